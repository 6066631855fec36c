use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_sheets4::api::{
    AddSheetRequest, BatchUpdateSpreadsheetRequest, Request, SheetProperties, ValueRange,
};
use google_sheets4::{hyper_rustls, hyper_util, Sheets};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;
use yup_oauth2::ApplicationSecret;

use crate::auth::{post_token_form, Credential, OAuthProvider, Pkce};
use crate::error::{SyncError, SyncResult};
use crate::records::cell_text;

const PROVIDER: &str = "google";
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

type Connector = hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;

/// Contents of a worksheet, or the fact that it does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetSnapshot {
    Found(Vec<Vec<String>>),
    NotFound,
}

/// The spreadsheet operations the sync needs.
#[async_trait]
pub trait SpreadsheetClient: Send + Sync {
    async fn list_worksheets(&self, spreadsheet_id: &str) -> SyncResult<Vec<String>>;

    /// Adds a worksheet; an existing one with the same name is left alone.
    async fn create_worksheet(&self, spreadsheet_id: &str, name: &str) -> SyncResult<()>;

    async fn read_range(&self, spreadsheet_id: &str, range: &str) -> SyncResult<SheetSnapshot>;

    /// Appends rows below existing data, returning the number of rows written.
    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        range: &str,
        rows: Vec<Vec<Value>>,
    ) -> SyncResult<usize>;
}

pub fn sheets_link(spreadsheet_id: &str) -> String {
    format!("https://docs.google.com/spreadsheets/d/{spreadsheet_id}/edit")
}

/// A1 reference to a whole worksheet, quoted so names with spaces work.
pub fn worksheet_range(sheet_name: &str) -> String {
    format!("'{}'", sheet_name.replace('\'', "''"))
}

/// A1 reference to the first cell of a worksheet.
pub fn worksheet_anchor(sheet_name: &str) -> String {
    format!("{}!A1", worksheet_range(sheet_name))
}

/// Google "authorized user" token file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoogleToken {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl Credential for GoogleToken {
    fn access_token(&self) -> &str {
        &self.token
    }

    fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }
}

/// OAuth side of Google, driven by an "installed app" client secret file.
pub struct GoogleProvider {
    credentials_path: PathBuf,
    secret: Option<ApplicationSecret>,
    redirect_port: u16,
    http: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(credentials_path: impl Into<PathBuf>, redirect_port: u16) -> Self {
        let credentials_path = credentials_path.into();
        let secret = load_secret(&credentials_path);
        Self {
            credentials_path,
            secret,
            redirect_port,
            http: reqwest::Client::new(),
        }
    }

    fn secret(&self) -> SyncResult<&ApplicationSecret> {
        self.secret.as_ref().ok_or_else(|| {
            SyncError::configuration(format!(
                "Google API credentials file not found at {}. Create an OAuth client in the \
                 Google Cloud Console, enable the Sheets API, and download its JSON there.",
                self.credentials_path.display()
            ))
        })
    }

    fn token_uri(&self) -> String {
        self.secret
            .as_ref()
            .map(|s| s.token_uri.clone())
            .filter(|uri| !uri.is_empty())
            .unwrap_or_else(default_token_uri)
    }
}

fn load_secret(path: &Path) -> Option<ApplicationSecret> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) => {
            debug!("no Google client secret at {}: {}", path.display(), e);
            return None;
        }
    };
    match yup_oauth2::parse_application_secret(raw) {
        Ok(secret) => Some(secret),
        Err(e) => {
            tracing::warn!("invalid Google client secret {}: {}", path.display(), e);
            None
        }
    }
}

#[async_trait]
impl OAuthProvider for GoogleProvider {
    type Credential = GoogleToken;
    type Client = GoogleSheetsClient;

    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn check_configured(&self) -> SyncResult<()> {
        let secret = self.secret()?;
        if secret.client_id.is_empty() || secret.client_secret.is_empty() {
            return Err(SyncError::configuration(format!(
                "Google credentials at {} lack a client id or secret",
                self.credentials_path.display()
            )));
        }
        Ok(())
    }

    fn redirect_port(&self) -> u16 {
        self.redirect_port
    }

    fn authorization_url(&self, redirect_uri: &str, pkce: &Pkce) -> SyncResult<String> {
        let secret = self.secret()?;
        let auth_uri = if secret.auth_uri.is_empty() {
            DEFAULT_AUTH_URI
        } else {
            secret.auth_uri.as_str()
        };
        let mut url = Url::parse(auth_uri)
            .map_err(|e| SyncError::configuration(format!("bad Google auth URI: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &secret.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", SHEETS_SCOPE)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", &pkce.state)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256");
        Ok(url.into())
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> SyncResult<GoogleToken> {
        let secret = self.secret()?;
        let token_uri = self.token_uri();
        let response = post_token_form(
            &self.http,
            PROVIDER,
            &token_uri,
            None,
            &[
                ("code", code),
                ("client_id", secret.client_id.as_str()),
                ("client_secret", secret.client_secret.as_str()),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
                ("code_verifier", code_verifier),
            ],
        )
        .await?;

        let scopes = response
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| vec![SHEETS_SCOPE.to_string()]);

        Ok(GoogleToken {
            expiry: Some(response.expires_at(Utc::now())),
            token: response.access_token,
            refresh_token: response.refresh_token,
            token_uri,
            client_id: secret.client_id.clone(),
            client_secret: secret.client_secret.clone(),
            scopes,
        })
    }

    async fn refresh(&self, credential: &GoogleToken) -> SyncResult<GoogleToken> {
        let refresh_token = credential
            .refresh_token()
            .ok_or_else(|| SyncError::token_refresh(PROVIDER, "no refresh token stored"))?;

        // The token file carries its own client; fall back to the secret file.
        let (client_id, client_secret) = if credential.client_id.is_empty() {
            let secret = self.secret()?;
            (secret.client_id.clone(), secret.client_secret.clone())
        } else {
            (credential.client_id.clone(), credential.client_secret.clone())
        };

        let response = post_token_form(
            &self.http,
            PROVIDER,
            &credential.token_uri,
            None,
            &[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ],
        )
        .await?;
        info!("Refreshed Google access token");

        Ok(GoogleToken {
            expiry: Some(response.expires_at(Utc::now())),
            token: response.access_token,
            refresh_token: response
                .refresh_token
                .or_else(|| credential.refresh_token.clone()),
            token_uri: credential.token_uri.clone(),
            client_id,
            client_secret,
            scopes: credential.scopes.clone(),
        })
    }

    fn client(&self, credential: &GoogleToken) -> SyncResult<GoogleSheetsClient> {
        GoogleSheetsClient::new(credential.access_token().to_string())
    }
}

/// Sheets v4 client bound to one access token.
pub struct GoogleSheetsClient {
    hub: Sheets<Connector>,
}

impl GoogleSheetsClient {
    pub fn new(access_token: String) -> SyncResult<Self> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| SyncError::upstream(PROVIDER, format!("cannot load TLS roots: {e}")))?
            .https_or_http()
            .enable_http1()
            .build();
        let client =
            hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
                .build(connector);

        Ok(Self {
            hub: Sheets::new(client, access_token),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: String) -> Self {
        self.hub.base_url(base_url);
        self
    }
}

fn upstream(e: impl std::fmt::Display) -> SyncError {
    SyncError::upstream(PROVIDER, e.to_string())
}

/// Sheets answers a read of a missing tab with this 400 message.
fn is_missing_range(message: &str) -> bool {
    message.contains("Unable to parse range")
}

#[async_trait]
impl SpreadsheetClient for GoogleSheetsClient {
    async fn list_worksheets(&self, spreadsheet_id: &str) -> SyncResult<Vec<String>> {
        let (_, spreadsheet) = self
            .hub
            .spreadsheets()
            .get(spreadsheet_id)
            .doit()
            .await
            .map_err(upstream)?;

        Ok(spreadsheet
            .sheets
            .unwrap_or_default()
            .into_iter()
            .filter_map(|sheet| sheet.properties.and_then(|p| p.title))
            .collect())
    }

    async fn create_worksheet(&self, spreadsheet_id: &str, name: &str) -> SyncResult<()> {
        let request = BatchUpdateSpreadsheetRequest {
            requests: Some(vec![Request {
                add_sheet: Some(AddSheetRequest {
                    properties: Some(SheetProperties {
                        title: Some(name.to_string()),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        };

        match self
            .hub
            .spreadsheets()
            .batch_update(request, spreadsheet_id)
            .doit()
            .await
        {
            Ok(_) => {
                info!("Created new sheet: {}", name);
                Ok(())
            }
            Err(e) if e.to_string().contains("already exists") => {
                debug!("Sheet '{}' already exists", name);
                Ok(())
            }
            Err(e) => Err(upstream(e)),
        }
    }

    async fn read_range(&self, spreadsheet_id: &str, range: &str) -> SyncResult<SheetSnapshot> {
        debug!("Reading {} from spreadsheet {}", range, spreadsheet_id);
        let result = self
            .hub
            .spreadsheets()
            .values_get(spreadsheet_id, range)
            .value_render_option("UNFORMATTED_VALUE")
            .date_time_render_option("SERIAL_NUMBER")
            .doit()
            .await;

        match result {
            Ok((_, value_range)) => {
                let rows = value_range
                    .values
                    .unwrap_or_default()
                    .iter()
                    .map(|row| row.iter().map(cell_text).collect())
                    .collect::<Vec<Vec<String>>>();
                debug!("Read {} rows from {}", rows.len(), range);
                Ok(SheetSnapshot::Found(rows))
            }
            Err(e) if is_missing_range(&e.to_string()) => Ok(SheetSnapshot::NotFound),
            Err(e) => Err(upstream(e)),
        }
    }

    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        range: &str,
        rows: Vec<Vec<Value>>,
    ) -> SyncResult<usize> {
        let count = rows.len();
        let request = ValueRange {
            major_dimension: Some("ROWS".to_string()),
            values: Some(rows),
            ..Default::default()
        };

        let (_, response) = self
            .hub
            .spreadsheets()
            .values_append(request, spreadsheet_id, range)
            .value_input_option("USER_ENTERED")
            .insert_data_option("INSERT_ROWS")
            .doit()
            .await
            .map_err(upstream)?;

        let updated_cells = response
            .updates
            .and_then(|u| u.updated_cells)
            .unwrap_or_default();
        info!("{} cells appended to {}", updated_cells, range);
        Ok(count)
    }
}
