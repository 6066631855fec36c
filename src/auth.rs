//! OAuth building blocks shared by the Fitbit and Google sessions.
//!
//! A provider knows how to build its authorization URL, trade a code for a
//! credential, refresh that credential, and turn it into an API client. The
//! session logic in [`crate::session`] only talks to these traits.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::Rng as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Tokens are treated as expired this long before their actual expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Random bytes behind a PKCE code verifier, before base64 encoding.
const CODE_VERIFIER_LENGTH: usize = 32;
const STATE_LENGTH: usize = 16;

/// Per-login PKCE verifier, its S256 challenge, and the CSRF `state` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl Pkce {
    pub fn new() -> Self {
        let verifier = random_token(CODE_VERIFIER_LENGTH);
        Self {
            challenge: challenge_for(&verifier),
            verifier,
            state: random_token(STATE_LENGTH),
        }
    }
}

impl Default for Pkce {
    fn default() -> Self {
        Self::new()
    }
}

fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    let bytes: Vec<u8> = (0..len).map(|_| rng.random()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

pub(crate) fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Token material that can be persisted and checked for freshness.
pub trait Credential: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn access_token(&self) -> &str;

    fn refresh_token(&self) -> Option<&str>;

    fn expires_at(&self) -> Option<DateTime<Utc>>;

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires_at) => now + Duration::seconds(EXPIRY_SKEW_SECS) >= expires_at,
            None => false,
        }
    }
}

/// Fitbit token file: `{access_token, refresh_token, expires_at}` with
/// `expires_at` in (fractional) epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "epoch_seconds")]
    pub expires_at: DateTime<Utc>,
}

impl Credential for TokenRecord {
    fn access_token(&self) -> &str {
        &self.access_token
    }

    fn refresh_token(&self) -> Option<&str> {
        if self.refresh_token.is_empty() {
            None
        } else {
            Some(&self.refresh_token)
        }
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

mod epoch_seconds {
    use super::*;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        let secs = value.timestamp() as f64 + f64::from(value.timestamp_subsec_millis()) / 1000.0;
        serializer.serialize_f64(secs)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        let millis = (secs * 1000.0).round() as i64;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {secs}")))
    }
}

/// Body returned by OAuth2 token endpoints for both code exchange and refresh.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.expires_in.unwrap_or(3600))
    }
}

/// One OAuth2 provider with an authorization-code flow.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    type Credential: Credential;
    type Client: Send + Sync;

    fn name(&self) -> &'static str;

    /// Fails when the client id/secret needed for a fresh login are missing.
    fn check_configured(&self) -> SyncResult<()>;

    /// Port the provider's registered redirect URI points at; 0 means any.
    fn redirect_port(&self) -> u16;

    fn redirect_uri(&self, port: u16) -> String {
        format!("http://localhost:{port}/")
    }

    /// Login URL carrying the PKCE challenge and `state` of this attempt.
    fn authorization_url(&self, redirect_uri: &str, pkce: &Pkce) -> SyncResult<String>;

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> SyncResult<Self::Credential>;

    async fn refresh(&self, credential: &Self::Credential) -> SyncResult<Self::Credential>;

    fn client(&self, credential: &Self::Credential) -> SyncResult<Self::Client>;
}

/// POSTs a form to a token endpoint and decodes the standard response.
pub async fn post_token_form(
    http: &reqwest::Client,
    provider: &str,
    token_url: &str,
    basic_auth: Option<(&str, &str)>,
    form: &[(&str, &str)],
) -> SyncResult<TokenResponse> {
    debug!("requesting {} token from {}", provider, token_url);
    let mut request = http.post(token_url).form(form);
    if let Some((user, password)) = basic_auth {
        request = request.basic_auth(user, Some(password));
    }

    let response = request
        .send()
        .await
        .map_err(|e| SyncError::upstream(provider, format!("token request failed: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| SyncError::upstream(provider, format!("failed to read token response: {e}")))?;

    if !status.is_success() {
        return Err(SyncError::upstream(
            provider,
            format!("token endpoint returned {status}: {body}"),
        ));
    }

    serde_json::from_str(&body)
        .map_err(|e| SyncError::upstream(provider, format!("invalid token response: {e}")))
}
