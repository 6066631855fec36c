//! Fitbit Web API: OAuth provider and the sleep / heart-rate client.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::auth::{post_token_form, Credential, OAuthProvider, Pkce, TokenRecord, TokenResponse};
use crate::error::{SyncError, SyncResult};
use crate::records::{sort_heart_rate, sort_sleep, HeartRateRecord, SleepRecord};

const PROVIDER: &str = "fitbit";
const AUTHORIZE_URL: &str = "https://www.fitbit.com/oauth2/authorize";
const TOKEN_URL: &str = "https://api.fitbit.com/oauth2/token";
const API_BASE: &str = "https://api.fitbit.com";
const SCOPES: &str = "activity heartrate profile sleep";
const HTTP_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// The sleep range endpoint rejects spans longer than this.
const MAX_SLEEP_RANGE_DAYS: i64 = 100;
/// Heart rate time series are capped at one year per request.
const MAX_HEART_RANGE_DAYS: i64 = 365;

/// Source of fitness records over an inclusive date range.
#[async_trait]
pub trait FitnessSource: Send + Sync {
    async fn fetch_sleep(&self, start: NaiveDate, end: NaiveDate) -> SyncResult<Vec<SleepRecord>>;

    async fn fetch_resting_heart_rate(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> SyncResult<Vec<HeartRateRecord>>;
}

/// OAuth side of Fitbit.
#[derive(Debug, Clone)]
pub struct FitbitProvider {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    authorize_url: String,
    token_url: String,
    api_base: String,
    http: reqwest::Client,
}

impl FitbitProvider {
    pub fn new(client_id: &str, client_secret: &str, redirect_uri: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: redirect_uri.to_string(),
            authorize_url: AUTHORIZE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            api_base: API_BASE.to_string(),
            http: http_client(),
        }
    }

    #[cfg(test)]
    pub fn with_endpoints(mut self, token_url: &str, api_base: &str) -> Self {
        self.token_url = token_url.to_string();
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn credential_from(
        &self,
        response: TokenResponse,
        previous_refresh: Option<&str>,
    ) -> TokenRecord {
        let expires_at = response.expires_at(Utc::now());
        TokenRecord {
            refresh_token: response
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string))
                .unwrap_or_default(),
            access_token: response.access_token,
            expires_at,
        }
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[async_trait]
impl OAuthProvider for FitbitProvider {
    type Credential = TokenRecord;
    type Client = FitbitClient;

    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn check_configured(&self) -> SyncResult<()> {
        if self.client_id.trim().is_empty() || self.client_secret.trim().is_empty() {
            return Err(SyncError::configuration(
                "FITBIT_CLIENT_ID and FITBIT_CLIENT_SECRET must be set",
            ));
        }
        Ok(())
    }

    fn redirect_port(&self) -> u16 {
        Url::parse(&self.redirect_uri)
            .ok()
            .and_then(|url| url.port_or_known_default())
            .unwrap_or(80)
    }

    /// Fitbit only accepts the exact registered redirect URI.
    fn redirect_uri(&self, _port: u16) -> String {
        self.redirect_uri.clone()
    }

    fn authorization_url(&self, redirect_uri: &str, pkce: &Pkce) -> SyncResult<String> {
        let mut url = Url::parse(&self.authorize_url)
            .map_err(|e| SyncError::configuration(format!("bad Fitbit authorize URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", SCOPES)
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
    ) -> SyncResult<TokenRecord> {
        let response = post_token_form(
            &self.http,
            PROVIDER,
            &self.token_url,
            Some((self.client_id.as_str(), self.client_secret.as_str())),
            &[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
                ("code", code),
                ("code_verifier", code_verifier),
            ],
        )
        .await?;
        Ok(self.credential_from(response, None))
    }

    async fn refresh(&self, credential: &TokenRecord) -> SyncResult<TokenRecord> {
        self.check_configured()?;
        let response = post_token_form(
            &self.http,
            PROVIDER,
            &self.token_url,
            Some((self.client_id.as_str(), self.client_secret.as_str())),
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", credential.refresh_token.as_str()),
            ],
        )
        .await?;
        info!("Refreshed Fitbit access token");
        Ok(self.credential_from(response, Some(&credential.refresh_token)))
    }

    fn client(&self, credential: &TokenRecord) -> SyncResult<FitbitClient> {
        Ok(FitbitClient {
            http: self.http.clone(),
            api_base: self.api_base.clone(),
            access_token: credential.access_token().to_string(),
        })
    }
}

/// Authenticated Fitbit API client. Built fresh for each session.
#[derive(Debug, Clone)]
pub struct FitbitClient {
    http: reqwest::Client,
    api_base: String,
    access_token: String,
}

impl FitbitClient {
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        let url = format!("{}{}", self.api_base, path);
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .header("Accept-Language", "en_US")
            .send()
            .await
            .map_err(|e| SyncError::upstream(PROVIDER, format!("request to {path} failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::upstream(PROVIDER, format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(SyncError::upstream(PROVIDER, format!("{status}: {body}")));
        }

        serde_json::from_str(&body)
            .map_err(|e| SyncError::upstream(PROVIDER, format!("malformed response from {path}: {e}")))
    }
}

#[async_trait]
impl FitnessSource for FitbitClient {
    async fn fetch_sleep(&self, start: NaiveDate, end: NaiveDate) -> SyncResult<Vec<SleepRecord>> {
        info!("Fetching sleep data from {} to {}...", start, end);
        let mut records = Vec::new();
        for (window_start, window_end) in windows(start, end, MAX_SLEEP_RANGE_DAYS) {
            let path = format!("/1.2/user/-/sleep/date/{window_start}/{window_end}.json");
            let response: SleepResponse = self.get_json(&path).await?;
            records.extend(sleep_records(response));
        }
        sort_sleep(&mut records);
        Ok(records)
    }

    async fn fetch_resting_heart_rate(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> SyncResult<Vec<HeartRateRecord>> {
        info!("Fetching resting heart rate data from {} to {}...", start, end);
        let mut records = Vec::new();
        for (window_start, window_end) in windows(start, end, MAX_HEART_RANGE_DAYS) {
            let path = format!("/1/user/-/activities/heart/date/{window_start}/{window_end}.json");
            let response: HeartResponse = self.get_json(&path).await?;
            records.extend(heart_rate_records(response));
        }
        sort_heart_rate(&mut records);
        Ok(records)
    }
}

/// Splits `[start, end]` into consecutive inclusive windows of at most `days`.
fn windows(start: NaiveDate, end: NaiveDate, days: i64) -> Vec<(NaiveDate, NaiveDate)> {
    let mut out = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let window_end = (cursor + Duration::days(days - 1)).min(end);
        out.push((cursor, window_end));
        cursor = window_end + Duration::days(1);
    }
    out
}

#[derive(Debug, Default, Deserialize)]
struct SleepResponse {
    #[serde(default)]
    sleep: Vec<SleepLog>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SleepLog {
    date_of_sleep: NaiveDate,
    #[serde(default)]
    start_time: String,
    #[serde(default)]
    end_time: String,
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    efficiency: u32,
    #[serde(default)]
    is_main_sleep: bool,
    #[serde(default)]
    minutes_asleep: u32,
    #[serde(default)]
    minutes_awake: u32,
    #[serde(default)]
    time_in_bed: u32,
    #[serde(default)]
    levels: Option<SleepLevels>,
}

#[derive(Debug, Default, Deserialize)]
struct SleepLevels {
    #[serde(default)]
    summary: Option<StageSummary>,
}

#[derive(Debug, Default, Deserialize)]
struct StageSummary {
    deep: Option<StageMinutes>,
    light: Option<StageMinutes>,
    rem: Option<StageMinutes>,
    wake: Option<StageMinutes>,
}

#[derive(Debug, Deserialize)]
struct StageMinutes {
    #[serde(default)]
    minutes: u32,
}

fn sleep_records(response: SleepResponse) -> Vec<SleepRecord> {
    response
        .sleep
        .into_iter()
        .map(|log| {
            // Classic (non-stage) logs carry asleep/restless/awake instead.
            let stages = log
                .levels
                .and_then(|levels| levels.summary)
                .filter(|summary| {
                    log.is_main_sleep
                        && (summary.deep.is_some()
                            || summary.light.is_some()
                            || summary.rem.is_some()
                            || summary.wake.is_some())
                })
                .unwrap_or_default();
            let minutes = |stage: Option<StageMinutes>| stage.map(|s| s.minutes);

            SleepRecord {
                date: log.date_of_sleep,
                start_time: log.start_time,
                end_time: log.end_time,
                duration_minutes: log.duration as f64 / 60_000.0,
                efficiency_pct: log.efficiency,
                is_main_sleep: log.is_main_sleep,
                minutes_asleep: log.minutes_asleep,
                minutes_awake: log.minutes_awake,
                time_in_bed_minutes: log.time_in_bed,
                deep_minutes: minutes(stages.deep),
                light_minutes: minutes(stages.light),
                rem_minutes: minutes(stages.rem),
                wake_minutes: minutes(stages.wake),
            }
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct HeartResponse {
    #[serde(default, rename = "activities-heart")]
    days: Vec<HeartDay>,
}

#[derive(Debug, Deserialize)]
struct HeartDay {
    #[serde(rename = "dateTime")]
    date_time: NaiveDate,
    #[serde(default)]
    value: HeartValue,
}

#[derive(Debug, Default, Deserialize)]
struct HeartValue {
    #[serde(default, rename = "restingHeartRate")]
    resting_heart_rate: Option<u32>,
}

fn heart_rate_records(response: HeartResponse) -> Vec<HeartRateRecord> {
    response
        .days
        .into_iter()
        .filter_map(|day| {
            day.value.resting_heart_rate.map(|rate| HeartRateRecord {
                date: day.date_time,
                resting_heart_rate: rate,
            })
        })
        .collect()
}
