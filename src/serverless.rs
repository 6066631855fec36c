//! Headless single-shot entry point for function runtimes.
//!
//! Tokens arrive through the environment instead of a browser, and the result
//! is reported as a `{statusCode, body}` JSON document.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::cfg::Cfg;
use crate::error::{SyncError, SyncResult};
use crate::job::{SyncOrchestrator, SyncOutcome, SyncRequest};
use crate::records::DataKind;

/// Event payload. Every field may also come from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InvocationRequest {
    #[serde(default)]
    pub sync_type: Option<String>,
    #[serde(default)]
    pub spreadsheet_id: Option<String>,
    #[serde(default)]
    pub sheet_name: Option<String>,
    #[serde(default)]
    pub default_days: Option<u32>,
}

impl InvocationRequest {
    /// `SYNC_TYPE`, `SPREADSHEET_ID` and `SHEET_NAME` win over the payload.
    pub fn with_env(mut self, lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let env = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(sync_type) = env("SYNC_TYPE") {
            self.sync_type = Some(sync_type);
        }
        if let Some(spreadsheet_id) = env("SPREADSHEET_ID") {
            self.spreadsheet_id = Some(spreadsheet_id);
        }
        if let Some(sheet_name) = env("SHEET_NAME") {
            self.sheet_name = Some(sheet_name);
        }
        self
    }

    pub fn into_sync_request(self) -> SyncResult<SyncRequest> {
        let (Some(sync_type), Some(spreadsheet_id), Some(sheet_name)) = (
            self.sync_type.filter(|v| !v.is_empty()),
            self.spreadsheet_id.filter(|v| !v.is_empty()),
            self.sheet_name.filter(|v| !v.is_empty()),
        ) else {
            return Err(SyncError::configuration(
                "Missing required parameters: sync_type, spreadsheet_id, sheet_name",
            ));
        };

        let kind = DataKind::parse(&sync_type).ok_or_else(|| {
            SyncError::configuration(format!("unknown sync_type {sync_type:?}"))
        })?;

        Ok(SyncRequest {
            kind,
            spreadsheet_id,
            sheet_name,
            default_days: self.default_days,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: Value,
}

impl InvocationResponse {
    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }

    pub fn success(request: &SyncRequest, outcome: &SyncOutcome) -> Self {
        let mut body = json!({
            "message": outcome.message(),
            "sync_type": request.kind.to_string(),
            "sheet_name": request.sheet_name,
        });
        if let SyncOutcome::Synced {
            records_written,
            synced_through,
            ..
        } = outcome
        {
            body["records_written"] = json!(records_written);
            body["synced_through"] = json!(synced_through.to_string());
        }
        Self {
            status_code: 200,
            body,
        }
    }

    pub fn failure(error: &SyncError) -> Self {
        let message = format!("Error during health data sync: {error}");
        if error.is_timeout() {
            return Self {
                status_code: 504,
                body: json!({ "message": message }),
            };
        }
        match error {
            SyncError::AuthorizationRequired { provider } => Self {
                status_code: 500,
                body: json!({
                    "message": message,
                    "authorization_required": true,
                    "provider": provider,
                }),
            },
            _ => Self {
                status_code: 500,
                body: json!({ "message": message }),
            },
        }
    }

    pub fn timed_out(seconds: u64) -> Self {
        Self {
            status_code: 504,
            body: json!({
                "message": format!("Health data sync timed out after {seconds} seconds"),
            }),
        }
    }
}

/// Writes `FITBIT_TOKEN_JSON` / `GOOGLE_TOKEN_JSON` to the token paths.
pub fn inject_tokens(
    orchestrator: &SyncOrchestrator,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> SyncResult<()> {
    if let Some(raw) = lookup("FITBIT_TOKEN_JSON").filter(|v| !v.is_empty()) {
        orchestrator.fitbit_store().import_json(&raw)?;
    }
    if let Some(raw) = lookup("GOOGLE_TOKEN_JSON").filter(|v| !v.is_empty()) {
        orchestrator.google_store().import_json(&raw)?;
    }
    Ok(())
}

/// Runs one headless sync and always produces a response.
pub async fn handle(
    cfg: &Cfg,
    event: InvocationRequest,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> InvocationResponse {
    info!("Starting health data sync");

    let request = match event.with_env(lookup).into_sync_request() {
        Ok(request) => request,
        Err(e) => {
            error!("{}", e);
            return InvocationResponse::failure(&e);
        }
    };

    let mut cfg = cfg.clone();
    cfg.auth.interactive = false;
    let orchestrator = SyncOrchestrator::from_cfg(&cfg);

    if let Err(e) = inject_tokens(&orchestrator, lookup) {
        error!("{}", e);
        return InvocationResponse::failure(&e);
    }

    let seconds = cfg.serverless.timeout_secs;
    match tokio::time::timeout(Duration::from_secs(seconds), orchestrator.run(&request)).await {
        Ok(Ok(outcome)) => {
            info!("Sync completed successfully");
            InvocationResponse::success(&request, &outcome)
        }
        Ok(Err(e)) => {
            error!("Error during health data sync: {}", e);
            InvocationResponse::failure(&e)
        }
        Err(_) => {
            error!("Health data sync timed out after {} seconds", seconds);
            InvocationResponse::timed_out(seconds)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::SyncRange;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn test_cfg(dir: &std::path::Path) -> Cfg {
        let mut cfg = Cfg::default();
        cfg.fitbit.client_id = "id".into();
        cfg.fitbit.client_secret = "secret".into();
        cfg.fitbit.token_path = dir.join("fitbit_token.json").to_string_lossy().into_owned();
        cfg.google.token_path = dir.join("google_token.json").to_string_lossy().into_owned();
        cfg.google.credentials_path = dir.join("google.json").to_string_lossy().into_owned();
        cfg
    }

    #[test]
    fn environment_wins_over_payload() {
        let event: InvocationRequest = serde_json::from_value(json!({
            "sync_type": "sleep",
            "spreadsheet_id": "from-event",
            "sheet_name": "Sleep"
        }))
        .unwrap();

        let request = event
            .with_env(&env(&[("SPREADSHEET_ID", "from-env"), ("SYNC_TYPE", "")]))
            .into_sync_request()
            .unwrap();

        assert_eq!(request.kind, DataKind::Sleep);
        assert_eq!(request.spreadsheet_id, "from-env");
        assert_eq!(request.sheet_name, "Sleep");
    }

    #[test]
    fn missing_parameters_are_rejected() {
        let event = InvocationRequest {
            sync_type: Some("heart_rate".into()),
            spreadsheet_id: Some("id".into()),
            ..Default::default()
        };
        assert!(matches!(
            event.into_sync_request(),
            Err(SyncError::Configuration(_))
        ));

        let event = InvocationRequest {
            sync_type: Some("steps".into()),
            spreadsheet_id: Some("id".into()),
            sheet_name: Some("Sheet1".into()),
            default_days: None,
        };
        assert!(event.into_sync_request().is_err());
    }

    #[test]
    fn errors_map_to_status_codes() {
        let timeout = SyncError::AuthorizationTimeout {
            provider: "fitbit".into(),
            seconds: 300,
        };
        assert_eq!(InvocationResponse::failure(&timeout).status_code, 504);

        let required = InvocationResponse::failure(&SyncError::AuthorizationRequired {
            provider: "google".into(),
        });
        assert_eq!(required.status_code, 500);
        assert_eq!(required.body["authorization_required"], json!(true));

        let upstream = InvocationResponse::failure(&SyncError::upstream("fitbit", "429"));
        assert_eq!(upstream.status_code, 500);
        assert!(upstream.body["message"].as_str().unwrap().contains("429"));

        assert_eq!(InvocationResponse::timed_out(30).status_code, 504);
    }

    #[test]
    fn success_body_reports_progress() {
        let request = SyncRequest {
            kind: DataKind::HeartRate,
            spreadsheet_id: "id".into(),
            sheet_name: "HR".into(),
            default_days: None,
        };
        let day = |s: &str| s.parse().unwrap();
        let outcome = SyncOutcome::Synced {
            records_written: 2,
            synced_through: day("2024-05-07"),
            range: SyncRange {
                start: day("2024-05-06"),
                end: day("2024-05-07"),
                needs_header: false,
            },
        };

        let response = InvocationResponse::success(&request, &outcome);
        let encoded = serde_json::to_value(&response).unwrap();

        assert_eq!(encoded["statusCode"], json!(200));
        assert_eq!(encoded["body"]["records_written"], json!(2));
        assert_eq!(encoded["body"]["synced_through"], json!("2024-05-07"));

        let up_to_date = SyncOutcome::UpToDate {
            through: day("2024-05-07"),
        };
        assert!(InvocationResponse::success(&request, &up_to_date).is_success());
    }

    #[test]
    fn injected_tokens_land_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = SyncOrchestrator::from_cfg(&test_cfg(dir.path()));

        inject_tokens(
            &orchestrator,
            &env(&[(
                "FITBIT_TOKEN_JSON",
                r#"{"access_token":"a","refresh_token":"r","expires_at":1715000000}"#,
            )]),
        )
        .unwrap();

        assert_eq!(orchestrator.fitbit_store().read().unwrap().access_token, "a");
        assert!(orchestrator.google_store().read().is_none());
    }

    #[tokio::test]
    async fn headless_run_without_tokens_requires_authorization() {
        let dir = tempfile::tempdir().unwrap();
        let event = InvocationRequest {
            sync_type: Some("sleep".into()),
            spreadsheet_id: Some("id".into()),
            sheet_name: Some("Sleep".into()),
            default_days: Some(7),
        };

        let response = handle(&test_cfg(dir.path()), event, &env(&[])).await;

        assert_eq!(response.status_code, 500);
        assert_eq!(response.body["authorization_required"], json!(true));
        assert_eq!(response.body["provider"], json!("fitbit"));
    }

    #[tokio::test]
    async fn bad_event_is_a_server_error() {
        let dir = tempfile::tempdir().unwrap();

        let response = handle(&test_cfg(dir.path()), InvocationRequest::default(), &env(&[])).await;

        assert_eq!(response.status_code, 500);
        assert!(!response.is_success());
    }
}
