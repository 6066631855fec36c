use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Local, NaiveDate};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::{Credential, TokenRecord};
use crate::callback::{CodeGrant, LoopbackGrant};
use crate::cfg::Cfg;
use crate::csv_sink;
use crate::error::{SyncError, SyncResult};
use crate::fitbit::{FitbitProvider, FitnessSource};
use crate::range::{resolve, SyncRange};
use crate::records::{cell_text, sort_heart_rate, sort_sleep, DataKind, RecordBatch};
use crate::session::ProviderSession;
use crate::sheets::{
    sheets_link, worksheet_anchor, worksheet_range, GoogleProvider, GoogleToken, SheetSnapshot,
    SpreadsheetClient,
};
use crate::token_store::TokenStore;

/// One sync run's destination and lookback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub kind: DataKind,
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub default_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate {
        through: NaiveDate,
    },
    Synced {
        records_written: usize,
        synced_through: NaiveDate,
        range: SyncRange,
    },
}

impl SyncOutcome {
    pub fn message(&self) -> String {
        match self {
            SyncOutcome::UpToDate { through } => {
                format!("Sheet is already up to date through {through}")
            }
            SyncOutcome::Synced {
                records_written,
                synced_through,
                ..
            } => format!("Synced {records_written} records through {synced_through}"),
        }
    }
}

/// Fetches one kind of record over an inclusive range, in sheet order.
pub async fn fetch_batch(
    fitness: &dyn FitnessSource,
    kind: DataKind,
    start: NaiveDate,
    end: NaiveDate,
) -> SyncResult<RecordBatch> {
    let batch = match kind {
        DataKind::Sleep => {
            let mut records = fitness.fetch_sleep(start, end).await?;
            sort_sleep(&mut records);
            RecordBatch::Sleep(records)
        }
        DataKind::HeartRate => {
            let mut records = fitness.fetch_resting_heart_rate(start, end).await?;
            sort_heart_rate(&mut records);
            RecordBatch::HeartRate(records)
        }
    };
    debug!("Fetched {} {} records", batch.len(), kind);
    Ok(batch)
}

/// Appends rows below existing data, creating the worksheet first if needed.
/// `header` is written ahead of the rows when given.
pub async fn append_to_worksheet(
    sheets: &dyn SpreadsheetClient,
    spreadsheet_id: &str,
    sheet_name: &str,
    header: Option<Vec<String>>,
    rows: Vec<Vec<Value>>,
) -> SyncResult<usize> {
    let existing = sheets.list_worksheets(spreadsheet_id).await?;
    if !existing.iter().any(|name| name == sheet_name) {
        sheets.create_worksheet(spreadsheet_id, sheet_name).await?;
    }

    let data_rows = rows.len();
    let mut values = Vec::with_capacity(data_rows + 1);
    if let Some(header) = header {
        values.push(header.into_iter().map(Value::from).collect());
    }
    values.extend(rows);

    sheets
        .append_rows(spreadsheet_id, &worksheet_anchor(sheet_name), values)
        .await?;
    info!("Appended {} rows to sheet '{}'", data_rows, sheet_name);
    Ok(data_rows)
}

pub async fn append_records(
    sheets: &dyn SpreadsheetClient,
    spreadsheet_id: &str,
    sheet_name: &str,
    batch: &RecordBatch,
    include_header: bool,
) -> SyncResult<usize> {
    let header = include_header.then(|| batch.kind().headers());
    append_to_worksheet(sheets, spreadsheet_id, sheet_name, header, batch.to_rows()).await
}

/// The incremental sync against already-connected clients.
pub async fn sync_with(
    fitness: &dyn FitnessSource,
    sheets: &dyn SpreadsheetClient,
    request: &SyncRequest,
    today: NaiveDate,
) -> SyncResult<SyncOutcome> {
    info!(
        "Syncing {} data into '{}' of spreadsheet {}",
        request.kind, request.sheet_name, request.spreadsheet_id
    );

    let snapshot = sheets
        .read_range(&request.spreadsheet_id, &worksheet_range(&request.sheet_name))
        .await?;
    let range = resolve(&snapshot, today, request.default_days)?;
    if range.is_empty() {
        return Ok(SyncOutcome::UpToDate { through: today });
    }

    let batch = fetch_batch(fitness, request.kind, range.start, range.end).await?;
    if batch.is_empty() {
        info!("No new {} data between {}", request.kind, range);
        return Ok(SyncOutcome::Synced {
            records_written: 0,
            synced_through: range.end,
            range,
        });
    }

    let records_written = append_records(
        sheets,
        &request.spreadsheet_id,
        &request.sheet_name,
        &batch,
        range.needs_header,
    )
    .await?;

    Ok(SyncOutcome::Synced {
        records_written,
        synced_through: batch.last_date().unwrap_or(range.end),
        range,
    })
}

/// Appends a CSV table, with its header only when the worksheet is new.
pub async fn upload_table(
    sheets: &dyn SpreadsheetClient,
    spreadsheet_id: &str,
    sheet_name: &str,
    table: csv_sink::CsvTable,
) -> SyncResult<usize> {
    if table.rows.is_empty() {
        warn!("CSV has no data rows, nothing to upload");
        return Ok(0);
    }

    let snapshot = sheets
        .read_range(spreadsheet_id, &worksheet_range(sheet_name))
        .await?;
    let is_new = match snapshot {
        SheetSnapshot::NotFound => true,
        SheetSnapshot::Found(rows) => rows.is_empty(),
    };

    let header = is_new.then_some(table.headers);
    append_to_worksheet(sheets, spreadsheet_id, sheet_name, header, table.rows).await
}

/// Both provider sessions, wired from configuration.
pub struct SyncOrchestrator {
    fitbit: ProviderSession<FitbitProvider>,
    google: ProviderSession<GoogleProvider>,
}

impl SyncOrchestrator {
    pub fn new(
        fitbit: ProviderSession<FitbitProvider>,
        google: ProviderSession<GoogleProvider>,
    ) -> Self {
        Self { fitbit, google }
    }

    pub fn from_cfg(cfg: &Cfg) -> Self {
        let grant: Arc<dyn CodeGrant> = Arc::new(LoopbackGrant::new(Duration::from_secs(
            cfg.auth.callback_timeout_secs,
        )));

        let fitbit = ProviderSession::new(
            FitbitProvider::new(
                &cfg.fitbit.client_id,
                &cfg.fitbit.client_secret,
                &cfg.fitbit.redirect_uri,
            ),
            TokenStore::new(&cfg.fitbit.token_path),
            grant.clone(),
            cfg.auth.interactive,
        );
        let google = ProviderSession::new(
            GoogleProvider::new(&cfg.google.credentials_path, cfg.google.redirect_port),
            TokenStore::new(&cfg.google.token_path),
            grant,
            cfg.auth.interactive,
        );

        Self::new(fitbit, google)
    }

    pub async fn run(&self, request: &SyncRequest) -> SyncResult<SyncOutcome> {
        let fitness = self.fitbit.connect().await?;
        let sheets = self.google.connect().await?;

        let today = Local::now().date_naive();
        let outcome = sync_with(&fitness, &sheets, request, today).await?;

        info!("{}", outcome.message());
        info!("View your data at {}", sheets_link(&request.spreadsheet_id));
        Ok(outcome)
    }

    /// The last `days` days ending today, optionally saved to a fresh CSV.
    pub async fn fetch(
        &self,
        kind: DataKind,
        days: u32,
        csv_out: Option<&Path>,
    ) -> SyncResult<RecordBatch> {
        if days == 0 {
            return Err(SyncError::configuration("days must be at least 1"));
        }
        let fitness = self.fitbit.connect().await?;

        let end = Local::now().date_naive();
        let start = end
            .checked_sub_days(Days::new(u64::from(days) - 1))
            .ok_or_else(|| SyncError::configuration(format!("{days} days back is out of range")))?;
        let batch = fetch_batch(&fitness, kind, start, end).await?;
        match (batch.first_date(), batch.last_date()) {
            (Some(first), Some(last)) => {
                info!("Fetched {} {} records from {} to {}", batch.len(), kind, first, last)
            }
            _ => info!("No {} data between {} and {}", kind, start, end),
        }

        match csv_out {
            Some(path) => {
                csv_sink::write(path, &batch)?;
                info!("Data saved to {}", path.display());
            }
            None => {
                for row in batch.to_rows() {
                    let cells: Vec<String> = row.iter().map(cell_text).collect();
                    debug!("{}", cells.join(", "));
                }
            }
        }
        Ok(batch)
    }

    pub async fn upload(
        &self,
        csv_in: &Path,
        spreadsheet_id: &str,
        sheet_name: &str,
    ) -> SyncResult<usize> {
        let table = csv_sink::read_table(csv_in)?;
        let sheets = self.google.connect().await?;

        let written = upload_table(&sheets, spreadsheet_id, sheet_name, table).await?;
        info!("View your data at {}", sheets_link(spreadsheet_id));
        Ok(written)
    }

    pub async fn refresh_tokens(&self, fitbit: bool, google: bool) -> SyncResult<()> {
        if fitbit {
            info!("Refreshing Fitbit token...");
            let session = self.fitbit.refresh_now().await?;
            info!(
                "Fitbit token ready ({:?}), expires {:?}",
                session.source,
                session.credential.expires_at()
            );
        }
        if google {
            info!("Refreshing Google Sheets token...");
            let session = self.google.refresh_now().await?;
            info!(
                "Google Sheets token ready ({:?}), expires {:?}",
                session.source,
                session.credential.expires_at()
            );
        }
        info!("Token refresh complete");
        Ok(())
    }

    pub fn fitbit_store(&self) -> &TokenStore<TokenRecord> {
        self.fitbit.store()
    }

    pub fn google_store(&self) -> &TokenStore<GoogleToken> {
        self.google.store()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{HeartRateRecord, SleepRecord};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeFitness {
        heart: Vec<HeartRateRecord>,
        sleep: Vec<SleepRecord>,
        requested: Mutex<Vec<(NaiveDate, NaiveDate)>>,
    }

    impl FakeFitness {
        fn heart(days: &[(&str, u32)]) -> Self {
            Self {
                heart: days
                    .iter()
                    .map(|(d, bpm)| HeartRateRecord {
                        date: d.parse().unwrap(),
                        resting_heart_rate: *bpm,
                    })
                    .collect(),
                sleep: Vec::new(),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FitnessSource for FakeFitness {
        async fn fetch_sleep(
            &self,
            start: NaiveDate,
            end: NaiveDate,
        ) -> SyncResult<Vec<SleepRecord>> {
            self.requested.lock().unwrap().push((start, end));
            Ok(self
                .sleep
                .iter()
                .filter(|r| r.date >= start && r.date <= end)
                .cloned()
                .collect())
        }

        async fn fetch_resting_heart_rate(
            &self,
            start: NaiveDate,
            end: NaiveDate,
        ) -> SyncResult<Vec<HeartRateRecord>> {
            self.requested.lock().unwrap().push((start, end));
            Ok(self
                .heart
                .iter()
                .filter(|r| r.date >= start && r.date <= end)
                .cloned()
                .collect())
        }
    }

    /// Worksheets keyed by name, holding rendered cells.
    #[derive(Default)]
    struct FakeSheets {
        tabs: Mutex<Vec<(String, Vec<Vec<String>>)>>,
        created: Mutex<Vec<String>>,
    }

    impl FakeSheets {
        fn with_tab(name: &str, rows: &[&[&str]]) -> Self {
            let rows = rows
                .iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect();
            let sheets = Self::default();
            sheets.tabs.lock().unwrap().push((name.to_string(), rows));
            sheets
        }

        fn rows(&self, name: &str) -> Vec<Vec<String>> {
            self.tabs
                .lock()
                .unwrap()
                .iter()
                .find(|(tab, _)| tab == name)
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default()
        }
    }

    fn tab_name(range: &str) -> String {
        let name = range.split('!').next().unwrap_or(range);
        name.trim_matches('\'').replace("''", "'")
    }

    #[async_trait]
    impl SpreadsheetClient for FakeSheets {
        async fn list_worksheets(&self, _spreadsheet_id: &str) -> SyncResult<Vec<String>> {
            Ok(self.tabs.lock().unwrap().iter().map(|(n, _)| n.clone()).collect())
        }

        async fn create_worksheet(&self, _spreadsheet_id: &str, name: &str) -> SyncResult<()> {
            self.created.lock().unwrap().push(name.to_string());
            self.tabs.lock().unwrap().push((name.to_string(), Vec::new()));
            Ok(())
        }

        async fn read_range(
            &self,
            _spreadsheet_id: &str,
            range: &str,
        ) -> SyncResult<SheetSnapshot> {
            let name = tab_name(range);
            Ok(self
                .tabs
                .lock()
                .unwrap()
                .iter()
                .find(|(tab, _)| *tab == name)
                .map(|(_, rows)| SheetSnapshot::Found(rows.clone()))
                .unwrap_or(SheetSnapshot::NotFound))
        }

        async fn append_rows(
            &self,
            _spreadsheet_id: &str,
            range: &str,
            rows: Vec<Vec<Value>>,
        ) -> SyncResult<usize> {
            let name = tab_name(range);
            let mut tabs = self.tabs.lock().unwrap();
            let (_, existing) = tabs
                .iter_mut()
                .find(|(tab, _)| *tab == name)
                .ok_or_else(|| SyncError::upstream("google", "Unable to parse range"))?;
            let count = rows.len();
            existing.extend(
                rows.into_iter()
                    .map(|row| row.iter().map(cell_text).collect::<Vec<_>>()),
            );
            Ok(count)
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn request(default_days: Option<u32>) -> SyncRequest {
        SyncRequest {
            kind: DataKind::HeartRate,
            spreadsheet_id: "sheet-id".to_string(),
            sheet_name: "HR".to_string(),
            default_days,
        }
    }

    #[tokio::test]
    async fn appends_only_days_after_latest_row() {
        let sheets = FakeSheets::with_tab(
            "HR",
            &[&["date", "resting_heart_rate"], &["2024-05-05", "57"]],
        );
        let fitness = FakeFitness::heart(&[
            ("2024-05-05", 57),
            ("2024-05-06", 58),
            ("2024-05-07", 61),
        ]);

        let outcome = sync_with(&fitness, &sheets, &request(None), date("2024-05-07"))
            .await
            .unwrap();

        match outcome {
            SyncOutcome::Synced {
                records_written,
                synced_through,
                range,
            } => {
                assert_eq!(records_written, 2);
                assert_eq!(synced_through, date("2024-05-07"));
                assert_eq!(range.start, date("2024-05-06"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            fitness.requested.lock().unwrap().as_slice(),
            &[(date("2024-05-06"), date("2024-05-07"))]
        );
        let rows = sheets.rows("HR");
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2], vec!["2024-05-06", "58"]);
        assert_eq!(rows[3], vec!["2024-05-07", "61"]);
    }

    #[tokio::test]
    async fn second_run_writes_nothing() {
        let sheets = FakeSheets::with_tab("HR", &[&["date", "resting_heart_rate"]]);
        let fitness = FakeFitness::heart(&[("2024-05-06", 58), ("2024-05-07", 61)]);
        let today = date("2024-05-07");

        sync_with(&fitness, &sheets, &request(Some(2)), today)
            .await
            .unwrap();
        let after_first = sheets.rows("HR");

        let outcome = sync_with(&fitness, &sheets, &request(Some(2)), today)
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::UpToDate { through: today });
        assert_eq!(sheets.rows("HR"), after_first);
        assert_eq!(fitness.requested.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_worksheet_is_created_with_header() {
        let sheets = FakeSheets::default();
        let fitness = FakeFitness::heart(&[("2024-03-09", 55), ("2024-03-10", 56)]);

        sync_with(&fitness, &sheets, &request(Some(7)), date("2024-03-10"))
            .await
            .unwrap();

        assert_eq!(sheets.created.lock().unwrap().as_slice(), &["HR".to_string()]);
        assert_eq!(
            fitness.requested.lock().unwrap().as_slice(),
            &[(date("2024-03-04"), date("2024-03-10"))]
        );
        let rows = sheets.rows("HR");
        assert_eq!(rows[0], vec!["date", "resting_heart_rate"]);
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn missing_worksheet_without_default_days_fails_before_fetch() {
        let sheets = FakeSheets::default();
        let fitness = FakeFitness::heart(&[("2024-03-10", 56)]);

        let err = sync_with(&fitness, &sheets, &request(None), date("2024-03-10"))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Configuration(_)));
        assert!(fitness.requested.lock().unwrap().is_empty());
        assert!(sheets.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_new_data_reports_range_end() {
        let sheets = FakeSheets::with_tab("HR", &[&["date"], &["2024-05-05"]]);
        let fitness = FakeFitness::heart(&[]);

        let outcome = sync_with(&fitness, &sheets, &request(None), date("2024-05-07"))
            .await
            .unwrap();

        match outcome {
            SyncOutcome::Synced {
                records_written,
                synced_through,
                ..
            } => {
                assert_eq!(records_written, 0);
                assert_eq!(synced_through, date("2024-05-07"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(sheets.rows("HR").len(), 2);
    }

    fn sleep_record(date: &str, start: &str, main: bool) -> SleepRecord {
        SleepRecord {
            date: date.parse().unwrap(),
            start_time: start.to_string(),
            end_time: start.to_string(),
            duration_minutes: if main { 470.0 } else { 40.0 },
            efficiency_pct: 90,
            is_main_sleep: main,
            minutes_asleep: 400,
            minutes_awake: 20,
            time_in_bed_minutes: 420,
            deep_minutes: main.then_some(80),
            light_minutes: main.then_some(240),
            rem_minutes: main.then_some(100),
            wake_minutes: main.then_some(40),
        }
    }

    #[tokio::test]
    async fn sleep_sync_puts_main_sleep_before_nap() {
        let sheets = FakeSheets::with_tab(
            "Sleep",
            &[&["date", "start_time", "end_time"], &["2024-05-05"]],
        );
        let fitness = FakeFitness {
            heart: Vec::new(),
            sleep: vec![
                sleep_record("2024-05-07", "2024-05-06T22:50:00.000", true),
                sleep_record("2024-05-06", "2024-05-06T14:00:00.000", false),
                sleep_record("2024-05-06", "2024-05-05T23:10:00.000", true),
            ],
            requested: Mutex::new(Vec::new()),
        };
        let request = SyncRequest {
            kind: DataKind::Sleep,
            spreadsheet_id: "sheet-id".to_string(),
            sheet_name: "Sleep".to_string(),
            default_days: None,
        };

        let outcome = sync_with(&fitness, &sheets, &request, date("2024-05-07"))
            .await
            .unwrap();

        match outcome {
            SyncOutcome::Synced {
                records_written,
                synced_through,
                ..
            } => {
                assert_eq!(records_written, 3);
                assert_eq!(synced_through, date("2024-05-07"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let rows = sheets.rows("Sleep");
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[2][0], "2024-05-06");
        assert_eq!(rows[2][5], "true");
        assert_eq!(rows[2][9], "80");
        assert_eq!(rows[3][0], "2024-05-06");
        assert_eq!(rows[3][5], "false");
        assert_eq!(rows[3][9], "");
        assert_eq!(rows[4][0], "2024-05-07");
    }

    #[tokio::test]
    async fn upload_adds_header_only_to_new_worksheet() {
        let table = || csv_sink::CsvTable {
            headers: vec!["date".into(), "resting_heart_rate".into()],
            rows: vec![vec![Value::from("2024-05-06"), Value::from(58)]],
        };

        let sheets = FakeSheets::default();
        assert_eq!(upload_table(&sheets, "id", "HR", table()).await.unwrap(), 1);
        assert_eq!(upload_table(&sheets, "id", "HR", table()).await.unwrap(), 1);

        let rows = sheets.rows("HR");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0], "date");
        assert_eq!(rows[2], vec!["2024-05-06", "58"]);
    }
}
