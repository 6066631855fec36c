use chrono::{Days, NaiveDate};
use std::fmt;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::sheets::SheetSnapshot;

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Inclusive date window for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// The destination is missing or has no rows yet.
    pub needs_header: bool,
}

impl SyncRange {
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn days(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start).num_days() as u64 + 1
        }
    }
}

impl fmt::Display for SyncRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

/// Works out which days still need syncing given what the worksheet holds.
pub fn resolve(
    snapshot: &SheetSnapshot,
    today: NaiveDate,
    default_days: Option<u32>,
) -> SyncResult<SyncRange> {
    let (latest, needs_header) = match snapshot {
        SheetSnapshot::NotFound => {
            info!("Worksheet does not exist yet");
            (None, true)
        }
        SheetSnapshot::Found(rows) => (latest_date(rows), rows.is_empty()),
    };

    let end = today;
    let start = match latest {
        Some(latest) => {
            info!("Latest date already in sheet: {}", latest);
            latest.succ_opt().ok_or_else(|| {
                SyncError::configuration(format!("date {latest} is out of range"))
            })?
        }
        None => initial_start(end, default_days)?,
    };

    let range = SyncRange {
        start,
        end,
        needs_header,
    };
    if range.is_empty() {
        info!("Sheet is already up to date through {}", end);
    } else {
        info!("Syncing {} ({} days)", range, range.days());
    }
    Ok(range)
}

fn initial_start(end: NaiveDate, default_days: Option<u32>) -> SyncResult<NaiveDate> {
    let days = match default_days {
        Some(0) => {
            return Err(SyncError::configuration(
                "default days must be at least 1",
            ))
        }
        Some(days) => days,
        None => {
            return Err(SyncError::configuration(
                "the sheet has no data yet; pass --default-days to choose how far back to start",
            ))
        }
    };
    info!("No existing data, starting {} days back", days);
    end.checked_sub_days(Days::new(u64::from(days) - 1))
        .ok_or_else(|| SyncError::configuration(format!("{days} days back is out of range")))
}

/// Highest date found in the `date` column, or the first column when the
/// sheet has no such header.
fn latest_date(rows: &[Vec<String>]) -> Option<NaiveDate> {
    let column = rows
        .first()
        .and_then(|header| {
            header
                .iter()
                .position(|cell| cell.trim().eq_ignore_ascii_case("date"))
        })
        .unwrap_or(0);

    let latest = rows
        .iter()
        .filter_map(|row| row.get(column))
        .filter_map(|cell| parse_date_cell(cell))
        .max();
    debug!("Scanned {} rows in column {}: latest {:?}", rows.len(), column, latest);
    latest
}

/// Parses a date as Sheets may render it back. Serial numbers count days
/// from 1899-12-30.
pub fn parse_date_cell(cell: &str) -> Option<NaiveDate> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }

    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(cell, format).ok())
    {
        return Some(date);
    }

    let serial: f64 = cell.parse().ok()?;
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_days(Days::new(serial.trunc() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn sheet(rows: &[&[&str]]) -> SheetSnapshot {
        SheetSnapshot::Found(
            rows.iter()
                .map(|row| row.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn starts_the_day_after_latest_row() {
        let snapshot = sheet(&[
            &["date", "resting_heart_rate"],
            &["2024-05-03", "60"],
            &["2024-05-05", "58"],
            &["2024-05-04", "59"],
        ]);

        let range = resolve(&snapshot, date("2024-05-07"), None).unwrap();

        assert_eq!(range.start, date("2024-05-06"));
        assert_eq!(range.end, date("2024-05-07"));
        assert!(!range.needs_header);
        assert_eq!(range.days(), 2);
    }

    #[test]
    fn missing_sheet_counts_back_from_today() {
        let range = resolve(&SheetSnapshot::NotFound, date("2024-03-10"), Some(7)).unwrap();

        assert_eq!(range.start, date("2024-03-04"));
        assert_eq!(range.end, date("2024-03-10"));
        assert!(range.needs_header);
        assert_eq!(range.days(), 7);
    }

    #[test]
    fn missing_sheet_without_default_days_is_a_configuration_error() {
        let err = resolve(&SheetSnapshot::NotFound, date("2024-03-10"), None).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));

        let err = resolve(&SheetSnapshot::NotFound, date("2024-03-10"), Some(0)).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn empty_existing_sheet_needs_header() {
        let range = resolve(&sheet(&[]), date("2024-03-10"), Some(1)).unwrap();

        assert_eq!(range.start, date("2024-03-10"));
        assert!(range.needs_header);
    }

    #[test]
    fn header_only_sheet_uses_default_days_without_new_header() {
        let range = resolve(&sheet(&[&["date"]]), date("2024-03-10"), Some(3)).unwrap();

        assert_eq!(range.start, date("2024-03-08"));
        assert!(!range.needs_header);
    }

    #[test]
    fn up_to_date_sheet_yields_empty_range() {
        let snapshot = sheet(&[&["date"], &["2024-05-07"]]);

        let range = resolve(&snapshot, date("2024-05-07"), Some(30)).unwrap();

        assert!(range.is_empty());
        assert_eq!(range.days(), 0);
    }

    #[test]
    fn date_column_is_found_by_header() {
        let snapshot = sheet(&[
            &["note", "date"],
            &["2024-12-31", "2024-01-01"],
            &["", "2024-01-02"],
        ]);

        let range = resolve(&snapshot, date("2024-01-10"), None).unwrap();
        assert_eq!(range.start, date("2024-01-03"));
    }

    #[test]
    fn unformatted_serial_dates_resume_after_latest() {
        let snapshot = sheet(&[
            &["date", "resting_heart_rate"],
            &["45418", "58"],
            &["45419.0", "60"],
        ]);

        let range = resolve(&snapshot, date("2024-05-10"), None).unwrap();

        assert_eq!(range.start, date("2024-05-08"));
        assert_eq!(range.days(), 3);
    }

    #[test]
    fn parses_sheet_date_renderings() {
        assert_eq!(parse_date_cell("2024-05-06"), Some(date("2024-05-06")));
        assert_eq!(parse_date_cell("2024/05/06"), Some(date("2024-05-06")));
        assert_eq!(parse_date_cell("05/06/2024"), Some(date("2024-05-06")));
        assert_eq!(parse_date_cell("45418"), Some(date("2024-05-06")));
        assert_eq!(parse_date_cell("date"), None);
        assert_eq!(parse_date_cell(""), None);
    }
}
