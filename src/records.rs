use chrono::NaiveDate;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Which metric a run synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DataKind {
    Sleep,
    HeartRate,
}

impl DataKind {
    pub fn headers(self) -> Vec<String> {
        let names: &[&str] = match self {
            DataKind::Sleep => &SLEEP_HEADERS,
            DataKind::HeartRate => &HEART_RATE_HEADERS,
        };
        names.iter().map(|h| h.to_string()).collect()
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "sleep" => Some(DataKind::Sleep),
            "heart-rate" | "heart_rate" => Some(DataKind::HeartRate),
            _ => None,
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Sleep => write!(f, "sleep"),
            DataKind::HeartRate => write!(f, "heart-rate"),
        }
    }
}

const SLEEP_HEADERS: [&str; 13] = [
    "date",
    "start_time",
    "end_time",
    "duration_mins",
    "efficiency",
    "is_main_sleep",
    "minutes_asleep",
    "minutes_awake",
    "time_in_bed",
    "deep_minutes",
    "light_minutes",
    "rem_minutes",
    "wake_minutes",
];

const HEART_RATE_HEADERS: [&str; 2] = ["date", "resting_heart_rate"];

/// One sleep session. Stage minutes are only filled on the main sleep of a
/// night when the provider sent a stage summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepRecord {
    pub date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub duration_minutes: f64,
    pub efficiency_pct: u32,
    pub is_main_sleep: bool,
    pub minutes_asleep: u32,
    pub minutes_awake: u32,
    pub time_in_bed_minutes: u32,
    pub deep_minutes: Option<u32>,
    pub light_minutes: Option<u32>,
    pub rem_minutes: Option<u32>,
    pub wake_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateRecord {
    pub date: NaiveDate,
    pub resting_heart_rate: u32,
}

/// Records fetched for a single run, already in sheet order.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBatch {
    Sleep(Vec<SleepRecord>),
    HeartRate(Vec<HeartRateRecord>),
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        match self {
            RecordBatch::Sleep(records) => records.len(),
            RecordBatch::HeartRate(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> DataKind {
        match self {
            RecordBatch::Sleep(_) => DataKind::Sleep,
            RecordBatch::HeartRate(_) => DataKind::HeartRate,
        }
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        match self {
            RecordBatch::Sleep(records) => records.iter().map(|r| r.date).max(),
            RecordBatch::HeartRate(records) => records.iter().map(|r| r.date).max(),
        }
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        match self {
            RecordBatch::Sleep(records) => records.iter().map(|r| r.date).min(),
            RecordBatch::HeartRate(records) => records.iter().map(|r| r.date).min(),
        }
    }

    /// Cells ready for the Sheets `USER_ENTERED` append.
    pub fn to_rows(&self) -> Vec<Vec<Value>> {
        match self {
            RecordBatch::Sleep(records) => records.iter().map(SleepRecord::to_row).collect(),
            RecordBatch::HeartRate(records) => {
                records.iter().map(HeartRateRecord::to_row).collect()
            }
        }
    }
}

impl SleepRecord {
    pub fn to_row(&self) -> Vec<Value> {
        vec![
            Value::from(self.date.to_string()),
            Value::from(self.start_time.clone()),
            Value::from(self.end_time.clone()),
            Value::from(self.duration_minutes),
            Value::from(self.efficiency_pct),
            Value::from(self.is_main_sleep),
            Value::from(self.minutes_asleep),
            Value::from(self.minutes_awake),
            Value::from(self.time_in_bed_minutes),
            optional_cell(self.deep_minutes),
            optional_cell(self.light_minutes),
            optional_cell(self.rem_minutes),
            optional_cell(self.wake_minutes),
        ]
    }
}

impl HeartRateRecord {
    pub fn to_row(&self) -> Vec<Value> {
        vec![
            Value::from(self.date.to_string()),
            Value::from(self.resting_heart_rate),
        ]
    }
}

fn optional_cell(value: Option<u32>) -> Value {
    value.map(Value::from).unwrap_or_else(|| Value::from(""))
}

/// Main sleep first within a day, naps after it.
pub fn sort_sleep(records: &mut [SleepRecord]) {
    records.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| b.is_main_sleep.cmp(&a.is_main_sleep))
            .then_with(|| a.start_time.cmp(&b.start_time))
    });
}

pub fn sort_heart_rate(records: &mut [HeartRateRecord]) {
    records.sort_by_key(|r| r.date);
}

/// Renders a cell the way the CSV export and debug previews show it.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
