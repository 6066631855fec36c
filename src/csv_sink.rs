use csv::{ReaderBuilder, Writer};
use serde_json::Value;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info};

use crate::error::SyncResult;
use crate::records::{cell_text, RecordBatch};

/// Writes a batch to a fresh CSV file, replacing any previous contents.
/// The header is always written, so an empty batch leaves a header-only file.
pub fn write(csv_path: &Path, batch: &RecordBatch) -> SyncResult<usize> {
    info!("Writing {} rows to CSV file: {}", batch.len(), csv_path.display());

    if let Some(parent) = csv_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut writer = Writer::from_writer(File::create(csv_path)?);
    writer.write_record(batch.kind().headers())?;

    let rows = batch.to_rows();
    for row in &rows {
        writer.write_record(row.iter().map(cell_text))?;
    }

    writer.flush()?;
    debug!("Data saved to {}", csv_path.display());
    Ok(rows.len())
}

/// A CSV file loaded for upload: its header and its data rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Reads a CSV with a header row. Numeric and boolean cells are typed so
/// Sheets stores them as values rather than text.
pub fn read_table(csv_path: &Path) -> SyncResult<CsvTable> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(csv_path)?;
    let headers = reader.headers()?.iter().map(str::to_string).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(typed_cell).collect());
    }

    info!("Loaded {} rows from {}", rows.len(), csv_path.display());
    Ok(CsvTable { headers, rows })
}

fn typed_cell(raw: &str) -> Value {
    match raw {
        "True" | "true" => return Value::Bool(true),
        "False" | "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Value::from(int);
    }
    match raw.parse::<f64>() {
        Ok(float) if float.is_finite() => Value::from(float),
        _ => Value::from(raw),
    }
}
