use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::records::DataKind;

#[derive(Parser, Debug)]
#[command(name = "fitsheet_sync")]
#[command(about = "Sync Fitbit sleep and resting heart rate data into Google Sheets")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Disable colored log output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Never open a browser; fail if a provider needs authorization
    #[arg(long, global = true)]
    pub headless: bool,

    /// Path to config file
    #[arg(long, global = true, default_value = "config/config.toml")]
    pub config: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Append any days missing from the worksheet
    Sync {
        /// Which data to sync
        #[arg(long = "type", value_enum)]
        kind: DataKind,

        #[arg(long, value_name = "ID")]
        spreadsheet_id: String,

        #[arg(long, default_value = "Sheet1")]
        sheet_name: String,

        /// Days to fetch when the worksheet has no data yet
        #[arg(long, value_name = "N")]
        default_days: Option<u32>,
    },

    /// Fetch recent data and write it to CSV
    Fetch {
        #[arg(long = "type", value_enum)]
        kind: DataKind,

        /// Number of days ending today
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..))]
        days: u32,

        /// CSV file to append to; omit to only log a preview
        #[arg(long, value_name = "PATH")]
        csv_out: Option<PathBuf>,
    },

    /// Append the rows of a CSV file to a worksheet
    Upload {
        #[arg(long, value_name = "PATH")]
        csv_in: PathBuf,

        #[arg(long, value_name = "ID")]
        spreadsheet_id: String,

        #[arg(long, default_value = "Sheet1")]
        sheet_name: String,
    },

    /// Refresh stored tokens, re-authorizing where needed
    RefreshTokens {
        #[arg(long, conflicts_with = "google_only")]
        fitbit_only: bool,

        #[arg(long)]
        google_only: bool,
    },

    /// Run one serverless-style invocation and print the JSON response
    Invoke {
        /// JSON event file; stdin is not read
        #[arg(long, value_name = "PATH")]
        event: Option<PathBuf>,
    },
}
