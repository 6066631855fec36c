use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

mod args;
mod auth;
mod callback;
mod cfg;
mod csv_sink;
mod error;
mod fitbit;
mod job;
mod range;
mod records;
mod serverless;
mod session;
mod sheets;
mod token_store;

use args::{Args, Command};
use cfg::Cfg;
use job::{SyncOrchestrator, SyncRequest};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.no_color);

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    info!("Starting fitsheet_sync");

    let cfg = Cfg::load(&args)?;
    cfg.validate()?;

    match args.command {
        Command::Sync {
            kind,
            spreadsheet_id,
            sheet_name,
            default_days,
        } => {
            let request = SyncRequest {
                kind,
                spreadsheet_id,
                sheet_name,
                default_days,
            };
            SyncOrchestrator::from_cfg(&cfg).run(&request).await?;
        }
        Command::Fetch {
            kind,
            days,
            csv_out,
        } => {
            SyncOrchestrator::from_cfg(&cfg)
                .fetch(kind, days, csv_out.as_deref())
                .await?;
        }
        Command::Upload {
            csv_in,
            spreadsheet_id,
            sheet_name,
        } => {
            SyncOrchestrator::from_cfg(&cfg)
                .upload(&csv_in, &spreadsheet_id, &sheet_name)
                .await?;
        }
        Command::RefreshTokens {
            fitbit_only,
            google_only,
        } => {
            SyncOrchestrator::from_cfg(&cfg)
                .refresh_tokens(!google_only, !fitbit_only)
                .await?;
        }
        Command::Invoke { event } => {
            let event = match event {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading event {}", path.display()))?;
                    serde_json::from_str(&raw)
                        .with_context(|| format!("parsing event {}", path.display()))?
                }
                None => serverless::InvocationRequest::default(),
            };

            let lookup = |key: &str| std::env::var(key).ok();
            let response = serverless::handle(&cfg, event, &lookup).await;
            println!("{}", serde_json::to_string_pretty(&response)?);

            if !response.is_success() {
                anyhow::bail!("invocation failed with status {}", response.status_code);
            }
        }
    }

    info!("fitsheet_sync completed successfully");
    Ok(())
}

fn init_logging(level: &str, no_color: bool) {
    let filter = match level.to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" | "critical" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_ansi(!no_color)
        .init();
}
