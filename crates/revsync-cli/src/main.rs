use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use revsync_sync::{ResponseSource, SyncJobConfig};

#[derive(Debug, Parser)]
#[command(name = "revsync")]
#[command(about = "Sync Tally form reviews into the reviews CSV")]
struct Cli {
    /// Path to the reviews CSV that should be updated.
    #[arg(long)]
    csv_path: PathBuf,

    /// File used to store the last-processed response watermark.
    #[arg(long)]
    state_file: PathBuf,

    /// Local JSON file with pre-fetched responses; skips the network entirely.
    #[arg(long)]
    responses_file: Option<PathBuf>,

    /// Print mapped rows without writing the CSV or the state file.
    #[arg(long)]
    dry_run: bool,

    /// Tally API key.
    #[arg(long, env = "TALLY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Tally form id.
    #[arg(long, env = "TALLY_FORM_ID")]
    form_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let source = match (cli.responses_file, cli.api_key, cli.form_id) {
        (Some(path), _, _) => ResponseSource::Fixture(path),
        (None, Some(api_key), Some(form_id)) => ResponseSource::Api { api_key, form_id },
        _ => bail!("TALLY_API_KEY and TALLY_FORM_ID must be provided unless --responses-file is used"),
    };

    let config = SyncJobConfig {
        csv_path: cli.csv_path,
        state_path: cli.state_file,
        source,
        dry_run: cli.dry_run,
    };

    let summary = revsync_sync::run(&config).await?;
    println!(
        "sync complete: fetched={} appended={} dry_run={}",
        summary.fetched, summary.appended, summary.dry_run
    );
    Ok(())
}
