//! Review sync pipeline: fetch -> map -> delta-filter -> CSV append ->
//! persist watermark. One sequential pass; idempotent across reruns.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use revsync_core::{map_response, AliasTable, Response, ReviewRow, CSV_COLUMNS};
use revsync_tally::TallyClient;

pub const CRATE_NAME: &str = "revsync-sync";

/// Watermark persisted between runs. Everything at or below it has already
/// been appended to the CSV.
///
/// Response ids are opaque, so ordering by id is not an option for the
/// equal-timestamp case. Instead the state keeps every id observed at
/// exactly the watermark timestamp; a tie is new only when its id is absent
/// from that set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seen_ids_at_watermark: BTreeSet<String>,
}

impl SyncState {
    /// Read prior state. A missing or unreadable file means first run.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(state) => Ok(state),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        %err,
                        "state file unreadable; starting from an empty watermark"
                    );
                    Ok(Self::default())
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => {
                Err(err).with_context(|| format!("reading state file {}", path.display()))
            }
        }
    }

    /// Write-then-rename so a crash can never leave the state pointing ahead
    /// of what actually reached the CSV.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating state directory {}", parent.display()))?;
            }
        }
        let mut bytes = serde_json::to_vec_pretty(self).context("serializing sync state")?;
        bytes.push(b'\n');

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "state".to_string());
        let temp_path = path.with_file_name(format!(".{file_name}.tmp"));
        std::fs::write(&temp_path, &bytes)
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        std::fs::rename(&temp_path, path).with_context(|| {
            format!(
                "renaming temp state file {} -> {}",
                temp_path.display(),
                path.display()
            )
        })?;
        Ok(())
    }

    /// Advance the watermark past a batch of ingested responses. Ties at the
    /// running watermark accumulate ids; a strictly newer timestamp resets
    /// the set. Responses without a parseable timestamp cannot move the
    /// watermark.
    pub fn advance(&mut self, ingested: &[Response]) {
        for response in ingested {
            let Some(submitted) = response.submitted_at() else {
                continue;
            };
            match self.last_submitted_at {
                Some(current) if submitted < current => {}
                Some(current) if submitted == current => {
                    self.seen_ids_at_watermark.insert(response.id.clone());
                }
                _ => {
                    self.last_submitted_at = Some(submitted);
                    self.seen_ids_at_watermark.clear();
                    self.seen_ids_at_watermark.insert(response.id.clone());
                }
            }
        }
    }
}

/// Stable pipeline order: ascending (submitted_at, id). Responses with no
/// parseable timestamp sort first.
pub fn sort_responses(responses: &mut [Response]) {
    responses.sort_by(|a, b| {
        (a.submitted_at(), a.id.as_str()).cmp(&(b.submitted_at(), b.id.as_str()))
    });
}

/// Keep only responses strictly beyond the watermark. Equal-timestamp
/// responses pass when their id has not been seen; unparseable timestamps
/// are treated as new.
pub fn filter_new(responses: Vec<Response>, state: &SyncState) -> Vec<Response> {
    let Some(watermark) = state.last_submitted_at else {
        return responses;
    };
    responses
        .into_iter()
        .filter(|response| match response.submitted_at() {
            None => true,
            Some(submitted) if submitted > watermark => true,
            Some(submitted) if submitted == watermark => {
                !state.seen_ids_at_watermark.contains(&response.id)
            }
            Some(_) => false,
        })
        .collect()
}

/// Append rows in fixed column order; create the file with a header when
/// absent or empty. Existing rows are never touched. Empty input is a no-op
/// that leaves the file alone.
pub fn append_rows(csv_path: &Path, rows: &[ReviewRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let needs_header = match std::fs::metadata(csv_path) {
        Ok(meta) => meta.len() == 0,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
        Err(err) => {
            return Err(err).with_context(|| format!("inspecting {}", csv_path.display()))
        }
    };
    if let Some(parent) = csv_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating csv directory {}", parent.display()))?;
        }
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)
        .with_context(|| format!("opening {} for append", csv_path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if needs_header {
        writer
            .write_record(CSV_COLUMNS)
            .with_context(|| format!("writing header to {}", csv_path.display()))?;
    }
    for row in rows {
        writer
            .write_record(row.csv_record())
            .with_context(|| format!("appending row to {}", csv_path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", csv_path.display()))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub enum ResponseSource {
    Api { api_key: String, form_id: String },
    Fixture(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SyncJobConfig {
    pub csv_path: PathBuf,
    pub state_path: PathBuf,
    pub source: ResponseSource,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub fetched: usize,
    pub appended: usize,
    pub watermark: Option<DateTime<Utc>>,
    pub dry_run: bool,
}

pub async fn run(config: &SyncJobConfig) -> Result<SyncRunSummary> {
    let aliases = AliasTable::builtin();
    run_with_aliases(config, &aliases).await
}

/// Run one sync pass. Append-then-commit ordering: a CSV failure aborts the
/// run before the state file moves, so a rerun picks the same delta up again.
pub async fn run_with_aliases(
    config: &SyncJobConfig,
    aliases: &AliasTable,
) -> Result<SyncRunSummary> {
    let mut responses = match &config.source {
        ResponseSource::Fixture(path) => revsync_tally::load_fixture(path)?,
        ResponseSource::Api { api_key, form_id } => {
            let client = TallyClient::new(api_key.clone())?;
            client.fetch_all_responses(form_id).await?
        }
    };
    sort_responses(&mut responses);
    let fetched = responses.len();

    let mut state = SyncState::load(&config.state_path)?;
    let new_responses = filter_new(responses, &state);

    let mut rows = Vec::with_capacity(new_responses.len());
    for response in &new_responses {
        if response.submitted_at().is_none() {
            warn!(
                response_id = %response.id,
                raw = ?response.submitted_at_raw(),
                "response has no parseable submission timestamp"
            );
        }
        let mapped = map_response(response, aliases);
        if mapped.recognized_fields == 0 {
            warn!(
                response_id = %response.id,
                "no answer labels matched any known alias; emitting an empty row"
            );
        }
        rows.push(mapped.row);
    }

    if config.dry_run {
        let rendered =
            serde_json::to_string_pretty(&rows).context("serializing dry-run rows")?;
        println!("{rendered}");
        return Ok(SyncRunSummary {
            fetched,
            appended: rows.len(),
            watermark: state.last_submitted_at,
            dry_run: true,
        });
    }

    append_rows(&config.csv_path, &rows)?;

    if !new_responses.is_empty() {
        state.advance(&new_responses);
        state.save(&config.state_path)?;
    }

    info!(
        fetched,
        appended = rows.len(),
        watermark = ?state.last_submitted_at,
        "sync run complete"
    );
    Ok(SyncRunSummary {
        fetched,
        appended: rows.len(),
        watermark: state.last_submitted_at,
        dry_run: false,
    })
}
