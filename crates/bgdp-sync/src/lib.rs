//! Pipeline orchestration: the sequential batch loop, incremental
//! persistence and the downstream simplify pass.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use bgdp_core::{AttributeMapping, GameAttributeView, GameRecord};
use bgdp_extract::{discover_game_ids, parse_response, ApiResponse, ExtractOptions, Normalizer, RawItem};
use bgdp_storage::{
    BackoffPolicy, CsvChunkWriter, HttpTransport, HttpTransportConfig, RequestGate, Transport,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bgdp-sync";

/// Everything a run needs, in one explicit object: endpoints, artifact
/// paths, batching and retry policy. No hardcoded stage paths, no
/// process-wide state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub listing_url: String,
    pub detail_endpoint: String,
    pub output_path: PathBuf,
    pub ids_input_path: PathBuf,
    pub attribute_output_path: PathBuf,
    pub mechanics_map_path: PathBuf,
    pub category_map_path: PathBuf,
    pub reports_dir: PathBuf,
    pub batch_size: usize,
    pub max_retries: usize,
    pub flush_threshold: usize,
    pub min_request_interval_secs: u64,
    pub request_jitter_secs: u64,
    pub retry_base_delay_secs: u64,
    pub retry_jitter_secs: u64,
    pub busy_wait_secs: u64,
    pub publication_year_cutoff: Option<i32>,
    pub repair_mojibake: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            listing_url: "https://boardgamegeek.com/browse/boardgame".to_string(),
            detail_endpoint: "https://boardgamegeek.com/xmlapi2/thing".to_string(),
            output_path: PathBuf::from("data/bgg_games.csv"),
            ids_input_path: PathBuf::from("data/game_ids.csv"),
            attribute_output_path: PathBuf::from("data/game_simple_attributes.csv"),
            mechanics_map_path: PathBuf::from("data/simple_mechanics.csv"),
            category_map_path: PathBuf::from("data/simple_category.csv"),
            reports_dir: PathBuf::from("reports"),
            batch_size: 20,
            max_retries: 5,
            flush_threshold: 1000,
            min_request_interval_secs: 5,
            request_jitter_secs: 2,
            retry_base_delay_secs: 5,
            retry_jitter_secs: 3,
            busy_wait_secs: 5,
            publication_year_cutoff: Some(2021),
            repair_mojibake: true,
            user_agent: "bgdp-bot/0.1".to_string(),
            http_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
            jitter: Duration::from_secs(self.retry_jitter_secs),
            busy_wait: Duration::from_secs(self.busy_wait_secs),
        }
    }

    pub fn request_gate(&self) -> RequestGate {
        RequestGate::new(
            Duration::from_secs(self.min_request_interval_secs),
            Duration::from_secs(self.request_jitter_secs),
        )
    }

    pub fn extract_options(&self, with_descriptions: bool) -> ExtractOptions {
        ExtractOptions {
            publication_year_cutoff: self.publication_year_cutoff,
            with_descriptions,
            normalizer: Normalizer {
                repair_mojibake: self.repair_mojibake,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("no valid payload after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: usize, last_error: String },
}

/// Requests one identifier batch, waiting out busy sentinels and retrying
/// genuine parse/transport failures up to the configured bound. Busy
/// waits never consume an attempt: they are flow control, not failures.
pub struct BatchFetcher<'a, T: Transport + ?Sized> {
    transport: &'a T,
    endpoint: &'a str,
    backoff: BackoffPolicy,
}

impl<'a, T: Transport + ?Sized> BatchFetcher<'a, T> {
    pub fn new(transport: &'a T, endpoint: &'a str, backoff: BackoffPolicy) -> Self {
        Self {
            transport,
            endpoint,
            backoff,
        }
    }

    pub async fn fetch_batch(&self, ids: &[String]) -> Result<Vec<RawItem>, FetchFailure> {
        let url = format!("{}?id={}&stats=1", self.endpoint, ids.join(","));
        let mut attempts = 0usize;
        let mut last_error = String::new();

        while attempts < self.backoff.max_retries {
            let body = match self.transport.get_text(&url).await {
                Ok(body) => body,
                Err(err) => {
                    attempts += 1;
                    last_error = err.to_string();
                    warn!(attempt = attempts, max = self.backoff.max_retries, error = %last_error, "transport failure");
                    if attempts < self.backoff.max_retries {
                        tokio::time::sleep(self.backoff.retry_delay()).await;
                    }
                    continue;
                }
            };

            match parse_response(&body) {
                Ok(ApiResponse::Items(items)) => return Ok(items),
                Ok(ApiResponse::Busy(message)) => {
                    info!(message, wait_secs = self.backoff.busy_wait.as_secs(), "upstream busy, waiting");
                    tokio::time::sleep(self.backoff.busy_wait).await;
                    continue;
                }
                Err(err) => {
                    attempts += 1;
                    last_error = err.to_string();
                    warn!(attempt = attempts, max = self.backoff.max_retries, error = %last_error, "parse failure");
                    if attempts < self.backoff.max_retries {
                        tokio::time::sleep(self.backoff.retry_delay()).await;
                    }
                }
            }
        }

        Err(FetchFailure::ExhaustedRetries {
            attempts,
            last_error,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub kind: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub identifiers: usize,
    pub batches_fetched: usize,
    pub batches_skipped: usize,
    pub records_written: usize,
    pub flushes: usize,
    pub output_path: String,
    pub report_path: Option<String>,
}

pub struct Pipeline<T: Transport> {
    config: PipelineConfig,
    transport: T,
    gate: RequestGate,
}

impl Pipeline<HttpTransport> {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let transport = HttpTransport::new(HttpTransportConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..HttpTransportConfig::default()
        })?;
        Ok(Self::with_transport(config, transport))
    }
}

impl<T: Transport> Pipeline<T> {
    pub fn with_transport(config: PipelineConfig, transport: T) -> Self {
        let gate = config.request_gate();
        Self {
            config,
            transport,
            gate,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Full-catalog run: discover identifiers from the listing page, then
    /// scrape the catalog profile (no free-text columns).
    pub async fn run_catalog(&self, cancel: &AtomicBool) -> Result<RunSummary> {
        let listing = self
            .transport
            .get_text(&self.config.listing_url)
            .await
            .with_context(|| format!("fetching listing page {}", self.config.listing_url))?;
        let ids = discover_game_ids(&listing);
        anyhow::ensure!(
            !ids.is_empty(),
            "listing page {} yielded no identifiers; page structure changed?",
            self.config.listing_url
        );
        self.scrape(ids, false, "catalog", cancel).await
    }

    /// Description-focused run over identifiers from the input artifact.
    pub async fn run_descriptions(&self, cancel: &AtomicBool) -> Result<RunSummary> {
        let ids = load_ids_csv(&self.config.ids_input_path)?;
        anyhow::ensure!(
            !ids.is_empty(),
            "no usable identifiers in {}",
            self.config.ids_input_path.display()
        );
        info!(count = ids.len(), input = %self.config.ids_input_path.display(), "loaded identifiers");
        self.scrape(ids, true, "descriptions", cancel).await
    }

    async fn scrape(
        &self,
        ids: Vec<String>,
        with_descriptions: bool,
        kind: &str,
        cancel: &AtomicBool,
    ) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        // Full-rebuild semantics: a leftover artifact from a prior run is
        // removed before the first batch lands.
        if self.config.output_path.exists() {
            std::fs::remove_file(&self.config.output_path).with_context(|| {
                format!("removing stale artifact {}", self.config.output_path.display())
            })?;
        }

        let mut writer: CsvChunkWriter<GameRecord> =
            CsvChunkWriter::new(&self.config.output_path, self.config.flush_threshold);
        let fetcher = BatchFetcher::new(
            &self.transport,
            &self.config.detail_endpoint,
            self.config.backoff(),
        );
        let options = self.config.extract_options(with_descriptions);

        let total_batches = ids.len().div_ceil(self.config.batch_size.max(1));
        let mut status = RunStatus::Completed;
        let mut batches_fetched = 0usize;
        let mut batches_skipped = 0usize;

        for (index, batch) in ids.chunks(self.config.batch_size.max(1)).enumerate() {
            if cancel.load(Ordering::Relaxed) {
                warn!(kind, batch = index + 1, "cancellation requested, stopping before next batch");
                status = RunStatus::Cancelled;
                break;
            }

            self.gate.wait().await;
            info!(kind, batch = index + 1, total = total_batches, size = batch.len(), "fetching batch");

            match fetcher.fetch_batch(batch).await {
                Ok(items) => {
                    for record in bgdp_extract::extract_records(&items, &options) {
                        writer.push(record)?;
                    }
                    batches_fetched += 1;
                }
                // One bad batch must not abort the run.
                Err(err) => {
                    warn!(kind, batch = index + 1, ids = batch.join(","), error = %err, "skipping batch");
                    batches_skipped += 1;
                }
            }
        }

        let written = writer.finish()?;
        let mut summary = RunSummary {
            run_id,
            kind: kind.to_string(),
            status,
            started_at,
            finished_at: Utc::now(),
            identifiers: ids.len(),
            batches_fetched,
            batches_skipped,
            records_written: written.rows_written,
            flushes: written.flushes,
            output_path: written.path.display().to_string(),
            report_path: None,
        };
        summary.report_path = Some(self.write_report(&summary)?.display().to_string());
        info!(
            kind,
            run_id = %summary.run_id,
            records = summary.records_written,
            skipped = summary.batches_skipped,
            "run finished"
        );
        Ok(summary)
    }

    /// Downstream pass over a completed artifact: join the raw attribute
    /// lists against the static mapping tables and emit the narrowed
    /// attribute view.
    pub fn run_simplify(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mechanics_map = load_mapping_csv(&self.config.mechanics_map_path)?;
        let category_map = load_mapping_csv(&self.config.category_map_path)?;
        let records = load_records_csv(&self.config.output_path)?;

        if self.config.attribute_output_path.exists() {
            std::fs::remove_file(&self.config.attribute_output_path).with_context(|| {
                format!(
                    "removing stale artifact {}",
                    self.config.attribute_output_path.display()
                )
            })?;
        }

        let mut writer: CsvChunkWriter<GameAttributeView> = CsvChunkWriter::new(
            &self.config.attribute_output_path,
            self.config.flush_threshold,
        );
        let total = records.len();
        for record in &records {
            writer.push(GameAttributeView::from_record(
                record,
                &mechanics_map,
                &category_map,
            ))?;
        }
        let written = writer.finish()?;

        let mut summary = RunSummary {
            run_id,
            kind: "simplify".to_string(),
            status: RunStatus::Completed,
            started_at,
            finished_at: Utc::now(),
            identifiers: total,
            batches_fetched: 0,
            batches_skipped: 0,
            records_written: written.rows_written,
            flushes: written.flushes,
            output_path: written.path.display().to_string(),
            report_path: None,
        };
        summary.report_path = Some(self.write_report(&summary)?.display().to_string());
        info!(run_id = %summary.run_id, records = summary.records_written, "simplify finished");
        Ok(summary)
    }

    fn write_report(&self, summary: &RunSummary) -> Result<PathBuf> {
        let report_dir = self.config.reports_dir.join(summary.run_id.to_string());
        std::fs::create_dir_all(&report_dir)
            .with_context(|| format!("creating {}", report_dir.display()))?;
        let path = report_dir.join("summary.json");
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

/// Reads the identifier input artifact: takes the `id` column, drops
/// rows that are missing or not integer-like.
pub fn load_ids_csv(path: &Path) -> Result<Vec<String>> {
    let text = read_text_without_bom(path)?;
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .with_context(|| format!("reading headers of {}", path.display()))?;
    let id_column = headers
        .iter()
        .position(|h| h == "id")
        .with_context(|| format!("{} has no `id` column", path.display()))?;

    let mut ids = Vec::new();
    for row in reader.records() {
        let row = row.with_context(|| format!("reading row of {}", path.display()))?;
        let Some(raw) = row.get(id_column) else {
            continue;
        };
        if let Ok(id) = raw.trim().parse::<i64>() {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}

/// Two-column mapping table: raw value, canonical value. Header row
/// skipped; extra columns ignored.
pub fn load_mapping_csv(path: &Path) -> Result<AttributeMapping> {
    let text = read_text_without_bom(path)?;
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let mut mapping = AttributeMapping::default();
    for row in reader.records() {
        let row = row.with_context(|| format!("reading row of {}", path.display()))?;
        if let (Some(raw), Some(canonical)) = (row.get(0), row.get(1)) {
            if !raw.trim().is_empty() {
                mapping.insert(raw.trim(), canonical.trim());
            }
        }
    }
    Ok(mapping)
}

pub fn load_records_csv(path: &Path) -> Result<Vec<GameRecord>> {
    let text = read_text_without_bom(path)?;
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let record: GameRecord = row.with_context(|| format!("reading row of {}", path.display()))?;
        records.push(record);
    }
    Ok(records)
}

fn read_text_without_bom(path: &Path) -> Result<String> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(text.trim_start_matches('\u{feff}').to_string())
}
