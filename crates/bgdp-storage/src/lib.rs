//! HTTP transport, retry/rate-limit policy objects and the incremental
//! CSV writer for the board game data pipeline.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info_span;

pub const CRATE_NAME: &str = "bgdp-storage";

/// UTF-8 byte-order mark written once at the head of every artifact so
/// spreadsheet tools pick the right encoding for multi-byte text.
pub const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry policy for genuine failures: a base delay plus a small uniform
/// jitter, bounded by `max_retries`. The upstream busy sentinel is waited
/// out separately (see `busy_wait`) and never counts against the bound.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub jitter: Duration,
    pub busy_wait: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(5),
            jitter: Duration::from_secs(3),
            busy_wait: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn retry_delay(&self) -> Duration {
        self.base_delay + random_jitter(self.jitter)
    }
}

fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max.as_millis() as u64))
}

/// Enforces a global minimum interval between outbound requests. Owned by
/// the orchestrating loop; a politeness contract with the upstream
/// service, so the interval applies even across independent batches.
#[derive(Debug)]
pub struct RequestGate {
    min_interval: Duration,
    jitter: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestGate {
    pub fn new(min_interval: Duration, jitter: Duration) -> Self {
        Self {
            min_interval,
            jitter,
            last_request: Mutex::new(None),
        }
    }

    /// Sleeps until at least `min_interval` (+ jitter) has elapsed since
    /// the previous call, then records the new request instant.
    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval + random_jitter(self.jitter);
            tokio::time::sleep_until(ready_at).await;
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Minimal outbound surface of the pipeline, kept behind a trait so the
/// fetch loop can run against a scripted fake in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get_text(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Bound and delay for transient transport retries (5xx / connect /
    /// timeout). Distinct from the parse-failure policy the fetch loop
    /// applies on top.
    pub transient_retries: usize,
    pub transient_delay: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            transient_retries: 3,
            transient_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    transient_retries: usize,
    transient_delay: Duration,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            transient_retries: config.transient_retries,
            transient_delay: config.transient_delay,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_get", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.transient_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.transient_retries
                    {
                        tokio::time::sleep(self.transient_delay).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.transient_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.transient_delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

/// Counters reported by a finished [`CsvChunkWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterSummary {
    pub path: PathBuf,
    pub flushes: usize,
    pub rows_written: usize,
}

/// Buffers records and flushes them to a CSV artifact in fixed-size
/// chunks. The first flush truncates/creates the file and writes the BOM
/// plus the header row; later flushes append rows only. An empty
/// remainder is never flushed.
#[derive(Debug)]
pub struct CsvChunkWriter<T: Serialize> {
    path: PathBuf,
    flush_threshold: usize,
    buffer: Vec<T>,
    flushes: usize,
    rows_written: usize,
    created: bool,
}

impl<T: Serialize> CsvChunkWriter<T> {
    pub fn new(path: impl Into<PathBuf>, flush_threshold: usize) -> Self {
        Self {
            path: path.into(),
            flush_threshold: flush_threshold.max(1),
            buffer: Vec::new(),
            flushes: 0,
            rows_written: 0,
            created: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, record: T) -> anyhow::Result<()> {
        self.buffer.push(record);
        if self.buffer.len() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let file = if self.created {
            OpenOptions::new()
                .append(true)
                .open(&self.path)
                .with_context(|| format!("appending to {}", self.path.display()))?
        } else {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
            }
            let mut file = File::create(&self.path)
                .with_context(|| format!("creating {}", self.path.display()))?;
            file.write_all(UTF8_BOM)
                .with_context(|| format!("writing BOM to {}", self.path.display()))?;
            file
        };

        let mut writer = csv::WriterBuilder::new()
            .has_headers(!self.created)
            .from_writer(file);
        for record in self.buffer.drain(..) {
            writer
                .serialize(record)
                .with_context(|| format!("serializing row to {}", self.path.display()))?;
            self.rows_written += 1;
        }
        writer
            .flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;

        self.created = true;
        self.flushes += 1;
        Ok(())
    }

    /// Flushes the remainder (if any) and reports the final counters.
    pub fn finish(mut self) -> anyhow::Result<WriterSummary> {
        self.flush()?;
        Ok(WriterSummary {
            path: self.path,
            flushes: self.flushes,
            rows_written: self.rows_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: String,
        title: Option<String>,
    }

    fn mk_row(i: usize) -> Row {
        Row {
            id: i.to_string(),
            title: Some(format!("game {i}")),
        }
    }

    fn read_rows(path: &Path) -> (String, Vec<Row>) {
        let bytes = std::fs::read(path).expect("read artifact");
        assert!(bytes.starts_with(UTF8_BOM), "artifact missing UTF-8 BOM");
        let text = String::from_utf8(bytes[UTF8_BOM.len()..].to_vec()).expect("utf-8");
        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let header = reader
            .headers()
            .expect("headers")
            .iter()
            .collect::<Vec<_>>()
            .join(",");
        let rows = reader
            .deserialize()
            .collect::<Result<Vec<Row>, _>>()
            .expect("rows");
        (header, rows)
    }

    #[test]
    fn threshold_produces_expected_flush_chunks() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("games.csv");
        let mut writer = CsvChunkWriter::new(&path, 1000);

        for i in 0..2500 {
            writer.push(mk_row(i)).expect("push");
        }
        let summary = writer.finish().expect("finish");

        // 1000 + 1000 + the 500 remainder.
        assert_eq!(summary.flushes, 3);
        assert_eq!(summary.rows_written, 2500);

        let (header, rows) = read_rows(&path);
        assert_eq!(header, "id,title");
        assert_eq!(rows.len(), 2500);
        assert_eq!(rows[0].id, "0");
        assert_eq!(rows[2499].id, "2499");

        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(text.matches("id,title").count(), 1, "header must appear once");
    }

    #[test]
    fn exact_multiple_of_threshold_skips_empty_remainder_flush() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("games.csv");
        let mut writer = CsvChunkWriter::new(&path, 500);
        for i in 0..1000 {
            writer.push(mk_row(i)).expect("push");
        }
        let summary = writer.finish().expect("finish");
        assert_eq!(summary.flushes, 2);
        assert_eq!(summary.rows_written, 1000);
    }

    #[test]
    fn no_rows_means_no_artifact() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("games.csv");
        let writer: CsvChunkWriter<Row> = CsvChunkWriter::new(&path, 10);
        let summary = writer.finish().expect("finish");
        assert_eq!(summary.flushes, 0);
        assert!(!path.exists());
    }

    #[test]
    fn first_flush_truncates_leftover_artifact() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("games.csv");
        std::fs::write(&path, "stale,content\n1,2\n").expect("seed stale file");

        let mut writer = CsvChunkWriter::new(&path, 10);
        writer.push(mk_row(1)).expect("push");
        writer.finish().expect("finish");

        let (header, rows) = read_rows(&path);
        assert_eq!(header, "id,title");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn multibyte_text_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("games.csv");
        let mut writer = CsvChunkWriter::new(&path, 10);
        writer
            .push(Row {
                id: "1".into(),
                title: Some("Café Mélange — 中文 überspiel".into()),
            })
            .expect("push");
        writer.finish().expect("finish");

        let (_, rows) = read_rows(&path);
        assert_eq!(rows[0].title.as_deref(), Some("Café Mélange — 中文 überspiel"));
    }

    #[tokio::test(start_paused = true)]
    async fn request_gate_spaces_out_consecutive_requests() {
        let gate = RequestGate::new(Duration::from_secs(5), Duration::ZERO);
        let started = Instant::now();
        gate.wait().await;
        assert!(started.elapsed() < Duration::from_millis(10), "first wait is free");
        gate.wait().await;
        assert!(started.elapsed() >= Duration::from_secs(5));
        gate.wait().await;
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[test]
    fn backoff_delay_stays_within_jitter_window() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(5),
            jitter: Duration::from_secs(3),
            busy_wait: Duration::from_secs(5),
        };
        for _ in 0..32 {
            let delay = policy.retry_delay();
            assert!(delay >= Duration::from_secs(5));
            assert!(delay <= Duration::from_secs(8));
        }
    }

    #[test]
    fn status_classification_matches_rate_limit_semantics() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
