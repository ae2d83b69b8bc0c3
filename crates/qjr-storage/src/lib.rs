//! HTTP fetch utilities + record sink contracts for QJR.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use qjr_core::{EnrichedRecord, KnownRecords};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, info_span};

pub const CRATE_NAME: &str = "qjr-storage";

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Page source for the collector. The loop fetches one page at a time, so
/// the contract is a single URL in, decoded body out.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
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

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRecord {
    pub record_id: String,
}

/// Create-if-new persistence contract. `create` returning `Ok(None)` means
/// the sink itself rejected the record as a duplicate, which is a normal
/// outcome and distinct from the pipeline's own pre-filtering.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn known_records(&self) -> Result<KnownRecords, SinkError>;
    async fn create(&self, record: &EnrichedRecord) -> Result<Option<CreatedRecord>, SinkError>;
}

fn snapshot_from_records<'a>(records: impl Iterator<Item = &'a EnrichedRecord>) -> KnownRecords {
    let mut known = KnownRecords::default();
    for record in records {
        known.insert(&record.url, &record.composite_key());
    }
    known
}

/// In-memory sink for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<MemorySinkState>,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    records: Vec<EnrichedRecord>,
    next_id: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load a record so a snapshot already knows its identities.
    pub async fn seed(&self, record: EnrichedRecord) {
        let mut state = self.inner.lock().await;
        state.records.push(record);
        state.next_id += 1;
    }

    pub async fn records(&self) -> Vec<EnrichedRecord> {
        self.inner.lock().await.records.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.records.is_empty()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn known_records(&self) -> Result<KnownRecords, SinkError> {
        let state = self.inner.lock().await;
        Ok(snapshot_from_records(state.records.iter()))
    }

    async fn create(&self, record: &EnrichedRecord) -> Result<Option<CreatedRecord>, SinkError> {
        let mut state = self.inner.lock().await;
        let key = record.composite_key();
        let duplicate = state
            .records
            .iter()
            .any(|r| r.url == record.url || r.composite_key() == key);
        if duplicate {
            return Ok(None);
        }
        state.next_id += 1;
        let record_id = format!("rec{}", state.next_id);
        state.records.push(record.clone());
        Ok(Some(CreatedRecord { record_id }))
    }
}

/// Append-only JSON-lines sink: one `EnrichedRecord` per line. The whole
/// file is re-read for each snapshot, which keeps the layout trivially
/// recoverable and is cheap at collection-cycle cadence.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<EnrichedRecord>, SinkError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl RecordSink for JsonlSink {
    async fn known_records(&self) -> Result<KnownRecords, SinkError> {
        let records = self.read_all().await?;
        Ok(snapshot_from_records(records.iter()))
    }

    async fn create(&self, record: &EnrichedRecord) -> Result<Option<CreatedRecord>, SinkError> {
        let existing = self.read_all().await?;
        let key = record.composite_key();
        if existing
            .iter()
            .any(|r| r.url == record.url || r.composite_key() == key)
        {
            return Ok(None);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        let record_id = format!("line{}", existing.len() + 1);
        info!(title = %record.title, company = %record.company, "appended record to jsonl sink");
        Ok(Some(CreatedRecord { record_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use qjr_core::{CompanyInfo, JobCriteria, JobType, Priority};
    use tempfile::tempdir;

    fn mk_record(title: &str, company: &str, url: &str) -> EnrichedRecord {
        let ts = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).single().unwrap();
        EnrichedRecord {
            title: title.to_string(),
            company: company.to_string(),
            location: "Taipei City, Taiwan".to_string(),
            url: url.to_string(),
            source: "linkedin".to_string(),
            scraped_at: ts,
            posted_time: Some("2 days ago".to_string()),
            application_status: None,
            job_type: JobType::Remote,
            description: "desc".to_string(),
            criteria: JobCriteria::default(),
            company_info: CompanyInfo::default(),
            summary: "summary".to_string(),
            category: "Quantitative Research".to_string(),
            score: 75,
            priority: Priority::Medium,
            tags: vec!["Remote".to_string()],
            requirements: String::new(),
            benefits: String::new(),
            date_added: ts,
            status: "new".to_string(),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limited_status_is_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn memory_sink_rejects_duplicates_as_none() {
        let sink = MemorySink::new();
        let record = mk_record("Quant Researcher", "Acme Capital", "https://jobs/1");

        let first = sink.create(&record).await.unwrap();
        assert_eq!(first.unwrap().record_id, "rec1");

        let second = sink.create(&record).await.unwrap();
        assert!(second.is_none());
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn memory_sink_rejects_composite_match_with_different_url() {
        let sink = MemorySink::new();
        sink.seed(mk_record("Quant Researcher", "Acme Capital", "https://jobs/1"))
            .await;

        let reposted = mk_record("Quant Researcher", "Acme Capital", "https://jobs/999");
        let result = sink.create(&reposted).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn jsonl_sink_snapshot_round_trips_identities() {
        let dir = tempdir().expect("tempdir");
        let sink = JsonlSink::new(dir.path().join("jobs.jsonl"));

        assert!(sink.known_records().await.unwrap().is_empty());

        let record = mk_record("ML Engineer", "Globex", "https://jobs/42");
        let created = sink.create(&record).await.unwrap();
        assert!(created.is_some());

        let known = sink.known_records().await.unwrap();
        assert!(known.urls.contains("https://jobs/42"));
        assert!(known
            .composite_keys
            .contains(&record.composite_key()));

        let again = sink.create(&record).await.unwrap();
        assert!(again.is_none());
    }
}
