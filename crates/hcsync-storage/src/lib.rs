//! Record-store access, HTTP transport and raw feed archiving for hcsync.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hcsync_core::{Base, CustomerRecord, ProductRecord, RecordUpdate, StoreRecord, Table};
use reqwest::StatusCode;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod airtable;
mod memory;

pub use airtable::{AirtableConfig, AirtableStore};
pub use memory::{MemoryRecordStore, WriteCall};
pub use reqwest::{Method, Url};

pub const CRATE_NAME: &str = "hcsync-storage";

/// The record store accepts at most this many records per write request.
pub const MAX_RECORDS_PER_REQUEST: usize = 10;

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed, write-once archive of raw upstream feed payloads.
#[derive(Debug, Clone)]
pub struct FeedArchive {
    root: PathBuf,
}

impl FeedArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        feed: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim_start_matches('.').trim() {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(feed)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Archive a payload under its hash; identical payloads in the same slot are written once.
    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        feed: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.payload_relative_path(fetched_at, feed, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedPayload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp payload {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp payload {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp payload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

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
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// The record store allows five requests per second per base.
    pub fn record_store() -> Self {
        Self {
            capacity: 5,
            refill_every: Duration::from_millis(200),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            {
                let mut state = self.state.lock().await;
                let refill_ms = self.refill_every.as_millis();
                let elapsed = state.last_refill.elapsed();
                if refill_ms > 0 && elapsed >= self.refill_every {
                    let refills = (elapsed.as_millis() / refill_ms) as u32;
                    state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                    state.last_refill = Instant::now();
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
            }
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

/// A request description the fetcher can rebuild for every retry attempt.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub json_body: Option<JsonValue>,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            json_body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: JsonValue) -> Self {
        self.json_body = Some(body);
        self
    }

    /// POST creates records, so only failures that never reached the server are retried.
    fn is_idempotent(&self) -> bool {
        self.method != Method::POST
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable response body from {url}: {source}")]
    Body {
        url: String,
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<SimpleTokenBucket>,
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
            token_bucket: config
                .token_bucket
                .map(|c| SimpleTokenBucket::new(c.capacity, c.refill_every)),
            backoff: config.backoff,
        })
    }

    fn build(&self, spec: &RequestSpec) -> reqwest::RequestBuilder {
        let mut request = self.client.request(spec.method.clone(), &spec.url);
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !spec.query.is_empty() {
            request = request.query(&spec.query);
        }
        if let Some(body) = &spec.json_body {
            request = request.json(body);
        }
        request
    }

    /// Send a request, retrying transient failures with exponential backoff.
    pub async fn send(
        &self,
        label: &str,
        spec: &RequestSpec,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", label, method = %spec.method, url = %spec.url);
        self.send_with_retries(spec).instrument(span).await
    }

    async fn send_with_retries(&self, spec: &RequestSpec) -> Result<FetchedResponse, FetchError> {
        let idempotent = spec.is_idempotent();
        let mut attempt = 0usize;

        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }
            let can_retry = attempt < self.backoff.max_retries;

            match self.build(spec).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let retryable = classify_status(status) == RetryDisposition::Retryable
                        && (idempotent || status == StatusCode::TOO_MANY_REQUESTS);
                    if !(retryable && can_retry) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    debug!(status = status.as_u16(), attempt, "retrying after status");
                }
                Err(err) => {
                    let retryable = classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && (idempotent || err.is_connect());
                    if !(retryable && can_retry) {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, attempt, "retrying after transport error");
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {table} from {base}: {source}")]
    Read {
        base: Base,
        table: Table,
        #[source]
        source: FetchError,
    },
    #[error("writing {table} in {base} failed after {applied_chunks} of {total_chunks} chunks: {source}")]
    WriteFailure {
        base: Base,
        table: Table,
        applied_chunks: usize,
        total_chunks: usize,
        #[source]
        source: FetchError,
    },
    #[error("decoding {table} records from {base}: {source}")]
    Decode {
        base: Base,
        table: Table,
        #[source]
        source: serde_json::Error,
    },
    #[error("no record-store base id configured for {0}")]
    UnknownBase(Base),
}

/// Capability the sync needs from the relational record store.
///
/// Writes are chunked by the implementation; a failing chunk leaves earlier
/// chunks applied and is reported as [`StoreError::WriteFailure`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_all_stores(&self, base: Base) -> Result<Vec<StoreRecord>, StoreError>;

    async fn get_all_products(&self, base: Base) -> Result<Vec<ProductRecord>, StoreError>;

    async fn get_all_customers(&self, base: Base) -> Result<Vec<CustomerRecord>, StoreError>;

    async fn get_stores_by_ids(
        &self,
        base: Base,
        ids: &[String],
    ) -> Result<Vec<StoreRecord>, StoreError> {
        let stores = self.get_all_stores(base).await?;
        Ok(stores.into_iter().filter(|s| ids.contains(&s.id)).collect())
    }

    async fn update_many(
        &self,
        base: Base,
        table: Table,
        updates: &[RecordUpdate],
    ) -> Result<(), StoreError>;

    /// Create records from field maps, returning the new ids in input order.
    async fn create_many(
        &self,
        base: Base,
        table: Table,
        records: &[JsonMap<String, JsonValue>],
    ) -> Result<Vec<String>, StoreError>;
}

pub fn chunk_count(records: usize) -> usize {
    records.div_ceil(MAX_RECORDS_PER_REQUEST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn payload_hashing_is_stable() {
        assert_eq!(
            FeedArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_payloads_are_archived_once() {
        let dir = tempdir().expect("tempdir");
        let archive = FeedArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2020-04-20T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .archive(fetched_at, "appian", "json", br#"{"data":[]}"#)
            .await
            .expect("first archive");
        let second = archive
            .archive(fetched_at, "appian", "json", br#"{"data":[]}"#)
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20200420_120000/appian"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn empty_extension_falls_back_to_bin() {
        let archive = FeedArchive::new("/tmp/unused");
        let at = DateTime::parse_from_rfc3339("2020-04-20T00:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let path = archive.payload_relative_path(at, "sheets", "abc", ".");
        assert_eq!(path, PathBuf::from("20200420_000000/sheets/abc.bin"));
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
    fn rate_limits_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn creates_are_not_treated_as_idempotent() {
        assert!(RequestSpec::get("http://x").is_idempotent());
        assert!(RequestSpec::new(Method::PATCH, "http://x").is_idempotent());
        assert!(!RequestSpec::new(Method::POST, "http://x").is_idempotent());
    }

    #[test]
    fn writes_are_chunked_by_ten() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(10), 1);
        assert_eq!(chunk_count(11), 2);
    }

    #[tokio::test]
    async fn token_bucket_hands_out_capacity_without_waiting() {
        let bucket = SimpleTokenBucket::new(3, Duration::from_secs(60));
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
