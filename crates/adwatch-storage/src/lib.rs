//! Durable partition storage + HTTP fetch utilities for adwatch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use adwatch_core::ListingRecord;
use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tracing::{info_span, warn};

pub const CRATE_NAME: &str = "adwatch-storage";

/// One JSON-array file per scope partition, replaced atomically on
/// every write. Readers only ever see the last fully renamed version.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, partition_id: &str) -> PathBuf {
        self.root.join(format!("{partition_id}.json"))
    }

    /// Returns the last durably written collection. A missing,
    /// unreadable, or corrupt file is an empty partition, never an
    /// error: the next completed scan rebuilds it.
    pub async fn read(&self, partition_id: &str) -> Vec<ListingRecord> {
        let path = self.partition_path(partition_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(partition_id, error = %err, "partition file unreadable, treating as empty");
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Vec<serde_json::Value>>(&bytes) {
            Ok(values) => values
                .into_iter()
                .filter_map(ListingRecord::from_value)
                .collect(),
            Err(err) => {
                warn!(partition_id, error = %err, "partition file corrupt, treating as empty");
                Vec::new()
            }
        }
    }

    /// Serializes the full collection to a temp file and atomically
    /// renames it over the partition's target path. On any failure the
    /// temp artifact is removed and the previous durable version is
    /// left untouched.
    pub async fn write(
        &self,
        partition_id: &str,
        records: &[ListingRecord],
    ) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating store root {}", self.root.display()))?;

        let path = self.partition_path(partition_id);
        let temp_path = self.root.join(format!("{partition_id}.json.tmp"));
        // Minified on purpose: partitions are re-read in full every
        // merge batch.
        let bytes =
            serde_json::to_vec(records).with_context(|| format!("serializing {partition_id}"))?;

        if let Err(err) = write_then_rename(&temp_path, &path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        Ok(())
    }
}

async fn write_then_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    fs::write(temp_path, bytes)
        .await
        .with_context(|| format!("writing temp partition file {}", temp_path.display()))?;
    fs::rename(temp_path, path).await.with_context(|| {
        format!(
            "atomically renaming {} -> {}",
            temp_path.display(),
            path.display()
        )
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    // 429 is deliberately not retried here: rate limits are surfaced
    // to the caller, which counts them against the enrichment breaker.
    if status.is_server_error() {
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

/// Bounded-attempt wrapper around a single remote call: a fixed
/// attempt cap with a fixed delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

/// Sequential HTTP client shared by the collectors. All calls are
/// causally ordered by the scan cycle; the fetcher itself only adds
/// timeout + bounded retry on top of reqwest.
#[derive(Debug)]
pub struct Fetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
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
            retry: config.retry,
        })
    }

    /// GET with bounded retry; non-2xx terminal statuses map to
    /// `FetchError::HttpStatus`.
    pub async fn get_with_retry(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_get", url);
        let _guard = span.enter();
        self.send_with_retry(url, || self.client.get(url)).await
    }

    /// Form POST with bounded retry, used by the authenticated search
    /// endpoint (CSRF token + session cookie headers).
    pub async fn post_form_with_retry(
        &self,
        url: &str,
        form: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post_form", url);
        let _guard = span.enter();
        self.send_with_retry(url, || {
            let mut req = self.client.post(url).form(form);
            for (name, value) in headers {
                req = req.header(*name, value);
            }
            req
        })
        .await
    }

    /// Single attempt with its own deadline, returning the response
    /// for any status. The contact-lookup path classifies 429/404
    /// itself instead of going through the retry loop.
    pub async fn get_once(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedResponse, reqwest::Error> {
        let resp = self.client.get(url).timeout(timeout).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse { status, body })
    }

    /// Single form-POST attempt with its own deadline. Used for the
    /// per-record image fragment, where a miss just means no images.
    pub async fn post_form_once(
        &self,
        url: &str,
        form: &[(&str, String)],
        headers: &[(&str, String)],
        timeout: Duration,
    ) -> Result<FetchedResponse, reqwest::Error> {
        let mut req = self.client.post(url).form(form).timeout(timeout);
        for (name, value) in headers {
            req = req.header(*name, value);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse { status, body })
    }

    async fn send_with_retry(
        &self,
        url: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse { status, body });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < max_attempts
                    {
                        tokio::time::sleep(self.retry.retry_delay).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < max_attempts
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.retry.retry_delay).await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(value: serde_json::Value) -> ListingRecord {
        ListingRecord::from_value(value).expect("object")
    }

    #[tokio::test]
    async fn write_then_read_round_trips_in_order() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let records = vec![
            record(json!({"ad_id": 1, "subject": "a"})),
            record(json!({"ad_id": 2, "subject": "b"})),
        ];

        store.write("ads-13110", &records).await.expect("write");
        let got = store.read("ads-13110").await;
        assert_eq!(got, records);
    }

    #[tokio::test]
    async fn missing_partition_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        assert!(store.read("ads-13110").await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_partition_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        fs::write(store.partition_path("ads-13110"), b"{not json")
            .await
            .expect("seed corrupt file");
        assert!(store.read("ads-13110").await.is_empty());
    }

    #[tokio::test]
    async fn orphan_temp_file_leaves_durable_partition_intact() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let records = vec![record(json!({"ad_id": 1}))];
        store.write("ads-13110", &records).await.expect("write");

        // Simulated crash mid-write: the temp artifact exists but was
        // never renamed over the target.
        fs::write(dir.path().join("ads-13110.json.tmp"), b"partial")
            .await
            .expect("seed orphan temp");

        assert_eq!(store.read("ads-13110").await, records);
    }

    #[tokio::test]
    async fn failed_rename_discards_temp_and_keeps_previous_version() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());

        // A directory squatting on the target path makes the rename
        // fail after the temp file has been written.
        fs::create_dir_all(store.partition_path("ads-13110"))
            .await
            .expect("squat target path");

        let result = store.write("ads-13110", &[record(json!({"ad_id": 1}))]).await;
        assert!(result.is_err());
        assert!(!dir.path().join("ads-13110.json.tmp").exists());
    }

    #[test]
    fn server_errors_are_retryable_and_rate_limits_are_not() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn retry_policy_defaults_to_three_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
    }
}
