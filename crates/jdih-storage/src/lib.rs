//! HTTP fetch utilities, the identity ledger, and downloaded-file storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub mod download;
pub mod ledger;
pub mod store;

pub use download::{DownloadError, DownloadPipeline, DownloadSink};
pub use ledger::{Ledger, LedgerError, LedgerState};
pub use store::{FileStore, StoredFile};

pub const CRATE_NAME: &str = "jdih-storage";

/// Portal outages and throttling clear up on their own; a 404 or a
/// rejected query does not.
fn transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn transient_request_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Retries are opt-in. With the default of zero, a failed source waits for
/// the next scheduled run.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Lower bound for a spread refill interval.
pub const MIN_REFILL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// One request per `delay / workers`, so the aggregate rate across the
    /// pool stays at one request per `delay`.
    pub fn spread(delay: Duration, workers: usize) -> Option<Self> {
        if delay.is_zero() {
            return None;
        }
        let workers = u32::try_from(workers.max(1)).unwrap_or(u32::MAX);
        Some(Self {
            capacity: 1,
            refill_every: (delay / workers).max(MIN_REFILL_INTERVAL),
        })
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

    /// Waits for a token. A zero interval means no throttling.
    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
            if refills > 0 {
                let added = u32::try_from(refills).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(added).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(wait.max(Duration::from_micros(100))).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    source_gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed JSON from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

struct AttemptFailure {
    transient: bool,
    error: FetchError,
}

/// Appends query parameters to `base`, keeping any it already carries.
pub fn url_with_query<K, V>(base: &str, params: &[(K, V)]) -> Result<String, FetchError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut url = Url::parse(base).map_err(|e| FetchError::InvalidUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })?;
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in params {
            pairs.append_pair(k.as_ref(), v.as_ref());
        }
    }
    Ok(url.to_string())
}

/// Resolves `href` against `base`; absolute links pass through unchanged.
pub fn absolutize(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    Url::parse(base).ok()?.join(href).ok().map(|u| u.to_string())
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            source_gates: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    /// One semaphore per portal, created on first use.
    async fn source_gate(&self, source_id: &str) -> Arc<Semaphore> {
        let mut gates = self.source_gates.lock().await;
        Arc::clone(
            gates
                .entry(source_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit))),
        )
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(source_id, url).instrument(span).await
    }

    async fn fetch_with_retries(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let gate = self.source_gate(source_id).await;
        let _source = gate.acquire().await.expect("semaphore not closed");

        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }
            let failure = match self.get_once(url).await {
                Ok(resp) => return Ok(resp),
                Err(failure) => failure,
            };
            if !failure.transient || attempt >= self.backoff.max_retries {
                return Err(failure.error);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?delay, error = %failure.error, "transient failure, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn get_once(&self, url: &str) -> Result<FetchedResponse, AttemptFailure> {
        let resp = self.client.get(url).send().await.map_err(|err| AttemptFailure {
            transient: transient_request_error(&err),
            error: FetchError::Request(err),
        })?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(AttemptFailure {
                transient: transient_status(status),
                error: FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                },
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        // A body cut off mid-stream is not worth another round trip.
        let body = resp
            .bytes()
            .await
            .map_err(|err| AttemptFailure {
                transient: false,
                error: FetchError::Request(err),
            })?
            .to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, source_id: &str, url: &str) -> Result<T, FetchError> {
        let resp = self.fetch_bytes(source_id, url).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Json {
            url: resp.final_url,
            source,
        })
    }

    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(source_id, url).await?.text())
    }
}
