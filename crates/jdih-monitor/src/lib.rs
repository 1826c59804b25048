//! Monitor orchestration: fetch, classify and deduplicate every selected
//! source, then hand new documents to the download sink.
//!
//! Per source: `fetching -> parsing -> classifying -> (new | duplicate |
//! rejected) -> recorded`, with downloads attempted only for documents that
//! were recorded as new in the same run.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use jdih_adapters::{adapter_for_source, AdapterContext, SourceAdapter, SourceConfig, SourceRegistry};
use jdih_core::{Classifier, Document};
use jdih_storage::{
    BackoffPolicy, DownloadError, DownloadPipeline, DownloadSink, FileStore, HttpClientConfig,
    HttpFetcher, Ledger, LedgerError, TokenBucketConfig,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

mod report;

pub use report::{
    write_report, DownloadFailure, DownloadRecord, RetryReport, RunReport, SourceError,
    SourceErrorKind, SourceListing, SourceStatus, SourceSummary, StatusReport,
};

pub const CRATE_NAME: &str = "jdih-monitor";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub state_file: PathBuf,
    pub download_dir: PathBuf,
    /// YAML source table; the built-in table is used when unset or missing.
    pub sources_file: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub workers: usize,
    /// Aggregate spacing between requests, shared across all workers.
    pub request_delay: Duration,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub max_retries: usize,
    pub scheduler_cron: String,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("data/raw/jdih_monitor_state.json"),
            download_dir: PathBuf::from("data/raw/umk"),
            sources_file: None,
            reports_dir: None,
            workers: 4,
            request_delay: Duration::from_millis(1000),
            user_agent: format!("jdih-monitor/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 30,
            download_timeout_secs: 60,
            max_retries: 0,
            scheduler_cron: "0 0 6 * * *".to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            state_file: env_path("JDIH_STATE_FILE").unwrap_or(defaults.state_file),
            download_dir: env_path("JDIH_DOWNLOAD_DIR").unwrap_or(defaults.download_dir),
            sources_file: env_path("JDIH_SOURCES_FILE"),
            reports_dir: env_path("JDIH_REPORTS_DIR"),
            workers: env_or("JDIH_WORKERS", defaults.workers).max(1),
            request_delay: Duration::from_millis(env_or(
                "JDIH_REQUEST_DELAY_MS",
                defaults.request_delay.as_millis() as u64,
            )),
            user_agent: std::env::var("JDIH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("JDIH_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            download_timeout_secs: env_or("JDIH_DOWNLOAD_TIMEOUT_SECS", defaults.download_timeout_secs),
            max_retries: env_or("JDIH_MAX_RETRIES", defaults.max_retries),
            scheduler_cron: std::env::var("JDIH_SCHEDULER_CRON").unwrap_or(defaults.scheduler_cron),
        }
    }

    fn client_config(&self, timeout_secs: u64) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.workers.max(1),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
            token_bucket: TokenBucketConfig::spread(self.request_delay, self.workers),
            ..Default::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        self.client_config(self.http_timeout_secs)
    }

    pub fn download_client_config(&self) -> HttpClientConfig {
        self.client_config(self.download_timeout_secs)
    }
}

/// Resolves a configured source to its adapter.
pub type AdapterLookup =
    Arc<dyn Fn(&SourceConfig) -> Option<Box<dyn SourceAdapter>> + Send + Sync>;

struct SourceCheck {
    summary: SourceSummary,
    new_documents: Vec<Document>,
    error: Option<String>,
}

#[derive(Default)]
struct DownloadBatch {
    downloaded: Vec<DownloadRecord>,
    unresolved: Vec<DownloadFailure>,
    failed: Vec<DownloadFailure>,
}

pub struct Monitor {
    registry: SourceRegistry,
    ledger: Arc<Ledger>,
    http: Arc<HttpFetcher>,
    rules: Arc<Classifier>,
    sink: Option<Arc<dyn DownloadSink>>,
    adapters: AdapterLookup,
    workers: usize,
}

impl Monitor {
    pub fn new(registry: SourceRegistry, ledger: Arc<Ledger>, http: Arc<HttpFetcher>) -> Self {
        Self {
            registry,
            ledger,
            http,
            rules: Arc::new(Classifier::default()),
            sink: None,
            adapters: Arc::new(adapter_for_source),
            workers: 4,
        }
    }

    /// Wires the registry, ledger, HTTP client and download pipeline from
    /// `config`. Fails when the ledger file exists but cannot be read.
    pub fn from_config(config: &MonitorConfig) -> Result<Self> {
        let registry = SourceRegistry::load(config.sources_file.as_deref())?;
        let ledger = Ledger::open(config.state_file.clone())
            .with_context(|| format!("opening ledger {}", config.state_file.display()))?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let downloads = DownloadPipeline::new(
            HttpFetcher::new(config.download_client_config())?,
            FileStore::new(config.download_dir.clone()),
        );
        Ok(Self::new(registry, Arc::new(ledger), Arc::new(http))
            .with_workers(config.workers)
            .with_download_sink(Arc::new(downloads)))
    }

    pub fn with_rules(mut self, rules: Classifier) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    pub fn with_download_sink(mut self, sink: Arc<dyn DownloadSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_adapters<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&SourceConfig) -> Option<Box<dyn SourceAdapter>> + Send + Sync + 'static,
    {
        self.adapters = Arc::new(lookup);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Checks `codes`, or every enabled source when `codes` is empty.
    ///
    /// Source failures end up in the report. The only error returned is a
    /// ledger that could not be persisted, since continuing would leave the
    /// next run unable to tell what was already seen.
    pub async fn run(&self, codes: &[String], download: bool) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let ctx = AdapterContext::now(run_id);

        let codes: Vec<String> = if codes.is_empty() {
            self.registry.enabled().map(|s| s.code.clone()).collect()
        } else {
            let mut unique = BTreeSet::new();
            codes
                .iter()
                .map(|c| c.trim().to_lowercase())
                .filter(|c| unique.insert(c.clone()))
                .collect()
        };
        info!(%run_id, sources = codes.len(), download, "run started");

        let mut source_errors = Vec::new();
        let mut adapters = Vec::new();
        for code in &codes {
            let Some(config) = self.registry.get(code) else {
                warn!(source = %code, "source is not configured; skipping");
                source_errors.push(SourceError {
                    code: code.clone(),
                    kind: SourceErrorKind::Configuration,
                    message: "source code is not configured".to_string(),
                });
                continue;
            };
            match (self.adapters)(config) {
                Some(adapter) => adapters.push(adapter),
                None => {
                    warn!(source = %code, "no adapter for source; skipping");
                    source_errors.push(SourceError {
                        code: code.clone(),
                        kind: SourceErrorKind::Configuration,
                        message: "no adapter implements this source".to_string(),
                    });
                }
            }
        }

        let mut report = RunReport {
            run_id,
            started_at,
            finished_at: started_at,
            sources: Vec::new(),
            new_documents: Vec::new(),
            downloaded: Vec::new(),
            unresolved_downloads: Vec::new(),
            failed_downloads: Vec::new(),
            source_errors,
        };

        for check in self.check_sources(adapters, &ctx).await? {
            if let Some(message) = check.error {
                report.source_errors.push(SourceError {
                    code: check.summary.code.clone(),
                    kind: SourceErrorKind::Fetch,
                    message,
                });
            }
            report.sources.push(check.summary);
            report.new_documents.extend(check.new_documents);
        }

        if download {
            match &self.sink {
                Some(sink) => {
                    let batch = self.download_all(sink, &report.new_documents).await?;
                    for record in &batch.downloaded {
                        if let Some(doc) = report.new_documents.iter_mut().find(|d| {
                            d.source == record.source && d.identity.as_str() == record.identity
                        }) {
                            doc.mark_retrieved(record.local_path.clone());
                        }
                    }
                    report.downloaded = batch.downloaded;
                    report.unresolved_downloads = batch.unresolved;
                    report.failed_downloads = batch.failed;
                }
                None => warn!("download requested but no download sink is configured"),
            }
        }

        report.finished_at = Utc::now();
        info!(
            %run_id,
            new = report.new_documents.len(),
            downloaded = report.downloaded.len(),
            source_errors = report.source_errors.len(),
            "run finished"
        );
        Ok(report)
    }

    /// Downloads every recorded document that has a file link and was never
    /// retrieved.
    pub async fn retry_downloads(&self) -> Result<RetryReport> {
        let sink = self
            .sink
            .as_ref()
            .context("no download sink is configured")?;
        let pending = self.ledger.pending_downloads();
        info!(pending = pending.len(), "retrying downloads");
        let batch = self.download_all(sink, &pending).await?;
        Ok(RetryReport {
            attempted: pending.len(),
            downloaded: batch.downloaded,
            unresolved: batch.unresolved,
            failed: batch.failed,
        })
    }

    pub fn status(&self) -> StatusReport {
        let state = self.ledger.snapshot();

        let mut sources: Vec<SourceStatus> = self
            .registry
            .sources
            .iter()
            .map(|s| SourceStatus {
                code: s.code.clone(),
                name: Some(s.name.clone()),
                configured: true,
                last_check: state.last_check.get(&s.code).copied(),
                seen: state.seen_count(&s.code),
            })
            .collect();
        let known: BTreeSet<String> = state
            .seen_ids
            .keys()
            .chain(state.last_check.keys())
            .cloned()
            .collect();
        for code in known {
            if self.registry.get(&code).is_some() {
                continue;
            }
            sources.push(SourceStatus {
                last_check: state.last_check.get(&code).copied(),
                seen: state.seen_count(&code),
                code,
                name: None,
                configured: false,
            });
        }

        let recent_from = state.documents.len().saturating_sub(5);
        StatusReport {
            ledger_path: self.ledger.path().to_path_buf(),
            sources,
            total_documents: state.documents.len(),
            pending_downloads: self.ledger.pending_downloads().len(),
            recent: state.documents[recent_from..].to_vec(),
        }
    }

    pub fn list(&self) -> Vec<SourceListing> {
        self.registry
            .sources
            .iter()
            .map(|s| SourceListing {
                code: s.code.clone(),
                name: s.name.clone(),
                crawlability: s.crawlability,
                enabled: s.enabled,
                implemented: (self.adapters)(s).is_some(),
                notes: s.notes.clone(),
            })
            .collect()
    }

    async fn check_sources(
        &self,
        adapters: Vec<Box<dyn SourceAdapter>>,
        ctx: &AdapterContext,
    ) -> Result<Vec<SourceCheck>> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for (index, adapter) in adapters.into_iter().enumerate() {
            let permits = Arc::clone(&permits);
            let http = Arc::clone(&self.http);
            let ledger = Arc::clone(&self.ledger);
            let rules = Arc::clone(&self.rules);
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore not closed");
                let code = adapter.source_id().to_string();
                // A panicking adapter is reported against its source only.
                let check = match tokio::spawn(async move {
                    check_source(&*adapter, &http, &ledger, &rules, &ctx).await
                })
                .await
                {
                    Ok(check) => check,
                    Err(err) => {
                        warn!(source = %code, error = %err, "source task aborted");
                        Ok(SourceCheck {
                            summary: SourceSummary {
                                code,
                                ..Default::default()
                            },
                            new_documents: Vec::new(),
                            error: Some(format!("source task aborted: {err}")),
                        })
                    }
                };
                (index, check)
            });
        }

        let mut checks = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let (index, check) = joined.context("source task failed")?;
            checks.push((index, check?));
        }
        checks.sort_by_key(|(index, _)| *index);
        Ok(checks.into_iter().map(|(_, check)| check).collect())
    }

    async fn download_all(
        &self,
        sink: &Arc<dyn DownloadSink>,
        documents: &[Document],
    ) -> Result<DownloadBatch> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut unresolved = Vec::new();
        for (index, document) in documents.iter().enumerate() {
            if document.file_url.is_none() {
                unresolved.push((
                    index,
                    DownloadFailure {
                        document: document.clone(),
                        reason: DownloadError::NoFileUrl.to_string(),
                    },
                ));
                continue;
            }
            let permits = Arc::clone(&permits);
            let sink = Arc::clone(sink);
            let document = document.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore not closed");
                let result = sink.store(&document).await;
                (index, document, result)
            });
        }

        let mut downloaded = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, document, result) = joined.context("download task failed")?;
            match result {
                Ok(stored) => {
                    let local_path = stored.absolute_path.display().to_string();
                    self.ledger
                        .mark_retrieved(&document.source, &document.identity, &local_path)?;
                    downloaded.push((
                        index,
                        DownloadRecord {
                            source: document.source.clone(),
                            identity: document.identity.to_string(),
                            local_path,
                            bytes: stored.byte_size,
                            already_stored: stored.deduplicated,
                        },
                    ));
                }
                Err(err @ (DownloadError::NoFileUrl | DownloadError::MarkupResponse { .. })) => {
                    warn!(source = %document.source, identity = %document.identity, error = %err, "download unresolved");
                    unresolved.push((index, DownloadFailure { document, reason: err.to_string() }));
                }
                Err(err) => {
                    warn!(source = %document.source, identity = %document.identity, error = %err, "download failed");
                    failed.push((index, DownloadFailure { document, reason: err.to_string() }));
                }
            }
        }

        Ok(DownloadBatch {
            downloaded: in_order(downloaded),
            unresolved: in_order(unresolved),
            failed: in_order(failed),
        })
    }
}

fn in_order<T>(mut indexed: Vec<(usize, T)>) -> Vec<T> {
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, item)| item).collect()
}

async fn check_source(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    ledger: &Ledger,
    rules: &Classifier,
    ctx: &AdapterContext,
) -> Result<SourceCheck, LedgerError> {
    let code = adapter.source_id();
    info!(source = code, run_id = %ctx.run_id, "checking source");
    let outcome = adapter.fetch(http, ctx).await;

    let mut summary = SourceSummary {
        code: code.to_string(),
        requests: outcome.requests,
        fetched: outcome.items.len(),
        ..Default::default()
    };
    let mut new_documents = Vec::new();
    for item in &outcome.items {
        let Some(document) = adapter.parse(item, ctx, rules) else {
            summary.rejected += 1;
            continue;
        };
        if ledger.seen(&document.source, &document.identity) {
            summary.duplicates += 1;
            continue;
        }

        let document = if document.file_url.is_none() {
            match adapter.resolve_file_url(http, &document).await {
                Ok(file_url) => document.with_file_url(file_url),
                Err(err) => {
                    warn!(source = code, identity = %document.identity, error = %err, "file link lookup failed");
                    document
                }
            }
        } else {
            document
        };

        if ledger.record(&document)? {
            info!(source = code, identity = %document.identity, title = %document.title, "new document");
            summary.new += 1;
            new_documents.push(document);
        } else {
            summary.duplicates += 1;
        }
    }

    let error = outcome.error.map(|err| {
        warn!(source = code, error = %err, "source fetch failed");
        err.to_string()
    });
    ledger.touch_last_check(code, Utc::now())?;
    info!(
        source = code,
        new = summary.new,
        duplicates = summary.duplicates,
        rejected = summary.rejected,
        "source checked"
    );
    Ok(SourceCheck {
        summary,
        new_documents,
        error,
    })
}

/// Cron job re-running every enabled source. Reports are written when
/// `reports_dir` is set.
pub async fn build_scheduler(
    monitor: Arc<Monitor>,
    cron: &str,
    download: bool,
    reports_dir: Option<PathBuf>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let monitor = Arc::clone(&monitor);
        let reports_dir = reports_dir.clone();
        Box::pin(async move {
            match monitor.run(&[], download).await {
                Ok(report) => {
                    if let Some(dir) = reports_dir {
                        if let Err(err) = write_report(&report, &dir).await {
                            warn!(error = %err, "writing scheduled run report failed");
                        }
                    }
                }
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Runs the scheduler until Ctrl-C.
pub async fn watch(
    monitor: Arc<Monitor>,
    cron: &str,
    download: bool,
    reports_dir: Option<PathBuf>,
) -> Result<()> {
    let mut sched = build_scheduler(monitor, cron, download, reports_dir).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron, "scheduler started; waiting for ctrl-c");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use jdih_adapters::{AdapterError, Crawlability, FetchOutcome, RawItem};
    use jdih_core::{DocumentDraft, DocumentId, DocumentType};
    use jdih_storage::StoredFile;
    use serde_json::json;
    use tempfile::tempdir;

    const UMK_TITLE: &str =
        "Keputusan Gubernur Nomor 188/45/2025 tentang Upah Minimum Sektoral Kabupaten Tahun 2025";
    const UMP_TITLE: &str = "Keputusan Gubernur Nomor 561/12/2024 tentang Upah Minimum Provinsi Tahun 2025";

    #[derive(Clone)]
    struct FakeAdapter {
        code: &'static str,
        items: Vec<RawItem>,
        error: Option<String>,
        resolved_url: Option<String>,
        panics: bool,
        fetches: Arc<AtomicUsize>,
        resolves: Arc<AtomicUsize>,
    }

    impl FakeAdapter {
        fn new(code: &'static str, items: Vec<RawItem>) -> Self {
            Self {
                code,
                items,
                error: None,
                resolved_url: None,
                panics: false,
                fetches: Arc::default(),
                resolves: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for FakeAdapter {
        fn source_id(&self) -> &'static str {
            self.code
        }

        fn crawlability(&self) -> Crawlability {
            Crawlability::Api
        }

        async fn fetch(&self, _http: &HttpFetcher, _ctx: &AdapterContext) -> FetchOutcome {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("listing layout changed");
            }
            FetchOutcome {
                items: self.items.clone(),
                requests: 1,
                error: self.error.clone().map(AdapterError::Message),
            }
        }

        fn draft(&self, item: &RawItem) -> Option<DocumentDraft> {
            let RawItem::Json(value) = item else {
                return None;
            };
            let mut draft = DocumentDraft::new(
                self.code,
                value.get("id")?.as_str()?,
                value.get("title")?.as_str()?,
            );
            draft.file_url = value.get("file").and_then(|f| f.as_str()).map(String::from);
            Some(draft)
        }

        async fn resolve_file_url(
            &self,
            _http: &HttpFetcher,
            _document: &Document,
        ) -> Result<Option<String>, AdapterError> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(self.resolved_url.clone())
        }
    }

    #[derive(Default)]
    struct FakeSink {
        calls: Mutex<Vec<String>>,
        failing: AtomicBool,
        markup: AtomicBool,
    }

    impl FakeSink {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DownloadSink for FakeSink {
        async fn store(&self, document: &Document) -> Result<StoredFile, DownloadError> {
            self.calls.lock().unwrap().push(document.identity.to_string());
            if self.failing.load(Ordering::SeqCst) {
                return Err(DownloadError::Store(anyhow::anyhow!("disk full")));
            }
            if self.markup.load(Ordering::SeqCst) {
                return Err(DownloadError::MarkupResponse {
                    url: document.file_url.clone().unwrap_or_default(),
                    content_type: "text/html".to_string(),
                });
            }
            Ok(StoredFile {
                content_hash: "00".to_string(),
                relative_path: PathBuf::from(format!("{}.pdf", document.identity)),
                absolute_path: PathBuf::from(format!("/srv/jdih/{}.pdf", document.identity)),
                byte_size: 4,
                deduplicated: false,
            })
        }
    }

    fn item(id: &str, title: &str, file: Option<&str>) -> RawItem {
        RawItem::Json(json!({"id": id, "title": title, "file": file}))
    }

    fn monitor(dir: &Path, adapters: Vec<FakeAdapter>, sink: Option<Arc<FakeSink>>) -> Monitor {
        let ledger = Ledger::open(dir.join("state.json")).unwrap();
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let mut monitor = Monitor::new(SourceRegistry::builtin(), Arc::new(ledger), Arc::new(http))
            .with_workers(2)
            .with_adapters(move |config| {
                adapters
                    .iter()
                    .find(|a| a.code == config.code)
                    .map(|a| Box::new(a.clone()) as Box<dyn SourceAdapter>)
            });
        if let Some(sink) = sink {
            monitor = monitor.with_download_sink(sink);
        }
        monitor
    }

    fn codes(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn second_run_over_unchanged_source_finds_nothing_and_downloads_nothing() {
        let dir = tempdir().unwrap();
        let mut jatim = FakeAdapter::new(
            "jatim",
            vec![
                item("1", UMK_TITLE, Some("https://files.test/1.pdf")),
                item("2", UMP_TITLE, None),
                item("3", "Peraturan Gubernur tentang Cagar Budaya Tahun 2025", None),
            ],
        );
        jatim.resolved_url = Some("https://files.test/2.pdf".to_string());
        let (fetches, resolves) = (jatim.fetches.clone(), jatim.resolves.clone());
        let sink = Arc::new(FakeSink::default());
        let monitor = monitor(dir.path(), vec![jatim], Some(sink.clone()));

        let first = monitor.run(&codes(&["jatim"]), true).await.unwrap();
        assert_eq!(first.new_documents.len(), 2);
        assert_eq!(first.new_documents[0].document_type, DocumentType::Umsk);
        assert_eq!(first.new_documents[1].file_url.as_deref(), Some("https://files.test/2.pdf"));
        assert_eq!(first.downloaded.len(), 2);
        assert_eq!(first.sources[0].rejected, 1);
        assert_eq!(resolves.load(Ordering::SeqCst), 1);
        let after_first = monitor.ledger().snapshot();

        let second = monitor.run(&codes(&["jatim"]), true).await.unwrap();
        assert!(second.new_documents.is_empty());
        assert!(second.downloaded.is_empty());
        assert_eq!(second.sources[0].duplicates, 2);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(resolves.load(Ordering::SeqCst), 1);
        assert_eq!(sink.calls().len(), 2);

        let after_second = monitor.ledger().snapshot();
        assert_eq!(after_first.seen_ids, after_second.seen_ids);
        assert_eq!(after_first.documents, after_second.documents);
        assert!(after_second.documents.iter().all(|d| d.retrieved));
    }

    #[tokio::test]
    async fn document_without_file_link_is_unresolved_and_never_reaches_sink() {
        let dir = tempdir().unwrap();
        let ntb = FakeAdapter::new("ntb", vec![item("908", UMP_TITLE, None)]);
        let sink = Arc::new(FakeSink::default());
        let monitor = monitor(dir.path(), vec![ntb], Some(sink.clone()));

        let report = monitor.run(&codes(&["ntb"]), true).await.unwrap();
        assert_eq!(report.new_documents.len(), 1);
        assert_eq!(report.unresolved_downloads.len(), 1);
        assert!(report.failed_downloads.is_empty());
        assert!(report.source_errors.is_empty());
        assert!(sink.calls().is_empty());
        assert!(monitor.ledger().seen("ntb", &DocumentId::from("908")));
    }

    #[tokio::test]
    async fn configuration_errors_do_not_abort_the_batch() {
        let dir = tempdir().unwrap();
        let jatim = FakeAdapter::new("jatim", vec![item("1", UMK_TITLE, None)]);
        let monitor = monitor(dir.path(), vec![jatim], None);

        let report = monitor
            .run(&codes(&["jabar", "jateng", "jatim"]), false)
            .await
            .unwrap();
        assert_eq!(report.new_documents.len(), 1);
        let errored: Vec<_> = report
            .source_errors
            .iter()
            .map(|e| (e.code.as_str(), e.kind))
            .collect();
        assert_eq!(
            errored,
            [
                ("jabar", SourceErrorKind::Configuration),
                ("jateng", SourceErrorKind::Configuration)
            ]
        );
    }

    #[tokio::test]
    async fn fetch_error_keeps_items_already_classified() {
        let dir = tempdir().unwrap();
        let mut jatim = FakeAdapter::new("jatim", vec![item("1", UMK_TITLE, None)]);
        jatim.error = Some("http status 500 for page 2".to_string());
        let broken = FakeAdapter {
            error: Some("request failed: timed out".to_string()),
            ..FakeAdapter::new("bengkulu", Vec::new())
        };
        let monitor = monitor(dir.path(), vec![jatim, broken], None);

        let report = monitor.run(&codes(&["bengkulu", "jatim"]), false).await.unwrap();
        assert_eq!(report.new_documents.len(), 1);
        assert_eq!(report.sources.len(), 2);
        assert_eq!(report.sources[0].code, "bengkulu");
        assert_eq!(report.sources[0].new, 0);
        assert_eq!(report.source_errors.len(), 2);
        assert!(report
            .source_errors
            .iter()
            .all(|e| e.kind == SourceErrorKind::Fetch));
        let state = monitor.ledger().snapshot();
        assert!(state.last_check.contains_key("bengkulu"));
        assert!(state.last_check.contains_key("jatim"));
    }

    #[tokio::test]
    async fn failed_download_keeps_ledger_entry_until_explicit_retry() {
        let dir = tempdir().unwrap();
        let jatim = FakeAdapter::new("jatim", vec![item("7", UMK_TITLE, Some("https://files.test/7.pdf"))]);
        let sink = Arc::new(FakeSink::default());
        sink.failing.store(true, Ordering::SeqCst);
        let monitor = monitor(dir.path(), vec![jatim], Some(sink.clone()));

        let first = monitor.run(&codes(&["jatim"]), true).await.unwrap();
        assert_eq!(first.failed_downloads.len(), 1);
        assert!(!first.is_clean());
        assert_eq!(monitor.ledger().pending_downloads().len(), 1);

        let second = monitor.run(&codes(&["jatim"]), true).await.unwrap();
        assert!(second.new_documents.is_empty());
        assert_eq!(sink.calls().len(), 1);

        sink.failing.store(false, Ordering::SeqCst);
        let retry = monitor.retry_downloads().await.unwrap();
        assert_eq!(retry.attempted, 1);
        assert_eq!(retry.downloaded.len(), 1);
        assert!(monitor.ledger().pending_downloads().is_empty());

        let reopened = Ledger::open(dir.path().join("state.json")).unwrap();
        let doc = &reopened.snapshot().documents[0];
        assert!(doc.retrieved);
        assert_eq!(doc.local_path.as_deref(), Some("/srv/jdih/7.pdf"));
    }

    #[tokio::test]
    async fn markup_download_is_unresolved_not_failed() {
        let dir = tempdir().unwrap();
        let jatim = FakeAdapter::new("jatim", vec![item("9", UMK_TITLE, Some("https://files.test/9"))]);
        let sink = Arc::new(FakeSink::default());
        sink.markup.store(true, Ordering::SeqCst);
        let monitor = monitor(dir.path(), vec![jatim], Some(sink.clone()));

        let report = monitor.run(&codes(&["jatim"]), true).await.unwrap();
        assert_eq!(sink.calls(), ["9"]);
        assert!(report.downloaded.is_empty());
        assert!(report.failed_downloads.is_empty());
        assert_eq!(report.unresolved_downloads.len(), 1);
        assert!(report.unresolved_downloads[0].reason.contains("text/html"));
        assert!(report.is_clean());
        assert!(monitor.ledger().seen("jatim", &DocumentId::from("9")));
        assert_eq!(monitor.ledger().pending_downloads().len(), 1);
    }

    #[tokio::test]
    async fn downloaded_documents_are_marked_retrieved_in_the_report() {
        let dir = tempdir().unwrap();
        let jatim = FakeAdapter::new(
            "jatim",
            vec![item("4", UMK_TITLE, Some("https://files.test/4.pdf")), item("5", UMP_TITLE, None)],
        );
        let sink = Arc::new(FakeSink::default());
        let monitor = monitor(dir.path(), vec![jatim], Some(sink));

        let report = monitor.run(&codes(&["jatim"]), true).await.unwrap();
        assert_eq!(report.downloaded.len(), 1);
        let stored = report.new_documents.iter().find(|d| d.identity.as_str() == "4").unwrap();
        assert!(stored.retrieved);
        assert_eq!(stored.local_path.as_deref(), Some("/srv/jdih/4.pdf"));
        let pending = report.new_documents.iter().find(|d| d.identity.as_str() == "5").unwrap();
        assert!(!pending.retrieved);
        assert!(pending.local_path.is_none());

        let ledger_doc = monitor
            .ledger()
            .snapshot()
            .documents
            .into_iter()
            .find(|d| d.identity.as_str() == "4")
            .unwrap();
        assert_eq!(&ledger_doc, stored);
    }

    #[tokio::test]
    async fn panicking_adapter_is_reported_against_its_source_only() {
        let dir = tempdir().unwrap();
        let mut ntb = FakeAdapter::new("ntb", Vec::new());
        ntb.panics = true;
        let jatim = FakeAdapter::new("jatim", vec![item("1", UMK_TITLE, None)]);
        let monitor = monitor(dir.path(), vec![ntb, jatim], None);

        let report = monitor.run(&codes(&["ntb", "jatim"]), false).await.unwrap();
        assert_eq!(report.sources.len(), 2);
        assert_eq!(report.new_documents.len(), 1);
        assert_eq!(report.new_documents[0].source, "jatim");
        assert_eq!(report.source_errors.len(), 1);
        assert_eq!(report.source_errors[0].code, "ntb");
        assert_eq!(report.source_errors[0].kind, SourceErrorKind::Fetch);
        assert!(report.source_errors[0].message.contains("aborted"));
    }

    #[tokio::test]
    async fn retry_without_sink_is_an_error() {
        let dir = tempdir().unwrap();
        let monitor = monitor(dir.path(), Vec::new(), None);
        assert!(monitor.retry_downloads().await.is_err());
    }

    #[tokio::test]
    async fn unpersistable_ledger_fails_the_run() {
        let dir = tempdir().unwrap();
        let jatim = FakeAdapter::new("jatim", vec![item("1", UMK_TITLE, None)]);
        let monitor = monitor(dir.path(), vec![jatim], None);
        std::fs::create_dir_all(dir.path().join("state.json")).unwrap();

        let result = monitor.run(&codes(&["jatim"]), false).await;
        assert!(result.is_err());
        assert!(!monitor.ledger().seen("jatim", &DocumentId::from("1")));
    }

    #[tokio::test]
    async fn empty_selection_runs_every_enabled_source() {
        let dir = tempdir().unwrap();
        let adapters = ["jatim", "bengkulu", "ntb", "jateng", "jakarta", "kaltim"]
            .into_iter()
            .map(|code| FakeAdapter::new(code, Vec::new()))
            .collect::<Vec<_>>();
        let fetches: Vec<_> = adapters.iter().map(|a| a.fetches.clone()).collect();
        let monitor = monitor(dir.path(), adapters, None);

        let report = monitor.run(&[], false).await.unwrap();
        assert_eq!(report.sources.len(), 6);
        assert_eq!(report.sources[0].code, "jatim");
        assert!(fetches.iter().all(|f| f.load(Ordering::SeqCst) == 1));
    }

    #[tokio::test]
    async fn status_lists_configured_sources_with_counts() {
        let dir = tempdir().unwrap();
        let jatim = FakeAdapter::new(
            "jatim",
            vec![item("1", UMK_TITLE, None), item("2", UMP_TITLE, Some("https://files.test/2.pdf"))],
        );
        let monitor = monitor(dir.path(), vec![jatim], None);
        monitor.run(&codes(&["jatim"]), false).await.unwrap();

        let status = monitor.status();
        let jatim = status.sources.iter().find(|s| s.code == "jatim").unwrap();
        assert_eq!(jatim.seen, 2);
        assert!(jatim.last_check.is_some());
        let ntb = status.sources.iter().find(|s| s.code == "ntb").unwrap();
        assert_eq!(ntb.seen, 0);
        assert!(ntb.last_check.is_none());
        assert_eq!(status.total_documents, 2);
        assert_eq!(status.pending_downloads, 1);
        assert_eq!(status.recent.len(), 2);
        assert!(status.to_text().contains("pending downloads: 1"));

        let listing = monitor.list();
        assert!(listing.iter().find(|s| s.code == "jatim").unwrap().implemented);
        assert!(!listing.iter().find(|s| s.code == "kaltim").unwrap().implemented);
        let ntb = listing.iter().find(|s| s.code == "ntb").unwrap();
        assert_eq!(ntb.notes.as_deref(), Some("API publishes no file link"));
    }

    #[tokio::test]
    async fn report_is_written_as_markdown_and_json() {
        let dir = tempdir().unwrap();
        let jatim = FakeAdapter::new("jatim", vec![item("1", UMK_TITLE, None)]);
        let monitor = monitor(dir.path(), vec![jatim], None);
        let report = monitor.run(&codes(&["jatim", "jabar"]), false).await.unwrap();

        let out = write_report(&report, &dir.path().join("reports")).await.unwrap();
        let summary = std::fs::read_to_string(out.join("summary.md")).unwrap();
        assert!(summary.contains("New documents: 1"));
        assert!(summary.contains("jabar (configuration)"));
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("new_documents.json")).unwrap()).unwrap();
        assert_eq!(json["counts"]["jatim"], 1);
        assert_eq!(json["documents"][0]["decree_number"], "188/45/2025");
    }

    #[test]
    fn config_defaults_match_documented_environment() {
        let config = MonitorConfig::default();
        assert_eq!(config.state_file, PathBuf::from("data/raw/jdih_monitor_state.json"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_retries, 0);
        let http = config.http_client_config();
        assert_eq!(http.timeout, Duration::from_secs(30));
        assert_eq!(http.token_bucket.unwrap().refill_every, Duration::from_millis(250));
        assert_eq!(config.download_client_config().timeout, Duration::from_secs(60));
    }
}
