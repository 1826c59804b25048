//! Run, retry and status reports, plus their on-disk rendering.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jdih_adapters::Crawlability;
use jdih_core::Document;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorKind {
    /// Unknown code, or a code with no adapter behind it.
    Configuration,
    /// Network failure, non-2xx status or malformed payload.
    Fetch,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceError {
    pub code: String,
    pub kind: SourceErrorKind,
    pub message: String,
}

/// Counters for one source in one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceSummary {
    pub code: String,
    pub requests: usize,
    pub fetched: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub new: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadRecord {
    pub source: String,
    pub identity: String,
    pub local_path: String,
    pub bytes: usize,
    pub already_stored: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadFailure {
    pub document: Document,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceSummary>,
    /// Newly classified documents in source order, then listing order.
    pub new_documents: Vec<Document>,
    pub downloaded: Vec<DownloadRecord>,
    /// No file link could be found, or the link served a markup page.
    pub unresolved_downloads: Vec<DownloadFailure>,
    pub failed_downloads: Vec<DownloadFailure>,
    pub source_errors: Vec<SourceError>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.source_errors.is_empty() && self.failed_downloads.is_empty()
    }

    pub fn to_markdown(&self) -> String {
        let mut out = format!(
            "# JDIH Monitor Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- New documents: {}\n- Downloaded: {}\n- Unresolved downloads: {}\n- Failed downloads: {}\n- Source errors: {}\n",
            self.run_id,
            self.started_at,
            self.finished_at,
            self.new_documents.len(),
            self.downloaded.len(),
            self.unresolved_downloads.len(),
            self.failed_downloads.len(),
            self.source_errors.len(),
        );

        out.push_str("\n## Sources\n");
        for s in &self.sources {
            out.push_str(&format!(
                "- {}: {} new, {} duplicate, {} rejected ({} items, {} requests)\n",
                s.code, s.new, s.duplicates, s.rejected, s.fetched, s.requests
            ));
        }

        if !self.new_documents.is_empty() {
            out.push_str("\n## New documents\n");
            for doc in &self.new_documents {
                out.push_str(&format!("- {}\n", document_line(doc)));
            }
        }
        for (heading, failures) in [
            ("Unresolved downloads", &self.unresolved_downloads),
            ("Failed downloads", &self.failed_downloads),
        ] {
            if failures.is_empty() {
                continue;
            }
            out.push_str(&format!("\n## {heading}\n"));
            for f in failures {
                out.push_str(&format!("- [{}] {}: {}\n", f.document.source, f.document.title, f.reason));
            }
        }
        if !self.source_errors.is_empty() {
            out.push_str("\n## Source errors\n");
            for e in &self.source_errors {
                let kind = match e.kind {
                    SourceErrorKind::Configuration => "configuration",
                    SourceErrorKind::Fetch => "fetch",
                };
                out.push_str(&format!("- {} ({kind}): {}\n", e.code, e.message));
            }
        }
        out
    }
}

pub(crate) fn document_line(doc: &Document) -> String {
    let year = doc.year.map_or_else(|| "-".to_string(), |y| y.to_string());
    format!(
        "[{}] {} ({} {}, {})",
        doc.source,
        doc.title,
        doc.document_type,
        year,
        doc.decree_number.as_deref().unwrap_or("no decree number")
    )
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub downloaded: Vec<DownloadRecord>,
    pub unresolved: Vec<DownloadFailure>,
    pub failed: Vec<DownloadFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub code: String,
    pub name: Option<String>,
    pub configured: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub seen: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub ledger_path: PathBuf,
    pub sources: Vec<SourceStatus>,
    pub total_documents: usize,
    pub pending_downloads: usize,
    /// Up to five most recently recorded documents, newest last.
    pub recent: Vec<Document>,
}

impl StatusReport {
    pub fn to_text(&self) -> String {
        let mut out = format!("ledger: {}\n", self.ledger_path.display());
        for s in &self.sources {
            let last = s
                .last_check
                .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
            let name = s.name.as_deref().unwrap_or("(not configured)");
            out.push_str(&format!("  {:<10} {:<28} last check: {last}  seen: {}\n", s.code, name, s.seen));
        }
        out.push_str(&format!(
            "total documents: {}\npending downloads: {}\n",
            self.total_documents, self.pending_downloads
        ));
        if !self.recent.is_empty() {
            out.push_str("recent:\n");
            for doc in &self.recent {
                out.push_str(&format!("  {}\n", document_line(doc)));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceListing {
    pub code: String,
    pub name: String,
    pub crawlability: Crawlability,
    pub enabled: bool,
    pub implemented: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Writes `summary.md` and `new_documents.json` under `root/<run_id>/`.
pub async fn write_report(report: &RunReport, root: &Path) -> Result<PathBuf> {
    let dir = root.join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    fs::write(dir.join("summary.md"), report.to_markdown())
        .await
        .context("writing summary.md")?;

    let mut by_source: BTreeMap<&str, usize> = BTreeMap::new();
    for doc in &report.new_documents {
        *by_source.entry(doc.source.as_str()).or_default() += 1;
    }
    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "run_id": report.run_id,
        "finished_at": report.finished_at,
        "counts": by_source,
        "documents": report.new_documents,
        "unresolved_downloads": report.unresolved_downloads,
        "failed_downloads": report.failed_downloads,
        "source_errors": report.source_errors,
    }))
    .context("serializing new documents")?;
    fs::write(dir.join("new_documents.json"), json)
        .await
        .context("writing new_documents.json")?;

    Ok(dir)
}
