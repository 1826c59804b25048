//! Retrieves a classified document's file and persists it through [`FileStore`].

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use jdih_core::Document;
use thiserror::Error;
use tracing::{info, warn};

use crate::store::{FileStore, StoredFile};
use crate::{FetchError, HttpFetcher};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("document has no resolved file url")]
    NoFileUrl,
    #[error("{url} returned a markup page ({content_type}) instead of a file")]
    MarkupResponse { url: String, content_type: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Storage sink the monitor hands new documents to.
#[async_trait]
pub trait DownloadSink: Send + Sync {
    async fn store(&self, document: &Document) -> Result<StoredFile, DownloadError>;
}

pub struct DownloadPipeline {
    http: HttpFetcher,
    store: FileStore,
}

impl DownloadPipeline {
    pub fn new(http: HttpFetcher, store: FileStore) -> Self {
        Self { http, store }
    }
}

/// True when the response looks like an HTML page rather than a document.
pub fn is_markup(content_type: Option<&str>, body: &[u8]) -> bool {
    match content_type.map(|c| c.to_ascii_lowercase()) {
        Some(ct) if !ct.trim().is_empty() => {
            ct.contains("text/html") || ct.contains("application/xhtml")
        }
        _ => {
            let head = String::from_utf8_lossy(&body[..body.len().min(64)]).to_ascii_lowercase();
            let head = head.trim_start();
            head.starts_with("<!doctype html") || head.starts_with("<html")
        }
    }
}

#[async_trait]
impl DownloadSink for DownloadPipeline {
    async fn store(&self, document: &Document) -> Result<StoredFile, DownloadError> {
        let url = document.file_url.as_deref().ok_or(DownloadError::NoFileUrl)?;

        info!(source = %document.source, identity = %document.identity, url, "downloading");
        let resp = self.http.fetch_bytes(&document.source, url).await?;
        if is_markup(resp.content_type.as_deref(), &resp.body) {
            let content_type = resp.content_type.unwrap_or_else(|| "sniffed html".to_string());
            warn!(url, %content_type, "download resolved to a markup page");
            return Err(DownloadError::MarkupResponse {
                url: resp.final_url,
                content_type,
            });
        }

        let relative = self
            .store
            .document_relative_path(document, Utc::now().year());
        let stored = self.store.store_bytes(&relative, &resp.body).await?;
        info!(
            path = %stored.absolute_path.display(),
            bytes = stored.byte_size,
            deduplicated = stored.deduplicated,
            "saved"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpClientConfig;
    use jdih_core::{Classifier, DocumentDraft};
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn doc(file_url: Option<String>) -> Document {
        let mut draft = DocumentDraft::new(
            "bengkulu",
            "b-12",
            "Keputusan Gubernur Bengkulu Nomor Q.123.B/2024 tentang Upah Minimum Provinsi Tahun 2025",
        );
        draft.file_url = file_url;
        Classifier::default().classify(draft, Utc::now()).unwrap()
    }

    fn pipeline(root: &std::path::Path) -> DownloadPipeline {
        DownloadPipeline::new(
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
            FileStore::new(root),
        )
    }

    #[test]
    fn markup_detection_uses_content_type_then_sniffs() {
        assert!(is_markup(Some("text/html; charset=UTF-8"), b"%PDF"));
        assert!(!is_markup(Some("application/pdf"), b"<html>"));
        assert!(is_markup(None, b"  <!DOCTYPE html><html>"));
        assert!(!is_markup(None, b"%PDF-1.7"));
    }

    #[tokio::test]
    async fn pdf_is_saved_under_deterministic_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/ump.pdf"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(b"%PDF-1.7 body".to_vec(), "application/pdf"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let stored = pipeline(dir.path())
            .store(&doc(Some(format!("{}/files/ump.pdf", server.uri()))))
            .await
            .unwrap();
        assert_eq!(
            stored.relative_path,
            std::path::PathBuf::from("2025/bengkulu_ump_2025_Q.123.B-2024.pdf")
        );
        assert_eq!(std::fs::read(stored.absolute_path).unwrap(), b"%PDF-1.7 body");
    }

    #[tokio::test]
    async fn interstitial_html_page_is_a_resolution_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/ump.pdf"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html>virus scan warning</html>", "text/html"),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let err = pipeline(dir.path())
            .store(&doc(Some(format!("{}/files/ump.pdf", server.uri()))))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::MarkupResponse { .. }));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn missing_file_url_is_rejected_without_io() {
        let dir = tempdir().unwrap();
        let err = pipeline(dir.path()).store(&doc(None)).await.unwrap_err();
        assert!(matches!(err, DownloadError::NoFileUrl));
    }
}
