//! Source adapter contract and the per-province fetch/parse implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jdih_core::{Classifier, Document, DocumentDraft, DocumentId};
use jdih_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod api;
pub mod config;
pub mod html;

pub use config::{Crawlability, JsonFieldMap, SourceConfig, SourceRegistry};

pub const CRATE_NAME: &str = "jdih-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn now(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

/// Candidate link scraped from an HTML listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingLink {
    pub title: String,
    pub url: String,
}

/// One unparsed item as returned by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawItem {
    Json(JsonValue),
    Link(ListingLink),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response shape from {url}: {detail}")]
    UnexpectedShape { url: String, detail: String },
}

/// Items gathered by one fetch. A transient failure stops the remaining
/// pages but keeps what was already retrieved.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub items: Vec<RawItem>,
    pub requests: usize,
    pub error: Option<AdapterError>,
}

impl FetchOutcome {
    pub fn failed(error: AdapterError, requests: usize) -> Self {
        Self {
            items: Vec::new(),
            requests,
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn crawlability(&self) -> Crawlability;

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> FetchOutcome;

    /// Maps source-specific field names onto a draft. `None` for items that
    /// lack an identity or do not belong to this adapter.
    fn draft(&self, item: &RawItem) -> Option<DocumentDraft>;

    /// `None` when the item is not a wage decree; not an error.
    fn parse(&self, item: &RawItem, ctx: &AdapterContext, rules: &Classifier) -> Option<Document> {
        let draft = self.draft(item)?;
        rules.classify(draft, ctx.fetched_at)
    }

    /// Secondary lookup for sources whose listings only link a detail page.
    async fn resolve_file_url(
        &self,
        _http: &HttpFetcher,
        _document: &Document,
    ) -> Result<Option<String>, AdapterError> {
        Ok(None)
    }
}

/// Builds the adapter implementing `config.code`, or `None` when the code
/// has no implementation.
pub fn adapter_for_source(config: &SourceConfig) -> Option<Box<dyn SourceAdapter>> {
    let config = config.clone();
    match config.code.as_str() {
        "jatim" => Some(Box::new(api::JatimAdapter::new(config))),
        "bengkulu" => Some(Box::new(api::BengkuluAdapter::new(config))),
        "ntb" => Some(Box::new(api::NtbAdapter::new(config))),
        "jateng" => Some(Box::new(html::JatengAdapter::new(config))),
        "jakarta" => Some(Box::new(html::JakartaAdapter::new(config))),
        "kaltim" => Some(Box::new(html::KaltimAdapter::new(config))),
        _ => None,
    }
}

pub fn implemented_sources() -> &'static [&'static str] {
    &["jatim", "bengkulu", "ntb", "jateng", "jakarta", "kaltim"]
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("selector {css}: {e}")))
}

pub(crate) fn element_text(el: ElementRef<'_>) -> Option<String> {
    text_or_none(&el.text().collect::<Vec<_>>().join(" "))
}

pub(crate) fn select_first_attr(document: &Html, css: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none))
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

/// Numbers are rendered in decimal; blank strings count as missing.
pub(crate) fn json_identity(value: &JsonValue, field: &str) -> Option<DocumentId> {
    match value.get(field)? {
        JsonValue::Number(n) => n
            .as_i64()
            .map(DocumentId::from)
            .or_else(|| n.as_u64().map(DocumentId::from)),
        JsonValue::String(s) => text_or_none(s).map(DocumentId::from),
        _ => None,
    }
}

pub(crate) fn json_year(value: &JsonValue, field: &str) -> Option<i32> {
    let year: Option<i32> = match value.get(field)? {
        JsonValue::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    year.filter(|y| (1900..=2200).contains(y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_builtin_source_has_an_adapter() {
        let registry = SourceRegistry::builtin();
        for code in implemented_sources() {
            let config = registry.get(code).expect("configured");
            let adapter = adapter_for_source(config).expect("implemented");
            assert_eq!(adapter.source_id(), *code);
            assert_eq!(adapter.crawlability(), config.crawlability);
        }
    }

    #[test]
    fn unimplemented_code_has_no_adapter() {
        let mut config = SourceRegistry::builtin().get("jatim").unwrap().clone();
        config.code = "jabar".into();
        assert!(adapter_for_source(&config).is_none());
    }

    #[test]
    fn identity_accepts_numbers_and_strings() {
        let item = json!({"a": 12, "b": " X-9 ", "c": "", "d": null});
        assert_eq!(json_identity(&item, "a"), Some(DocumentId::from("12")));
        assert_eq!(json_identity(&item, "b"), Some(DocumentId::from("X-9")));
        assert_eq!(json_identity(&item, "c"), None);
        assert_eq!(json_identity(&item, "d"), None);
    }

    #[test]
    fn year_field_tolerates_strings_and_rejects_junk() {
        let item = json!({"a": 2024, "b": "2025", "c": "n/a", "d": 0});
        assert_eq!(json_year(&item, "a"), Some(2024));
        assert_eq!(json_year(&item, "b"), Some(2025));
        assert_eq!(json_year(&item, "c"), None);
        assert_eq!(json_year(&item, "d"), None);
    }
}
