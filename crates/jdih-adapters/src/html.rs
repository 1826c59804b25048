//! Adapters for provinces that only publish HTML pages.
//!
//! Listing pages give a title and a detail link. The detail link is the
//! document identity; the file link is looked up on the detail page only for
//! documents the ledger has not seen.

use std::collections::HashSet;

use async_trait::async_trait;
use jdih_core::{Document, DocumentDraft};
use jdih_storage::{absolutize, url_with_query, HttpFetcher};
use scraper::{ElementRef, Html};
use tracing::{debug, warn};

use crate::{
    element_text, select_first_attr, selector, AdapterContext, AdapterError, Crawlability,
    FetchOutcome, ListingLink, RawItem, SourceAdapter, SourceConfig,
};

const JAKARTA_DEFAULT_PAGE_CAP: usize = 5;
const JAKARTA_MIN_TITLE_CHARS: usize = 10;
const KALTIM_MIN_CONTEXT_CHARS: usize = 20;
const KALTIM_MAX_TITLE_CHARS: usize = 200;

fn link_draft(source: &str, item: &RawItem) -> Option<DocumentDraft> {
    let RawItem::Link(link) = item else {
        return None;
    };
    let mut draft = DocumentDraft::new(source, link.url.as_str(), link.title.as_str());
    draft.detail_url = Some(link.url.clone());
    Some(draft)
}

fn detail_url(document: &Document) -> &str {
    document
        .detail_url
        .as_deref()
        .unwrap_or_else(|| document.identity.as_str())
}

/// Looks up the file link on the detail page with `extract`.
async fn resolve_from_detail(
    http: &HttpFetcher,
    source_id: &str,
    document: &Document,
    extract: fn(&str, &str) -> Result<Option<String>, AdapterError>,
) -> Result<Option<String>, AdapterError> {
    let url = detail_url(document);
    let body = http.fetch_text(source_id, url).await?;
    let file_url = extract(&body, url)?;
    if file_url.is_none() {
        debug!(source_id, detail_url = url, "no file link on detail page");
    }
    Ok(file_url)
}

fn first_link(document: &Html, base: &str, css: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    Ok(select_first_attr(document, css, attr)?.and_then(|href| absolutize(base, &href)))
}

/// Jawa Tengah: one keyword search page; results are `h4` headings that
/// wrap the detail link.
#[derive(Debug, Clone)]
pub struct JatengAdapter {
    config: SourceConfig,
}

impl JatengAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }
}

pub(crate) fn jateng_listing(body: &str, base: &str) -> Result<Vec<ListingLink>, AdapterError> {
    let document = Html::parse_document(body);
    let heading = selector("h4")?;
    let detail = selector("a[href*='/inventarisasi-hukum/detail/']")?;

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for h4 in document.select(&heading) {
        let Some(a) = h4.select(&detail).next() else {
            continue;
        };
        let Some(url) = a.value().attr("href").and_then(|href| absolutize(base, href)) else {
            continue;
        };
        if !seen.insert(url.clone()) {
            continue;
        }
        if let Some(title) = element_text(a) {
            links.push(ListingLink { title, url });
        }
    }
    Ok(links)
}

pub(crate) fn jateng_file_url(body: &str, base: &str) -> Result<Option<String>, AdapterError> {
    let document = Html::parse_document(body);
    if let Some(url) = first_link(&document, base, "a[href*='/download/']", "href")? {
        return Ok(Some(url));
    }
    first_link(&document, base, "iframe[src*='.pdf']", "src")
}

#[async_trait]
impl SourceAdapter for JatengAdapter {
    fn source_id(&self) -> &'static str {
        "jateng"
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::PublicHtml
    }

    async fn fetch(&self, http: &HttpFetcher, _ctx: &AdapterContext) -> FetchOutcome {
        let base = self.config.base_url();
        let url = match url_with_query(
            &format!("{base}/pencarian/pencarian"),
            &[("dokumen", self.config.search_or_default())],
        ) {
            Ok(url) => url,
            Err(err) => return FetchOutcome::failed(err.into(), 0),
        };
        let body = match http.fetch_text(self.source_id(), &url).await {
            Ok(body) => body,
            Err(err) => return FetchOutcome::failed(err.into(), 1),
        };
        match jateng_listing(&body, base) {
            Ok(links) => FetchOutcome {
                items: links.into_iter().map(RawItem::Link).collect(),
                requests: 1,
                error: None,
            },
            Err(err) => FetchOutcome::failed(err, 1),
        }
    }

    fn draft(&self, item: &RawItem) -> Option<DocumentDraft> {
        link_draft(self.source_id(), item)
    }

    async fn resolve_file_url(
        &self,
        http: &HttpFetcher,
        document: &Document,
    ) -> Result<Option<String>, AdapterError> {
        resolve_from_detail(http, self.source_id(), document, jateng_file_url).await
    }
}

/// DKI Jakarta: paginated quick search over regional regulations. Pages are
/// read until the cap or until a page adds no new detail links.
#[derive(Debug, Clone)]
pub struct JakartaAdapter {
    config: SourceConfig,
}

impl JakartaAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }
}

fn jakarta_title(a: ElementRef<'_>) -> Result<Option<String>, AdapterError> {
    let paragraph = selector("p")?;
    Ok(match a.select(&paragraph).next() {
        Some(p) => element_text(p),
        None => element_text(a),
    })
}

/// Links not already in `seen`; `seen` is keyed on the raw href across pages.
pub(crate) fn jakarta_listing(
    body: &str,
    base: &str,
    seen: &mut HashSet<String>,
) -> Result<Vec<ListingLink>, AdapterError> {
    let document = Html::parse_document(body);
    let detail = selector("a[href*='/dokumen/detail/']")?;

    let mut links = Vec::new();
    for a in document.select(&detail) {
        let Some(href) = a.value().attr("href").map(str::trim).filter(|h| !h.is_empty()) else {
            continue;
        };
        if seen.contains(href) {
            continue;
        }
        let Some(title) = jakarta_title(a)? else {
            continue;
        };
        if title.chars().count() < JAKARTA_MIN_TITLE_CHARS {
            continue;
        }
        let Some(url) = absolutize(base, href) else {
            continue;
        };
        seen.insert(href.to_string());
        links.push(ListingLink { title, url });
    }
    Ok(links)
}

pub(crate) fn jakarta_file_url(body: &str, base: &str) -> Result<Option<String>, AdapterError> {
    let document = Html::parse_document(body);
    for (css, attr) in [
        ("iframe[src*='.pdf']", "src"),
        ("a[href*='/download-fulltext/']", "href"),
        ("a[href*='.pdf']", "href"),
    ] {
        if let Some(url) = first_link(&document, base, css, attr)? {
            return Ok(Some(url));
        }
    }
    Ok(None)
}

#[async_trait]
impl SourceAdapter for JakartaAdapter {
    fn source_id(&self) -> &'static str {
        "jakarta"
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::PublicHtml
    }

    async fn fetch(&self, http: &HttpFetcher, _ctx: &AdapterContext) -> FetchOutcome {
        let base = self.config.base_url();
        let search_url = format!("{base}/pencarianCepat");
        let mut outcome = FetchOutcome::default();
        let mut seen = HashSet::new();

        for page in 1..=self.config.page_cap_or(JAKARTA_DEFAULT_PAGE_CAP) {
            let page_param = page.to_string();
            let url = match url_with_query(
                &search_url,
                &[
                    ("judul", self.config.search_or_default()),
                    ("tipe_dokumen", "PU"),
                    ("page", page_param.as_str()),
                ],
            ) {
                Ok(url) => url,
                Err(err) => {
                    outcome.error = Some(err.into());
                    break;
                }
            };
            outcome.requests += 1;

            let body = match http.fetch_text(self.source_id(), &url).await {
                Ok(body) => body,
                Err(err) => {
                    warn!(source_id = self.source_id(), page, error = %err, "page fetch failed; skipping remaining pages");
                    outcome.error = Some(err.into());
                    break;
                }
            };
            let links = match jakarta_listing(&body, base, &mut seen) {
                Ok(links) => links,
                Err(err) => {
                    outcome.error = Some(err);
                    break;
                }
            };
            debug!(source_id = self.source_id(), page, links = links.len(), "page");
            if links.is_empty() {
                break;
            }
            outcome.items.extend(links.into_iter().map(RawItem::Link));
        }
        outcome
    }

    fn draft(&self, item: &RawItem) -> Option<DocumentDraft> {
        link_draft(self.source_id(), item)
    }

    async fn resolve_file_url(
        &self,
        http: &HttpFetcher,
        document: &Document,
    ) -> Result<Option<String>, AdapterError> {
        resolve_from_detail(http, self.source_id(), document, jakarta_file_url).await
    }
}

/// Kalimantan Timur: no usable search, so the home page is scanned for
/// document links whose surrounding block mentions the search term.
#[derive(Debug, Clone)]
pub struct KaltimAdapter {
    config: SourceConfig,
}

impl KaltimAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }
}

pub(crate) fn kaltim_listing(body: &str, base: &str, term: &str) -> Result<Vec<ListingLink>, AdapterError> {
    let document = Html::parse_document(body);
    let dokumen = selector("a[href*='/dokumen/']")?;
    let term = term.to_lowercase();

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for a in document.select(&dokumen) {
        let Some(href) = a.value().attr("href").map(str::trim).filter(|h| !h.is_empty()) else {
            continue;
        };
        if seen.contains(href) {
            continue;
        }
        let Some(context) = a.parent().and_then(ElementRef::wrap).and_then(element_text) else {
            continue;
        };
        if !context.to_lowercase().contains(&term) {
            continue;
        }
        let title = if context.chars().count() > KALTIM_MIN_CONTEXT_CHARS {
            context.chars().take(KALTIM_MAX_TITLE_CHARS).collect()
        } else {
            match element_text(a) {
                Some(text) => text,
                None => context,
            }
        };
        let Some(url) = absolutize(base, href) else {
            continue;
        };
        seen.insert(href.to_string());
        links.push(ListingLink { title, url });
    }
    Ok(links)
}

pub(crate) fn kaltim_file_url(body: &str, base: &str) -> Result<Option<String>, AdapterError> {
    let document = Html::parse_document(body);
    if let Some(url) = first_link(
        &document,
        base,
        "a[href*='/storage/dokumen/'][href$='.pdf']",
        "href",
    )? {
        return Ok(Some(url));
    }
    first_link(&document, base, "img[data-pdf-thumbnail-file]", "data-pdf-thumbnail-file")
}

#[async_trait]
impl SourceAdapter for KaltimAdapter {
    fn source_id(&self) -> &'static str {
        "kaltim"
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::PublicHtml
    }

    async fn fetch(&self, http: &HttpFetcher, _ctx: &AdapterContext) -> FetchOutcome {
        let base = self.config.base_url();
        let body = match http.fetch_text(self.source_id(), base).await {
            Ok(body) => body,
            Err(err) => return FetchOutcome::failed(err.into(), 1),
        };
        match kaltim_listing(&body, base, self.config.search_or_default()) {
            Ok(links) => FetchOutcome {
                items: links.into_iter().map(RawItem::Link).collect(),
                requests: 1,
                error: None,
            },
            Err(err) => FetchOutcome::failed(err, 1),
        }
    }

    fn draft(&self, item: &RawItem) -> Option<DocumentDraft> {
        link_draft(self.source_id(), item)
    }

    async fn resolve_file_url(
        &self,
        http: &HttpFetcher,
        document: &Document,
    ) -> Result<Option<String>, AdapterError> {
        resolve_from_detail(http, self.source_id(), document, kaltim_file_url).await
    }
}
