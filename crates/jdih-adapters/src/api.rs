//! Adapters for provinces that publish a JSON API.
//!
//! Paginated sources stop at the first empty page or at the configured page
//! cap, whichever comes first. Only recent activity is scanned; a decree
//! published further back than the cap is never observed.

use async_trait::async_trait;
use jdih_core::DocumentDraft;
use jdih_storage::{url_with_query, FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{
    json_identity, json_str, json_year, text_or_none, AdapterContext, AdapterError, Crawlability,
    FetchOutcome, JsonFieldMap, RawItem, SourceAdapter, SourceConfig,
};

const DEFAULT_PAGE_CAP: usize = 3;
const DEFAULT_PER_PAGE: usize = 100;

fn fields(id: &str, title: &str, description: Option<&str>, date: &str, year: Option<&str>, file_url: Option<&str>) -> JsonFieldMap {
    JsonFieldMap {
        id: id.to_string(),
        title: title.to_string(),
        description: description.map(ToString::to_string),
        date: date.to_string(),
        year: year.map(ToString::to_string),
        file_url: file_url.map(ToString::to_string),
    }
}

pub fn jatim_fields() -> JsonFieldMap {
    fields("id", "title", None, "date", None, None)
}

pub fn bengkulu_fields() -> JsonFieldMap {
    fields(
        "idData",
        "judul",
        None,
        "tanggal_pengundangan",
        Some("tahun_pengundangan"),
        Some("urlDownload"),
    )
}

pub fn ntb_fields() -> JsonFieldMap {
    fields("id", "judul", Some("deskripsi"), "tgl_penetapan", Some("tahun"), None)
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Maps one JSON item through a field table.
pub(crate) fn draft_from_fields(source: &str, map: &JsonFieldMap, item: &JsonValue) -> Option<DocumentDraft> {
    let identity = json_identity(item, &map.id)?;
    let title = json_str(item, &[map.title.as_str()]).and_then(text_or_none)?;

    let mut draft = DocumentDraft::new(source, identity, title);
    draft.description = map
        .description
        .as_deref()
        .and_then(|f| json_str(item, &[f]))
        .and_then(text_or_none);
    draft.published_date = json_str(item, &[map.date.as_str()])
        .map(|d| d.trim().to_string())
        .unwrap_or_default();
    draft.year_hint = map.year.as_deref().and_then(|f| json_year(item, f));
    draft.file_url = map
        .file_url
        .as_deref()
        .and_then(|f| json_str(item, &[f]))
        .and_then(non_blank);
    Some(draft)
}

/// Requests pages `1..=page_cap`, stopping early on an empty page or on the
/// first failure.
pub(crate) async fn paginate<U>(
    http: &HttpFetcher,
    source_id: &str,
    page_cap: usize,
    page_url: U,
    extract: fn(&JsonValue) -> Option<&Vec<JsonValue>>,
) -> FetchOutcome
where
    U: Fn(usize) -> Result<String, FetchError> + Send,
{
    let mut outcome = FetchOutcome::default();
    for page in 1..=page_cap {
        let url = match page_url(page) {
            Ok(url) => url,
            Err(err) => {
                outcome.error = Some(err.into());
                break;
            }
        };
        outcome.requests += 1;

        let value: JsonValue = match http.fetch_json(source_id, &url).await {
            Ok(value) => value,
            Err(err) => {
                warn!(source_id, page, error = %err, "page fetch failed; skipping remaining pages");
                outcome.error = Some(err.into());
                break;
            }
        };
        let Some(items) = extract(&value) else {
            outcome.error = Some(AdapterError::UnexpectedShape {
                url,
                detail: "no item array".to_string(),
            });
            break;
        };
        debug!(source_id, page, items = items.len(), "page");
        if items.is_empty() {
            break;
        }
        outcome.items.extend(items.iter().cloned().map(RawItem::Json));
    }
    outcome
}

fn nested_data_items(value: &JsonValue) -> Option<&Vec<JsonValue>> {
    value.get("data")?.get("data")?.as_array()
}

fn data_items(value: &JsonValue) -> Option<&Vec<JsonValue>> {
    value.get("data")?.as_array()
}

fn bare_or_data_items(value: &JsonValue) -> Option<&Vec<JsonValue>> {
    value.as_array().or_else(|| data_items(value))
}

fn json_item(item: &RawItem) -> Option<&JsonValue> {
    match item {
        RawItem::Json(value) => Some(value),
        RawItem::Link(_) => None,
    }
}

/// Jawa Timur: topic listing filtered by section, newest first. The file
/// link sits in the item's `fields` array under an attachment title.
#[derive(Debug, Clone)]
pub struct JatimAdapter {
    config: SourceConfig,
    fields: JsonFieldMap,
}

impl JatimAdapter {
    pub fn new(config: SourceConfig) -> Self {
        let fields = config.fields.clone().unwrap_or_else(jatim_fields);
        Self { config, fields }
    }

    fn attachment_url(&self, item: &JsonValue) -> Option<String> {
        let needle = self
            .config
            .attachment_field
            .as_deref()
            .unwrap_or("lampiran")
            .to_lowercase();
        item.get("fields")?
            .as_array()?
            .iter()
            .find(|f| json_str(f, &["title"]).is_some_and(|t| t.to_lowercase().contains(&needle)))
            .and_then(|f| json_str(f, &["details"]))
            .and_then(non_blank)
    }
}

#[async_trait]
impl SourceAdapter for JatimAdapter {
    fn source_id(&self) -> &'static str {
        "jatim"
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    async fn fetch(&self, http: &HttpFetcher, _ctx: &AdapterContext) -> FetchOutcome {
        let per_page = self.config.per_page_or(DEFAULT_PER_PAGE).to_string();
        let section = self.config.section_id.map(|s| s.to_string());
        let base = self.config.base_url();
        let page_url = |page: usize| {
            let mut params = vec![("per_page", per_page.clone()), ("page", page.to_string())];
            if let Some(section) = &section {
                params.push(("webmaster_section_id", section.clone()));
            }
            params.push(("sort_by", "date".to_string()));
            params.push(("sort_order", "desc".to_string()));
            url_with_query(base, &params)
        };
        paginate(
            http,
            self.source_id(),
            self.config.page_cap_or(DEFAULT_PAGE_CAP),
            page_url,
            nested_data_items,
        )
        .await
    }

    fn draft(&self, item: &RawItem) -> Option<DocumentDraft> {
        let value = json_item(item)?;
        let mut draft = draft_from_fields(self.source_id(), &self.fields, value)?;
        if draft.file_url.is_none() {
            draft.file_url = self.attachment_url(value);
        }
        Some(draft)
    }
}

/// Bengkulu: one keyword search returning every match at once.
#[derive(Debug, Clone)]
pub struct BengkuluAdapter {
    config: SourceConfig,
    fields: JsonFieldMap,
}

impl BengkuluAdapter {
    pub fn new(config: SourceConfig) -> Self {
        let fields = config.fields.clone().unwrap_or_else(bengkulu_fields);
        Self { config, fields }
    }
}

#[async_trait]
impl SourceAdapter for BengkuluAdapter {
    fn source_id(&self) -> &'static str {
        "bengkulu"
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    async fn fetch(&self, http: &HttpFetcher, _ctx: &AdapterContext) -> FetchOutcome {
        let base = self.config.base_url();
        let search = self.config.search_or_default();
        paginate(
            http,
            self.source_id(),
            1,
            |_| url_with_query(base, &[("search", search)]),
            bare_or_data_items,
        )
        .await
    }

    fn draft(&self, item: &RawItem) -> Option<DocumentDraft> {
        draft_from_fields(self.source_id(), &self.fields, json_item(item)?)
    }
}

/// Nusa Tenggara Barat: paginated keyword search. Relevance also looks at
/// the description, and the API never links a file.
#[derive(Debug, Clone)]
pub struct NtbAdapter {
    config: SourceConfig,
    fields: JsonFieldMap,
}

impl NtbAdapter {
    pub fn new(config: SourceConfig) -> Self {
        let fields = config.fields.clone().unwrap_or_else(ntb_fields);
        Self { config, fields }
    }
}

#[async_trait]
impl SourceAdapter for NtbAdapter {
    fn source_id(&self) -> &'static str {
        "ntb"
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    async fn fetch(&self, http: &HttpFetcher, _ctx: &AdapterContext) -> FetchOutcome {
        let per_page = self.config.per_page_or(DEFAULT_PER_PAGE).to_string();
        let search = self.config.search_or_default();
        let base = self.config.base_url();
        let page_url = |page: usize| {
            url_with_query(
                base,
                &[
                    ("per_page", per_page.as_str()),
                    ("page", page.to_string().as_str()),
                    ("search", search),
                ],
            )
        };
        paginate(
            http,
            self.source_id(),
            self.config.page_cap_or(DEFAULT_PAGE_CAP),
            page_url,
            data_items,
        )
        .await
    }

    fn draft(&self, item: &RawItem) -> Option<DocumentDraft> {
        draft_from_fields(self.source_id(), &self.fields, json_item(item)?)
    }
}
