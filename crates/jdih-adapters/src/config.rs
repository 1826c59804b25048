//! Enumerated source table. Adding a source means one entry here plus one
//! adapter; the monitor itself does not change.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Crawlability {
    Api,
    PublicHtml,
}

impl Crawlability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::PublicHtml => "public_html",
        }
    }
}

/// Raw JSON field names for one API source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonFieldMap {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub date: String,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub code: String,
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub crawlability: Crawlability,
    pub base_url: String,
    /// Upper bound on listing requests per run. Sources are scanned for
    /// recent activity only; documents beyond the cap are never observed.
    #[serde(default)]
    pub page_cap: Option<usize>,
    #[serde(default)]
    pub per_page: Option<usize>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub section_id: Option<u64>,
    /// Title fragment of the attachment entry holding the file link.
    #[serde(default)]
    pub attachment_field: Option<String>,
    #[serde(default)]
    pub fields: Option<JsonFieldMap>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceConfig {
    pub fn page_cap_or(&self, default: usize) -> usize {
        self.page_cap.unwrap_or(default).max(1)
    }

    pub fn per_page_or(&self, default: usize) -> usize {
        self.per_page.unwrap_or(default).max(1)
    }

    pub fn search_or_default(&self) -> &str {
        self.search.as_deref().unwrap_or(DEFAULT_SEARCH)
    }

    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

pub const DEFAULT_SEARCH: &str = "upah minimum";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        let api = |code: &str, name: &str, base_url: &str| SourceConfig {
            code: code.to_string(),
            name: name.to_string(),
            enabled: true,
            crawlability: Crawlability::Api,
            base_url: base_url.to_string(),
            page_cap: None,
            per_page: None,
            search: None,
            section_id: None,
            attachment_field: None,
            fields: None,
            notes: None,
        };
        let html = |code: &str, name: &str, base_url: &str| SourceConfig {
            crawlability: Crawlability::PublicHtml,
            ..api(code, name, base_url)
        };

        Self {
            sources: vec![
                SourceConfig {
                    page_cap: Some(3),
                    per_page: Some(100),
                    section_id: Some(10),
                    attachment_field: Some("Lampiran".to_string()),
                    fields: Some(api::jatim_fields()),
                    ..api("jatim", "Jawa Timur", "https://api.jdih.jatimprov.go.id/api/v2/topics")
                },
                SourceConfig {
                    fields: Some(api::bengkulu_fields()),
                    ..api("bengkulu", "Bengkulu", "https://jdih.bengkuluprov.go.id/api/documents")
                },
                SourceConfig {
                    page_cap: Some(3),
                    per_page: Some(100),
                    fields: Some(api::ntb_fields()),
                    notes: Some("API publishes no file link".to_string()),
                    ..api("ntb", "Nusa Tenggara Barat", "https://jdih.ntbprov.go.id/api/produk-hukum")
                },
                html("jateng", "Jawa Tengah", "https://jdih.jatengprov.go.id"),
                SourceConfig {
                    page_cap: Some(5),
                    ..html("jakarta", "DKI Jakarta", "https://jdih.jakarta.go.id")
                },
                html("kaltim", "Kalimantan Timur", "https://jdih.kaltimprov.go.id"),
            ],
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry yaml")
    }

    /// Reads `path` when it exists, otherwise falls back to the built-in table.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
            }
            _ => Ok(Self::builtin()),
        }
    }

    pub fn get(&self, code: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.code == code)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_covers_api_and_html_sources() {
        let registry = SourceRegistry::builtin();
        let codes: Vec<_> = registry.enabled().map(|s| s.code.as_str()).collect();
        assert_eq!(codes, ["jatim", "bengkulu", "ntb", "jateng", "jakarta", "kaltim"]);
        assert_eq!(registry.get("jakarta").unwrap().page_cap_or(1), 5);
        assert_eq!(
            registry.get("kaltim").unwrap().crawlability,
            Crawlability::PublicHtml
        );
        assert!(registry.get("jabar").is_none());
    }

    #[test]
    fn yaml_registry_overrides_table() {
        let yaml = r#"
sources:
  - code: ntb
    name: Nusa Tenggara Barat
    crawlability: api
    base_url: http://localhost:9000/api/produk-hukum/
    page_cap: 2
    fields:
      id: id
      title: judul
      date: tgl_penetapan
  - code: jateng
    name: Jawa Tengah
    enabled: false
    crawlability: public_html
    base_url: https://jdih.jatengprov.go.id
"#;
        let registry = SourceRegistry::from_yaml_str(yaml).unwrap();
        let ntb = registry.get("ntb").unwrap();
        assert_eq!(ntb.base_url(), "http://localhost:9000/api/produk-hukum");
        assert_eq!(ntb.page_cap_or(3), 2);
        assert_eq!(ntb.search_or_default(), "upah minimum");
        assert_eq!(registry.enabled().count(), 1);
    }

    #[test]
    fn missing_registry_file_uses_builtin_table() {
        let registry = SourceRegistry::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap();
        assert_eq!(registry, SourceRegistry::builtin());
    }
}
