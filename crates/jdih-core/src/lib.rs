//! Normalized document model shared by every JDIH source.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod classify;

pub use classify::Classifier;

pub const CRATE_NAME: &str = "jdih-core";

/// Source-local document identifier. Unique within one source only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for DocumentId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for DocumentId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of minimum-wage decree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    /// Upah Minimum Kabupaten/Kota.
    Umk,
    /// Upah Minimum Provinsi.
    Ump,
    /// Upah Minimum Sektoral Kabupaten/Kota.
    Umsk,
    /// Upah Minimum Sektoral Provinsi.
    Umsp,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Umk => "umk",
            Self::Ump => "ump",
            Self::Umsk => "umsk",
            Self::Umsp => "umsp",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pre-classification handoff contract from adapters into the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDraft {
    pub source: String,
    pub identity: DocumentId,
    pub title: String,
    /// Extra free text considered for relevance and appended to the stored title.
    pub description: Option<String>,
    pub published_date: String,
    pub file_url: Option<String>,
    pub detail_url: Option<String>,
    /// Year from a dedicated source field; wins over title extraction.
    pub year_hint: Option<i32>,
}

impl DocumentDraft {
    pub fn new(source: impl Into<String>, identity: impl Into<DocumentId>, title: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            identity: identity.into(),
            title: title.into(),
            description: None,
            published_date: String::new(),
            file_url: None,
            detail_url: None,
            year_hint: None,
        }
    }

    /// Title as it is stored on the classified document.
    pub fn display_title(&self) -> String {
        match self.description.as_deref().map(str::trim) {
            Some(desc) if !desc.is_empty() => format!("{} - {}", self.title.trim(), desc),
            _ => self.title.trim().to_string(),
        }
    }
}

/// A classified minimum-wage decree.
///
/// Immutable after classification apart from the `retrieved`/`local_path`
/// pair, which goes from unset to set once via [`Document::mark_retrieved`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub identity: DocumentId,
    pub title: String,
    pub source: String,
    pub published_date: String,
    pub file_url: Option<String>,
    #[serde(default)]
    pub detail_url: Option<String>,
    pub decree_number: Option<String>,
    pub year: Option<i32>,
    pub document_type: DocumentType,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub retrieved: bool,
    #[serde(default)]
    pub local_path: Option<String>,
}

impl Document {
    /// Ledger key for this document.
    pub fn key(&self) -> (&str, &DocumentId) {
        (&self.source, &self.identity)
    }

    /// Returns false when the document had already been retrieved.
    pub fn mark_retrieved(&mut self, local_path: impl Into<String>) -> bool {
        if self.retrieved {
            return false;
        }
        self.retrieved = true;
        self.local_path = Some(local_path.into());
        true
    }

    /// Copy with a file URL resolved after the listing step.
    pub fn with_file_url(mut self, file_url: Option<String>) -> Self {
        if self.file_url.is_none() {
            self.file_url = file_url;
        }
        self
    }
}
