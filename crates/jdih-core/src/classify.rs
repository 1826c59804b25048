//! Keyword and pattern rules that confirm a raw item is a wage decree and
//! pull structured fields out of its title.
//!
//! Each field has its own ordered rule list; the first rule that yields a
//! value wins:
//!
//! * relevance: case-insensitive containment of any keyword
//! * year: dedicated source field, then `tahun NNNN`, then a bare `19xx`/`20xx`
//! * decree number: `nomor|nomer|no.` followed by a code containing a digit
//! * type: sectoral+district, sectoral+province, province without district, district

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::{Document, DocumentDraft, DocumentType};

pub const DEFAULT_KEYWORDS: &[&str] = &["upah minimum", "upah minimal", "pengupahan"];

const YEAR_PATTERNS: &[&str] = &[r"(?i)\btahun\s*(\d{4})\b", r"\b((?:19|20)\d{2})\b"];

const DECREE_PATTERNS: &[&str] = &[r"(?i)\b(?:nomor|nomer|no)\s*[.:]?\s*([0-9a-z][0-9a-z./\-]*)"];

#[derive(Debug, Clone)]
pub struct Classifier {
    keywords: Vec<String>,
    year_rules: Vec<Regex>,
    decree_rules: Vec<Regex>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            year_rules: compile(YEAR_PATTERNS),
            decree_rules: compile(DECREE_PATTERNS),
        }
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("built-in classification pattern"))
        .collect()
}

impl Classifier {
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords
            .into_iter()
            .map(|k| k.into().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        self
    }

    pub fn is_relevant(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.keywords.iter().any(|kw| lower.contains(kw.as_str()))
    }

    pub fn extract_year(&self, text: &str) -> Option<i32> {
        self.year_rules.iter().find_map(|rule| {
            rule.captures(text)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse().ok())
        })
    }

    pub fn extract_decree_number(&self, text: &str) -> Option<String> {
        self.decree_rules.iter().find_map(|rule| {
            rule.captures_iter(text).find_map(|caps| {
                let code = caps.get(1)?.as_str().trim_end_matches(['.', '-', '/']);
                if code.chars().any(|c| c.is_ascii_digit()) {
                    Some(code.to_string())
                } else {
                    None
                }
            })
        })
    }

    pub fn classify_document_type(&self, text: &str) -> DocumentType {
        let lower = text.to_lowercase();
        if lower.contains("sektoral kabupaten") || lower.contains("sektoral kota") {
            DocumentType::Umsk
        } else if lower.contains("sektoral provinsi") {
            DocumentType::Umsp
        } else if lower.contains("provinsi") && !lower.contains("kabupaten") {
            DocumentType::Ump
        } else {
            DocumentType::Umk
        }
    }

    /// Confirms and enriches a draft. `None` means the item is not a wage
    /// decree, which is a normal outcome rather than an error.
    pub fn classify(&self, draft: DocumentDraft, discovered_at: DateTime<Utc>) -> Option<Document> {
        let relevance_text = match draft.description.as_deref() {
            Some(desc) => format!("{} {}", draft.title, desc),
            None => draft.title.clone(),
        };
        if !self.is_relevant(&relevance_text) {
            return None;
        }

        let title = draft.display_title();
        Some(Document {
            decree_number: self.extract_decree_number(&draft.title),
            year: draft.year_hint.or_else(|| self.extract_year(&draft.title)),
            document_type: self.classify_document_type(&title),
            identity: draft.identity,
            title,
            source: draft.source,
            published_date: draft.published_date,
            file_url: draft.file_url,
            detail_url: draft.detail_url,
            discovered_at,
            retrieved: false,
            local_path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECTORAL_DISTRICT: &str =
        "Keputusan Gubernur Nomor 188/45/2025 tentang Upah Minimum Sektoral Kabupaten Tahun 2025";

    #[test]
    fn sectoral_district_title_is_fully_classified() {
        let rules = Classifier::default();
        let draft = DocumentDraft::new("jatim", 1_i64, SECTORAL_DISTRICT);
        let doc = rules.classify(draft, Utc::now()).expect("relevant");
        assert_eq!(doc.document_type, DocumentType::Umsk);
        assert_eq!(doc.year, Some(2025));
        assert_eq!(doc.decree_number.as_deref(), Some("188/45/2025"));
    }

    #[test]
    fn title_without_keyword_is_rejected() {
        let rules = Classifier::default();
        let mut draft = DocumentDraft::new(
            "jatim",
            9_i64,
            "Keputusan Gubernur Nomor 100.3.3.1/12/2025 tentang Penetapan Cagar Budaya Tahun 2025",
        );
        draft.file_url = Some("https://example.test/cagar.pdf".into());
        draft.year_hint = Some(2025);
        assert!(rules.classify(draft, Utc::now()).is_none());
    }

    #[test]
    fn relevance_is_case_insensitive_and_considers_description() {
        let rules = Classifier::default();
        assert!(rules.is_relevant("PENETAPAN UPAH MINIMUM KOTA"));
        let mut draft = DocumentDraft::new("ntb", 3_i64, "Keputusan Gubernur NTB Nomor 561-712 Tahun 2024");
        draft.description = Some("Upah Minimum Provinsi Nusa Tenggara Barat".into());
        let doc = rules.classify(draft, Utc::now()).expect("description carries keyword");
        assert_eq!(doc.document_type, DocumentType::Ump);
        assert_eq!(doc.decree_number.as_deref(), Some("561-712"));
        assert!(doc.title.ends_with("- Upah Minimum Provinsi Nusa Tenggara Barat"));
    }

    #[test]
    fn qualified_year_beats_earlier_bare_year() {
        let rules = Classifier::default();
        assert_eq!(
            rules.extract_year("Nomor 188/2023 tentang Upah Minimum Tahun 2024"),
            Some(2024)
        );
        assert_eq!(rules.extract_year("UMK 2026 Jawa Timur"), Some(2026));
        assert_eq!(rules.extract_year("Upah Minimum Kabupaten"), None);
    }

    #[test]
    fn year_hint_wins_over_title() {
        let rules = Classifier::default();
        let mut draft = DocumentDraft::new("bengkulu", "a1", "Upah Minimum Provinsi Tahun 2024");
        draft.year_hint = Some(2023);
        let doc = rules.classify(draft, Utc::now()).unwrap();
        assert_eq!(doc.year, Some(2023));
    }

    #[test]
    fn decree_number_needs_a_digit() {
        let rules = Classifier::default();
        assert_eq!(rules.extract_decree_number("Ekonomi dan Upah Minimum"), None);
        assert_eq!(
            rules.extract_decree_number("Pergub No. 12.A/2024. tentang Upah Minimum"),
            Some("12.A/2024".into())
        );
        assert_eq!(
            rules.extract_decree_number("Keputusan Nomor: 561/KEP.789-HUK/2024"),
            Some("561/KEP.789-HUK/2024".into())
        );
    }

    #[test]
    fn type_precedence_prefers_sectoral_phrases() {
        let rules = Classifier::default();
        assert_eq!(
            rules.classify_document_type("Upah Minimum Sektoral Provinsi Jawa Timur"),
            DocumentType::Umsp
        );
        assert_eq!(
            rules.classify_document_type("Upah Minimum Sektoral Kota Surabaya Provinsi Jawa Timur"),
            DocumentType::Umsk
        );
        assert_eq!(
            rules.classify_document_type("Upah Minimum Provinsi Jawa Tengah"),
            DocumentType::Ump
        );
        assert_eq!(
            rules.classify_document_type("Upah Minimum Kabupaten/Kota di Provinsi Jawa Timur"),
            DocumentType::Umk
        );
    }

    #[test]
    fn custom_keywords_replace_defaults() {
        let rules = Classifier::default().with_keywords(["UMR"]);
        assert!(rules.is_relevant("penetapan umr 2025"));
        assert!(!rules.is_relevant("upah minimum"));
    }
}
