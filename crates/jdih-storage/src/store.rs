//! Deterministic, collision-resistant on-disk storage for decree files.

use std::path::{Path, PathBuf};

use anyhow::Context;
use jdih_core::Document;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes were already present at the target path.
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

/// Replaces anything outside `[A-Za-z0-9._-]` with `-` and collapses runs.
pub fn sanitize_component(input: &str) -> String {
    let mapped = input
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect::<String>();
    let collapsed = mapped
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let trimmed = collapsed.trim_matches('.').to_string();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed
    }
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `{year}/{source}_{type}_{year}_{decree-or-identity}.pdf`
    pub fn document_relative_path(&self, document: &Document, fallback_year: i32) -> PathBuf {
        let year = document.year.unwrap_or(fallback_year);
        let tail = document
            .decree_number
            .as_deref()
            .unwrap_or_else(|| document.identity.as_str());
        let file_name = format!(
            "{}_{}_{}_{}.pdf",
            sanitize_component(&document.source),
            document.document_type,
            year,
            sanitize_component(tail)
        );
        PathBuf::from(year.to_string()).join(file_name)
    }

    fn with_hash_suffix(relative_path: &Path, content_hash: &str) -> PathBuf {
        let stem = relative_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = relative_path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bin".to_string());
        relative_path.with_file_name(format!("{stem}_{}.{ext}", &content_hash[..8]))
    }

    /// Stores bytes at `relative_path` via temp-file rename. When a different
    /// file already occupies the path, a content-hash suffix is appended.
    pub async fn store_bytes(&self, relative_path: &Path, bytes: &[u8]) -> anyhow::Result<StoredFile> {
        let content_hash = Self::sha256_hex(bytes);
        let mut relative_path = relative_path.to_path_buf();

        for candidate in 0..2 {
            let absolute_path = self.root.join(&relative_path);
            if !fs::try_exists(&absolute_path)
                .await
                .with_context(|| format!("checking path {}", absolute_path.display()))?
            {
                break;
            }
            let existing = fs::read(&absolute_path)
                .await
                .with_context(|| format!("reading existing file {}", absolute_path.display()))?;
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredFile {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                });
            }
            if candidate == 0 {
                relative_path = Self::with_hash_suffix(&relative_path, &content_hash);
            } else {
                anyhow::bail!(
                    "{} already holds different content; refusing to overwrite",
                    absolute_path.display()
                );
            }
        }

        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .context("stored file path has no parent directory")?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredFile {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jdih_core::{Classifier, DocumentDraft};
    use tempfile::tempdir;

    fn doc(title: &str) -> Document {
        Classifier::default()
            .classify(DocumentDraft::new("jatim", 77_i64, title), Utc::now())
            .expect("relevant")
    }

    #[test]
    fn content_hashing_is_stable() {
        let hash = FileStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn path_uses_decree_number_with_safe_characters() {
        let store = FileStore::new("/tmp/umk");
        let path = store.document_relative_path(
            &doc("Keputusan Gubernur Nomor 188/45/2025 tentang Upah Minimum Sektoral Kabupaten Tahun 2025"),
            2030,
        );
        assert_eq!(path, PathBuf::from("2025/jatim_umsk_2025_188-45-2025.pdf"));
    }

    #[test]
    fn path_falls_back_to_identity_and_current_year() {
        let store = FileStore::new("/tmp/umk");
        let path = store.document_relative_path(&doc("Upah Minimum Kabupaten/Kota"), 2026);
        assert_eq!(path, PathBuf::from("2026/jatim_umk_2026_77.pdf"));
    }

    #[test]
    fn sanitize_collapses_unsafe_runs() {
        assert_eq!(sanitize_component("561 / KEP.789 // HUK"), "561-KEP.789-HUK");
        assert_eq!(
            sanitize_component("https://jdih.example.go.id/dokumen/detail/12"),
            "https-jdih.example.go.id-dokumen-detail-12"
        );
        assert_eq!(sanitize_component("///"), "unknown");
    }

    #[tokio::test]
    async fn identical_bytes_deduplicate_and_different_bytes_get_suffix() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        let rel = PathBuf::from("2025/jatim_umk_2025_1.pdf");

        let first = store.store_bytes(&rel, b"%PDF-1.4 one").await.unwrap();
        let again = store.store_bytes(&rel, b"%PDF-1.4 one").await.unwrap();
        let other = store.store_bytes(&rel, b"%PDF-1.4 two").await.unwrap();

        assert!(!first.deduplicated);
        assert!(again.deduplicated);
        assert_eq!(first.relative_path, again.relative_path);
        assert!(!other.deduplicated);
        assert_ne!(other.relative_path, first.relative_path);
        assert!(other
            .relative_path
            .to_string_lossy()
            .starts_with("2025/jatim_umk_2025_1_"));
        assert_eq!(std::fs::read(&first.absolute_path).unwrap(), b"%PDF-1.4 one");
        assert_eq!(std::fs::read(&other.absolute_path).unwrap(), b"%PDF-1.4 two");
    }

    #[tokio::test]
    async fn occupied_suffixed_path_is_never_overwritten() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        let rel = PathBuf::from("2025/jatim_umk_2025_1.pdf");
        let incoming = b"%PDF-1.4 incoming";
        let suffixed = FileStore::with_hash_suffix(&rel, &FileStore::sha256_hex(incoming));

        store.store_bytes(&rel, b"%PDF-1.4 original").await.unwrap();
        std::fs::write(dir.path().join(&suffixed), b"%PDF-1.4 squatter").unwrap();

        let err = store.store_bytes(&rel, incoming).await.unwrap_err();
        assert!(err.to_string().contains("refusing to overwrite"));
        assert_eq!(
            std::fs::read(dir.path().join(&suffixed)).unwrap(),
            b"%PDF-1.4 squatter"
        );
    }
}
