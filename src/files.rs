//! On-disk storage for uploaded originals and their JSON exports.
//!
//! Paths stored in the database are relative to the media root, so the root
//! can move between deployments without rewriting rows.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Directory (relative to the media root) holding uploaded originals.
pub const UPLOAD_DIR: &str = "uploads/pdf_files";

static RE_UNSAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]+").unwrap());

/// Reduce a file stem to `[A-Za-z0-9_-]`, collapsing runs of anything else to `_`.
pub fn sanitize_stem(stem: &str) -> String {
    let cleaned = RE_UNSAFE.replace_all(stem.trim(), "_");
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned.chars().take(100).collect()
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a stored relative path against the media root.
    pub fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Write an upload under a unique name and return its relative path,
    /// e.g. `uploads/pdf_files/invoice_4f1c…e2.pdf`.
    pub async fn save_upload(&self, file_name: &str, bytes: &[u8]) -> std::io::Result<String> {
        let path = Path::new(file_name);
        let stem = sanitize_stem(path.file_stem().and_then(|s| s.to_str()).unwrap_or_default());
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_ascii_lowercase()))
            .unwrap_or_default();

        let relative = format!("{UPLOAD_DIR}/{stem}_{}{ext}", Uuid::new_v4().simple());
        write_atomic(&self.absolute(&relative), bytes).await?;
        debug!(path = %relative, bytes = bytes.len(), "Stored upload");
        Ok(relative)
    }

    /// Write `payload` as pretty JSON beside the stored upload, replacing its
    /// extension with `.json`. Returns the relative path of the export.
    pub async fn write_json_export(
        &self,
        upload_relative: &str,
        payload: &serde_json::Value,
    ) -> std::io::Result<String> {
        let relative = Path::new(upload_relative)
            .with_extension("json")
            .to_string_lossy()
            .into_owned();
        let body = serde_json::to_vec_pretty(payload).map_err(std::io::Error::other)?;
        write_atomic(&self.absolute(&relative), &body).await?;
        Ok(relative)
    }

    /// Delete a stored file. A file that is already gone is not an error.
    pub async fn remove(&self, relative: &str) {
        match tokio::fs::remove_file(self.absolute(relative)).await {
            Ok(()) => debug!(path = relative, "Removed stored file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = relative, error = %e, "Failed to remove stored file"),
        }
    }
}

/// Temp file + rename, so a reader never sees a partial file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
