//! Input validation: decide whether an upload is something we can process.
//!
//! Only PDF, JPEG and PNG are accepted. The extension picks the declared
//! type and the leading bytes must agree with it: a renamed `.exe` is
//! rejected here with a meaningful error instead of reaching the model
//! endpoint as garbage inline data.

use crate::error::PipelineError;
use image::ImageFormat;
use std::path::Path;
use tracing::debug;

/// Extensions accepted on upload, for error messages.
pub const ALLOWED_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".pdf"];

/// The formats the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Jpeg,
    Png,
}

impl DocumentKind {
    /// Kind implied by a file name's extension (case-insensitive).
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())?
            .to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(DocumentKind::Pdf),
            "jpg" | "jpeg" => Some(DocumentKind::Jpeg),
            "png" => Some(DocumentKind::Png),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "application/pdf",
            DocumentKind::Jpeg => "image/jpeg",
            DocumentKind::Png => "image/png",
        }
    }

    /// Paged formats can be truncated; images always count as one page.
    pub fn is_paged(&self) -> bool {
        matches!(self, DocumentKind::Pdf)
    }

    fn content_matches(&self, bytes: &[u8]) -> bool {
        match self {
            DocumentKind::Pdf => bytes.starts_with(b"%PDF"),
            DocumentKind::Jpeg => matches!(image::guess_format(bytes), Ok(ImageFormat::Jpeg)),
            DocumentKind::Png => matches!(image::guess_format(bytes), Ok(ImageFormat::Png)),
        }
    }
}

/// A validated document held in memory.
#[derive(Debug, Clone)]
pub struct InputArtifact {
    pub file_name: String,
    pub kind: DocumentKind,
    pub bytes: Vec<u8>,
}

impl InputArtifact {
    /// Validate an uploaded file.
    pub fn from_upload(file_name: &str, bytes: Vec<u8>) -> Result<Self, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::UnsupportedInput("No file uploaded".into()));
        }

        let kind = DocumentKind::from_file_name(file_name).ok_or_else(|| {
            PipelineError::UnsupportedInput(format!(
                "Unsupported file type '{file_name}'. Allowed: {}",
                ALLOWED_EXTENSIONS.join(", ")
            ))
        })?;

        if !kind.content_matches(&bytes) {
            let magic: Vec<u8> = bytes.iter().take(4).copied().collect();
            debug!(file_name, ?magic, "Upload content does not match extension");
            return Err(PipelineError::UnsupportedInput(format!(
                "File '{file_name}' is not a valid {}",
                kind.mime_type()
            )));
        }

        Ok(Self {
            file_name: file_name.to_string(),
            kind,
            bytes,
        })
    }

    /// Load a previously stored original for reprocessing.
    pub async fn from_stored(path: &Path) -> Result<Self, PipelineError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let kind = DocumentKind::from_file_name(&file_name).ok_or_else(|| {
            PipelineError::Internal(format!("stored file has unknown type: {}", path.display()))
        })?;

        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::NotFound("Original file not found".into()));
            }
            Err(e) => {
                return Err(PipelineError::Internal(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        Ok(Self {
            file_name,
            kind,
            bytes,
        })
    }
}
