//! Page limiting: cap how much of a PDF is sent to the model.
//!
//! Default-tier uploads are truncated to their first few pages before
//! inference; full-document runs pass through untouched. The limiter also
//! reports how many pages were actually sent, which is what the usage ledger
//! is charged with.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which uses thread-local
//! state internally. Parsing and re-writing a PDF is CPU-bound, so the work
//! runs on the blocking pool instead of stalling a Tokio worker.
//!
//! ## Fail soft
//!
//! A PDF that pdfium cannot open (or a host without libpdfium) must not sink
//! the upload: the limiter logs a warning and falls back to the original
//! bytes counted as a single page.
//!
//! ## Derived artifacts
//!
//! A truncated copy is written to a [`NamedTempFile`] owned by the returned
//! [`LimitedArtifact`]. Dropping the artifact deletes the file, on every exit
//! path of the caller.

use crate::pipeline::input::InputArtifact;
use pdfium_render::prelude::*;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Env var naming a libpdfium file (or the directory containing it).
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

/// Failure inside a [`PdfPager`]. Never escapes [`PageLimiter::limit`].
#[derive(Debug, Error)]
pub enum PagerError {
    #[error("failed to bind to pdfium library: {0}")]
    Binding(String),

    #[error("failed to parse PDF: {0}")]
    Parse(String),

    #[error("failed to write truncated PDF: {0}")]
    Write(String),
}

/// Page-level operations on PDF bytes. Implementations block.
pub trait PdfPager: Send + Sync {
    fn page_count(&self, pdf: &[u8]) -> Result<u32, PagerError>;

    /// A new PDF holding the first `keep` pages of `pdf`, in order.
    fn first_pages(&self, pdf: &[u8], keep: u32) -> Result<Vec<u8>, PagerError>;
}

/// Bind to libpdfium: `PDFIUM_LIB_PATH` first, then the system library.
pub fn bind_pdfium() -> Result<Pdfium, PagerError> {
    let bindings = match std::env::var_os(PDFIUM_LIB_PATH_ENV) {
        Some(raw) => {
            let path = PathBuf::from(raw);
            let lib = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&path)
            } else {
                path
            };
            debug!("Binding pdfium from {}", lib.display());
            Pdfium::bind_to_library(&lib)
        }
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| PagerError::Binding(format!("{e:?}")))?;

    Ok(Pdfium::new(bindings))
}

/// [`PdfPager`] backed by pdfium.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfiumPager;

impl PdfPager for PdfiumPager {
    fn page_count(&self, pdf: &[u8]) -> Result<u32, PagerError> {
        let pdfium = bind_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| PagerError::Parse(format!("{e:?}")))?;
        Ok(document.pages().len() as u32)
    }

    fn first_pages(&self, pdf: &[u8], keep: u32) -> Result<Vec<u8>, PagerError> {
        let pdfium = bind_pdfium()?;
        let source = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| PagerError::Parse(format!("{e:?}")))?;

        let mut derived = pdfium
            .create_new_pdf()
            .map_err(|e| PagerError::Write(format!("{e:?}")))?;
        let last = keep.saturating_sub(1) as PdfPageIndex;
        derived
            .pages_mut()
            .copy_page_range_from_document(&source, 0..=last, 0)
            .map_err(|e| PagerError::Write(format!("{e:?}")))?;

        derived
            .save_to_bytes()
            .map_err(|e| PagerError::Write(format!("{e:?}")))
    }
}

/// The document to send, after limiting.
pub struct LimitedArtifact {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    /// Pages actually included in `bytes`.
    pub page_count: u32,
    derived: Option<NamedTempFile>,
}

impl LimitedArtifact {
    fn passthrough(artifact: &InputArtifact, page_count: u32) -> Self {
        Self {
            bytes: artifact.bytes.clone(),
            mime_type: artifact.kind.mime_type(),
            page_count,
            derived: None,
        }
    }

    /// True when `bytes` is a truncated copy rather than the original.
    pub fn is_derived(&self) -> bool {
        self.derived.is_some()
    }

    /// Location of the temporary truncated copy, if one was made.
    pub fn derived_path(&self) -> Option<&Path> {
        self.derived.as_ref().map(|f| f.path())
    }
}

impl fmt::Debug for LimitedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitedArtifact")
            .field("bytes", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .field("page_count", &self.page_count)
            .field("derived", &self.derived_path())
            .finish()
    }
}

/// Applies a page cap to uploaded documents.
#[derive(Clone)]
pub struct PageLimiter {
    pager: Arc<dyn PdfPager>,
}

impl fmt::Debug for PageLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PageLimiter")
    }
}

impl Default for PageLimiter {
    fn default() -> Self {
        Self::new(Arc::new(PdfiumPager))
    }
}

impl PageLimiter {
    pub fn new(pager: Arc<dyn PdfPager>) -> Self {
        Self { pager }
    }

    /// Limit `artifact` to at most `max_pages` pages.
    ///
    /// * non-paged formats → original, 1 page
    /// * `max_pages = None` → original, total page count
    /// * otherwise → first `min(total, max_pages)` pages
    ///
    /// Never fails; see the module docs for the fallback.
    pub async fn limit(&self, artifact: &InputArtifact, max_pages: Option<u32>) -> LimitedArtifact {
        if !artifact.kind.is_paged() {
            return LimitedArtifact::passthrough(artifact, 1);
        }

        let pager = Arc::clone(&self.pager);
        let bytes = artifact.bytes.clone();
        let joined =
            tokio::task::spawn_blocking(move || limit_blocking(pager.as_ref(), &bytes, max_pages))
                .await;

        match joined {
            Ok(Ok(Limited::Unchanged { total })) => {
                debug!(file = %artifact.file_name, total, "PDF within page cap");
                LimitedArtifact::passthrough(artifact, total)
            }
            Ok(Ok(Limited::Truncated {
                bytes,
                kept,
                total,
                file,
            })) => {
                info!(file = %artifact.file_name, kept, total, "Truncated PDF for processing");
                LimitedArtifact {
                    bytes,
                    mime_type: artifact.kind.mime_type(),
                    page_count: kept,
                    derived: Some(file),
                }
            }
            Ok(Err(e)) => {
                warn!(file = %artifact.file_name, error = %e, "Page limiting failed; using original as 1 page");
                LimitedArtifact::passthrough(artifact, 1)
            }
            Err(e) => {
                warn!(file = %artifact.file_name, error = %e, "Page limiting task panicked; using original as 1 page");
                LimitedArtifact::passthrough(artifact, 1)
            }
        }
    }
}

enum Limited {
    Unchanged {
        total: u32,
    },
    Truncated {
        bytes: Vec<u8>,
        kept: u32,
        total: u32,
        file: NamedTempFile,
    },
}

fn limit_blocking(
    pager: &dyn PdfPager,
    pdf: &[u8],
    max_pages: Option<u32>,
) -> Result<Limited, PagerError> {
    let total = pager.page_count(pdf)?;
    if total == 0 {
        return Err(PagerError::Parse("document has no pages".into()));
    }

    let kept = match max_pages {
        Some(max) => total.min(max.max(1)),
        None => return Ok(Limited::Unchanged { total }),
    };
    if kept == total {
        return Ok(Limited::Unchanged { total });
    }

    let bytes = pager.first_pages(pdf, kept)?;
    let mut file = tempfile::Builder::new()
        .prefix("docintake-")
        .suffix(".pdf")
        .tempfile()
        .map_err(|e| PagerError::Write(e.to_string()))?;
    file.write_all(&bytes)
        .and_then(|_| file.flush())
        .map_err(|e| PagerError::Write(e.to_string()))?;

    Ok(Limited::Truncated {
        bytes,
        kept,
        total,
        file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::input::DocumentKind;

    /// Encodes the page count in the bytes: `%PDF-fake:<pages>`.
    struct FakePager;

    fn fake_pdf(pages: u32) -> Vec<u8> {
        format!("%PDF-fake:{pages}").into_bytes()
    }

    impl PdfPager for FakePager {
        fn page_count(&self, pdf: &[u8]) -> Result<u32, PagerError> {
            std::str::from_utf8(pdf)
                .ok()
                .and_then(|s| s.strip_prefix("%PDF-fake:"))
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| PagerError::Parse("not a fake pdf".into()))
        }

        fn first_pages(&self, pdf: &[u8], keep: u32) -> Result<Vec<u8>, PagerError> {
            self.page_count(pdf)?;
            Ok(fake_pdf(keep))
        }
    }

    struct BrokenPager;

    impl PdfPager for BrokenPager {
        fn page_count(&self, _pdf: &[u8]) -> Result<u32, PagerError> {
            Err(PagerError::Parse("xref table corrupt".into()))
        }

        fn first_pages(&self, _pdf: &[u8], _keep: u32) -> Result<Vec<u8>, PagerError> {
            Err(PagerError::Parse("xref table corrupt".into()))
        }
    }

    fn pdf_artifact(bytes: Vec<u8>) -> InputArtifact {
        InputArtifact {
            file_name: "report.pdf".into(),
            kind: DocumentKind::Pdf,
            bytes,
        }
    }

    #[tokio::test]
    async fn truncates_to_cap() {
        let limiter = PageLimiter::new(Arc::new(FakePager));
        let limited = limiter.limit(&pdf_artifact(fake_pdf(10)), Some(3)).await;

        assert_eq!(limited.page_count, 3);
        assert_eq!(limited.bytes, fake_pdf(3));
        assert!(limited.is_derived());

        let path = limited.derived_path().unwrap().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), fake_pdf(3));
        drop(limited);
        assert!(!path.exists(), "derived artifact must be deleted on drop");
    }

    #[tokio::test]
    async fn unlimited_returns_original_with_total() {
        let limiter = PageLimiter::new(Arc::new(FakePager));
        let original = fake_pdf(10);
        let limited = limiter.limit(&pdf_artifact(original.clone()), None).await;

        assert_eq!(limited.page_count, 10);
        assert_eq!(limited.bytes, original);
        assert!(!limited.is_derived());
    }

    #[tokio::test]
    async fn short_document_is_not_copied() {
        let limiter = PageLimiter::new(Arc::new(FakePager));
        let limited = limiter.limit(&pdf_artifact(fake_pdf(2)), Some(3)).await;
        assert_eq!(limited.page_count, 2);
        assert!(!limited.is_derived());
    }

    #[tokio::test]
    async fn images_always_count_one_page() {
        let limiter = PageLimiter::new(Arc::new(BrokenPager));
        let artifact = InputArtifact {
            file_name: "receipt.png".into(),
            kind: DocumentKind::Png,
            bytes: vec![0x89, b'P', b'N', b'G'],
        };
        for cap in [None, Some(3)] {
            let limited = limiter.limit(&artifact, cap).await;
            assert_eq!(limited.page_count, 1);
            assert_eq!(limited.mime_type, "image/png");
        }
    }

    #[tokio::test]
    async fn parse_failure_falls_back_to_single_page() {
        let limiter = PageLimiter::new(Arc::new(BrokenPager));
        let original = b"%PDF-1.4 garbage".to_vec();
        let limited = limiter.limit(&pdf_artifact(original.clone()), Some(3)).await;

        assert_eq!(limited.page_count, 1);
        assert_eq!(limited.bytes, original);
        assert!(!limited.is_derived());
    }

    /// Uses the real pdfium library; skipped when it cannot be bound.
    #[tokio::test]
    async fn pdfium_truncates_ten_pages_to_three() {
        let pdfium = match bind_pdfium() {
            Ok(p) => p,
            Err(e) => {
                println!("SKIP: {e}");
                return;
            }
        };

        let mut document = pdfium.create_new_pdf().unwrap();
        for i in 0..10u16 {
            let width = PdfPoints::new(200.0 + f32::from(i) * 10.0);
            document
                .pages_mut()
                .create_page_at_end(PdfPagePaperSize::Custom(width, PdfPoints::new(400.0)))
                .unwrap();
        }
        let original = document.save_to_bytes().unwrap();
        drop(document);
        drop(pdfium);

        let limiter = PageLimiter::default();
        let limited = limiter.limit(&pdf_artifact(original.clone()), Some(3)).await;
        assert_eq!(limited.page_count, 3);
        assert!(limited.is_derived());

        let pdfium = bind_pdfium().unwrap();
        let derived = pdfium.load_pdf_from_byte_slice(&limited.bytes, None).unwrap();
        let widths: Vec<f32> = derived.pages().iter().map(|p| p.width().value).collect();
        assert_eq!(widths, vec![200.0, 210.0, 220.0]);

        let unlimited = limiter.limit(&pdf_artifact(original.clone()), None).await;
        assert_eq!(unlimited.page_count, 10);
        assert_eq!(unlimited.bytes, original);
    }
}
