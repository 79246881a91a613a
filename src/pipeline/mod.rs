//! Pipeline stages for document extraction.
//!
//! Each submodule implements exactly one step so it can be tested alone;
//! [`crate::process`] composes them and owns the state machine.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ limit ──▶ inference ──▶ normalize
//! (validate) (pdfium)  (retry/backoff) (JSON record)
//!                         │
//!                      gemini (HTTP)
//! ```
//!
//! 1. [`input`]    : accept PDF / JPEG / PNG uploads whose bytes match their extension
//! 2. [`limit`]    : truncate PDFs to the page cap; runs in `spawn_blocking`
//! 3. [`inference`]: call the model with classified retry and jittered backoff
//! 4. [`gemini`]   : the REST transport used by [`inference`] in production
//! 5. [`normalize`]: strip fences and coerce the reply to a single JSON object

pub mod gemini;
pub mod inference;
pub mod input;
pub mod limit;
pub mod normalize;
