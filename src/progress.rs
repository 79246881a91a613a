//! Progress reporting for pipeline runs.
//!
//! The pipeline and the inference client announce each phase ("Sending
//! request to AI model...", "Rate limited. Retrying in 2.04 seconds...") to
//! a [`ProgressSink`]. Reporting is observational only: nothing a sink does
//! can change the outcome of a run, and every method has a no-op default.
//!
//! The HTTP layer collects messages with a [`ProgressLog`] and returns them
//! in the upload response. The CLI forwards them to a terminal spinner.
//!
//! # Example
//!
//! ```rust
//! use docintake::progress::{ProgressLog, ProgressSink};
//!
//! let log = ProgressLog::new();
//! log.report("Preparing document for processing...");
//! assert_eq!(log.messages().len(), 1);
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Receives human-readable stage notifications.
///
/// Implementations must be `Send + Sync` because a sink is shared by the
/// request task and the blocking PDF worker.
pub trait ProgressSink: Send + Sync {
    /// Called at every phase transition and before every retry.
    fn report(&self, message: &str) {
        let _ = message;
    }
}

/// Discards every message.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {}

/// Convenience alias for a shared sink.
pub type SharedProgress = Arc<dyn ProgressSink>;

/// One recorded progress line.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressMessage {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Collects messages in arrival order.
#[derive(Debug, Default)]
pub struct ProgressLog {
    messages: Mutex<Vec<ProgressMessage>>,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn messages(&self) -> Vec<ProgressMessage> {
        self.messages
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn into_messages(self) -> Vec<ProgressMessage> {
        self.messages.into_inner().unwrap_or_default()
    }
}

impl ProgressSink for ProgressLog {
    fn report(&self, message: &str) {
        debug!(progress = message);
        // A poisoned lock only loses the message; it must not fail the run.
        if let Ok(mut guard) = self.messages.lock() {
            guard.push(ProgressMessage {
                timestamp: Utc::now(),
                message: message.to_string(),
            });
        }
    }
}
