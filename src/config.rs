//! Pipeline configuration.
//!
//! Everything the pipeline needs to decide *how much* work to do lives in
//! [`PipelineConfig`], built via [`PipelineConfigBuilder`]. Transport settings
//! (API key, endpoint) belong to the backend, not here.

use crate::error::PipelineError;
use crate::pipeline::inference::{GenerationOptions, RetryPolicy};
use crate::quota::DEFAULT_MAX_DOCUMENTS;
use std::time::Duration;

/// Configuration for [`crate::process::DocumentPipeline`].
///
/// # Example
/// ```rust
/// use docintake::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .max_pages_limited(3)
///     .max_retries(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.retry.max_retries, 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Pages sent for default-tier users and for limited runs. Default: 3.
    pub max_pages_limited: u32,

    /// Document cap substituted when a user's stored cap is zero. Default: 20.
    pub default_max_documents: i64,

    /// Sampling parameters for every model call.
    pub generation: GenerationOptions,

    /// Retry budget and backoff schedule for model calls.
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pages_limited: 3,
            default_max_documents: DEFAULT_MAX_DOCUMENTS,
            generation: GenerationOptions::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn max_pages_limited(mut self, pages: u32) -> Self {
        self.config.max_pages_limited = pages.max(1);
        self
    }

    pub fn default_max_documents(mut self, n: i64) -> Self {
        self.config.default_max_documents = n;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.generation.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.config.generation.top_p = p.clamp(0.0, 1.0);
        self
    }

    pub fn top_k(mut self, k: u32) -> Self {
        self.config.generation.top_k = k.max(1);
        self
    }

    pub fn max_output_tokens(mut self, n: u32) -> Self {
        self.config.generation.max_output_tokens = n;
        self
    }

    /// `None` lets the model answer in free text.
    pub fn response_mime_type(mut self, mime: Option<String>) -> Self {
        self.config.generation.response_mime_type = mime;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.retry.max_retries = n;
        self
    }

    pub fn initial_delay(mut self, d: Duration) -> Self {
        self.config.retry.initial_delay = d;
        self
    }

    pub fn backoff_factor(mut self, f: f64) -> Self {
        self.config.retry.factor = f.max(1.0);
        self
    }

    pub fn max_delay(mut self, d: Duration) -> Self {
        self.config.retry.max_delay = d;
        self
    }

    /// Replace the whole retry policy, unclamped. Used by tests.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.default_max_documents <= 0 {
            return Err(PipelineError::Misconfigured(format!(
                "default document limit must be positive, got {}",
                c.default_max_documents
            )));
        }
        if c.generation.max_output_tokens == 0 {
            return Err(PipelineError::Misconfigured(
                "max_output_tokens must be at least 1".into(),
            ));
        }
        if c.retry.max_delay < c.retry.initial_delay {
            return Err(PipelineError::Misconfigured(format!(
                "max retry delay ({:?}) is shorter than the initial delay ({:?})",
                c.retry.max_delay, c.retry.initial_delay
            )));
        }
        if !c.retry.factor.is_finite() {
            return Err(PipelineError::Misconfigured(
                "backoff factor must be finite".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = PipelineConfig::default();
        assert_eq!(c.max_pages_limited, 3);
        assert_eq!(c.default_max_documents, 20);
        assert_eq!(c.retry.max_retries, 5);
        assert_eq!(c.generation.top_k, 32);
    }

    #[test]
    fn setters_clamp() {
        let c = PipelineConfig::builder()
            .max_pages_limited(0)
            .temperature(9.0)
            .top_p(-1.0)
            .backoff_factor(0.5)
            .build()
            .unwrap();
        assert_eq!(c.max_pages_limited, 1);
        assert_eq!(c.generation.temperature, 2.0);
        assert_eq!(c.generation.top_p, 0.0);
        assert_eq!(c.retry.factor, 1.0);
    }

    #[test]
    fn build_rejects_invalid_values() {
        assert!(matches!(
            PipelineConfig::builder().default_max_documents(0).build(),
            Err(PipelineError::Misconfigured(_))
        ));
        assert!(PipelineConfig::builder().max_output_tokens(0).build().is_err());
        assert!(PipelineConfig::builder()
            .initial_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(1))
            .build()
            .is_err());
    }
}
