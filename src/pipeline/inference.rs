//! Model invocation: retry, backoff and response shaping.
//!
//! This module owns everything between "we have a prompt and a document" and
//! "we have generated text plus token counts". The wire protocol lives behind
//! the [`InferenceBackend`] trait ([`crate::pipeline::gemini`] in production,
//! a scripted backend in tests) so retry and classification logic can be
//! exercised without a network.
//!
//! ## Retry Strategy
//!
//! Attempts run `0..=max_retries`. Every failure is classified by the pure
//! function [`classify`]:
//!
//! | Kind        | Trigger                                           | Action |
//! |-------------|---------------------------------------------------|--------|
//! | `RateLimit` | HTTP 429, or "rate limit" / "quota" / "429" / "resource exhausted" in the message | back off, retry |
//! | `Fatal`     | HTTP 400/401/403/404 without rate-limit markers   | stop immediately |
//! | `Transient` | anything else, including unreadable response bodies | back off, retry |
//!
//! The delay for attempt `k` is `min(initial * factor^k, cap)` plus up to 10%
//! uniform jitter. With the defaults (1 s, ×2, 60 s cap) the schedule is
//! 1 s → 2 s → 4 s → 8 s → 16 s.
//!
//! ## Response Shapes
//!
//! Two shapes are accepted for locating generated text: a top-level `text`
//! field, or `candidates[].content.parts[].text`. When both are present the
//! top-level `text` wins.

use crate::progress::ProgressSink;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

// ── Request types ────────────────────────────────────────────────────────────

/// One piece of model input.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    /// Raw bytes with their MIME type (a PDF or an image).
    Binary { mime_type: String, data: Vec<u8> },
}

/// Sampling and output parameters sent with every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    /// Ask the model to emit this MIME type, e.g. `application/json`.
    pub response_mime_type: Option<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            top_p: 1.0,
            top_k: 32,
            max_output_tokens: 65_536,
            response_mime_type: Some("application/json".to_string()),
        }
    }
}

/// A complete model request: document parts first, then the prompt.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub prompt: String,
    pub parts: Vec<ContentPart>,
    pub options: GenerationOptions,
}

// ── Backend seam ─────────────────────────────────────────────────────────────

/// A failed call as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    /// HTTP status when the failure came from the remote side.
    pub status: Option<u16>,
    pub message: String,
}

impl BackendError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "HTTP {code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Transport to a generative model.
///
/// Implementations perform exactly one remote call per `generate` and return
/// the decoded JSON body. They do not retry; [`InferenceClient`] does.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Model identifier recorded on every stored document.
    fn model_id(&self) -> &str;

    async fn generate(&self, request: &InferenceRequest) -> Result<serde_json::Value, BackendError>;
}

// ── Classification ───────────────────────────────────────────────────────────

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimit,
    Transient,
    Fatal,
}

static RE_RATE_LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rate[\s_-]?limit|quota|429|resource[\s_-]?exhausted").unwrap()
});

/// Classify a backend failure. Pure: the same error always yields the same kind.
pub fn classify(err: &BackendError) -> FailureKind {
    if err.status == Some(429) || RE_RATE_LIMIT.is_match(&err.message) {
        FailureKind::RateLimit
    } else if matches!(err.status, Some(400 | 401 | 403 | 404)) {
        FailureKind::Fatal
    } else {
        FailureKind::Transient
    }
}

// ── Backoff ──────────────────────────────────────────────────────────────────

/// Retry budget and exponential backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// [`Self::base_delay`] plus uniform jitter in `[0, 10%)` of it.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = rand::thread_rng().gen::<f64>() * 0.1 * base.as_secs_f64();
        base + Duration::from_secs_f64(jitter)
    }
}

// ── Response shaping ─────────────────────────────────────────────────────────

/// Normalised result of a successful call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InferenceOutcome {
    /// One entry per candidate; each is that candidate's text fragments.
    pub candidates: Vec<Vec<String>>,
    pub prompt_tokens: u64,
    pub candidate_tokens: u64,
    pub total_tokens: u64,
    /// Page count supplied by the caller, passed through unchanged.
    pub page_count: u32,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

impl InferenceOutcome {
    /// Concatenated fragments of the first candidate, if any text exists.
    pub fn primary_text(&self) -> Option<String> {
        let text: String = self.candidates.first()?.concat();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct UsageMetadata {
    #[serde(default, rename = "promptTokenCount", alias = "prompt_token_count")]
    prompt: u64,
    #[serde(default, rename = "candidatesTokenCount", alias = "candidates_token_count")]
    candidates: u64,
    #[serde(default, rename = "totalTokenCount", alias = "total_token_count")]
    total: u64,
}

#[derive(Debug, Deserialize)]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
}

/// The two known response layouts. Variant order matters: serde tries
/// `Direct` first, so a body carrying both shapes resolves to it unless
/// [`decode_response`] dropped a blank `text`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResponseBody {
    Direct {
        text: String,
        #[serde(default, rename = "usageMetadata", alias = "usage_metadata")]
        usage: UsageMetadata,
    },
    Candidates {
        candidates: Vec<WireCandidate>,
        #[serde(default, rename = "usageMetadata", alias = "usage_metadata")]
        usage: UsageMetadata,
    },
}

impl ResponseBody {
    fn into_outcome(self, page_count: u32, attempts: u32) -> InferenceOutcome {
        let (candidates, usage) = match self {
            ResponseBody::Direct { text, usage } => (vec![vec![text]], usage),
            ResponseBody::Candidates { candidates, usage } => {
                let texts = candidates
                    .into_iter()
                    .map(|c| {
                        c.content
                            .unwrap_or_default()
                            .parts
                            .into_iter()
                            .filter_map(|p| p.text)
                            .collect()
                    })
                    .collect();
                (texts, usage)
            }
        };
        InferenceOutcome {
            candidates,
            prompt_tokens: usage.prompt,
            candidate_tokens: usage.candidates,
            total_tokens: usage.total,
            page_count,
            attempts,
        }
    }
}

fn decode_response(mut body: serde_json::Value) -> Result<ResponseBody, BackendError> {
    // Blank direct text defers to the candidates.
    let blank_text = body
        .get("text")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|t| t.trim().is_empty());
    if blank_text && body.get("candidates").is_some() {
        if let Some(fields) = body.as_object_mut() {
            fields.remove("text");
        }
    }
    serde_json::from_value(body)
        .map_err(|_| BackendError::new(None, "unrecognized response shape"))
}

// ── Client ───────────────────────────────────────────────────────────────────

const RATE_LIMITED_NOTICE: &str = "Rate limited";
const REQUEST_FAILED_NOTICE: &str = "Request failed";

/// Whether a progress message announces a retry after a failed attempt.
pub fn is_retry_notice(message: &str) -> bool {
    message.starts_with(RATE_LIMITED_NOTICE) || message.starts_with(REQUEST_FAILED_NOTICE)
}

/// Terminal failure of [`InferenceClient::invoke`].
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("rate limited on all {attempts} attempts; last error: {last_error}")]
    RateLimitExceeded { attempts: u32, last_error: String },

    #[error("inference failed after {attempts} attempt(s): {message}")]
    Failed { attempts: u32, message: String },
}

/// Retrying wrapper around an [`InferenceBackend`].
#[derive(Clone)]
pub struct InferenceClient {
    backend: Arc<dyn InferenceBackend>,
    retry: RetryPolicy,
}

impl fmt::Debug for InferenceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceClient")
            .field("model", &self.backend.model_id())
            .field("retry", &self.retry)
            .finish()
    }
}

impl InferenceClient {
    pub fn new(backend: Arc<dyn InferenceBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Call the model, retrying per [`RetryPolicy`] and [`classify`].
    ///
    /// `page_count` is not interpreted here; it is copied into the outcome so
    /// callers keep a single record of what was sent.
    pub async fn invoke(
        &self,
        request: &InferenceRequest,
        page_count: u32,
        progress: &dyn ProgressSink,
    ) -> Result<InferenceOutcome, InferenceError> {
        let max_retries = self.retry.max_retries;
        let mut last_kind = FailureKind::Transient;
        let mut last_error = String::new();

        progress.report("Configuring AI model...");

        for attempt in 0..=max_retries {
            progress.report("Sending request to AI model...");

            let failure = match self.backend.generate(request).await {
                Ok(body) => {
                    progress.report("Processing AI response...");
                    match decode_response(body) {
                        Ok(decoded) => {
                            let outcome = decoded.into_outcome(page_count, attempt + 1);
                            info!(
                                model = self.backend.model_id(),
                                attempts = attempt + 1,
                                prompt_tokens = outcome.prompt_tokens,
                                candidate_tokens = outcome.candidate_tokens,
                                "Inference succeeded"
                            );
                            return Ok(outcome);
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            let kind = classify(&failure);
            warn!(
                attempt = attempt + 1,
                max_attempts = max_retries + 1,
                ?kind,
                error = %failure,
                "Inference attempt failed"
            );
            last_kind = kind;
            last_error = failure.to_string();

            if kind == FailureKind::Fatal {
                return Err(InferenceError::Failed {
                    attempts: attempt + 1,
                    message: last_error,
                });
            }

            if attempt < max_retries {
                let delay = self.retry.delay_for(attempt);
                let label = match kind {
                    FailureKind::RateLimit => RATE_LIMITED_NOTICE,
                    _ => REQUEST_FAILED_NOTICE,
                };
                progress.report(&format!(
                    "{label}. Retrying in {:.2} seconds... (Attempt {}/{})",
                    delay.as_secs_f64(),
                    attempt + 1,
                    max_retries
                ));
                debug!(?delay, "Backing off before retry");
                sleep(delay).await;
            }
        }

        let attempts = max_retries + 1;
        Err(match last_kind {
            FailureKind::RateLimit => InferenceError::RateLimitExceeded {
                attempts,
                last_error,
            },
            _ => InferenceError::Failed {
                attempts,
                message: last_error,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressLog;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<serde_json::Value, BackendError>>>,
        fallback: Result<serde_json::Value, BackendError>,
        calls: Mutex<u32>,
    }

    impl ScriptedBackend {
        fn new(
            script: Vec<Result<serde_json::Value, BackendError>>,
            fallback: Result<serde_json::Value, BackendError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        fn model_id(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            _request: &InferenceRequest,
        ) -> Result<serde_json::Value, BackendError> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(5),
        }
    }

    fn request() -> InferenceRequest {
        InferenceRequest {
            prompt: "Extract the invoice fields".into(),
            parts: vec![ContentPart::Binary {
                mime_type: "application/pdf".into(),
                data: b"%PDF-1.7".to_vec(),
            }],
            options: GenerationOptions::default(),
        }
    }

    fn candidates_body(text: &str) -> serde_json::Value {
        json!({
            "candidates": [{"content": {"parts": [{"text": text}], "role": "model"}}],
            "usageMetadata": {"promptTokenCount": 120, "candidatesTokenCount": 30, "totalTokenCount": 150}
        })
    }

    #[test]
    fn backoff_schedule_matches_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let d0 = policy.delay_for(0).as_secs_f64();
            assert!((1.0..1.1).contains(&d0), "attempt 0 delay {d0}");
            let d3 = policy.delay_for(3).as_secs_f64();
            assert!((8.0..8.8).contains(&d3), "attempt 3 delay {d3}");
            let d10 = policy.delay_for(10).as_secs_f64();
            assert!((60.0..66.0).contains(&d10), "attempt 10 delay {d10}");
        }
    }

    #[test]
    fn base_delay_caps_huge_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn classify_rate_limit_markers() {
        for msg in [
            "429 Too Many Requests",
            "Rate limit reached for requests",
            "Quota exceeded for quota metric",
            "RESOURCE_EXHAUSTED",
            "resource exhausted",
        ] {
            assert_eq!(
                classify(&BackendError::new(None, msg)),
                FailureKind::RateLimit,
                "{msg}"
            );
        }
        assert_eq!(
            classify(&BackendError::new(Some(429), "slow down")),
            FailureKind::RateLimit
        );
    }

    #[test]
    fn classify_fatal_and_transient() {
        assert_eq!(
            classify(&BackendError::new(Some(401), "API key not valid")),
            FailureKind::Fatal
        );
        assert_eq!(
            classify(&BackendError::new(Some(503), "backend overloaded")),
            FailureKind::Transient
        );
        assert_eq!(
            classify(&BackendError::new(None, "connection reset")),
            FailureKind::Transient
        );
        // Rate-limit markers win over a fatal status.
        assert_eq!(
            classify(&BackendError::new(Some(403), "quota exceeded")),
            FailureKind::RateLimit
        );
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let backend = ScriptedBackend::new(vec![], Ok(candidates_body("{\"a\":1}")));
        let client = InferenceClient::new(backend.clone(), fast_policy(5));
        let log = ProgressLog::new();

        let outcome = client.invoke(&request(), 3, &log).await.unwrap();

        assert_eq!(backend.calls(), 1);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.page_count, 3);
        assert_eq!(outcome.prompt_tokens, 120);
        assert_eq!(outcome.candidate_tokens, 30);
        assert_eq!(outcome.total_tokens, 150);
        assert_eq!(outcome.primary_text().as_deref(), Some("{\"a\":1}"));
        let texts: Vec<String> = log.messages().into_iter().map(|m| m.message).collect();
        assert_eq!(
            texts,
            [
                "Configuring AI model...",
                "Sending request to AI model...",
                "Processing AI response..."
            ]
        );
    }

    #[tokio::test]
    async fn rate_limited_every_attempt_exhausts_budget() {
        let backend = ScriptedBackend::new(
            vec![],
            Err(BackendError::new(Some(429), "Resource has been exhausted")),
        );
        let client = InferenceClient::new(backend.clone(), fast_policy(2));
        let log = ProgressLog::new();

        let err = client.invoke(&request(), 1, &log).await.unwrap_err();

        assert_eq!(backend.calls(), 3);
        assert!(matches!(err, InferenceError::RateLimitExceeded { attempts: 3, .. }));
        let retries = log
            .messages()
            .into_iter()
            .filter(|m| m.message.starts_with("Rate limited. Retrying in"))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn transient_then_success() {
        let backend = ScriptedBackend::new(
            vec![
                Err(BackendError::new(Some(503), "unavailable")),
                Err(BackendError::new(None, "connection reset by peer")),
            ],
            Ok(candidates_body("{}")),
        );
        let client = InferenceClient::new(backend.clone(), fast_policy(5));
        let log = ProgressLog::new();

        let outcome = client.invoke(&request(), 1, &log).await.unwrap();

        assert_eq!(backend.calls(), 3);
        assert_eq!(outcome.attempts, 3);
        let notices: Vec<_> = log
            .messages()
            .into_iter()
            .map(|m| m.message)
            .filter(|m| is_retry_notice(m))
            .collect();
        assert_eq!(notices.len(), 2);
        assert!(notices.iter().all(|m| m.starts_with("Request failed. Retrying in")));
        assert!(!is_retry_notice("Sending request to AI model..."));
    }

    #[tokio::test]
    async fn transient_exhaustion_is_generic_failure() {
        let backend =
            ScriptedBackend::new(vec![], Err(BackendError::new(Some(500), "internal error")));
        let client = InferenceClient::new(backend.clone(), fast_policy(1));

        let err = client
            .invoke(&request(), 1, &crate::progress::NoopProgress)
            .await
            .unwrap_err();

        assert_eq!(backend.calls(), 2);
        match err {
            InferenceError::Failed { attempts, message } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("internal error"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn last_failure_kind_decides_final_error() {
        let backend = ScriptedBackend::new(
            vec![Err(BackendError::new(Some(429), "rate limit"))],
            Err(BackendError::new(Some(502), "bad gateway")),
        );
        let client = InferenceClient::new(backend, fast_policy(1));

        let err = client
            .invoke(&request(), 1, &crate::progress::NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Failed { .. }));
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let backend = ScriptedBackend::new(
            vec![],
            Err(BackendError::new(Some(400), "Request contains an invalid argument.")),
        );
        let client = InferenceClient::new(backend.clone(), fast_policy(5));

        let err = client
            .invoke(&request(), 1, &crate::progress::NoopProgress)
            .await
            .unwrap_err();

        assert_eq!(backend.calls(), 1);
        assert!(matches!(err, InferenceError::Failed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn unrecognized_shape_retries_then_fails() {
        let backend = ScriptedBackend::new(vec![], Ok(json!({"unexpected": true})));
        let client = InferenceClient::new(backend.clone(), fast_policy(1));

        let err = client
            .invoke(&request(), 1, &crate::progress::NoopProgress)
            .await
            .unwrap_err();

        assert_eq!(backend.calls(), 2);
        match err {
            InferenceError::Failed { message, .. } => {
                assert_eq!(message, "unrecognized response shape")
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn direct_text_preferred_over_candidates() {
        let body = json!({
            "text": "{\"from\":\"direct\"}",
            "candidates": [{"content": {"parts": [{"text": "{\"from\":\"nested\"}"}]}}]
        });
        let outcome = decode_response(body).unwrap().into_outcome(1, 1);
        assert_eq!(outcome.primary_text().as_deref(), Some("{\"from\":\"direct\"}"));
        assert_eq!(outcome.total_tokens, 0);
    }

    #[test]
    fn blank_direct_text_falls_back_to_candidates() {
        let body = json!({
            "text": "",
            "candidates": [{"content": {"parts": [{"text": "{\"from\":\"nested\"}"}]}}],
            "usageMetadata": {"totalTokenCount": 42}
        });
        let outcome = decode_response(body).unwrap().into_outcome(1, 1);
        assert_eq!(outcome.primary_text().as_deref(), Some("{\"from\":\"nested\"}"));
        assert_eq!(outcome.total_tokens, 42);

        let blank_only = decode_response(json!({"text": "  "})).unwrap().into_outcome(1, 1);
        assert_eq!(blank_only.primary_text(), None);
    }

    #[test]
    fn nested_fragments_are_collected_per_candidate() {
        let body = json!({
            "candidates": [
                {"content": {"parts": [{"text": "{\"a\":"}, {"text": "1}"}]}},
                {"content": {"parts": [{"text": "{}"}]}},
                {"finishReason": "SAFETY"}
            ],
            "usage_metadata": {"prompt_token_count": 7}
        });
        let outcome = decode_response(body).unwrap().into_outcome(2, 1);
        assert_eq!(outcome.candidates.len(), 3);
        assert_eq!(outcome.candidates[0], vec!["{\"a\":", "1}"]);
        assert!(outcome.candidates[2].is_empty());
        assert_eq!(outcome.primary_text().as_deref(), Some("{\"a\":1}"));
        assert_eq!(outcome.prompt_tokens, 7);
        assert_eq!(outcome.candidate_tokens, 0);
    }

    #[test]
    fn empty_candidates_have_no_primary_text() {
        let outcome = decode_response(json!({"candidates": []}))
            .unwrap()
            .into_outcome(1, 1);
        assert_eq!(outcome.primary_text(), None);
    }
}
