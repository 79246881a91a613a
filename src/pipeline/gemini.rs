//! Gemini `generateContent` REST backend.
//!
//! One [`GeminiBackend::generate`] call is one HTTP POST. The backend does not
//! retry and does not interpret the response body beyond checking that it is
//! JSON; both jobs belong to [`crate::pipeline::inference::InferenceClient`].
//!
//! Non-2xx answers become a [`BackendError`] carrying the HTTP status plus the
//! provider's `error.status` and `error.message` (for example
//! `RESOURCE_EXHAUSTED: Quota exceeded ...`), which is what the rate-limit
//! classifier matches on.

use crate::pipeline::inference::{
    BackendError, ContentPart, GenerationOptions, InferenceBackend, InferenceRequest,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Public Generative Language API root.
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig<'a>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: GeminiInlineData },
}

#[derive(Debug, Serialize)]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig<'a> {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    status: Option<String>,
    message: String,
}

/// HTTP backend for the Gemini API.
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl fmt::Debug for GeminiBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiBackend")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl GeminiBackend {
    /// Build a backend with a per-request timeout.
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        })
    }

    /// Point at a different API root (a proxy or a regional endpoint).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint, self.model
        )
    }
}

fn build_body<'a>(request: &'a InferenceRequest) -> GeminiRequest<'a> {
    let mut parts: Vec<GeminiPart> = request
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => GeminiPart::Text { text: text.clone() },
            ContentPart::Binary { mime_type, data } => GeminiPart::InlineData {
                inline_data: GeminiInlineData {
                    mime_type: mime_type.clone(),
                    data: STANDARD.encode(data),
                },
            },
        })
        .collect();
    parts.push(GeminiPart::Text {
        text: request.prompt.clone(),
    });

    GeminiRequest {
        contents: vec![GeminiContent {
            role: "user",
            parts,
        }],
        generation_config: generation_config(&request.options),
    }
}

fn generation_config(options: &GenerationOptions) -> GeminiGenerationConfig<'_> {
    GeminiGenerationConfig {
        temperature: options.temperature,
        top_p: options.top_p,
        top_k: options.top_k,
        max_output_tokens: options.max_output_tokens,
        response_mime_type: options.response_mime_type.as_deref(),
    }
}

/// Turn a non-2xx body into a readable message, keeping the provider status.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<GeminiErrorBody>(body) {
        Ok(parsed) => match parsed.error.status {
            Some(status) => format!("{status}: {}", parsed.error.message),
            None => parsed.error.message,
        },
        Err(_) if body.trim().is_empty() => "empty error body".to_string(),
        Err(_) => body.trim().to_string(),
    }
}

#[async_trait]
impl InferenceBackend for GeminiBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &InferenceRequest) -> Result<serde_json::Value, BackendError> {
        let body = build_body(request);
        debug!(model = %self.model, parts = body.contents[0].parts.len(), "POST generateContent");

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() { "request timed out" } else { "request failed" };
                BackendError::new(None, format!("{reason}: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::new(Some(status.as_u16()), error_message(&text)));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| BackendError::new(None, format!("response body is not JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_puts_document_before_prompt() {
        let request = InferenceRequest {
            prompt: "Extract fields".into(),
            parts: vec![ContentPart::Binary {
                mime_type: "image/png".into(),
                data: vec![1, 2, 3],
            }],
            options: GenerationOptions::default(),
        };

        let value = serde_json::to_value(build_body(&request)).unwrap();

        assert_eq!(
            value["contents"][0]["parts"][0],
            json!({"inline_data": {"mime_type": "image/png", "data": "AQID"}})
        );
        assert_eq!(value["contents"][0]["parts"][1], json!({"text": "Extract fields"}));
        assert_eq!(value["contents"][0]["role"], "user");
    }

    #[test]
    fn generation_config_uses_camel_case() {
        let request = InferenceRequest {
            prompt: "p".into(),
            parts: vec![],
            options: GenerationOptions::default(),
        };
        let value = serde_json::to_value(build_body(&request)).unwrap();
        let config = &value["generationConfig"];
        assert_eq!(config["topK"], 32);
        assert_eq!(config["maxOutputTokens"], 65_536);
        assert_eq!(config["responseMimeType"], "application/json");
    }

    #[test]
    fn response_mime_type_omitted_when_unset() {
        let request = InferenceRequest {
            prompt: "p".into(),
            parts: vec![],
            options: GenerationOptions {
                response_mime_type: None,
                ..GenerationOptions::default()
            },
        };
        let value = serde_json::to_value(build_body(&request)).unwrap();
        assert!(value["generationConfig"].get("responseMimeType").is_none());
    }

    #[test]
    fn error_message_keeps_provider_status() {
        let body = r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(error_message(body), "RESOURCE_EXHAUSTED: Quota exceeded");
        assert_eq!(error_message("  upstream timeout "), "upstream timeout");
        assert_eq!(error_message(""), "empty error body");
    }

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let backend = GeminiBackend::new("k", "gemini-1.5-pro", Duration::from_secs(5))
            .unwrap()
            .with_endpoint("http://localhost:8080/");
        assert_eq!(
            backend.url(),
            "http://localhost:8080/v1beta/models/gemini-1.5-pro:generateContent"
        );
        assert!(!format!("{backend:?}").contains("\"k\""));
    }
}
