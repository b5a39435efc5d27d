//! Gemini `v1beta` `generateContent` client used to render green-screen images.

use async_trait::async_trait;
use base64::Engine;
use keyout_common::config::GeminiConfig;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Appended to every user prompt so the chroma key has a clean background to remove.
pub const GREEN_SCREEN_INSTRUCTION: &str = "Render the subject isolated on a flat, \
uniform pure green (#00FF00) background. The background must contain no shadows, \
gradients or scenery, and the subject itself must not use that green.";

const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited by Gemini")]
    RateLimited,
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("content blocked: {0}")]
    ContentBlocked(String),
    /// None of the known response shapes carried an image.
    #[error("no image in Gemini response (finish reason: {finish_reason:?})")]
    NoImageInResponse { finish_reason: Option<String> },
    #[error("failed to decode base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl GenerateError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Source of raw (undecoded) image bytes for a prompt.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, GenerateError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    max_retries: u32,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig, api_key: String) -> Result<Self, GenerateError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }

    async fn generate_once(&self, prompt: &str) -> Result<Vec<u8>, GenerateError> {
        let start = Instant::now();
        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&GenerateContentRequest::for_prompt(prompt))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_for_status(status.as_u16(), text));
        }

        let body: GenerateContentResponse = response.json().await?;
        let inline = extract_image(&body)?;
        let data = base64::engine::general_purpose::STANDARD.decode(&inline.data)?;
        info!(
            model = self.model,
            mime_type = inline.mime_type,
            bytes = data.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Gemini returned image"
        );
        Ok(data)
    }
}

#[async_trait]
impl ImageGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, GenerateError> {
        let mut attempt = 0;
        loop {
            match self.generate_once(prompt).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        error = %e,
                        attempt,
                        max_retries = self.max_retries,
                        "transient Gemini error, retrying in {:?}",
                        RETRY_DELAY
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                result => return result,
            }
        }
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

fn error_for_status(status: u16, text: String) -> GenerateError {
    match status {
        401 | 403 => GenerateError::Auth(text),
        429 => GenerateError::RateLimited,
        _ => GenerateError::Api {
            status,
            message: text,
        },
    }
}

// ---------------------------------------------------------------------------
// Response adapter
// ---------------------------------------------------------------------------

/// A named way of locating the image part in a response.
///
/// `extract` returns `None` when its precondition does not hold.
struct ExtractionStrategy {
    name: &'static str,
    extract: fn(&GenerateContentResponse) -> Option<&InlineData>,
}

/// Tried in order; the first match wins.
const STRATEGIES: &[ExtractionStrategy] = &[
    // Precondition: the first candidate has an inline part with an image/* mime type.
    ExtractionStrategy {
        name: "first_candidate_inline_image",
        extract: first_candidate_inline_image,
    },
    // Precondition: some later candidate carries an inline image part.
    ExtractionStrategy {
        name: "any_candidate_inline_image",
        extract: any_candidate_inline_image,
    },
];

fn inline_image(candidate: &Candidate) -> Option<&InlineData> {
    candidate
        .content
        .as_ref()?
        .parts
        .iter()
        .filter_map(|part| part.inline_data.as_ref())
        .find(|data| data.mime_type.starts_with("image/"))
}

fn first_candidate_inline_image(response: &GenerateContentResponse) -> Option<&InlineData> {
    response.candidates.first().and_then(inline_image)
}

fn any_candidate_inline_image(response: &GenerateContentResponse) -> Option<&InlineData> {
    response.candidates.iter().skip(1).find_map(inline_image)
}

const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "IMAGE_SAFETY",
    "IMAGE_PROHIBITED_CONTENT",
    "PROHIBITED_CONTENT",
    "RECITATION",
    "IMAGE_RECITATION",
    "BLOCKLIST",
];

fn extract_image(response: &GenerateContentResponse) -> Result<&InlineData, GenerateError> {
    if let Some(reason) = response
        .prompt_feedback
        .as_ref()
        .and_then(|f| f.block_reason.as_ref())
    {
        return Err(GenerateError::ContentBlocked(format!("prompt blocked: {reason}")));
    }

    for strategy in STRATEGIES {
        if let Some(data) = (strategy.extract)(response) {
            debug!(strategy = strategy.name, "extracted image payload");
            return Ok(data);
        }
        debug!(strategy = strategy.name, "strategy did not match");
    }

    let finish_reason = response
        .candidates
        .first()
        .and_then(|c| c.finish_reason.clone());
    if let Some(reason) = finish_reason.as_deref() {
        if BLOCKING_FINISH_REASONS.contains(&reason) {
            return Err(GenerateError::ContentBlocked(format!(
                "generation stopped: {reason}"
            )));
        }
    }
    Err(GenerateError::NoImageInResponse { finish_reason })
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<RequestContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
}

impl GenerateContentRequest {
    fn for_prompt(prompt: &str) -> Self {
        Self {
            contents: vec![RequestContent {
                parts: vec![TextPart {
                    text: format!("{prompt}\n\n{GREEN_SCREEN_INSTRUCTION}"),
                }],
            }],
            generation_config: GenerationConfig {
                response_modalities: vec!["TEXT", "IMAGE"],
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<ResponseContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL_PATH: &str = "/v1beta/models/gemini-2.5-flash-image:generateContent";

    fn client_for(server: &MockServer, max_retries: u32) -> GeminiClient {
        let config = GeminiConfig {
            base_url: server.uri(),
            max_retries,
            ..GeminiConfig::default()
        };
        GeminiClient::new(&config, "test-key".into()).unwrap()
    }

    fn parse(json: serde_json::Value) -> GenerateContentResponse {
        serde_json::from_value(json).unwrap()
    }

    fn image_body(b64: &str) -> serde_json::Value {
        serde_json::json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "here you go"},
                    {"inlineData": {"mimeType": "image/png", "data": b64}}
                ]},
                "finishReason": "STOP"
            }]
        })
    }

    #[test]
    fn request_appends_instruction_and_uses_camel_case() {
        let json = serde_json::to_value(GenerateContentRequest::for_prompt("a cat")).unwrap();
        let text = json["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("a cat\n\n"));
        assert!(text.ends_with(GREEN_SCREEN_INSTRUCTION));
        assert_eq!(
            json["generationConfig"]["responseModalities"],
            serde_json::json!(["TEXT", "IMAGE"])
        );
        assert!(json.get("generation_config").is_none());
    }

    #[test]
    fn first_candidate_strategy_skips_text_parts() {
        let response = parse(image_body("AAAA"));
        let data = extract_image(&response).unwrap();
        assert_eq!(data.mime_type, "image/png");
        assert_eq!(data.data, "AAAA");
    }

    #[test]
    fn later_candidate_is_used_when_first_has_no_image() {
        let response = parse(serde_json::json!({
            "candidates": [
                {"content": {"parts": [{"text": "no image"}]}},
                {"content": {"parts": [{"inlineData": {"mimeType": "image/jpeg", "data": "BBBB"}}]}}
            ]
        }));
        assert_eq!(extract_image(&response).unwrap().data, "BBBB");
    }

    #[test]
    fn non_image_inline_data_is_ignored() {
        let response = parse(serde_json::json!({
            "candidates": [{"content": {"parts": [
                {"inlineData": {"mimeType": "text/plain", "data": "CCCC"}}
            ]}}]
        }));
        assert!(matches!(
            extract_image(&response),
            Err(GenerateError::NoImageInResponse { .. })
        ));
    }

    #[test]
    fn prompt_feedback_block_is_content_blocked() {
        let response = parse(serde_json::json!({
            "candidates": [],
            "promptFeedback": {"blockReason": "SAFETY"}
        }));
        assert!(matches!(
            extract_image(&response),
            Err(GenerateError::ContentBlocked(_))
        ));
    }

    #[test]
    fn safety_finish_reason_is_content_blocked() {
        let response = parse(serde_json::json!({
            "candidates": [{"finishReason": "IMAGE_SAFETY"}]
        }));
        assert!(matches!(
            extract_image(&response),
            Err(GenerateError::ContentBlocked(_))
        ));
    }

    #[test]
    fn empty_response_names_missing_image() {
        let response = parse(serde_json::json!({
            "candidates": [{"finishReason": "STOP"}]
        }));
        match extract_image(&response) {
            Err(GenerateError::NoImageInResponse { finish_reason }) => {
                assert_eq!(finish_reason.as_deref(), Some("STOP"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(GenerateError::RateLimited.is_retryable());
        assert!(GenerateError::Api { status: 503, message: String::new() }.is_retryable());
        assert!(!GenerateError::Api { status: 400, message: String::new() }.is_retryable());
        assert!(!GenerateError::Auth("bad".into()).is_retryable());
        assert!(!GenerateError::ContentBlocked("nope".into()).is_retryable());
    }

    #[tokio::test]
    async fn generate_sends_key_and_decodes_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(MODEL_PATH))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "generationConfig": {"responseModalities": ["TEXT", "IMAGE"]}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(image_body("aGVsbG8=")))
            .expect(1)
            .mount(&server)
            .await;

        let bytes = client_for(&server, 0).generate("a cat").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(MODEL_PATH))
            .respond_with(ResponseTemplate::new(403).set_body_string("API key not valid"))
            .expect(1)
            .mount(&server)
            .await;

        let result = client_for(&server, 3).generate("a cat").await;
        assert!(matches!(result, Err(GenerateError::Auth(msg)) if msg.contains("not valid")));
    }

    #[tokio::test]
    async fn server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(MODEL_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(MODEL_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(image_body("aGVsbG8=")))
            .expect(1)
            .mount(&server)
            .await;

        let bytes = client_for(&server, 1).generate("a cat").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn rate_limit_without_retries_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(MODEL_PATH))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let result = client_for(&server, 0).generate("a cat").await;
        assert!(matches!(result, Err(GenerateError::RateLimited)));
    }

    #[tokio::test]
    async fn invalid_base64_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(MODEL_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(image_body("!!not base64!!")))
            .mount(&server)
            .await;

        let result = client_for(&server, 0).generate("a cat").await;
        assert!(matches!(result, Err(GenerateError::Base64(_))));
    }
}
