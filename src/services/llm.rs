use crate::core::config::Config;
use crate::core::error::GenerationError;
use crate::services::schema::Schema;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use url::Url;

/// What kind of answer a request wants back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Structured(Schema),
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub mode: OutputMode,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: OutputMode::Text,
        }
    }

    pub fn structured(prompt: impl Into<String>, schema: Schema) -> Self {
        Self {
            prompt: prompt.into(),
            mode: OutputMode::Structured(schema),
        }
    }

    pub fn image(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: OutputMode::Image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImageData {
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

/// Unprocessed backend answer: the text segments joined, plus any binary segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub text: Option<String>,
    pub images: Vec<ImageData>,
}

/// One request/response round trip to a completion backend.
#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn generate(
        &self,
        api_key: &str,
        request: &GenerationRequest,
    ) -> Result<RawResponse, GenerationError>;

    /// Whether calls need an API key at all.
    fn requires_credential(&self) -> bool {
        true
    }
}

pub fn create_llm(config: &Config) -> Result<Arc<dyn LlmClient>> {
    match config.llm.provider.as_str() {
        "gemini" => {
            let cfg = config.llm.gemini.clone().unwrap_or_default();
            Ok(Arc::new(GeminiClient::new(
                &cfg.base_url,
                &cfg.text_model,
                &cfg.image_model,
            )?))
        }
        "ollama" => {
            let cfg = config.llm.ollama.as_ref().context("Ollama config missing")?;
            Ok(Arc::new(OllamaClient::new(&cfg.base_url, &cfg.model)))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.llm.provider)),
    }
}

// --- Gemini ---
#[derive(Debug)]
pub struct GeminiClient {
    base_url: Url,
    text_model: String,
    image_model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(base_url: &str, text_model: &str, image_model: &str) -> Result<Self> {
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            base_url: Url::parse(&base).with_context(|| format!("Invalid Gemini base URL: {}", base_url))?,
            text_model: text_model.to_string(),
            image_model: image_model.to_string(),
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, model: &str) -> Result<Url, GenerationError> {
        self.base_url
            .join(&format!("models/{}:generateContent", model))
            .map_err(|e| GenerationError::Configuration(format!("bad model endpoint: {}", e)))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: Option<String>,
    #[serde(rename = "inlineData")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Deserialize)]
struct GeminiInlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

fn gemini_body(request: &GenerationRequest) -> GeminiRequest {
    let generation_config = match &request.mode {
        OutputMode::Text => None,
        OutputMode::Structured(schema) => Some(GeminiGenerationConfig {
            response_mime_type: Some("application/json".to_string()),
            response_schema: Some(schema.to_gemini_schema()),
            ..Default::default()
        }),
        OutputMode::Image => Some(GeminiGenerationConfig {
            response_modalities: Some(vec!["TEXT".to_string(), "IMAGE".to_string()]),
            ..Default::default()
        }),
    };

    GeminiRequest {
        contents: vec![GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart {
                text: request.prompt.clone(),
            }],
        }],
        generation_config,
    }
}

fn parse_gemini_response(body: &str) -> Result<RawResponse, GenerationError> {
    let result: GeminiResponse = serde_json::from_str(body).map_err(|e| {
        GenerationError::Transport(format!("Failed to parse Gemini response: {}. Body: {}", e, body))
    })?;

    if let Some(err) = result.error {
        return Err(GenerationError::Transport(format!(
            "Gemini API returned error: {}",
            err.message
        )));
    }

    let Some(first) = result.candidates.and_then(|c| c.into_iter().next()) else {
        return Ok(RawResponse::default());
    };

    let parts = first.content.map(|c| c.parts).unwrap_or_default();
    if parts.is_empty() {
        debug!(
            "Gemini candidate without parts. Finish reason: {}",
            first.finish_reason.as_deref().unwrap_or("UNKNOWN")
        );
    }

    let mut texts = Vec::new();
    let mut images = Vec::new();
    for part in parts {
        if let Some(text) = part.text {
            texts.push(text);
        }
        if let Some(inline) = part.inline_data {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(inline.data.as_bytes())
                .map_err(|e| GenerationError::MalformedOutput(format!("invalid image payload: {}", e)))?;
            images.push(ImageData {
                mime_type: inline.mime_type,
                bytes,
            });
        }
    }

    Ok(RawResponse {
        text: if texts.is_empty() { None } else { Some(texts.concat()) },
        images,
    })
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate(
        &self,
        api_key: &str,
        request: &GenerationRequest,
    ) -> Result<RawResponse, GenerationError> {
        let model = match request.mode {
            OutputMode::Image => &self.image_model,
            _ => &self.text_model,
        };
        let url = self.endpoint(model)?;

        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&gemini_body(request))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(GenerationError::Transport(format!(
                "Gemini API error {}: {}",
                status, error_text
            )));
        }

        let response_text = resp.text().await?;
        parse_gemini_response(&response_text)
    }
}

// --- Ollama ---
#[derive(Debug)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Value>,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(
        &self,
        _api_key: &str,
        request: &GenerationRequest,
    ) -> Result<RawResponse, GenerationError> {
        let url = format!("{}/api/chat", self.base_url);

        let format = match &request.mode {
            OutputMode::Structured(schema) => Some(schema.to_json_schema()),
            _ => None,
        };

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: vec![OllamaMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            stream: false,
            format,
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(GenerationError::Transport(format!("Ollama API error: {}", error_text)));
        }

        let result: OllamaResponse = resp.json().await?;
        // Ollama chat models never return image bytes.
        Ok(RawResponse {
            text: Some(result.message.content),
            images: Vec::new(),
        })
    }

    fn requires_credential(&self) -> bool {
        false
    }
}
