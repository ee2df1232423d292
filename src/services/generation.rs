use crate::core::error::GenerationError;
use crate::services::llm::{GenerationRequest, ImageData, LlmClient, OutputMode};
use crate::services::schema::Schema;
use crate::utils::text::strip_code_blocks;
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// What a successful call produced, by mode.
#[derive(Debug, Clone, PartialEq)]
pub enum Generated {
    Text(String),
    Value(Value),
    Image(ImageData),
}

/// Wraps a backend with credential checks and output parsing.
///
/// Holds no session state: every call is checked and sent on its own. Nothing is
/// retried here; retry policy belongs to the batch runner.
#[derive(Clone, Debug)]
pub struct GenerationClient {
    backend: Arc<dyn LlmClient>,
    api_key: Option<String>,
}

impl GenerationClient {
    pub fn new(backend: Arc<dyn LlmClient>, api_key: Option<String>) -> Self {
        Self { backend, api_key }
    }

    /// Fails with `Configuration` when the backend needs a key and none is set.
    pub fn check_credential(&self) -> Result<(), GenerationError> {
        self.credential().map(|_| ())
    }

    fn credential(&self) -> Result<&str, GenerationError> {
        match self.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Ok(key),
            _ if !self.backend.requires_credential() => Ok(""),
            _ => Err(GenerationError::Configuration(
                "API key is not set; add it to config.yml or GEMINI_API_KEY".to_string(),
            )),
        }
    }

    pub async fn complete(&self, request: &GenerationRequest) -> Result<Generated, GenerationError> {
        let api_key = self.credential()?;
        debug!("Sending {:?} request ({} chars)", mode_name(&request.mode), request.prompt.chars().count());
        let raw = self.backend.generate(api_key, request).await?;

        match &request.mode {
            OutputMode::Text => match raw.text {
                Some(text) if !text.trim().is_empty() => Ok(Generated::Text(text)),
                _ => Err(GenerationError::EmptyOutput),
            },
            OutputMode::Structured(schema) => {
                let text = raw.text.unwrap_or_default();
                parse_structured(&text, schema).map(Generated::Value)
            }
            OutputMode::Image => raw
                .images
                .into_iter()
                .next()
                .map(Generated::Image)
                .ok_or(GenerationError::NoImageData),
        }
    }

    pub async fn text(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        match self.complete(request).await? {
            Generated::Text(text) => Ok(text),
            other => Err(unexpected(other)),
        }
    }

    /// Structured call decoded into `T`. The value has already passed schema
    /// validation, so a decode failure is still reported as malformed output.
    pub async fn structured<T: DeserializeOwned>(&self, request: &GenerationRequest) -> Result<T, GenerationError> {
        match self.complete(request).await? {
            Generated::Value(value) => serde_json::from_value(value)
                .map_err(|e| GenerationError::MalformedOutput(e.to_string())),
            other => Err(unexpected(other)),
        }
    }

    pub async fn image(&self, request: &GenerationRequest) -> Result<ImageData, GenerationError> {
        match self.complete(request).await? {
            Generated::Image(image) => Ok(image),
            other => Err(unexpected(other)),
        }
    }
}

/// Parses raw model text as JSON and validates it against `schema`.
/// Anything short of a complete, conforming value is `MalformedOutput`.
pub fn parse_structured(raw: &str, schema: &Schema) -> Result<Value, GenerationError> {
    let clean = strip_code_blocks(raw);
    let value: Value = serde_json::from_str(&clean)
        .map_err(|e| GenerationError::MalformedOutput(format!("{}: {}", e, clean)))?;
    schema
        .validate(&value)
        .map_err(GenerationError::MalformedOutput)?;
    Ok(value)
}

fn mode_name(mode: &OutputMode) -> &'static str {
    match mode {
        OutputMode::Text => "text",
        OutputMode::Structured(_) => "structured",
        OutputMode::Image => "image",
    }
}

fn unexpected(got: Generated) -> GenerationError {
    let kind = match got {
        Generated::Text(_) => "text",
        Generated::Value(_) => "structured value",
        Generated::Image(_) => "image",
    };
    GenerationError::MalformedOutput(format!("request mode produced unexpected {}", kind))
}
