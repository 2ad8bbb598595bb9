use std::env;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use sticker_contracts::credentials::Credential;
use sticker_contracts::errors::ServiceError;
use sticker_contracts::stickers::InputImage;
use tracing::{debug, warn};

use crate::model::{ContentRequest, GenerativeModel, ImageConfig, ModelOutput, ResponseModality};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_IMAGE_MODEL: &str = "imagen-4.0-generate-001";
pub const DEFAULT_EDIT_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

const ERROR_BODY_MAX_CHARS: usize = 512;

/// Models used per call family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiModels {
    /// Text-to-image (`:predict`).
    pub image: String,
    /// Image-to-image (`:generateContent` with an image response).
    pub edit: String,
    /// Vision/text calls and key validation.
    pub text: String,
}

impl Default for GeminiModels {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE_MODEL.to_string(),
            edit: DEFAULT_EDIT_MODEL.to_string(),
            text: DEFAULT_TEXT_MODEL.to_string(),
        }
    }
}

impl GeminiModels {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            image: non_empty_env("STICKER_IMAGE_MODEL").unwrap_or(defaults.image),
            edit: non_empty_env("STICKER_EDIT_MODEL").unwrap_or(defaults.edit),
            text: non_empty_env("STICKER_TEXT_MODEL").unwrap_or(defaults.text),
        }
    }
}

/// HTTP client for the Gemini/Imagen REST surface.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_base: String,
    http: reqwest::Client,
    models: GeminiModels,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(api_base: impl Into<String>, models: GeminiModels) -> Self {
        let api_base = api_base.into();
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            models,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Reads `GEMINI_API_BASE` and the `STICKER_*_MODEL` overrides.
    pub fn from_env() -> Self {
        let api_base = non_empty_env("GEMINI_API_BASE")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self::new(api_base, GeminiModels::from_env())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn models(&self) -> &GeminiModels {
        &self.models
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:{}", self.api_base, model_path, method)
    }

    async fn post(
        &self,
        model: &str,
        method: &str,
        credential: &Credential,
        payload: &Value,
    ) -> Result<Value, ServiceError> {
        let endpoint = self.endpoint(model, method);
        debug!(
            model,
            method,
            credential = credential.kind().as_str(),
            key = %credential.fingerprint(),
            "gemini request"
        );
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", credential.secret())])
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                ServiceError::transport(format!("Gemini transport failed: {}", err.without_url()))
            })?;
        response_json_or_error(response).await
    }

    fn content_payload(request: &ContentRequest) -> Value {
        let mut parts = Vec::new();
        if let Some(image) = request.image.as_ref() {
            parts.push(json!({
                "inlineData": {
                    "mimeType": image.mime_type,
                    "data": BASE64.encode(&image.bytes),
                }
            }));
        }
        parts.push(json!({ "text": request.prompt }));

        let mut payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "responseModalities": [request.modality.as_api_str()],
            },
        });
        if let Some(instruction) = request
            .system_instruction
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            payload["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
        }
        payload
    }
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate_image(
        &self,
        credential: &Credential,
        prompt: &str,
        config: &ImageConfig,
    ) -> Result<Option<InputImage>, ServiceError> {
        let payload = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": config.sample_count,
                "aspectRatio": config.aspect_ratio,
            },
        });
        let response = self
            .post(&self.models.image, "predict", credential, &payload)
            .await?;
        Ok(extract_predictions(&response).into_iter().next())
    }

    async fn generate_content(
        &self,
        credential: &Credential,
        request: &ContentRequest,
    ) -> Result<ModelOutput, ServiceError> {
        let model = match request.modality {
            ResponseModality::Image => &self.models.edit,
            ResponseModality::Text => &self.models.text,
        };
        let payload = Self::content_payload(request);
        let response = self
            .post(model, "generateContent", credential, &payload)
            .await?;
        Ok(extract_content(&response))
    }

    async fn count_tokens(&self, credential: &Credential, prompt: &str) -> Result<(), ServiceError> {
        let payload = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        });
        self.post(&self.models.text, "countTokens", credential, &payload)
            .await
            .map(|_| ())
    }
}

async fn response_json_or_error(response: reqwest::Response) -> Result<Value, ServiceError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().await.map_err(|err| {
        ServiceError::new(
            Some(code),
            format!("Gemini response body read failed: {}", err.without_url()),
        )
    })?;
    if !status.is_success() {
        return Err(ServiceError::new(
            Some(code),
            format!(
                "Gemini request failed ({code}): {}",
                truncate_text(&body, ERROR_BODY_MAX_CHARS)
            ),
        ));
    }
    serde_json::from_str(&body).map_err(|err| {
        ServiceError::new(
            Some(code),
            format!("Gemini returned invalid JSON payload: {err}"),
        )
    })
}

fn extract_predictions(response: &Value) -> Vec<InputImage> {
    response
        .get("predictions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|row| {
            let encoded = row.get("bytesBase64Encoded").and_then(Value::as_str)?;
            let mime_type = row
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            decode_image(encoded, mime_type)
        })
        .collect()
}

fn extract_content(response: &Value) -> ModelOutput {
    let mut output = ModelOutput::default();
    let candidates = response
        .get("candidates")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                output.text.push_str(text);
            }
            let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
                continue;
            };
            let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            if let Some(image) = decode_image(data, mime_type) {
                output.images.push(image);
            }
        }
    }
    output
}

fn decode_image(encoded: &str, mime_type: &str) -> Option<InputImage> {
    match BASE64.decode(encoded.as_bytes()) {
        Ok(bytes) if !bytes.is_empty() => Some(InputImage::new(bytes, mime_type)),
        Ok(_) => None,
        Err(err) => {
            warn!(error = %err, "skipping undecodable image part");
            None
        }
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
