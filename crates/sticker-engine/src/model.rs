use async_trait::async_trait;
use sticker_contracts::credentials::Credential;
use sticker_contracts::errors::ServiceError;
use sticker_contracts::stickers::InputImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Image,
    Text,
}

impl ResponseModality {
    pub fn as_api_str(self) -> &'static str {
        match self {
            Self::Image => "IMAGE",
            Self::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    pub aspect_ratio: String,
    pub sample_count: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            aspect_ratio: "1:1".to_string(),
            sample_count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRequest {
    pub image: Option<InputImage>,
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub modality: ResponseModality,
}

/// Everything a content call returned; either side may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelOutput {
    pub images: Vec<InputImage>,
    pub text: String,
}

impl ModelOutput {
    pub fn first_image(self) -> Option<InputImage> {
        self.images.into_iter().find(|image| !image.bytes.is_empty())
    }

    pub fn non_empty_text(&self) -> Option<String> {
        let trimmed = self.text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// External generative model service.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    fn name(&self) -> &str;

    /// Text-to-image. `Ok(None)` means the service answered without an image.
    async fn generate_image(
        &self,
        credential: &Credential,
        prompt: &str,
        config: &ImageConfig,
    ) -> Result<Option<InputImage>, ServiceError>;

    /// Image-to-image, vision and text generation.
    async fn generate_content(
        &self,
        credential: &Credential,
        request: &ContentRequest,
    ) -> Result<ModelOutput, ServiceError>;

    /// Cheap authenticated call used to validate a key.
    async fn count_tokens(&self, credential: &Credential, prompt: &str) -> Result<(), ServiceError>;
}
