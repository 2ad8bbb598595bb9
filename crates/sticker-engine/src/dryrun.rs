use std::io::Cursor;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use sha2::{Digest, Sha256};
use sticker_contracts::credentials::Credential;
use sticker_contracts::errors::ServiceError;
use sticker_contracts::stickers::InputImage;

use crate::model::{ContentRequest, GenerativeModel, ImageConfig, ModelOutput, ResponseModality};

pub const DRYRUN_IMAGE_SIZE: u32 = 256;
pub const DRYRUN_TEXT: &str = "a friendly robot";

/// Offline stand-in for the model service.
///
/// Images are a prompt-colored disc with an anti-aliased rim on pure black,
/// which is exactly what the matting pass expects from the real service.
#[derive(Debug, Clone)]
pub struct DryrunModel {
    size: u32,
}

impl Default for DryrunModel {
    fn default() -> Self {
        Self {
            size: DRYRUN_IMAGE_SIZE,
        }
    }
}

impl DryrunModel {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    fn render(&self, prompt: &str) -> Result<InputImage, ServiceError> {
        let bytes = render_disc_png(self.size, color_from_prompt(prompt))
            .map_err(|err| ServiceError::transport(format!("dryrun render failed: {err}")))?;
        Ok(InputImage::new(bytes, "image/png"))
    }
}

#[async_trait]
impl GenerativeModel for DryrunModel {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn generate_image(
        &self,
        credential: &Credential,
        prompt: &str,
        _config: &ImageConfig,
    ) -> Result<Option<InputImage>, ServiceError> {
        check_key(credential)?;
        self.render(prompt).map(Some)
    }

    async fn generate_content(
        &self,
        credential: &Credential,
        request: &ContentRequest,
    ) -> Result<ModelOutput, ServiceError> {
        check_key(credential)?;
        match request.modality {
            ResponseModality::Image => Ok(ModelOutput {
                images: vec![self.render(&request.prompt)?],
                text: String::new(),
            }),
            ResponseModality::Text => Ok(ModelOutput {
                images: Vec::new(),
                text: DRYRUN_TEXT.to_string(),
            }),
        }
    }

    async fn count_tokens(&self, credential: &Credential, _prompt: &str) -> Result<(), ServiceError> {
        check_key(credential)
    }
}

fn check_key(credential: &Credential) -> Result<(), ServiceError> {
    if credential.secret().trim().is_empty() {
        return Err(ServiceError::new(
            Some(400),
            "Gemini request failed (400): API key not valid. API_KEY_INVALID",
        ));
    }
    Ok(())
}

fn color_from_prompt(prompt: &str) -> [u8; 3] {
    let digest = Sha256::digest(prompt.as_bytes());
    // Keep the subject well clear of the near-black background threshold.
    [
        digest[0].max(64),
        digest[1].max(64),
        digest[2].max(64),
    ]
}

fn render_disc_png(size: u32, color: [u8; 3]) -> Result<Vec<u8>, image::ImageError> {
    let center = f64::from(size) / 2.0;
    let radius = f64::from(size) * 0.35;
    let image = RgbaImage::from_fn(size, size, |x, y| {
        let dx = f64::from(x) + 0.5 - center;
        let dy = f64::from(y) + 0.5 - center;
        let distance = (dx * dx + dy * dy).sqrt();
        let coverage = (radius + 0.5 - distance).clamp(0.0, 1.0);
        let channel = |value: u8| (f64::from(value) * coverage).round() as u8;
        Rgba([channel(color[0]), channel(color[1]), channel(color[2]), 255])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(image).write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use sticker_contracts::credentials::Credential;

    use super::{DryrunModel, DRYRUN_TEXT};
    use crate::matting::remove_background;
    use crate::model::{ContentRequest, GenerativeModel, ImageConfig, ResponseModality};

    #[tokio::test]
    async fn dryrun_image_is_disc_on_black_that_mattes_cleanly() -> anyhow::Result<()> {
        let model = DryrunModel::new(64);
        let image = model
            .generate_image(&Credential::Device("k".to_string()), "a cat", &ImageConfig::default())
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing image"))?;
        assert_eq!(image.mime_type, "image/png");

        let decoded = image::load_from_memory(&image.bytes)?.to_rgba8();
        assert_eq!(decoded.dimensions(), (64, 64));
        assert_eq!(decoded.get_pixel(0, 0).0, [0, 0, 0, 255]);

        let matted = remove_background(&decoded);
        assert_eq!(matted.get_pixel(0, 0)[3], 0);
        assert_eq!(matted.get_pixel(32, 32)[3], 255);
        Ok(())
    }

    #[tokio::test]
    async fn same_prompt_renders_same_bytes() -> anyhow::Result<()> {
        let model = DryrunModel::new(32);
        let key = Credential::Device("k".to_string());
        let first = model.generate_image(&key, "owl", &ImageConfig::default()).await?;
        let second = model.generate_image(&key, "owl", &ImageConfig::default()).await?;
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn text_requests_return_canned_answer() -> anyhow::Result<()> {
        let output = DryrunModel::default()
            .generate_content(
                &Credential::User("k".to_string()),
                &ContentRequest {
                    image: None,
                    prompt: "what?".to_string(),
                    system_instruction: None,
                    modality: ResponseModality::Text,
                },
            )
            .await?;
        assert_eq!(output.text, DRYRUN_TEXT);
        Ok(())
    }

    #[tokio::test]
    async fn blank_key_is_rejected_as_invalid() {
        let err = DryrunModel::default()
            .count_tokens(&Credential::User("  ".to_string()), "ping")
            .await
            .err();
        assert!(err.map(|err| err.is_auth_failure()).unwrap_or(false));
    }
}
