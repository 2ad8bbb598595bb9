use serde_json::{json, Value};
use sticker_contracts::credentials::{Credential, CredentialStore};
use sticker_contracts::errors::StickerError;
use sticker_contracts::events::{payload, EventWriter};
use sticker_contracts::stickers::{
    ExportBlob, GenerationRequest, InputImage, OperationKind, StickerArtifact,
};
use sticker_contracts::styles::StyleRegistry;
use tracing::{debug, warn};

use crate::export::export_bytes_for_sharing;
use crate::matting::matte_to_png;
use crate::model::GenerativeModel;
use crate::orchestrator::{EngineConfig, GenerationOrchestrator, QuotaStatus};
use crate::preprocess::preprocess_image;

const STICKER_MIME: &str = "image/png";

/// Caller-facing pipeline: preprocess, orchestrate, matte, export.
///
/// CPU-bound passes run on the blocking pool so async callers stay
/// responsive. Run events go to an optional `events.jsonl`.
pub struct StickerEngine<M, S> {
    orchestrator: GenerationOrchestrator<M, S>,
    events: Option<EventWriter>,
}

impl<M, S> StickerEngine<M, S>
where
    M: GenerativeModel,
    S: CredentialStore,
{
    pub fn new(model: M, store: S, config: EngineConfig) -> Self {
        Self {
            orchestrator: GenerationOrchestrator::new(model, store, config),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_styles(mut self, styles: StyleRegistry) -> Self {
        self.orchestrator = self.orchestrator.with_styles(styles);
        self
    }

    pub fn orchestrator(&self) -> &GenerationOrchestrator<M, S> {
        &self.orchestrator
    }

    pub fn events(&self) -> Option<&EventWriter> {
        self.events.as_ref()
    }

    pub async fn preprocess_image(&self, bytes: Vec<u8>) -> Result<InputImage, StickerError> {
        tokio::task::spawn_blocking(move || preprocess_image(&bytes))
            .await
            .map_err(|err| worker_failed("preprocess", err))?
    }

    /// Creates a sticker from a prompt, a photo, or both. The photo is
    /// preprocessed before upload.
    pub async fn generate_sticker(
        &self,
        photo: Option<Vec<u8>>,
        prompt: &str,
        caption: Option<&str>,
        style: Option<&str>,
    ) -> Result<StickerArtifact, StickerError> {
        let selection = self.orchestrator.styles().resolve(style);
        self.emit(
            "sticker_requested",
            [
                ("operation", json!(OperationKind::Create.as_str())),
                ("prompt", json!(prompt)),
                ("style", json!(selection.style.id)),
                ("style_fallback_reason", json!(selection.fallback_reason)),
                ("has_photo", json!(photo.is_some())),
            ],
        );

        let result: Result<StickerArtifact, StickerError> = async {
            let image = match photo {
                Some(bytes) => Some(self.preprocess_image(bytes).await?),
                None => None,
            };
            let request = GenerationRequest::create(prompt)
                .with_image(image)
                .with_caption(caption.map(str::to_string))
                .with_style(style.map(str::to_string));
            let raw = self.orchestrator.generate_sticker(&request).await?;
            Ok(self.finish(raw, prompt).await)
        }
        .await;
        self.record_outcome(OperationKind::Create, result)
    }

    /// Applies an instruction to an existing sticker.
    pub async fn edit_sticker(
        &self,
        current: &InputImage,
        instruction: &str,
    ) -> Result<StickerArtifact, StickerError> {
        self.emit(
            "sticker_requested",
            [
                ("operation", json!(OperationKind::Edit.as_str())),
                ("prompt", json!(instruction)),
            ],
        );
        let result: Result<StickerArtifact, StickerError> = async {
            let raw = self.orchestrator.edit_sticker(current, instruction).await?;
            Ok(self.finish(raw, instruction).await)
        }
        .await;
        self.record_outcome(OperationKind::Edit, result)
    }

    pub async fn detect_subject(&self, image: &InputImage) -> Result<String, StickerError> {
        let result = self.orchestrator.detect_subject(image).await;
        self.record_text(OperationKind::DetectSubject, result)
    }

    pub async fn analyze_image(
        &self,
        image: &InputImage,
        prompt: &str,
    ) -> Result<String, StickerError> {
        let result = self.orchestrator.analyze_image(image, prompt).await;
        self.record_text(OperationKind::Analyze, result)
    }

    pub async fn validate_user_key(&self, secret: &str) -> bool {
        let valid = self.orchestrator.validate_user_key(secret).await;
        self.emit(
            "key_validated",
            [
                ("valid", json!(valid)),
                (
                    "key",
                    json!(Credential::User(secret.trim().to_string()).fingerprint()),
                ),
            ],
        );
        valid
    }

    /// Validates `secret` and stores it only when the service accepts it.
    pub async fn set_user_key(&self, secret: &str) -> Result<bool, StickerError> {
        if !self.validate_user_key(secret).await {
            return Ok(false);
        }
        self.orchestrator
            .store()
            .save_user_key(secret.trim())
            .map_err(StickerError::store)?;
        Ok(true)
    }

    pub fn clear_user_key(&self) -> Result<(), StickerError> {
        self.orchestrator
            .store()
            .clear_user_key()
            .map_err(StickerError::store)
    }

    pub fn quota_status(&self) -> Result<QuotaStatus, StickerError> {
        self.orchestrator.quota_status()
    }

    pub async fn export_for_sharing(&self, image: Vec<u8>) -> Result<ExportBlob, StickerError> {
        let blob = tokio::task::spawn_blocking(move || export_bytes_for_sharing(&image))
            .await
            .map_err(|err| worker_failed("export", err))??;
        self.emit(
            "export_created",
            [
                ("bytes", json!(blob.len())),
                ("mime_type", json!(blob.mime_type)),
                ("quality", json!(blob.quality)),
            ],
        );
        Ok(blob)
    }

    /// Mattes the raw model image. Falls back to the raw bytes when matting
    /// fails, keeping their mime type.
    async fn finish(&self, raw: InputImage, prompt: &str) -> StickerArtifact {
        let fallback = raw.clone();
        let sticker = tokio::task::spawn_blocking(move || match matte_to_png(&raw.bytes) {
            Ok(png) => InputImage::new(png, STICKER_MIME),
            Err(err) => {
                warn!(error = %err, "matting failed; keeping generated image");
                raw
            }
        })
        .await
        .unwrap_or_else(|err| {
            warn!(error = %err, "matting worker failed; keeping generated image");
            fallback
        });
        StickerArtifact::new(sticker.bytes, sticker.mime_type, prompt)
    }

    fn record_outcome(
        &self,
        operation: OperationKind,
        result: Result<StickerArtifact, StickerError>,
    ) -> Result<StickerArtifact, StickerError> {
        match &result {
            Ok(artifact) => self.emit(
                "sticker_created",
                [
                    ("operation", json!(operation.as_str())),
                    ("sticker_id", json!(artifact.id)),
                    ("mime_type", json!(artifact.mime_type)),
                    ("bytes", json!(artifact.image.len())),
                    ("created_at", json!(artifact.created_at_iso())),
                ],
            ),
            Err(err) => self.emit_failure(operation, err),
        }
        result
    }

    fn record_text(
        &self,
        operation: OperationKind,
        result: Result<String, StickerError>,
    ) -> Result<String, StickerError> {
        match &result {
            Ok(text) => self.emit(
                "text_result",
                [
                    ("operation", json!(operation.as_str())),
                    ("text", json!(text)),
                ],
            ),
            Err(err) => self.emit_failure(operation, err),
        }
        result
    }

    fn emit_failure(&self, operation: OperationKind, err: &StickerError) {
        self.emit(
            "sticker_failed",
            [
                ("operation", json!(operation.as_str())),
                ("error", json!(err.to_string())),
                ("needs_credential", json!(err.needs_credential())),
            ],
        );
    }

    fn emit<'a>(&self, event_type: &str, fields: impl IntoIterator<Item = (&'a str, Value)>) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        match events.emit(event_type, payload(fields)) {
            Ok(event) => debug!(event_type, seq = event.seq, "event emitted"),
            Err(err) => warn!(event_type, error = ?err, "failed to write event"),
        }
    }
}

fn worker_failed(stage: &str, err: tokio::task::JoinError) -> StickerError {
    warn!(stage, error = %err, "image worker did not complete");
    StickerError::Worker(format!("{stage}: {err}"))
}
