use std::future::Future;

use sticker_contracts::credentials::{Credential, CredentialKind, CredentialStore};
use sticker_contracts::errors::{ServiceError, StickerError};
use sticker_contracts::stickers::{GenerationRequest, InputImage, OperationKind};
use sticker_contracts::styles::StyleRegistry;
use tracing::{debug, info, warn};

use crate::gemini::non_empty_env;
use crate::model::{ContentRequest, GenerativeModel, ImageConfig, ModelOutput, ResponseModality};
use crate::prompts::{
    edit_prompt, photo_sticker_prompt, sticker_prompt, DETECT_SUBJECT_PROMPT,
    PHOTO_SYSTEM_INSTRUCTION,
};
use crate::retry::RetryPolicy;

/// Free device-key generations per installation.
pub const DEFAULT_QUOTA_LIMIT: u32 = 5;
const VALIDATION_PROMPT: &str = "ping";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub quota_limit: u32,
    pub retry: RetryPolicy,
    /// Operator key shared by all installations; `None` disables the free tier.
    pub device_key: Option<String>,
    pub image: ImageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quota_limit: DEFAULT_QUOTA_LIMIT,
            retry: RetryPolicy::default(),
            device_key: None,
            image: ImageConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Device key from `STICKER_DEVICE_KEY`, then `GEMINI_API_KEY`, then
    /// `GOOGLE_API_KEY`.
    pub fn from_env() -> Self {
        Self {
            device_key: non_empty_env("STICKER_DEVICE_KEY")
                .or_else(|| non_empty_env("GEMINI_API_KEY"))
                .or_else(|| non_empty_env("GOOGLE_API_KEY")),
            ..Self::default()
        }
    }

    pub fn with_device_key(mut self, key: impl Into<String>) -> Self {
        self.device_key = Some(key.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    pub used: u32,
    pub limit: u32,
    pub has_user_key: bool,
    pub has_device_key: bool,
}

impl QuotaStatus {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

/// Runs model operations with credential selection, retries, error
/// classification and quota accounting.
pub struct GenerationOrchestrator<M, S> {
    model: M,
    store: S,
    config: EngineConfig,
    styles: StyleRegistry,
}

impl<M, S> GenerationOrchestrator<M, S>
where
    M: GenerativeModel,
    S: CredentialStore,
{
    pub fn new(model: M, store: S, config: EngineConfig) -> Self {
        Self {
            model,
            store,
            config,
            styles: StyleRegistry::default(),
        }
    }

    pub fn with_styles(mut self, styles: StyleRegistry) -> Self {
        self.styles = styles;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn styles(&self) -> &StyleRegistry {
        &self.styles
    }

    /// A stored user key always wins. The device key is used only while the
    /// quota has room; otherwise no network call is made.
    pub fn select_credential(&self) -> Result<Credential, StickerError> {
        if let Some(secret) = self
            .store
            .user_key()
            .map_err(StickerError::store)?
            .filter(|value| !value.trim().is_empty())
        {
            return Ok(Credential::User(secret));
        }

        let Some(device_key) = self
            .config
            .device_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
        else {
            debug!("no user key and no device key configured");
            return Err(StickerError::CredentialRequired);
        };

        let used = self.store.quota_count().map_err(StickerError::store)?;
        if used >= self.config.quota_limit {
            info!(used, limit = self.config.quota_limit, "device quota exhausted");
            return Err(StickerError::CredentialRequired);
        }
        Ok(Credential::Device(device_key.to_string()))
    }

    pub fn quota_status(&self) -> Result<QuotaStatus, StickerError> {
        let has_user_key = self
            .store
            .user_key()
            .map_err(StickerError::store)?
            .is_some_and(|value| !value.trim().is_empty());
        Ok(QuotaStatus {
            used: self.store.quota_count().map_err(StickerError::store)?,
            limit: self.config.quota_limit,
            has_user_key,
            has_device_key: self
                .config
                .device_key
                .as_deref()
                .is_some_and(|value| !value.trim().is_empty()),
        })
    }

    /// Dispatches on `request.kind`. Image operations return the raw model
    /// image; text operations return it in `text`.
    pub async fn run(&self, request: &GenerationRequest) -> Result<Generated, StickerError> {
        match request.kind {
            OperationKind::Create => self.generate_sticker(request).await.map(Generated::Image),
            OperationKind::Edit => {
                let image = require_image(request)?;
                self.edit_sticker(image, &request.prompt)
                    .await
                    .map(Generated::Image)
            }
            OperationKind::DetectSubject => self
                .detect_subject(require_image(request)?)
                .await
                .map(Generated::Text),
            OperationKind::Analyze => self
                .analyze_image(require_image(request)?, &request.prompt)
                .await
                .map(Generated::Text),
        }
    }

    /// Text-to-image when no photo is attached, image-to-image otherwise.
    pub async fn generate_sticker(
        &self,
        request: &GenerationRequest,
    ) -> Result<InputImage, StickerError> {
        let selection = self.styles.resolve(request.style.as_deref());
        if let Some(reason) = selection.fallback_reason.as_deref() {
            debug!(reason, "style fallback");
        }
        let caption = request.caption.as_deref();

        match request.image.as_ref() {
            Some(photo) => {
                let content = ContentRequest {
                    image: Some(photo.clone()),
                    prompt: photo_sticker_prompt(&request.prompt, &selection.style, caption),
                    system_instruction: Some(PHOTO_SYSTEM_INSTRUCTION.to_string()),
                    modality: ResponseModality::Image,
                };
                let content = &content;
                self.execute(OperationKind::Create, "image", |credential| async move {
                    self.model
                        .generate_content(&credential, content)
                        .await
                        .map(ModelOutput::first_image)
                })
                .await
            }
            None => {
                if request.prompt.trim().is_empty() {
                    return Err(StickerError::InvalidRequest(
                        "a prompt or a photo is required".to_string(),
                    ));
                }
                let prompt = sticker_prompt(&request.prompt, &selection.style, caption);
                let prompt = prompt.as_str();
                let config = &self.config.image;
                self.execute(OperationKind::Create, "image", |credential| async move {
                    self.model.generate_image(&credential, prompt, config).await
                })
                .await
            }
        }
    }

    /// The current sticker is sent as-is together with the instruction.
    pub async fn edit_sticker(
        &self,
        current: &InputImage,
        instruction: &str,
    ) -> Result<InputImage, StickerError> {
        if instruction.trim().is_empty() {
            return Err(StickerError::InvalidRequest(
                "an edit instruction is required".to_string(),
            ));
        }
        let content = ContentRequest {
            image: Some(current.clone()),
            prompt: edit_prompt(instruction),
            system_instruction: None,
            modality: ResponseModality::Image,
        };
        let content = &content;
        self.execute(OperationKind::Edit, "image", |credential| async move {
            self.model
                .generate_content(&credential, content)
                .await
                .map(ModelOutput::first_image)
        })
        .await
    }

    pub async fn detect_subject(&self, image: &InputImage) -> Result<String, StickerError> {
        self.describe(OperationKind::DetectSubject, image, DETECT_SUBJECT_PROMPT)
            .await
    }

    pub async fn analyze_image(
        &self,
        image: &InputImage,
        prompt: &str,
    ) -> Result<String, StickerError> {
        self.describe(OperationKind::Analyze, image, prompt).await
    }

    /// Never fails: any rejection, transport error or blank secret is `false`.
    /// The stored key and the quota are left untouched.
    pub async fn validate_user_key(&self, secret: &str) -> bool {
        let secret = secret.trim();
        if secret.is_empty() {
            return false;
        }
        let credential = Credential::User(secret.to_string());
        match self.model.count_tokens(&credential, VALIDATION_PROMPT).await {
            Ok(()) => true,
            Err(err) => {
                info!(key = %credential.fingerprint(), error = %err, "user key rejected");
                false
            }
        }
    }

    async fn describe(
        &self,
        kind: OperationKind,
        image: &InputImage,
        prompt: &str,
    ) -> Result<String, StickerError> {
        let content = ContentRequest {
            image: Some(image.clone()),
            prompt: prompt.to_string(),
            system_instruction: None,
            modality: ResponseModality::Text,
        };
        let content = &content;
        self.execute(kind, "text", |credential| async move {
            self.model
                .generate_content(&credential, content)
                .await
                .map(|output| output.non_empty_text())
        })
        .await
    }

    /// Select, call with retries, classify, account. `call` returning
    /// `Ok(None)` is a successful but empty response.
    async fn execute<T, F, Fut>(
        &self,
        kind: OperationKind,
        payload: &'static str,
        call: F,
    ) -> Result<T, StickerError>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = Result<Option<T>, ServiceError>>,
    {
        let credential = self.select_credential()?;
        debug!(
            operation = kind.as_str(),
            credential = credential.kind().as_str(),
            model = self.model.name(),
            "executing model call"
        );

        let outcome = self
            .config
            .retry
            .run(kind.as_str(), |_| call(credential.clone()))
            .await;

        let value = match outcome {
            Ok(Some(value)) => value,
            Ok(None) => {
                warn!(operation = kind.as_str(), payload, "model returned an empty response");
                return Err(StickerError::GenerationEmpty(payload));
            }
            Err(err) if err.is_auth_failure() => return Err(self.reject_credential(&credential, err)),
            Err(err) => return Err(StickerError::Service(err)),
        };

        if credential.kind() == CredentialKind::Device && kind.consumes_quota() {
            let used = self.store.increment_quota().map_err(|err| {
                warn!(error = ?err, "quota increment failed; dropping result");
                StickerError::store(err)
            })?;
            debug!(used, limit = self.config.quota_limit, "device quota consumed");
        }
        Ok(value)
    }

    fn reject_credential(&self, credential: &Credential, err: ServiceError) -> StickerError {
        match credential.kind() {
            CredentialKind::User => {
                warn!(key = %credential.fingerprint(), error = %err, "user key rejected; clearing it");
                if let Err(clear_err) = self.store.clear_user_key() {
                    warn!(error = ?clear_err, "failed to clear rejected user key");
                }
                StickerError::CredentialInvalid
            }
            CredentialKind::Device => {
                warn!(error = %err, "device key rejected");
                StickerError::CredentialRequired
            }
        }
    }
}

/// Result of [`GenerationOrchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generated {
    Image(InputImage),
    Text(String),
}

fn require_image(request: &GenerationRequest) -> Result<&InputImage, StickerError> {
    request.image.as_ref().ok_or_else(|| {
        StickerError::InvalidRequest(format!("{} requires an image", request.kind.as_str()))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use sticker_contracts::credentials::{Credential, CredentialKind, CredentialStore, MemoryStore};
    use sticker_contracts::errors::{ServiceError, StickerError};
    use sticker_contracts::stickers::{GenerationRequest, InputImage};
    use tokio::time::Instant;

    use super::{EngineConfig, Generated, GenerationOrchestrator};
    use crate::model::{ContentRequest, GenerativeModel, ImageConfig, ModelOutput, ResponseModality};
    use crate::retry::RetryPolicy;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct Call {
        pub method: &'static str,
        pub credential: CredentialKind,
        pub prompt: String,
        pub system_instruction: Option<String>,
        pub with_image: bool,
    }

    /// Model with scripted failures that records every call.
    #[derive(Default)]
    pub(crate) struct ScriptedModel {
        failures: Mutex<VecDeque<ServiceError>>,
        calls: Mutex<Vec<Call>>,
        empty: bool,
    }

    impl ScriptedModel {
        pub fn failing(errors: impl IntoIterator<Item = ServiceError>) -> Self {
            Self {
                failures: Mutex::new(errors.into_iter().collect()),
                ..Self::default()
            }
        }

        pub fn empty() -> Self {
            Self {
                empty: true,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        fn record(&self, call: Call) -> Result<(), ServiceError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
            match self.failures.lock().ok().and_then(|mut queue| queue.pop_front()) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    pub(crate) fn sticker_png() -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut image = image::RgbaImage::from_pixel(8, 8, image::Rgba([0, 0, 0, 255]));
        image.put_pixel(4, 4, image::Rgba([250, 200, 10, 255]));
        let _ = image::DynamicImage::ImageRgba8(image)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png);
        bytes
    }

    #[async_trait]
    impl GenerativeModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate_image(
            &self,
            credential: &Credential,
            prompt: &str,
            _config: &ImageConfig,
        ) -> Result<Option<InputImage>, ServiceError> {
            self.record(Call {
                method: "generate_image",
                credential: credential.kind(),
                prompt: prompt.to_string(),
                system_instruction: None,
                with_image: false,
            })?;
            Ok((!self.empty).then(|| InputImage::new(sticker_png(), "image/png")))
        }

        async fn generate_content(
            &self,
            credential: &Credential,
            request: &ContentRequest,
        ) -> Result<ModelOutput, ServiceError> {
            self.record(Call {
                method: "generate_content",
                credential: credential.kind(),
                prompt: request.prompt.clone(),
                system_instruction: request.system_instruction.clone(),
                with_image: request.image.is_some(),
            })?;
            if self.empty {
                return Ok(ModelOutput::default());
            }
            Ok(match request.modality {
                ResponseModality::Image => ModelOutput {
                    images: vec![InputImage::new(sticker_png(), "image/png")],
                    text: String::new(),
                },
                ResponseModality::Text => ModelOutput {
                    images: Vec::new(),
                    text: "  a corgi \n".to_string(),
                },
            })
        }

        async fn count_tokens(&self, credential: &Credential, prompt: &str) -> Result<(), ServiceError> {
            self.record(Call {
                method: "count_tokens",
                credential: credential.kind(),
                prompt: prompt.to_string(),
                system_instruction: None,
                with_image: false,
            })
        }
    }

    fn device_config() -> EngineConfig {
        EngineConfig::default().with_device_key("device-secret")
    }

    fn orchestrator(
        model: ScriptedModel,
        store: MemoryStore,
    ) -> GenerationOrchestrator<ScriptedModel, MemoryStore> {
        GenerationOrchestrator::new(model, store, device_config())
    }

    fn transient(message: &str) -> ServiceError {
        ServiceError::new(Some(503), format!("Gemini request failed (503): {message}"))
    }

    #[tokio::test]
    async fn five_free_generations_then_credential_required_without_network() -> anyhow::Result<()> {
        let orch = orchestrator(ScriptedModel::default(), MemoryStore::new());
        for _ in 0..5 {
            orch.generate_sticker(&GenerationRequest::create("a cat")).await?;
        }
        assert_eq!(orch.store().quota_count()?, 5);
        assert_eq!(orch.model().calls().len(), 5);

        let err = orch.generate_sticker(&GenerationRequest::create("a cat")).await.err();
        assert!(matches!(err, Some(StickerError::CredentialRequired)), "{err:?}");
        assert_eq!(orch.model().calls().len(), 5);
        assert_eq!(orch.store().quota_count()?, 5);
        Ok(())
    }

    #[tokio::test]
    async fn user_key_bypasses_exhausted_quota() -> anyhow::Result<()> {
        let store = MemoryStore::with_quota(5);
        store.save_user_key("user-secret")?;
        let orch = orchestrator(ScriptedModel::default(), store);

        orch.generate_sticker(&GenerationRequest::create("a cat")).await?;
        orch.edit_sticker(&InputImage::new(vec![1], "image/png"), "add a hat").await?;

        let calls = orch.model().calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|call| call.credential == CredentialKind::User));
        assert_eq!(orch.store().quota_count()?, 5);
        Ok(())
    }

    #[tokio::test]
    async fn missing_device_key_requires_credential() -> anyhow::Result<()> {
        let orch = GenerationOrchestrator::new(
            ScriptedModel::default(),
            MemoryStore::new(),
            EngineConfig::default(),
        );
        let err = orch.generate_sticker(&GenerationRequest::create("a cat")).await.err();
        assert!(matches!(err, Some(StickerError::CredentialRequired)), "{err:?}");
        assert!(orch.model().calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn rejected_user_key_is_cleared() -> anyhow::Result<()> {
        let model = ScriptedModel::failing([ServiceError::new(
            Some(400),
            "Gemini request failed (400): API key not valid. Please pass a valid API key.",
        )]);
        let orch = orchestrator(model, MemoryStore::with_user_key("stale"));

        let err = orch.generate_sticker(&GenerationRequest::create("a cat")).await.err();
        assert!(matches!(err, Some(StickerError::CredentialInvalid)), "{err:?}");
        assert_eq!(orch.store().user_key()?, None);
        assert_eq!(orch.model().calls().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_device_key_requires_user_key() -> anyhow::Result<()> {
        let model = ScriptedModel::failing([ServiceError::new(
            Some(403),
            "Gemini request failed (403): PERMISSION_DENIED",
        )]);
        let orch = orchestrator(model, MemoryStore::new());

        let err = orch.generate_sticker(&GenerationRequest::create("a cat")).await.err();
        assert!(matches!(err, Some(StickerError::CredentialRequired)), "{err:?}");
        assert_eq!(orch.store().quota_count()?, 0);
        assert_eq!(orch.model().calls().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn detect_and_analyze_do_not_consume_quota() -> anyhow::Result<()> {
        let orch = orchestrator(ScriptedModel::default(), MemoryStore::with_quota(4));
        let photo = InputImage::new(vec![1, 2, 3], "image/jpeg");

        assert_eq!(orch.detect_subject(&photo).await?, "a corgi");
        assert_eq!(orch.analyze_image(&photo, "describe it").await?, "a corgi");
        assert_eq!(orch.store().quota_count()?, 4);

        orch.generate_sticker(&GenerationRequest::create("a cat")).await?;
        assert_eq!(orch.store().quota_count()?, 5);

        // Quota now exhausted: even non-consuming operations need a credential.
        let err = orch.detect_subject(&photo).await.err();
        assert!(matches!(err, Some(StickerError::CredentialRequired)), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn empty_response_is_generation_empty_and_not_counted() -> anyhow::Result<()> {
        let orch = orchestrator(ScriptedModel::empty(), MemoryStore::new());

        let err = orch.generate_sticker(&GenerationRequest::create("a cat")).await.err();
        assert!(matches!(err, Some(StickerError::GenerationEmpty("image"))), "{err:?}");

        let photo = InputImage::new(vec![1], "image/jpeg");
        let err = orch.detect_subject(&photo).await.err();
        assert!(matches!(err, Some(StickerError::GenerationEmpty("text"))), "{err:?}");
        assert_eq!(orch.store().quota_count()?, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_then_counted_once() -> anyhow::Result<()> {
        let model = ScriptedModel::failing([transient("first"), transient("second")]);
        let orch = orchestrator(model, MemoryStore::new());
        let started = Instant::now();

        orch.generate_sticker(&GenerationRequest::create("a cat")).await?;

        assert_eq!(orch.model().calls().len(), 3);
        assert_eq!(orch.store().quota_count()?, 1);
        assert!(started.elapsed() >= Duration::from_millis(3000));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_last_error_unchanged() -> anyhow::Result<()> {
        let model = ScriptedModel::failing([transient("one"), transient("two"), transient("three")]);
        let orch = orchestrator(model, MemoryStore::new());

        let err = orch.generate_sticker(&GenerationRequest::create("a cat")).await.err();
        match err {
            Some(StickerError::Service(err)) => {
                assert_eq!(err.message, "Gemini request failed (503): three");
            }
            other => anyhow::bail!("unexpected outcome: {other:?}"),
        }
        assert_eq!(orch.model().calls().len(), 3);
        assert_eq!(orch.store().quota_count()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn not_found_is_not_retried() -> anyhow::Result<()> {
        let model = ScriptedModel::failing([ServiceError::new(
            Some(404),
            "Gemini request failed (404): model not found",
        )]);
        let orch = GenerationOrchestrator::new(
            model,
            MemoryStore::new(),
            device_config().with_retry(RetryPolicy::default()),
        );
        let err = orch.generate_sticker(&GenerationRequest::create("a cat")).await.err();
        assert!(matches!(err, Some(StickerError::Service(_))), "{err:?}");
        assert_eq!(orch.model().calls().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn photo_generation_uses_image_to_image_with_system_instruction() -> anyhow::Result<()> {
        let orch = orchestrator(ScriptedModel::default(), MemoryStore::new());
        let request = GenerationRequest::create("")
            .with_image(Some(InputImage::new(vec![9], "image/jpeg")))
            .with_caption(Some("Hi".to_string()))
            .with_style(Some("pixel art".to_string()));

        orch.generate_sticker(&request).await?;

        let calls = orch.model().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "generate_content");
        assert!(calls[0].with_image);
        assert!(calls[0].system_instruction.is_some());
        assert!(calls[0].prompt.contains("pixel art"));
        assert!(calls[0].prompt.contains("\"Hi\""));
        Ok(())
    }

    #[tokio::test]
    async fn blank_prompt_without_photo_is_rejected_locally() {
        let orch = orchestrator(ScriptedModel::default(), MemoryStore::new());
        let err = orch.generate_sticker(&GenerationRequest::create("  ")).await.err();
        assert!(matches!(err, Some(StickerError::InvalidRequest(_))), "{err:?}");
        assert!(orch.model().calls().is_empty());
    }

    #[tokio::test]
    async fn run_dispatches_on_operation_kind() -> anyhow::Result<()> {
        let orch = orchestrator(ScriptedModel::default(), MemoryStore::new());
        let photo = InputImage::new(vec![1], "image/jpeg");

        let detected = orch.run(&GenerationRequest::detect_subject(photo.clone())).await?;
        assert_eq!(detected, Generated::Text("a corgi".to_string()));

        let edited = orch.run(&GenerationRequest::edit(photo, "add sunglasses")).await?;
        assert!(matches!(edited, Generated::Image(_)));

        let mut missing = GenerationRequest::analyze(InputImage::new(vec![1], "image/png"), "x");
        missing.image = None;
        let err = orch.run(&missing).await.err();
        assert!(matches!(err, Some(StickerError::InvalidRequest(_))), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn validate_user_key_never_errors_and_keeps_state() -> anyhow::Result<()> {
        let model = ScriptedModel::failing([ServiceError::new(
            Some(400),
            "Gemini request failed (400): API_KEY_INVALID",
        )]);
        let store = MemoryStore::with_user_key("kept");
        let orch = orchestrator(model, store);

        assert!(!orch.validate_user_key("   ").await);
        assert!(orch.model().calls().is_empty());

        assert!(!orch.validate_user_key("bad").await);
        assert!(orch.validate_user_key("good").await);
        assert_eq!(orch.model().calls().len(), 2);
        assert_eq!(orch.store().user_key()?.as_deref(), Some("kept"));
        assert_eq!(orch.store().quota_count()?, 0);
        Ok(())
    }

    /// Store that reads fine but refuses every quota write.
    #[derive(Default)]
    struct ReadOnlyQuotaStore {
        inner: MemoryStore,
    }

    impl CredentialStore for ReadOnlyQuotaStore {
        fn user_key(&self) -> anyhow::Result<Option<String>> {
            self.inner.user_key()
        }

        fn save_user_key(&self, secret: &str) -> anyhow::Result<()> {
            self.inner.save_user_key(secret)
        }

        fn clear_user_key(&self) -> anyhow::Result<()> {
            self.inner.clear_user_key()
        }

        fn quota_count(&self) -> anyhow::Result<u32> {
            self.inner.quota_count()
        }

        fn increment_quota(&self) -> anyhow::Result<u32> {
            anyhow::bail!("settings file is read-only")
        }
    }

    #[tokio::test]
    async fn failed_quota_increment_fails_the_device_call() -> anyhow::Result<()> {
        let orch = GenerationOrchestrator::new(
            ScriptedModel::default(),
            ReadOnlyQuotaStore::default(),
            device_config(),
        );

        let err = orch.generate_sticker(&GenerationRequest::create("a cat")).await.err();
        assert!(
            matches!(&err, Some(StickerError::Store(message)) if message.contains("read-only")),
            "{err:?}"
        );
        let err = orch
            .edit_sticker(&InputImage::new(vec![1], "image/png"), "add a hat")
            .await
            .err();
        assert!(matches!(err, Some(StickerError::Store(_))), "{err:?}");

        // Non-consuming calls never touch the counter.
        let photo = InputImage::new(vec![1], "image/jpeg");
        assert_eq!(orch.detect_subject(&photo).await?, "a corgi");

        orch.store().save_user_key("user-secret")?;
        orch.generate_sticker(&GenerationRequest::create("a cat")).await?;
        Ok(())
    }
}
