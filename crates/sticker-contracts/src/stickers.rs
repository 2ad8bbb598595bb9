use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Edit,
    DetectSubject,
    Analyze,
}

impl OperationKind {
    /// Only image-producing operations draw from the device quota.
    pub fn consumes_quota(self) -> bool {
        matches!(self, Self::Create | Self::Edit)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::DetectSubject => "detect_subject",
            Self::Analyze => "analyze",
        }
    }
}

/// Encoded image bytes with their mime type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl InputImage {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub kind: OperationKind,
    pub image: Option<InputImage>,
    pub prompt: String,
    pub caption: Option<String>,
    pub style: Option<String>,
}

impl GenerationRequest {
    pub fn create(prompt: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Create,
            image: None,
            prompt: prompt.into(),
            caption: None,
            style: None,
        }
    }

    pub fn edit(current: InputImage, instruction: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Edit,
            image: Some(current),
            prompt: instruction.into(),
            caption: None,
            style: None,
        }
    }

    pub fn detect_subject(image: InputImage) -> Self {
        Self {
            kind: OperationKind::DetectSubject,
            image: Some(image),
            prompt: String::new(),
            caption: None,
            style: None,
        }
    }

    pub fn analyze(image: InputImage, prompt: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Analyze,
            image: Some(image),
            prompt: prompt.into(),
            caption: None,
            style: None,
        }
    }

    pub fn with_image(mut self, image: Option<InputImage>) -> Self {
        self.image = image;
        self
    }

    pub fn with_caption(mut self, caption: Option<String>) -> Self {
        self.caption = caption
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }

    pub fn with_style(mut self, style: Option<String>) -> Self {
        self.style = style;
        self
    }
}

/// Finished, background-free sticker handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct StickerArtifact {
    pub id: String,
    pub image: Vec<u8>,
    pub mime_type: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

impl StickerArtifact {
    pub fn new(image: Vec<u8>, mime_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            image,
            mime_type: mime_type.into(),
            prompt: prompt.into(),
            created_at: Utc::now(),
        }
    }

    pub fn created_at_iso(&self) -> String {
        self.created_at
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Size-constrained encoding produced for sharing.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportBlob {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Encoder quality in `0.0..=1.0` that produced `bytes`.
    pub quality: f32,
}

impl ExportBlob {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{GenerationRequest, InputImage, OperationKind, StickerArtifact};

    #[test]
    fn only_create_and_edit_consume_quota() {
        assert!(OperationKind::Create.consumes_quota());
        assert!(OperationKind::Edit.consumes_quota());
        assert!(!OperationKind::DetectSubject.consumes_quota());
        assert!(!OperationKind::Analyze.consumes_quota());
    }

    #[test]
    fn blank_caption_is_dropped() {
        let request = GenerationRequest::create("cat").with_caption(Some("   ".to_string()));
        assert_eq!(request.caption, None);
        let request = GenerationRequest::create("cat").with_caption(Some(" hi! ".to_string()));
        assert_eq!(request.caption.as_deref(), Some("hi!"));
    }

    #[test]
    fn edit_request_carries_current_image() {
        let image = InputImage::new(vec![1, 2, 3], "image/png");
        let request = GenerationRequest::edit(image.clone(), "add a hat");
        assert_eq!(request.kind, OperationKind::Edit);
        assert_eq!(request.image, Some(image));
        assert_eq!(request.prompt, "add a hat");
    }

    #[test]
    fn artifacts_get_unique_ids() {
        let first = StickerArtifact::new(vec![0], "image/png", "cat");
        let second = StickerArtifact::new(vec![0], "image/png", "cat");
        assert_ne!(first.id, second.id);
        assert!(first.created_at_iso().ends_with('Z'));
    }
}
