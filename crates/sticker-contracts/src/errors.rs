use thiserror::Error;

/// Substrings that mark a failure as a rejected credential.
pub const AUTH_FAILURE_MARKERS: [&str; 4] = ["API key", "403", "PERMISSION_DENIED", "API_KEY_INVALID"];

/// Substrings that mark a failure as a client-side condition not worth retrying.
pub const NON_RETRYABLE_MARKERS: [&str; 5] = ["400", "403", "404", "not found", "API key"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The credential was rejected by the service.
    Authentication,
    /// Structurally invalid request; never retried.
    Client,
    /// Network or service hiccup; retried with backoff.
    Transient,
}

/// Failure reported by the generative model service or its transport.
///
/// Classification works on the rendered message; `status` carries the HTTP
/// status when one was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ServiceError {
    pub status: Option<u16>,
    pub message: String,
}

impl ServiceError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    pub fn is_auth_failure(&self) -> bool {
        is_auth_failure_message(&self.message)
    }

    pub fn is_retryable(&self) -> bool {
        !is_non_retryable_message(&self.message)
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_auth_failure() {
            ErrorClass::Authentication
        } else if !self.is_retryable() {
            ErrorClass::Client
        } else {
            ErrorClass::Transient
        }
    }
}

pub fn is_auth_failure_message(message: &str) -> bool {
    AUTH_FAILURE_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

pub fn is_non_retryable_message(message: &str) -> bool {
    NON_RETRYABLE_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

#[derive(Debug, Error)]
pub enum StickerError {
    #[error("image could not be decoded: {0}")]
    Decode(String),

    #[error("image encoder produced no output: {0}")]
    Encode(String),

    #[error("an API key is required: free generations are used up or not configured")]
    CredentialRequired,

    #[error("the saved API key was rejected by the service and has been cleared")]
    CredentialInvalid,

    #[error("model returned no usable {0}")]
    GenerationEmpty(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("settings store failed: {0}")]
    Store(String),

    #[error("image worker failed: {0}")]
    Worker(String),
}

impl StickerError {
    /// Errors that should send the caller back to credential entry.
    pub fn needs_credential(&self) -> bool {
        matches!(self, Self::CredentialRequired | Self::CredentialInvalid)
    }

    pub fn store(err: anyhow::Error) -> Self {
        Self::Store(format!("{err:#}"))
    }
}
