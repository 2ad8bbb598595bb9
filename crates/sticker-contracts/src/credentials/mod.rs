mod file_store;

use std::fmt;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

pub use file_store::JsonFileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Operator-provided key shared by every installation, capped by quota.
    Device,
    /// Key supplied by the end user; bypasses the quota.
    User,
}

impl CredentialKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::User => "user",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Device(String),
    User(String),
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::Device(_) => CredentialKind::Device,
            Self::User(_) => CredentialKind::User,
        }
    }

    pub fn secret(&self) -> &str {
        match self {
            Self::Device(secret) | Self::User(secret) => secret.as_str(),
        }
    }

    /// Short stable digest of the secret, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.secret().as_bytes());
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential::{}({})", self.kind().as_str(), self.fingerprint())
    }
}

/// Settings collaborator holding the user key and the device quota counter.
///
/// `increment_quota` is the only write that races between concurrent pipeline
/// runs; implementations must make it atomic with respect to their own storage.
pub trait CredentialStore: Send + Sync {
    fn user_key(&self) -> anyhow::Result<Option<String>>;
    fn save_user_key(&self, secret: &str) -> anyhow::Result<()>;
    fn clear_user_key(&self) -> anyhow::Result<()>;
    fn quota_count(&self) -> anyhow::Result<u32>;
    /// Returns the counter value after the increment.
    fn increment_quota(&self) -> anyhow::Result<u32>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default, Clone)]
struct MemoryState {
    user_key: Option<String>,
    quota: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_key(secret: impl Into<String>) -> Self {
        let store = Self::default();
        if let Ok(mut state) = store.state.lock() {
            state.user_key = Some(secret.into());
        }
        store
    }

    pub fn with_quota(count: u32) -> Self {
        let store = Self::default();
        if let Ok(mut state) = store.state.lock() {
            state.quota = count;
        }
        store
    }

    fn with_state<T>(&self, apply: impl FnOnce(&mut MemoryState) -> T) -> anyhow::Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(apply(&mut state))
    }
}

impl CredentialStore for MemoryStore {
    fn user_key(&self) -> anyhow::Result<Option<String>> {
        self.with_state(|state| state.user_key.clone())
    }

    fn save_user_key(&self, secret: &str) -> anyhow::Result<()> {
        self.with_state(|state| state.user_key = Some(secret.to_string()))
    }

    fn clear_user_key(&self) -> anyhow::Result<()> {
        self.with_state(|state| state.user_key = None)
    }

    fn quota_count(&self) -> anyhow::Result<u32> {
        self.with_state(|state| state.quota)
    }

    fn increment_quota(&self) -> anyhow::Result<u32> {
        self.with_state(|state| {
            state.quota = state.quota.saturating_add(1);
            state.quota
        })
    }
}
