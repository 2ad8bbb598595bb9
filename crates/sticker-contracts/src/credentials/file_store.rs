use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::CredentialStore;

/// On-disk settings document shared by every process of one installation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct StoreDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_key: Option<String>,
    #[serde(default)]
    quota: BTreeMap<String, u32>,
}

/// JSON-file backed [`CredentialStore`].
///
/// Every operation re-reads the file so separate store instances, in this
/// process or another one, observe each other's writes. Read-modify-write runs
/// under an exclusive advisory lock on a sibling `<file>.lock`, and the document
/// is replaced atomically by renaming a temp file over it.
///
/// A missing file reads as empty settings. A file that exists but cannot be
/// read or parsed is an error and is never overwritten.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("settings"));
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn device_id(&self) -> anyhow::Result<String> {
        self.update(ensure_device_id)
    }

    fn read(&self) -> anyhow::Result<StoreDocument> {
        read_document(&self.path)
    }

    fn update<T>(&self, apply: impl FnOnce(&mut StoreDocument) -> T) -> anyhow::Result<T> {
        let _lock = self.acquire()?;
        let mut document = read_document(&self.path)?;
        let snapshot = document.clone();
        let out = apply(&mut document);
        if document != snapshot {
            write_document(&self.path, &document)?;
        }
        Ok(out)
    }

    /// Released when the returned handle is dropped.
    fn acquire(&self) -> anyhow::Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("failed to open {}", self.lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", self.lock_path.display()))?;
        Ok(file)
    }
}

impl CredentialStore for JsonFileStore {
    fn user_key(&self) -> anyhow::Result<Option<String>> {
        Ok(self
            .read()?
            .user_key
            .filter(|value| !value.trim().is_empty()))
    }

    fn save_user_key(&self, secret: &str) -> anyhow::Result<()> {
        self.update(|document| document.user_key = Some(secret.trim().to_string()))
    }

    fn clear_user_key(&self) -> anyhow::Result<()> {
        self.update(|document| document.user_key = None)
    }

    fn quota_count(&self) -> anyhow::Result<u32> {
        let document = self.read()?;
        let Some(device_id) = document.device_id.as_deref() else {
            return Ok(0);
        };
        Ok(document.quota.get(device_id).copied().unwrap_or(0))
    }

    fn increment_quota(&self) -> anyhow::Result<u32> {
        self.update(|document| {
            let device_id = ensure_device_id(document);
            let count = document.quota.entry(device_id).or_insert(0);
            *count = count.saturating_add(1);
            *count
        })
    }
}

fn ensure_device_id(document: &mut StoreDocument) -> String {
    if let Some(existing) = document
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return existing.to_string();
    }
    let generated = uuid::Uuid::new_v4().to_string();
    document.device_id = Some(generated.clone());
    generated
}

fn read_document(path: &Path) -> anyhow::Result<StoreDocument> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(StoreDocument::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    serde_json::from_str(&raw).with_context(|| format!("corrupt settings file {}", path.display()))
}

fn write_document(path: &Path, document: &StoreDocument) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage settings in {}", parent.display()))?;
    temp.write_all(serde_json::to_string_pretty(document)?.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::JsonFileStore;
    use crate::credentials::CredentialStore;

    #[test]
    fn missing_file_reads_as_empty_settings() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = JsonFileStore::new(temp.path().join("state.json"));
        assert_eq!(store.user_key()?, None);
        assert_eq!(store.quota_count()?, 0);
        assert!(!store.path().exists());
        Ok(())
    }

    #[test]
    fn user_key_persists_across_instances() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("state.json");
        JsonFileStore::new(&path).save_user_key("  AIza-user  ")?;

        let reloaded = JsonFileStore::new(&path);
        assert_eq!(reloaded.user_key()?.as_deref(), Some("AIza-user"));
        reloaded.clear_user_key()?;
        assert_eq!(JsonFileStore::new(&path).user_key()?, None);
        Ok(())
    }

    #[test]
    fn quota_is_scoped_to_device_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("state.json");
        let store = JsonFileStore::new(&path);
        assert_eq!(store.increment_quota()?, 1);
        assert_eq!(store.increment_quota()?, 2);
        let device_id = store.device_id()?;

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(raw["device_id"], Value::String(device_id.clone()));
        assert_eq!(raw["quota"][device_id.as_str()], Value::from(2));

        std::fs::write(
            &path,
            r#"{"device_id":"other-device","quota":{"old-device":4}}"#,
        )?;
        assert_eq!(store.quota_count()?, 0);
        assert_eq!(store.increment_quota()?, 1);
        Ok(())
    }

    #[test]
    fn writers_on_same_path_merge_their_changes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("state.json");
        let store_a = JsonFileStore::new(&path);
        let store_b = JsonFileStore::new(&path);

        store_a.increment_quota()?;
        store_b.save_user_key("k")?;
        store_a.increment_quota()?;

        let reloaded = JsonFileStore::new(&path);
        assert_eq!(reloaded.quota_count()?, 2);
        assert_eq!(reloaded.user_key()?.as_deref(), Some("k"));
        Ok(())
    }

    #[test]
    fn truncated_file_is_an_error_and_is_left_untouched() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("state.json");
        let store = JsonFileStore::new(&path);
        for _ in 0..5 {
            store.increment_quota()?;
        }
        store.save_user_key("AIza-user")?;

        let full = std::fs::read(&path)?;
        std::fs::write(&path, &full[..full.len() / 2])?;

        assert!(store.quota_count().is_err());
        assert!(store.user_key().is_err());
        assert!(store.increment_quota().is_err());
        assert!(store.save_user_key("other").is_err());
        assert_eq!(std::fs::read(&path)?, &full[..full.len() / 2]);

        std::fs::write(&path, &full)?;
        assert_eq!(store.quota_count()?, 5);
        assert_eq!(store.user_key()?.as_deref(), Some("AIza-user"));
        Ok(())
    }

    #[test]
    fn separate_instances_do_not_lose_increments() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("state.json");
        JsonFileStore::new(&path).increment_quota()?;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || -> anyhow::Result<()> {
                    let store = JsonFileStore::new(path);
                    for _ in 0..50 {
                        store.increment_quota()?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker panicked"))??;
        }

        assert_eq!(JsonFileStore::new(&path).quota_count()?, 201);
        Ok(())
    }
}
