use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Keys owned by [`RunEvent`]; payload entries with these names are dropped.
pub const RESERVED_KEYS: [&str; 4] = ["type", "run_id", "seq", "ts"];

/// One line of a run's `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub run_id: String,
    /// Position within the run, starting at 0.
    pub seq: u64,
    pub ts: String,
    #[serde(flatten)]
    pub fields: EventPayload,
}

impl RunEvent {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Appends sticker pipeline events for one run. Clones share the sequence
/// counter and the file lock.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    run_id: String,
    next_seq: AtomicU64,
    append: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                run_id: run_id.into(),
                next_seq: AtomicU64::new(0),
                append: Mutex::new(()),
            }),
        }
    }

    pub fn for_new_run(path: impl Into<PathBuf>) -> Self {
        Self::new(path, uuid::Uuid::new_v4().to_string())
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn run_id(&self) -> &str {
        &self.shared.run_id
    }

    pub fn emit(&self, kind: &str, mut fields: EventPayload) -> anyhow::Result<RunEvent> {
        fields.retain(|key, _| !RESERVED_KEYS.contains(&key.as_str()));

        let _guard = self
            .shared
            .append
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let event = RunEvent {
            kind: kind.to_string(),
            run_id: self.shared.run_id.clone(),
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            fields,
        };

        let path = &self.shared.path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(&line))
            .with_context(|| format!("failed to append to {}", path.display()))?;
        Ok(event)
    }
}

/// Builds an event payload from key/value pairs.
pub fn payload<'a>(fields: impl IntoIterator<Item = (&'a str, Value)>) -> EventPayload {
    fields
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Parses every line of an events file, failing on the first malformed one.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<RunEvent>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("bad event on line {} of {}", index + 1, path.display()))
        })
        .collect()
}
