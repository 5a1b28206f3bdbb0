use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Lifecycle events recorded for the server and its sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerStarted,
    SessionStarted,
    ImageStored,
    ImageRejected,
    QuestionRejected,
    GenerationStarted,
    GenerationFinished,
    GenerationCancelled,
    SessionClosed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerStarted => "server_started",
            Self::SessionStarted => "session_started",
            Self::ImageStored => "image_stored",
            Self::ImageRejected => "image_rejected",
            Self::QuestionRejected => "question_rejected",
            Self::GenerationStarted => "generation_started",
            Self::GenerationFinished => "generation_finished",
            Self::GenerationCancelled => "generation_cancelled",
            Self::SessionClosed => "session_closed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared JSONL sink for session lifecycle events. Every line carries `type`,
/// `server_id`, `ts` and, for session events, `session_id`; payload fields
/// cannot overwrite those. Clones append to the same open file.
#[derive(Debug, Clone)]
pub struct EventWriter {
    path: Arc<PathBuf>,
    server_id: Arc<str>,
    file: Arc<Mutex<File>>,
}

impl EventWriter {
    /// Opens `path` for appending, creating missing parent directories.
    pub fn create(path: impl Into<PathBuf>, server_id: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create event directory {}", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        Ok(Self {
            path: Arc::new(path),
            server_id: Arc::from(server_id.into()),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn emit(&self, kind: EventKind, payload: EventPayload) -> Result<Value> {
        self.append(kind, None, payload)
    }

    pub fn emit_for_session(
        &self,
        kind: EventKind,
        session_id: &str,
        payload: EventPayload,
    ) -> Result<Value> {
        self.append(kind, Some(session_id), payload)
    }

    fn append(
        &self,
        kind: EventKind,
        session_id: Option<&str>,
        payload: EventPayload,
    ) -> Result<Value> {
        let mut event = payload;
        event.insert("type".to_string(), Value::from(kind.as_str()));
        event.insert("server_id".to_string(), Value::from(&*self.server_id));
        if let Some(session_id) = session_id {
            event.insert("session_id".to_string(), Value::from(session_id));
        }
        event.insert("ts".to_string(), Value::from(now_utc_iso()));

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
