// ABOUTME: Persistent conversation sessions keyed by scope, one JSON document per key.
// ABOUTME: Write-through cache over ~/.kafclaw/sessions with tolerant load/list behavior.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::paths;

const SESSION_FILE_EXT: &str = "jsonl";

/// A single conversation turn stored in a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Conversation state for one session scope.
///
/// Invariant: `updated_at >= created_at`; messages are kept in insertion
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<SessionMessage>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Append a turn and bump `updated_at`.
    pub fn add_message(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.messages.push(SessionMessage {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// The last `n` messages in chronological order.
    pub fn get_history(&self, n: usize) -> &[SessionMessage] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
        self.updated_at = Utc::now();
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn delete_metadata(&mut self, key: &str) {
        self.metadata.remove(key);
    }

    /// Drop all messages, keeping key and metadata.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.updated_at = Utc::now();
    }
}

/// Summary row returned by `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Session store: keyed cache in front of one JSON document per session.
///
/// `get_or_create` never writes; the first `save` materializes the file.
pub struct SessionManager {
    sessions_dir: PathBuf,
    cache: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    /// Create a manager rooted at `dir`, or at `<home>/.kafclaw/sessions`
    /// when `dir` is None. The directory is created eagerly on a best-effort
    /// basis; `save` surfaces the error if it still cannot be created.
    pub fn new(dir: Option<&Path>) -> Self {
        let sessions_dir = dir
            .map(Path::to_path_buf)
            .unwrap_or_else(paths::sessions_dir);
        if let Err(error) = std::fs::create_dir_all(&sessions_dir) {
            tracing::warn!(
                dir = %sessions_dir.display(),
                error = %error,
                "Could not create sessions directory"
            );
        }
        tracing::debug!(dir = %sessions_dir.display(), "Session manager initialized");
        Self {
            sessions_dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached session for `key`, loading it from disk on a cache
    /// miss, or minting a fresh empty session when no file exists.
    pub fn get_or_create(&self, key: &str) -> Session {
        let mut cache = self.cache.lock().unwrap();
        if let Some(session) = cache.get(key) {
            return session.clone();
        }
        let session = self.load(key);
        cache.insert(key.to_string(), session.clone());
        session
    }

    /// Read a session document from disk. Any failure (missing file, bad
    /// JSON) yields a fresh empty session for the key.
    fn load(&self, key: &str) -> Session {
        let path = self.file_path(key);
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Session>(&raw) {
                Ok(session) => session,
                Err(error) => {
                    tracing::warn!(
                        key = %key,
                        path = %path.display(),
                        error = %error,
                        "Malformed session file, starting fresh"
                    );
                    Session::new(key)
                }
            },
            Err(_) => Session::new(key),
        }
    }

    /// Persist a session and refresh the cache. Fails when the sessions
    /// directory cannot be created or the document cannot be written.
    pub fn save(&self, session: &Session) -> Result<()> {
        std::fs::create_dir_all(&self.sessions_dir).with_context(|| {
            format!(
                "Failed to create sessions directory: {}",
                self.sessions_dir.display()
            )
        })?;
        let path = self.file_path(&session.key);
        let doc = serde_json::to_string(session).context("Failed to encode session")?;
        std::fs::write(&path, doc)
            .with_context(|| format!("Failed to write session file: {}", path.display()))?;
        self.cache
            .lock()
            .unwrap()
            .insert(session.key.clone(), session.clone());
        tracing::debug!(key = %session.key, messages = session.messages.len(), "Session saved");
        Ok(())
    }

    /// Enumerate persisted sessions. Non-session files are skipped; a
    /// malformed document is reported as an empty session keyed by the file
    /// stem. A missing/unreadable directory yields an empty list.
    pub fn list(&self) -> Vec<SessionInfo> {
        let entries = match std::fs::read_dir(&self.sessions_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SESSION_FILE_EXT) {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let session = std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<Session>(&raw).ok())
                .unwrap_or_else(|| Session::new(stem));
            out.push(SessionInfo {
                key: session.key.clone(),
                created_at: session.created_at,
                updated_at: session.updated_at,
                message_count: session.messages.len(),
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Delete a session from cache and disk. Returns true only when the file
    /// existed (first deletion).
    pub fn delete(&self, key: &str) -> bool {
        self.cache.lock().unwrap().remove(key);
        std::fs::remove_file(self.file_path(key)).is_ok()
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.{SESSION_FILE_EXT}", sanitize_key(key)))
    }
}

/// Map a session key to a filesystem-safe file stem.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
