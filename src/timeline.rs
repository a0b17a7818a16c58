// ABOUTME: SQLite-backed timeline service: event log, knowledge idempotency/fact state,
// ABOUTME: memory chunks, and the settings key-value store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::channels::pairing::SettingStore;
use crate::knowledge::FactPayload;

/// One row of the timeline event log.
#[derive(Debug, Clone, Default)]
pub struct TimelineEvent {
    pub event_id: String,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub sender_id: String,
    pub sender_name: String,
    pub event_type: String,
    pub content_text: String,
    pub classification: String,
    pub authorized: bool,
    /// JSON object with event-specific fields.
    pub metadata: String,
}

/// Latest known state for a replicated fact.
#[derive(Debug, Clone, PartialEq)]
pub struct FactState {
    pub fact_id: String,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub version: i64,
}

/// Single source of truth for knowledge replication and pairing state.
#[derive(Clone)]
pub struct TimelineService {
    db: Arc<Mutex<Connection>>,
}

impl TimelineService {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create timeline database directory")?;
            }
        }
        let conn = Connection::open(path).context("Failed to open timeline database")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS timeline (
                event_id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                sender_name TEXT NOT NULL,
                event_type TEXT NOT NULL,
                content_text TEXT NOT NULL,
                classification TEXT NOT NULL,
                authorized INTEGER NOT NULL DEFAULT 0,
                metadata_json TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS knowledge_idempotency (
                idempotency_key TEXT PRIMARY KEY,
                claw_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                type TEXT NOT NULL,
                topic TEXT NOT NULL,
                trace_id TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS knowledge_fact_latest (
                fact_id TEXT PRIMARY KEY,
                \"group\" TEXT NOT NULL DEFAULT '',
                subject TEXT NOT NULL,
                predicate TEXT NOT NULL,
                object TEXT NOT NULL,
                version INTEGER NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                proposal_id TEXT NOT NULL DEFAULT '',
                decision_id TEXT NOT NULL DEFAULT '',
                tags_json TEXT NOT NULL DEFAULT '[]'
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS memory_chunks (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                embedding BLOB,
                source TEXT NOT NULL DEFAULT ''
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        tracing::info!(db = %path.display(), "Timeline service initialized");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Get the shared database connection (for diagnostics and tests).
    pub fn db_connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    pub fn add_event(&self, event: &TimelineEvent) -> Result<()> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        db.execute(
            "INSERT INTO timeline (event_id, trace_id, timestamp, sender_id, sender_name,
                                   event_type, content_text, classification, authorized, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &event.event_id,
                &event.trace_id,
                event.timestamp.to_rfc3339(),
                &event.sender_id,
                &event.sender_name,
                &event.event_type,
                &event.content_text,
                &event.classification,
                if event.authorized { 1 } else { 0 },
                if event.metadata.is_empty() {
                    "{}"
                } else {
                    &event.metadata
                },
            ],
        )?;
        Ok(())
    }

    /// Most recent events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<TimelineEvent>> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare(
            "SELECT event_id, trace_id, timestamp, sender_id, sender_name,
                    event_type, content_text, classification, authorized, metadata_json
             FROM timeline ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit as i64], |row| {
                let raw_ts: String = row.get(2)?;
                Ok(TimelineEvent {
                    event_id: row.get(0)?,
                    trace_id: row.get(1)?,
                    timestamp: DateTime::parse_from_rfc3339(&raw_ts)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_default(),
                    sender_id: row.get(3)?,
                    sender_name: row.get(4)?,
                    event_type: row.get(5)?,
                    content_text: row.get(6)?,
                    classification: row.get(7)?,
                    authorized: row.get::<_, i64>(8)? != 0,
                    metadata: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Count of events carrying the given classification (tests/diagnostics).
    pub fn count_events_with_classification(&self, classification: &str) -> Result<i64> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let count = db.query_row(
            "SELECT COUNT(*) FROM timeline WHERE classification = ?1",
            params![classification],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Record an envelope's idempotency key. Returns true when the key was
    /// newly inserted, false when a row already existed.
    pub fn record_knowledge_idempotency(
        &self,
        idempotency_key: &str,
        claw_id: &str,
        instance_id: &str,
        envelope_type: &str,
        topic: &str,
        trace_id: &str,
    ) -> Result<bool> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let inserted = db.execute(
            "INSERT OR IGNORE INTO knowledge_idempotency
                 (idempotency_key, claw_id, instance_id, type, topic, trace_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                idempotency_key,
                claw_id,
                instance_id,
                envelope_type,
                topic,
                trace_id
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_knowledge_fact_latest(&self, fact_id: &str) -> Result<Option<FactState>> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare(
            "SELECT fact_id, subject, predicate, object, version
             FROM knowledge_fact_latest WHERE fact_id = ?1",
        )?;
        let state = stmt.query_row(params![fact_id], |row| {
            Ok(FactState {
                fact_id: row.get(0)?,
                subject: row.get(1)?,
                predicate: row.get(2)?,
                object: row.get(3)?,
                version: row.get(4)?,
            })
        });
        match state {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically set the latest row for a fact.
    pub fn upsert_knowledge_fact_latest(&self, payload: &FactPayload) -> Result<()> {
        let tags_json = serde_json::to_string(&payload.tags).context("Failed to encode tags")?;
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        db.execute(
            "INSERT INTO knowledge_fact_latest
                 (fact_id, \"group\", subject, predicate, object, version,
                  source, proposal_id, decision_id, tags_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(fact_id) DO UPDATE SET
                 \"group\" = ?2, subject = ?3, predicate = ?4, object = ?5,
                 version = ?6, source = ?7, proposal_id = ?8, decision_id = ?9,
                 tags_json = ?10",
            params![
                &payload.fact_id,
                &payload.group,
                &payload.subject,
                &payload.predicate,
                &payload.object,
                payload.version,
                &payload.source,
                &payload.proposal_id,
                &payload.decision_id,
                tags_json,
            ],
        )?;
        Ok(())
    }

    /// Store a retrievable memory chunk. Embedding may be absent.
    pub fn add_memory_chunk(
        &self,
        content: &str,
        embedding: Option<&[u8]>,
        source: &str,
    ) -> Result<()> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        db.execute(
            "INSERT INTO memory_chunks (id, content, embedding, source) VALUES (?1, ?2, ?3, ?4)",
            params![uuid::Uuid::new_v4().to_string(), content, embedding, source],
        )?;
        Ok(())
    }

    /// Get a setting value by key.
    pub fn get_setting_value(&self, key: &str) -> Result<Option<String>> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare("SELECT value FROM settings WHERE key = ?1")?;
        let value = stmt.query_row(params![key], |row| row.get::<_, String>(0));
        match value {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value (upserts).
    pub fn set_setting_value(&self, key: &str, value: &str) -> Result<()> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        db.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }
}

impl SettingStore for TimelineService {
    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.get_setting_value(key)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.set_setting_value(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_timeline(dir: &TempDir) -> TimelineService {
        TimelineService::new(dir.path().join("timeline.db")).unwrap()
    }

    #[test]
    fn settings_roundtrip() {
        let dir = TempDir::new().unwrap();
        let tl = new_timeline(&dir);
        assert!(tl.get_setting_value("missing").unwrap().is_none());
        tl.set_setting_value("k", "v1").unwrap();
        tl.set_setting_value("k", "v2").unwrap();
        assert_eq!(tl.get_setting_value("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn idempotency_insert_is_once() {
        let dir = TempDir::new().unwrap();
        let tl = new_timeline(&dir);
        assert!(tl
            .record_knowledge_idempotency("idem-1", "claw", "inst", "fact", "t", "tr")
            .unwrap());
        assert!(!tl
            .record_knowledge_idempotency("idem-1", "claw", "inst", "fact", "t", "tr")
            .unwrap());
    }

    #[test]
    fn fact_latest_upsert_and_get() {
        let dir = TempDir::new().unwrap();
        let tl = new_timeline(&dir);
        assert!(tl.get_knowledge_fact_latest("f1").unwrap().is_none());

        let payload = FactPayload {
            fact_id: "f1".into(),
            group: "g1".into(),
            subject: "service".into(),
            predicate: "runbook".into(),
            object: "v1".into(),
            version: 1,
            source: "decision:d1".into(),
            proposal_id: String::new(),
            decision_id: String::new(),
            tags: vec!["ops".into()],
        };
        tl.upsert_knowledge_fact_latest(&payload).unwrap();
        let state = tl.get_knowledge_fact_latest("f1").unwrap().unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.object, "v1");

        let mut next = payload.clone();
        next.version = 2;
        next.object = "v2".into();
        tl.upsert_knowledge_fact_latest(&next).unwrap();
        let state = tl.get_knowledge_fact_latest("f1").unwrap().unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.object, "v2");
    }

    #[test]
    fn events_are_recorded_and_listed() {
        let dir = TempDir::new().unwrap();
        let tl = new_timeline(&dir);
        tl.add_event(&TimelineEvent {
            event_id: "e1".into(),
            trace_id: "tr".into(),
            timestamp: Utc::now(),
            sender_id: "s".into(),
            sender_name: "n".into(),
            event_type: "SYSTEM".into(),
            content_text: "hello".into(),
            classification: "KNOWLEDGE_FACT_ACCEPTED".into(),
            authorized: true,
            metadata: r#"{"topic":"t"}"#.into(),
        })
        .unwrap();

        let events = tl.recent_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].classification, "KNOWLEDGE_FACT_ACCEPTED");
        assert!(events[0].authorized);
        assert_eq!(
            tl.count_events_with_classification("KNOWLEDGE_FACT_ACCEPTED")
                .unwrap(),
            1
        );
    }
}
