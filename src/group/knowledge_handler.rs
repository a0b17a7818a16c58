// ABOUTME: Processes knowledge protocol envelopes: validation, idempotent recording,
// ABOUTME: monotonic fact reconciliation, and timeline event emission.

use std::sync::Arc;

use chrono::Utc;

use crate::knowledge::{Envelope, FactPayload, TYPE_FACT};
use crate::timeline::{TimelineEvent, TimelineService};

/// Processing failure classes. The broker consumer treats parse/validation
/// failures as poison pills (log + skip) and storage failures as fatal so
/// offsets are not advanced past unrecorded envelopes.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("decode knowledge envelope: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid knowledge envelope: {0}")]
    Validation(String),
    #[error("knowledge storage failure: {0}")]
    Storage(anyhow::Error),
}

impl ProcessError {
    pub fn is_poison(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::Validation(_))
    }
}

/// Outcome of applying a fact payload against the latest known state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    Accepted,
    DuplicateOrStale,
    VersionGapConflict,
}

impl ApplyStatus {
    /// Uppercase tag used in timeline classifications.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::DuplicateOrStale => "DUPLICATE_OR_STALE",
            Self::VersionGapConflict => "VERSION_GAP_CONFLICT",
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Accepted => "applied",
            Self::DuplicateOrStale => "duplicate_or_stale",
            Self::VersionGapConflict => "version_gap_conflict",
        }
    }
}

/// Handles envelopes delivered from the knowledge plane.
pub struct KnowledgeHandler {
    timeline: Arc<TimelineService>,
    local_id: String,
}

impl KnowledgeHandler {
    pub fn new(timeline: Arc<TimelineService>, local_claw_id: &str) -> Self {
        Self {
            timeline,
            local_id: local_claw_id.trim().to_string(),
        }
    }

    /// Process one raw envelope from `topic`.
    ///
    /// Self-originated and already-seen envelopes are dropped silently; every
    /// other accepted envelope leaves exactly one idempotency row and one
    /// timeline event.
    pub fn process(&self, topic: &str, raw: &[u8]) -> Result<(), ProcessError> {
        let env: Envelope = serde_json::from_slice(raw)?;
        env.validate_base()
            .map_err(|e| ProcessError::Validation(e.to_string()))?;

        if !self.local_id.is_empty()
            && env.claw_id.trim().eq_ignore_ascii_case(&self.local_id)
        {
            tracing::debug!(topic = %topic, "Dropping self-originated knowledge envelope");
            return Ok(());
        }

        let inserted = self
            .timeline
            .record_knowledge_idempotency(
                &env.idempotency_key,
                &env.claw_id,
                &env.instance_id,
                &env.kind,
                topic,
                &env.trace_id,
            )
            .map_err(ProcessError::Storage)?;
        if !inserted {
            tracing::debug!(
                topic = %topic,
                idempotency_key = %env.idempotency_key,
                "Dropping duplicate knowledge envelope"
            );
            metrics::counter!("kafclaw_knowledge_duplicates_total").increment(1);
            return Ok(());
        }

        let mut status = ApplyStatus::Accepted;
        if env.kind == TYPE_FACT {
            let payload: FactPayload = serde_json::from_value(env.payload.clone())
                .map_err(|e| ProcessError::Validation(format!("invalid_payload: {e}")))?;
            payload
                .validate()
                .map_err(|e| ProcessError::Validation(format!("invalid_payload: {e}")))?;
            status = self.apply_fact(&payload)?;
        }

        let payload_text = env.payload.to_string();
        let classification =
            format!("KNOWLEDGE_{}_{}", env.kind.to_uppercase(), status.tag());
        let metadata = serde_json::json!({
            "topic": topic,
            "idempotencyKey": env.idempotency_key,
            "applyStatus": status.tag(),
            "applyReason": status.reason(),
        });
        self.timeline
            .add_event(&TimelineEvent {
                event_id: format!(
                    "KNOWLEDGE_{}_{}",
                    env.kind.to_uppercase(),
                    Utc::now().timestamp_nanos_opt().unwrap_or_default()
                ),
                trace_id: env.trace_id.clone(),
                timestamp: Utc::now(),
                sender_id: env.claw_id.clone(),
                sender_name: env.instance_id.clone(),
                event_type: "SYSTEM".to_string(),
                content_text: payload_text,
                classification,
                authorized: true,
                metadata: metadata.to_string(),
            })
            .map_err(ProcessError::Storage)?;

        metrics::counter!("kafclaw_knowledge_envelopes_total").increment(1);
        tracing::debug!(
            topic = %topic,
            kind = %env.kind,
            claw_id = %env.claw_id,
            status = status.tag(),
            "Knowledge envelope processed"
        );
        Ok(())
    }

    /// Version policy: accept v1 for unknown facts and exact +1 successors;
    /// stale/duplicate versions and gaps leave the latest row unchanged.
    fn apply_fact(&self, payload: &FactPayload) -> Result<ApplyStatus, ProcessError> {
        let current = self
            .timeline
            .get_knowledge_fact_latest(&payload.fact_id)
            .map_err(ProcessError::Storage)?;

        let status = match &current {
            None if payload.version == 1 => ApplyStatus::Accepted,
            None => ApplyStatus::VersionGapConflict,
            Some(cur) if payload.version == cur.version + 1 => ApplyStatus::Accepted,
            Some(cur) if payload.version <= cur.version => ApplyStatus::DuplicateOrStale,
            Some(_) => ApplyStatus::VersionGapConflict,
        };

        if status == ApplyStatus::Accepted {
            self.timeline
                .upsert_knowledge_fact_latest(payload)
                .map_err(ProcessError::Storage)?;
            // Keep the fact retrievable as memory.
            self.timeline
                .add_memory_chunk(
                    &format!(
                        "{} {} {}",
                        payload.subject, payload.predicate, payload.object
                    ),
                    None,
                    &format!("knowledge:fact:{}", payload.fact_id),
                )
                .map_err(ProcessError::Storage)?;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{CURRENT_SCHEMA_VERSION, TYPE_PROPOSAL, TYPE_VOTE};
    use tempfile::TempDir;

    fn new_handler(dir: &TempDir) -> (KnowledgeHandler, Arc<TimelineService>) {
        let timeline =
            Arc::new(TimelineService::new(dir.path().join("timeline.db")).unwrap());
        (
            KnowledgeHandler::new(Arc::clone(&timeline), "local-claw"),
            timeline,
        )
    }

    fn envelope_json(kind: &str, idem: &str, claw: &str, payload: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": CURRENT_SCHEMA_VERSION,
            "type": kind,
            "traceId": "trace-1",
            "timestamp": Utc::now().to_rfc3339(),
            "idempotencyKey": idem,
            "clawId": claw,
            "instanceId": "inst-1",
            "payload": payload,
        }))
        .unwrap()
    }

    fn fact_json(idem: &str, version: i64, object: &str) -> Vec<u8> {
        envelope_json(
            "fact",
            idem,
            "remote-claw",
            serde_json::json!({
                "factId": "fact-1",
                "group": "g1",
                "subject": "service",
                "predicate": "runbook",
                "object": object,
                "version": version,
                "source": "decision:d1",
            }),
        )
    }

    #[test]
    fn valid_envelope_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (handler, timeline) = new_handler(&dir);

        let raw = envelope_json(
            TYPE_PROPOSAL,
            "idem-1",
            "remote-claw",
            serde_json::json!({"proposalId": "p1", "statement": "Runbook v2"}),
        );
        handler.process("group.g.knowledge.proposals", &raw).unwrap();
        handler.process("group.g.knowledge.proposals", &raw).unwrap();

        let db = timeline.db_connection();
        let count: i64 = db
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM knowledge_idempotency WHERE idempotency_key = 'idem-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            timeline
                .count_events_with_classification("KNOWLEDGE_PROPOSAL_ACCEPTED")
                .unwrap(),
            1
        );
    }

    #[test]
    fn missing_identity_is_a_validation_error() {
        let dir = TempDir::new().unwrap();
        let (handler, _) = new_handler(&dir);
        let raw = envelope_json(
            TYPE_VOTE,
            "idem-2",
            "",
            serde_json::json!({"proposalId": "p1", "vote": "yes"}),
        );
        let err = handler
            .process("group.g.knowledge.votes", &raw)
            .unwrap_err();
        assert!(matches!(err, ProcessError::Validation(_)));
        assert!(err.is_poison());
    }

    #[test]
    fn garbage_bytes_are_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let (handler, _) = new_handler(&dir);
        let err = handler
            .process("group.g.knowledge.facts", b"{not json")
            .unwrap_err();
        assert!(matches!(err, ProcessError::Parse(_)));
        assert!(err.is_poison());
    }

    #[test]
    fn self_originated_envelopes_are_dropped() {
        let dir = TempDir::new().unwrap();
        let (handler, timeline) = new_handler(&dir);
        let raw = envelope_json(
            TYPE_PROPOSAL,
            "idem-3",
            "LOCAL-CLAW",
            serde_json::json!({"proposalId": "p9"}),
        );
        handler.process("group.g.knowledge.proposals", &raw).unwrap();
        assert_eq!(timeline.recent_events(10).unwrap().len(), 0);
    }

    #[test]
    fn fact_version_policy() {
        let dir = TempDir::new().unwrap();
        let (handler, timeline) = new_handler(&dir);
        let topic = "group.g1.knowledge.facts";

        handler.process(topic, &fact_json("idem-f1", 1, "v1")).unwrap();
        let cur = timeline.get_knowledge_fact_latest("fact-1").unwrap().unwrap();
        assert_eq!((cur.version, cur.object.as_str()), (1, "v1"));

        // A gap conflicts and leaves latest unchanged.
        handler.process(topic, &fact_json("idem-f2", 3, "v3")).unwrap();
        let cur = timeline.get_knowledge_fact_latest("fact-1").unwrap().unwrap();
        assert_eq!((cur.version, cur.object.as_str()), (1, "v1"));
        assert_eq!(
            timeline
                .count_events_with_classification("KNOWLEDGE_FACT_VERSION_GAP_CONFLICT")
                .unwrap(),
            1
        );

        // The in-order successor applies.
        handler.process(topic, &fact_json("idem-f3", 2, "v2")).unwrap();
        let cur = timeline.get_knowledge_fact_latest("fact-1").unwrap().unwrap();
        assert_eq!((cur.version, cur.object.as_str()), (2, "v2"));

        // Now the previously gapped version is the successor.
        handler.process(topic, &fact_json("idem-f4", 3, "v3")).unwrap();
        let cur = timeline.get_knowledge_fact_latest("fact-1").unwrap().unwrap();
        assert_eq!((cur.version, cur.object.as_str()), (3, "v3"));

        // Stale redelivery is recorded but does not rewind.
        handler.process(topic, &fact_json("idem-f5", 2, "old")).unwrap();
        let cur = timeline.get_knowledge_fact_latest("fact-1").unwrap().unwrap();
        assert_eq!((cur.version, cur.object.as_str()), (3, "v3"));
        assert_eq!(
            timeline
                .count_events_with_classification("KNOWLEDGE_FACT_DUPLICATE_OR_STALE")
                .unwrap(),
            1
        );
    }

    #[test]
    fn first_version_above_one_is_a_gap() {
        let dir = TempDir::new().unwrap();
        let (handler, timeline) = new_handler(&dir);
        handler
            .process("group.g1.knowledge.facts", &fact_json("idem-g1", 2, "v2"))
            .unwrap();
        assert!(timeline.get_knowledge_fact_latest("fact-1").unwrap().is_none());
    }

    #[test]
    fn invalid_fact_payload_fails() {
        let dir = TempDir::new().unwrap();
        let (handler, _) = new_handler(&dir);
        let raw = envelope_json(
            "fact",
            "idem-bad",
            "remote-claw",
            serde_json::json!({"factId": "f", "subject": "s", "predicate": "p", "object": "o", "version": 0}),
        );
        let err = handler
            .process("group.g1.knowledge.facts", &raw)
            .unwrap_err();
        assert!(matches!(err, ProcessError::Validation(_)));
    }
}
