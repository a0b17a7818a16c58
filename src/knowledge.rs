// ABOUTME: Wire types for the knowledge replication protocol.
// ABOUTME: Envelope (origin/trace/idempotency wrapper) and FactPayload with validation.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub const TYPE_PROPOSAL: &str = "proposal";
pub const TYPE_VOTE: &str = "vote";
pub const TYPE_FACT: &str = "fact";

/// Self-describing wrapper around a knowledge payload.
///
/// Carries the origin node (`claw_id`), origin process (`instance_id`) and the
/// idempotency key that makes redelivery safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub schema_version: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: String,
    pub claw_id: String,
    pub instance_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Validate the identity fields every envelope must carry.
    pub fn validate_base(&self) -> Result<()> {
        if self.claw_id.trim().is_empty() {
            bail!("envelope clawId is required");
        }
        if self.instance_id.trim().is_empty() {
            bail!("envelope instanceId is required");
        }
        if self.idempotency_key.trim().is_empty() {
            bail!("envelope idempotencyKey is required");
        }
        Ok(())
    }
}

/// A replicated (subject, predicate, object) triple with a monotonically
/// increasing version. Immutable once emitted; the network may deliver
/// versions out of order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FactPayload {
    pub fact_id: String,
    #[serde(default)]
    pub group: String,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub version: i64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub proposal_id: String,
    #[serde(default)]
    pub decision_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl FactPayload {
    pub fn validate(&self) -> Result<()> {
        if self.fact_id.trim().is_empty() {
            bail!("fact payload factId is required");
        }
        if self.subject.trim().is_empty()
            || self.predicate.trim().is_empty()
            || self.object.trim().is_empty()
        {
            bail!("fact payload subject/predicate/object are required");
        }
        if self.version < 1 {
            bail!("fact payload version must be >= 1, got {}", self.version);
        }
        Ok(())
    }
}

/// Topic convention: `group.<group>.knowledge.<plural-type>`.
pub fn knowledge_topic(group: &str, kind: &str) -> String {
    format!("group.{group}.knowledge.{kind}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            schema_version: CURRENT_SCHEMA_VERSION,
            kind: TYPE_FACT.into(),
            trace_id: "trace-1".into(),
            timestamp: Utc::now(),
            idempotency_key: "idem-1".into(),
            claw_id: "claw-1".into(),
            instance_id: "inst-1".into(),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn base_validation_requires_identity_fields() {
        assert!(envelope().validate_base().is_ok());

        let mut missing_claw = envelope();
        missing_claw.claw_id = "  ".into();
        assert!(missing_claw.validate_base().is_err());

        let mut missing_instance = envelope();
        missing_instance.instance_id = String::new();
        assert!(missing_instance.validate_base().is_err());

        let mut missing_idem = envelope();
        missing_idem.idempotency_key = String::new();
        assert!(missing_idem.validate_base().is_err());
    }

    #[test]
    fn envelope_uses_camel_case_wire_format() {
        let raw = serde_json::to_value(envelope()).unwrap();
        assert!(raw.get("schemaVersion").is_some());
        assert!(raw.get("idempotencyKey").is_some());
        assert!(raw.get("clawId").is_some());
        assert!(raw.get("instanceId").is_some());
        assert_eq!(raw.get("type").and_then(|v| v.as_str()), Some("fact"));
    }

    #[test]
    fn fact_payload_validation() {
        let payload = FactPayload {
            fact_id: "f1".into(),
            subject: "service".into(),
            predicate: "runbook".into(),
            object: "v1".into(),
            version: 1,
            ..Default::default()
        };
        assert!(payload.validate().is_ok());

        let mut zero_version = payload.clone();
        zero_version.version = 0;
        assert!(zero_version.validate().is_err());

        let mut missing_subject = payload;
        missing_subject.subject = String::new();
        assert!(missing_subject.validate().is_err());
    }

    #[test]
    fn topic_convention() {
        assert_eq!(knowledge_topic("g1", TYPE_FACT), "group.g1.knowledge.facts");
        assert_eq!(
            knowledge_topic("ops", TYPE_PROPOSAL),
            "group.ops.knowledge.proposals"
        );
    }
}
