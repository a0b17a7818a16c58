// ABOUTME: Channel layer: adapter contract, identity normalization, and policy machinery.
// ABOUTME: Access evaluation, pairing, delivery classification, scope building, diagnostics.

pub mod access_policy;
pub mod delivery;
pub mod diagnostics;
pub mod pairing;
pub mod pairing_messages;
pub mod registry;
pub mod session_scope;

pub use access_policy::{evaluate_access, AccessConfig, AccessContext, AccessDecision};
pub use delivery::{classify_delivery_error, DeliveryClass};
pub use pairing::{PairingService, PendingPairing};
pub use registry::ChannelRegistry;
pub use session_scope::build_session_scope;

use crate::bus::{InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;

/// Normalize a channel name: trimmed, lowercased, with the `teams` alias
/// folded into `msteams`. Applied at every write and lookup site.
pub fn normalize_channel(name: &str) -> String {
    let v = name.trim().to_lowercase();
    match v.as_str() {
        "teams" => "msteams".to_string(),
        _ => v,
    }
}

/// Canonicalize an allow-list entry for a channel so inputs like
/// `slack:user:U1` and `U1` compare equal.
pub fn normalize_allow_entry_for_channel(channel: &str, raw: &str) -> String {
    let v = raw.trim();
    if v.is_empty() {
        return String::new();
    }
    match normalize_channel(channel).as_str() {
        "slack" => {
            let v = v.to_lowercase();
            let v = v.strip_prefix("slack:").unwrap_or(&v);
            let v = v.strip_prefix("user:").unwrap_or(v);
            v.trim().to_string()
        }
        "msteams" => {
            let v = v.to_lowercase();
            let v = v.strip_prefix("msteams:").unwrap_or(&v);
            let v = v.strip_prefix("teams:").unwrap_or(v);
            let v = v.strip_prefix("user:").unwrap_or(v);
            v.trim().to_string()
        }
        _ => v.to_string(),
    }
}

/// Group/mention hints an adapter derives from its native event, consumed by
/// the access gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatClassification {
    pub is_group: bool,
    pub was_mentioned: bool,
}

/// Contract every channel adapter satisfies: translate native events into
/// `InboundMessage` (publishing to the bus), deliver `OutboundMessage`s, and
/// classify chats for the access gate.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Canonical channel name ("slack", "msteams", "whatsapp").
    fn name(&self) -> &str;

    /// Deliver one outbound message. Errors are fed to the delivery
    /// classifier by the registry.
    async fn send(&self, msg: &OutboundMessage) -> Result<()>;

    /// Group/mention hints for an inbound message.
    fn classify(&self, _msg: &InboundMessage) -> ChatClassification {
        ChatClassification::default()
    }
}
