// ABOUTME: Pure access policy evaluator for DM and group chats.
// ABOUTME: Produces an allow/deny/requires-pairing verdict with a closed reason set.

use crate::channels::normalize_allow_entry_for_channel;

/// Normalized inbound context used for channel access checks.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    pub sender_id: String,
    pub is_group: bool,
    pub was_mentioned: bool,
}

/// Channel-agnostic policy view.
#[derive(Debug, Clone, Default)]
pub struct AccessConfig {
    pub channel: String,
    pub allow_from: Vec<String>,
    pub group_allow_from: Vec<String>,
    pub dm_policy: String,
    pub group_policy: String,
    pub require_mention: bool,
}

/// The authoritative admission verdict; no other state influences it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub requires_pairing: bool,
    pub reason: &'static str,
}

impl AccessDecision {
    fn allow(reason: &'static str) -> Self {
        Self {
            allowed: true,
            requires_pairing: false,
            reason,
        }
    }

    fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            requires_pairing: false,
            reason,
        }
    }
}

/// Evaluate DM/group policy semantics for one inbound message.
pub fn evaluate_access(ctx: &AccessContext, cfg: &AccessConfig) -> AccessDecision {
    let sender = ctx.sender_id.trim();
    if sender.is_empty() {
        return AccessDecision::deny("missing_sender_id");
    }

    if ctx.is_group {
        if cfg.require_mention && !ctx.was_mentioned {
            return AccessDecision::deny("mention_required");
        }
        return match cfg.group_policy.trim().to_lowercase().as_str() {
            "disabled" => AccessDecision::deny("group_policy_disabled"),
            "open" => AccessDecision::allow("group_policy_open"),
            "" | "allowlist" => {
                let allow = if cfg.group_allow_from.is_empty() {
                    &cfg.allow_from
                } else {
                    &cfg.group_allow_from
                };
                if is_allowed_sender(&cfg.channel, allow, sender) {
                    AccessDecision::allow("group_allowlist_match")
                } else {
                    AccessDecision::deny("group_allowlist_block")
                }
            }
            _ => AccessDecision::deny("invalid_group_policy"),
        };
    }

    match cfg.dm_policy.trim().to_lowercase().as_str() {
        "disabled" => AccessDecision::deny("dm_policy_disabled"),
        "open" => AccessDecision::allow("dm_policy_open"),
        "allowlist" => {
            if is_allowed_sender(&cfg.channel, &cfg.allow_from, sender) {
                AccessDecision::allow("dm_allowlist_match")
            } else {
                AccessDecision::deny("dm_allowlist_block")
            }
        }
        "" | "pairing" => {
            if is_allowed_sender(&cfg.channel, &cfg.allow_from, sender) {
                AccessDecision::allow("dm_allowlist_match")
            } else {
                AccessDecision {
                    allowed: false,
                    requires_pairing: true,
                    reason: "dm_pairing_required",
                }
            }
        }
        _ => AccessDecision::deny("invalid_dm_policy"),
    }
}

/// Allow-list membership with per-channel normalization on both sides.
/// The entry `*` matches any sender.
pub fn is_allowed_sender(channel: &str, allow: &[String], sender: &str) -> bool {
    let s = normalize_allow_entry_for_channel(channel, sender).to_lowercase();
    if s.is_empty() {
        return false;
    }
    allow.iter().any(|raw| {
        let v = normalize_allow_entry_for_channel(channel, raw).to_lowercase();
        !v.is_empty() && (v == "*" || v == s)
    })
}
