// ABOUTME: Operator-facing config health checks used by the doctor subcommand.
// ABOUTME: Unsafe group-policy warnings and per-channel account diagnostics.

use crate::config::{ChannelConfig, Config};

/// One channel account's configuration health snapshot.
#[derive(Debug, Clone)]
pub struct AccountDiagnostic {
    pub channel: String,
    pub account: String,
    pub enabled: bool,
    pub issues: Vec<String>,
}

/// Report risky group policy states across channels.
pub fn collect_unsafe_group_policy_warnings(cfg: &Config) -> Vec<String> {
    let mut out = Vec::new();
    for (name, channel) in [
        ("slack", &cfg.channels.slack),
        ("msteams", &cfg.channels.msteams),
        ("whatsapp", &cfg.channels.whatsapp),
    ] {
        out.extend(channel_policy_warnings(name, channel));
    }
    out
}

fn channel_policy_warnings(channel: &str, cfg: &ChannelConfig) -> Vec<String> {
    let mut out = Vec::new();
    match cfg.group_policy.trim().to_lowercase().as_str() {
        "open" => {
            if cfg.require_mention {
                out.push(format!(
                    "{channel} group policy is 'open': any mentioned user in group chats can trigger the agent"
                ));
            } else {
                out.push(format!(
                    "{channel} group policy is 'open' with mention gating disabled: any group message can trigger the agent"
                ));
            }
        }
        "" | "allowlist" => {
            if !cfg.require_mention {
                out.push(format!(
                    "{channel} group policy uses allowlist with mention gating disabled: allowlisted users can trigger on every group message"
                ));
            }
            let group_allow = if cfg.group_allow_from.is_empty() {
                &cfg.allow_from
            } else {
                &cfg.group_allow_from
            };
            if has_wildcard_allow(group_allow) {
                out.push(format!(
                    "{channel} group allowlist contains '*': effectively broad group access"
                ));
            }
        }
        _ => {}
    }
    out
}

fn has_wildcard_allow(entries: &[String]) -> bool {
    entries.iter().any(|raw| {
        let v = raw.trim().to_lowercase();
        v == "*" || v.ends_with(":*")
    })
}

/// Per-channel account configuration diagnostics.
pub fn collect_channel_account_diagnostics(cfg: &Config) -> Vec<AccountDiagnostic> {
    vec![
        slack_diagnostic(&cfg.channels.slack),
        teams_diagnostic(&cfg.channels.msteams),
        whatsapp_diagnostic(&cfg.channels.whatsapp),
    ]
}

fn slack_diagnostic(c: &ChannelConfig) -> AccountDiagnostic {
    let mut issues = Vec::new();
    if c.enabled {
        if c.bot_token.trim().is_empty() {
            issues.push("enabled but bot_token is missing".to_string());
        }
        if c.outbound_url.trim().is_empty() {
            issues.push("enabled but outbound_url is missing".to_string());
        }
        if c.inbound_token.trim().is_empty() {
            issues.push("enabled but inbound_token is missing".to_string());
        }
    } else if !c.bot_token.trim().is_empty()
        || !c.app_token.trim().is_empty()
        || !c.inbound_token.trim().is_empty()
        || !c.outbound_url.trim().is_empty()
    {
        issues.push("disabled but credentials/bridge settings are present".to_string());
    }
    AccountDiagnostic {
        channel: "slack".to_string(),
        account: "default".to_string(),
        enabled: c.enabled,
        issues,
    }
}

fn teams_diagnostic(c: &ChannelConfig) -> AccountDiagnostic {
    let mut issues = Vec::new();
    if c.enabled {
        if c.app_id.trim().is_empty() {
            issues.push("enabled but app_id is missing".to_string());
        }
        if c.app_password.trim().is_empty() {
            issues.push("enabled but app_password is missing".to_string());
        }
        if c.outbound_url.trim().is_empty() {
            issues.push("enabled but outbound_url is missing".to_string());
        }
        if c.inbound_token.trim().is_empty() {
            issues.push("enabled but inbound_token is missing".to_string());
        }
    } else if !c.app_id.trim().is_empty()
        || !c.app_password.trim().is_empty()
        || !c.inbound_token.trim().is_empty()
        || !c.outbound_url.trim().is_empty()
    {
        issues.push("disabled but credentials/bridge settings are present".to_string());
    }
    AccountDiagnostic {
        channel: "msteams".to_string(),
        account: "default".to_string(),
        enabled: c.enabled,
        issues,
    }
}

fn whatsapp_diagnostic(c: &ChannelConfig) -> AccountDiagnostic {
    let mut issues = Vec::new();
    if c.enabled && c.outbound_url.trim().is_empty() {
        issues.push("enabled but outbound_url is missing".to_string());
    }
    AccountDiagnostic {
        channel: "whatsapp".to_string(),
        account: "default".to_string(),
        enabled: c.enabled,
        issues,
    }
}
