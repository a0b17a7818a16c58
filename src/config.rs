// ABOUTME: Configuration parsing from TOML file with environment variable overrides.
// ABOUTME: Per-channel access policy sections, agent options, and the group/broker plane.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub sessions: SessionsConfig,
    pub timeline: TimelineConfig,
    pub channels: ChannelsConfig,
    pub group: GroupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model identifier passed through to the provider.
    pub model: String,
    /// Maximum tool-call rounds per turn.
    pub max_iterations: u32,
    /// Session scope mode: channel | account | room | thread | user.
    pub session_scope: String,
    /// How many prior turns are sent to the provider.
    pub history_window: usize,
    /// Workspace root owned by the loop.
    pub workspace: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            max_iterations: 4,
            session_scope: "room".to_string(),
            history_window: 20,
            workspace: "./workspace".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Sessions directory; empty means `<home>/.kafclaw/sessions`.
    pub dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Timeline database path; empty means `<home>/.kafclaw/timeline.db`.
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub slack: ChannelConfig,
    pub msteams: ChannelConfig,
    pub whatsapp: ChannelConfig,
}

/// Access policy and bridge credentials for one channel.
///
/// Policy values are strings on purpose: unknown values must flow through to
/// the evaluator, which answers with an invalid-policy denial rather than a
/// parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub allow_from: Vec<String>,
    pub group_allow_from: Vec<String>,
    /// "" (pairing) | disabled | open | allowlist | pairing
    pub dm_policy: String,
    /// "" (allowlist) | disabled | open | allowlist
    pub group_policy: String,
    pub require_mention: bool,
    // Bridge credentials, used by adapters and the doctor diagnostics.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bot_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub app_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub app_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub app_password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub inbound_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub outbound_url: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_from: Vec::new(),
            group_allow_from: Vec::new(),
            dm_policy: String::new(),
            group_policy: String::new(),
            require_mention: true,
            bot_token: String::new(),
            app_token: String::new(),
            app_id: String::new(),
            app_password: String::new(),
            inbound_token: String::new(),
            outbound_url: String::new(),
        }
    }
}

/// Knowledge replication plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub enabled: bool,
    /// Replication group name used in topic derivation.
    pub name: String,
    /// This node's identity on the knowledge plane.
    pub claw_id: String,
    /// This process's identity.
    pub instance_id: String,
    pub kafka_brokers: String,
    pub kafka_security_protocol: String,
    pub kafka_sasl_mechanism: String,
    pub kafka_sasl_username: String,
    pub kafka_sasl_password: String,
    pub kafka_tls_ca_file: String,
    pub kafka_tls_cert_file: String,
    pub kafka_tls_key_file: String,
    /// Legacy proxy API key; implies SASL_SSL with PLAIN/token credentials
    /// when nothing more specific is configured.
    pub lfs_proxy_api_key: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: "default".to_string(),
            claw_id: String::new(),
            instance_id: String::new(),
            kafka_brokers: String::new(),
            kafka_security_protocol: String::new(),
            kafka_sasl_mechanism: String::new(),
            kafka_sasl_username: String::new(),
            kafka_sasl_password: String::new(),
            kafka_tls_ca_file: String::new(),
            kafka_tls_cert_file: String::new(),
            kafka_tls_key_file: String::new(),
            lfs_proxy_api_key: String::new(),
        }
    }
}

const SCOPE_MODES: &[&str] = &["channel", "account", "room", "thread", "user"];

impl Config {
    /// Load configuration, preferring `path`, then ./kafclaw.toml, then the
    /// built-in defaults, with environment variable overrides applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file: {}", p.display()))?;
                toml::from_str::<Config>(&content)
                    .with_context(|| format!("Failed to parse config file: {}", p.display()))?
            }
            None => {
                let default_path = Path::new("kafclaw.toml");
                if default_path.exists() {
                    let content = std::fs::read_to_string(default_path)
                        .context("Failed to read kafclaw.toml")?;
                    toml::from_str::<Config>(&content).context("Failed to parse kafclaw.toml")?
                } else {
                    Config::default()
                }
            }
        };

        // Override with environment variables if present
        if let Ok(val) = std::env::var("KAFCLAW_MODEL") {
            config.agent.model = val;
        }
        if let Ok(val) = std::env::var("KAFCLAW_SESSION_SCOPE") {
            config.agent.session_scope = val;
        }
        if let Ok(val) = std::env::var("KAFCLAW_MAX_ITERATIONS") {
            config.agent.max_iterations = val.parse().with_context(|| {
                format!("KAFCLAW_MAX_ITERATIONS must be a number, got: {val}")
            })?;
        }
        if let Ok(val) = std::env::var("KAFCLAW_CLAW_ID") {
            config.group.claw_id = val;
        }
        if let Ok(val) = std::env::var("KAFCLAW_INSTANCE_ID") {
            config.group.instance_id = val;
        }
        if let Ok(val) = std::env::var("KAFCLAW_KAFKA_BROKERS") {
            config.group.kafka_brokers = val;
        }
        if let Ok(val) = std::env::var("KAFCLAW_KAFKA_SECURITY_PROTOCOL") {
            config.group.kafka_security_protocol = val;
        }
        if let Ok(val) = std::env::var("KAFCLAW_KAFKA_SASL_USERNAME") {
            config.group.kafka_sasl_username = val;
        }
        if let Ok(val) = std::env::var("KAFCLAW_KAFKA_SASL_PASSWORD") {
            config.group.kafka_sasl_password = val;
        }
        if let Ok(val) = std::env::var("KAFCLAW_LFS_PROXY_API_KEY") {
            config.group.lfs_proxy_api_key = val;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mode = self.agent.session_scope.trim().to_lowercase();
        if !mode.is_empty() && !SCOPE_MODES.contains(&mode.as_str()) {
            anyhow::bail!(
                "agent.session_scope must be one of {SCOPE_MODES:?}, got: {}",
                self.agent.session_scope
            );
        }
        if self.agent.max_iterations == 0 {
            anyhow::bail!("agent.max_iterations must be at least 1");
        }
        if self.group.enabled {
            if self.group.kafka_brokers.trim().is_empty() {
                anyhow::bail!("group.kafka_brokers is required when the group plane is enabled");
            }
            if self.group.claw_id.trim().is_empty() {
                anyhow::bail!("group.claw_id is required when the group plane is enabled");
            }
            if self.group.instance_id.trim().is_empty() {
                anyhow::bail!("group.instance_id is required when the group plane is enabled");
            }
        }
        Ok(())
    }

    /// Persist the configuration (used after pairing approval mutates an
    /// allow-list).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create config directory")?;
            }
        }
        let content = toml::to_string_pretty(self).context("Failed to encode config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Channel section by normalized name, if this is a known channel.
    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        match crate::channels::normalize_channel(name).as_str() {
            "slack" => Some(&self.channels.slack),
            "msteams" => Some(&self.channels.msteams),
            "whatsapp" => Some(&self.channels.whatsapp),
            _ => None,
        }
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut ChannelConfig> {
        match crate::channels::normalize_channel(name).as_str() {
            "slack" => Some(&mut self.channels.slack),
            "msteams" => Some(&mut self.channels.msteams),
            "whatsapp" => Some(&mut self.channels.whatsapp),
            _ => None,
        }
    }
}
