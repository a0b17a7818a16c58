// ABOUTME: The agent loop: consumes inbound messages, gates access, runs provider
// ABOUTME: rounds against the scoped session, and publishes replies outbound.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use kafclaw_agent::{ChatTurn, GenerateRequest, Provider, ToolExecutor};
use tokio_util::sync::CancellationToken;

use crate::bus::{BusError, InboundMessage, MessageBus, OutboundMessage};
use crate::channels::access_policy::{evaluate_access, AccessConfig, AccessContext};
use crate::channels::pairing::PairingService;
use crate::channels::pairing_messages::build_pairing_reply;
use crate::channels::{build_session_scope, normalize_channel};
use crate::config::Config;
use crate::session::SessionManager;
use crate::timeline::{TimelineEvent, TimelineService};

/// Everything the loop owns.
pub struct LoopOptions {
    pub bus: MessageBus,
    pub sessions: SessionManager,
    pub provider: Arc<dyn Provider>,
    pub tools: Arc<dyn ToolExecutor>,
    pub pairing: Option<Arc<PairingService>>,
    pub timeline: Option<Arc<TimelineService>>,
    pub config: Arc<Config>,
}

/// Per-process orchestrator.
///
/// Messages for distinct scopes run concurrently; messages for the same
/// scope are serialized by a per-scope async mutex so a session never sees
/// interleaved turns.
pub struct AgentLoop {
    bus: MessageBus,
    sessions: SessionManager,
    provider: Arc<dyn Provider>,
    tools: Arc<dyn ToolExecutor>,
    pairing: Option<Arc<PairingService>>,
    timeline: Option<Arc<TimelineService>>,
    config: Arc<Config>,
    scope_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AgentLoop {
    pub fn new(opts: LoopOptions) -> Self {
        Self {
            bus: opts.bus,
            sessions: opts.sessions,
            provider: opts.provider,
            tools: opts.tools,
            pairing: opts.pairing,
            timeline: opts.timeline,
            config: opts.config,
            scope_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Drive the loop until `cancel` fires: one inbound consumer feeding
    /// per-message tasks, plus the outbound dispatcher.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let dispatcher = {
            let bus = self.bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bus.dispatch_outbound(&cancel).await })
        };

        tracing::info!("Agent loop started");
        loop {
            let msg = match self.bus.consume_inbound(&cancel).await {
                Ok(msg) => msg,
                Err(BusError::Cancelled) => break,
                Err(BusError::Closed) => {
                    tracing::warn!("Message bus closed, stopping agent loop");
                    break;
                }
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                match this.process_message(&msg).await {
                    Ok(Some(out)) => this.bus.publish_outbound(out),
                    Ok(None) => {}
                    Err(error) => this.record_failure(&msg, &error),
                }
            });
        }

        let _ = dispatcher.await;
        tracing::info!("Agent loop stopped");
        Ok(())
    }

    /// Handle one inbound message end to end. Returns the outbound reply, if
    /// any.
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<Option<OutboundMessage>> {
        let scope = self.resolve_scope(msg);
        let lock = self.scope_lock(&scope).await;
        let _turn_guard = lock.lock().await;

        let mut session = self.sessions.get_or_create(&scope);

        // Internal messages originate in-process and bypass the access gate.
        if !msg.is_internal() {
            let decision = evaluate_access(
                &AccessContext {
                    sender_id: msg.sender_id.clone(),
                    is_group: msg.is_group(),
                    was_mentioned: msg.was_mentioned(),
                },
                &self.access_config_for(&msg.channel),
            );
            if !decision.allowed {
                if decision.requires_pairing {
                    if let Some(pairing) = &self.pairing {
                        let entry =
                            pairing.create_or_get_pending(&msg.channel, &msg.sender_id, None)?;
                        tracing::info!(
                            channel = %entry.channel,
                            sender_id = %entry.sender_id,
                            "Pairing required, replying with code"
                        );
                        return Ok(Some(self.reply_to(msg, build_pairing_reply(
                            &entry.channel,
                            &format!("Sender: {}", entry.sender_id),
                            &entry.code,
                        ))));
                    }
                }
                tracing::debug!(
                    channel = %msg.channel,
                    sender_id = %msg.sender_id,
                    reason = decision.reason,
                    "Inbound message denied"
                );
                self.record_denied(msg, decision.reason);
                return Ok(None);
            }
        }

        session.add_message("user", &msg.content);

        let turns: Vec<ChatTurn> = session
            .get_history(self.config.agent.history_window)
            .iter()
            .map(|m| ChatTurn::new(m.role.clone(), m.content.clone()))
            .collect();
        let reply = self.run_provider_rounds(turns).await?;

        session.add_message("assistant", &reply);
        self.sessions
            .save(&session)
            .context("Failed to persist session")?;
        metrics::counter!("kafclaw_messages_processed_total").increment(1);

        Ok(Some(self.reply_to(msg, reply)))
    }

    /// Verbatim metadata override wins; otherwise the scope builder runs with
    /// the configured mode.
    fn resolve_scope(&self, msg: &InboundMessage) -> String {
        match msg.session_scope_override() {
            Some(scope) => scope.to_string(),
            None => build_session_scope(
                &msg.channel,
                &msg.account_id,
                &msg.chat_id,
                &msg.thread_id,
                &msg.sender_id,
                &self.config.agent.session_scope,
            ),
        }
    }

    /// Run provider rounds, executing requested tool calls, bounded by
    /// `max_iterations`.
    async fn run_provider_rounds(&self, mut turns: Vec<ChatTurn>) -> Result<String> {
        let max_rounds = self.config.agent.max_iterations.max(1);
        let mut rounds = 0u32;
        loop {
            let resp = self
                .provider
                .generate(GenerateRequest {
                    model: self.config.agent.model.clone(),
                    system: None,
                    turns: turns.clone(),
                })
                .await
                .context("Provider call failed")?;

            if resp.tool_calls.is_empty() {
                return Ok(resp.text);
            }
            if rounds >= max_rounds {
                tracing::warn!(rounds, "Tool-call round budget exhausted");
                return Ok(resp.text);
            }
            rounds += 1;

            if !resp.text.is_empty() {
                turns.push(ChatTurn::new("assistant", resp.text));
            }
            for call in resp.tool_calls {
                tracing::debug!(tool = %call.name, id = %call.id, "Executing tool call");
                let result = self.tools.execute(call).await;
                let rendered = serde_json::json!({
                    "id": result.id,
                    "name": result.name,
                    "output": result.output,
                    "success": result.success,
                });
                turns.push(ChatTurn::new("tool", rendered.to_string()));
            }
        }
    }

    fn access_config_for(&self, channel: &str) -> AccessConfig {
        let name = normalize_channel(channel);
        let ch = self.config.channel(&name).cloned().unwrap_or_default();
        AccessConfig {
            channel: name,
            allow_from: ch.allow_from,
            group_allow_from: ch.group_allow_from,
            dm_policy: ch.dm_policy,
            group_policy: ch.group_policy,
            require_mention: ch.require_mention,
        }
    }

    async fn scope_lock(&self, scope: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.scope_locks.lock().await;
        locks
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn reply_to(&self, msg: &InboundMessage, content: String) -> OutboundMessage {
        OutboundMessage {
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
            content,
            reply_to: {
                let thread = msg.thread_id.trim();
                if thread.is_empty() {
                    None
                } else {
                    Some(thread.to_string())
                }
            },
        }
    }

    fn record_denied(&self, msg: &InboundMessage, reason: &str) {
        let Some(timeline) = &self.timeline else {
            return;
        };
        let event = TimelineEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            trace_id: String::new(),
            timestamp: Utc::now(),
            sender_id: msg.sender_id.clone(),
            sender_name: String::new(),
            event_type: "SYSTEM".to_string(),
            content_text: String::new(),
            classification: "ACCESS_DENIED".to_string(),
            authorized: false,
            metadata: serde_json::json!({
                "channel": msg.channel,
                "chatId": msg.chat_id,
                "reason": reason,
            })
            .to_string(),
        };
        if let Err(error) = timeline.add_event(&event) {
            tracing::error!(error = %error, "Failed to record denied message");
        }
    }

    /// Per-message failures are recorded and the consumer keeps running.
    fn record_failure(&self, msg: &InboundMessage, error: &anyhow::Error) {
        tracing::error!(
            channel = %msg.channel,
            sender_id = %msg.sender_id,
            error = %format!("{error:#}"),
            "Message processing failed"
        );
        metrics::counter!("kafclaw_message_failures_total").increment(1);
        let Some(timeline) = &self.timeline else {
            return;
        };
        let event = TimelineEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            trace_id: String::new(),
            timestamp: Utc::now(),
            sender_id: msg.sender_id.clone(),
            sender_name: String::new(),
            event_type: "SYSTEM".to_string(),
            content_text: format!("{error:#}"),
            classification: "MESSAGE_PROCESSING_FAILED".to_string(),
            authorized: true,
            metadata: serde_json::json!({
                "channel": msg.channel,
                "chatId": msg.chat_id,
            })
            .to_string(),
        };
        if let Err(db_error) = timeline.add_event(&event) {
            tracing::error!(error = %db_error, "Failed to record processing failure");
        }
    }
}
