// ABOUTME: Channel adapter registry and outbound bus wiring.
// ABOUTME: Classifies send failures; terminal ones become timeline events.

use std::collections::HashMap;
use std::sync::Arc;

use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::channels::delivery::{classify_delivery_error, DeliveryClass};
use crate::channels::ChannelAdapter;
use crate::timeline::{TimelineEvent, TimelineService};
use chrono::Utc;

/// Registry of channel adapters keyed by normalized channel name.
#[derive(Default)]
pub struct ChannelRegistry {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        let name = crate::channels::normalize_channel(adapter.name());
        tracing::info!(channel = %name, "Channel adapter registered");
        self.adapters.insert(name, adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters
            .get(&crate::channels::normalize_channel(name))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stamp the adapter's group/mention classification into the message
    /// metadata and publish it to the bus.
    pub fn publish_classified(&self, bus: &MessageBus, mut msg: InboundMessage) {
        if let Some(adapter) = self.get(&msg.channel) {
            let hints = adapter.classify(&msg);
            msg.metadata.insert(
                crate::bus::META_KEY_IS_GROUP.to_string(),
                serde_json::Value::Bool(hints.is_group),
            );
            msg.metadata.insert(
                crate::bus::META_KEY_WAS_MENTIONED.to_string(),
                serde_json::Value::Bool(hints.was_mentioned),
            );
        }
        bus.publish_inbound(msg);
    }

    /// Subscribe every registered adapter's `send` to the bus. Failures are
    /// classified: transient ones are logged for upstream retry policy,
    /// terminal ones additionally surface as timeline events.
    pub fn bind_outbound(&self, bus: &MessageBus, timeline: Option<Arc<TimelineService>>) {
        for (name, adapter) in &self.adapters {
            let adapter = Arc::clone(adapter);
            let timeline = timeline.clone();
            let channel = name.clone();
            bus.subscribe(
                name,
                Arc::new(move |msg: OutboundMessage| {
                    let adapter = Arc::clone(&adapter);
                    let timeline = timeline.clone();
                    let channel = channel.clone();
                    Box::pin(async move {
                        let result = adapter.send(&msg).await;
                        let Err(error) = result else {
                            return Ok(());
                        };
                        let (reason_code, class) = classify_delivery_error(Some(&error));
                        metrics::counter!("kafclaw_delivery_failures_total").increment(1);
                        match class {
                            DeliveryClass::Transient => {
                                tracing::warn!(
                                    channel = %channel,
                                    chat_id = %msg.chat_id,
                                    reason = %reason_code,
                                    error = %error,
                                    "Transient delivery failure"
                                );
                            }
                            DeliveryClass::Terminal => {
                                tracing::error!(
                                    channel = %channel,
                                    chat_id = %msg.chat_id,
                                    reason = %reason_code,
                                    error = %error,
                                    "Terminal delivery failure"
                                );
                                if let Some(timeline) = &timeline {
                                    let event = TimelineEvent {
                                        event_id: uuid::Uuid::new_v4().to_string(),
                                        trace_id: String::new(),
                                        timestamp: Utc::now(),
                                        sender_id: String::new(),
                                        sender_name: channel.clone(),
                                        event_type: "SYSTEM".to_string(),
                                        content_text: format!("{error:#}"),
                                        classification: "DELIVERY_FAILED".to_string(),
                                        authorized: true,
                                        metadata: serde_json::json!({
                                            "channel": channel,
                                            "chatId": msg.chat_id,
                                            "reasonCode": reason_code,
                                        })
                                        .to_string(),
                                    };
                                    if let Err(db_err) = timeline.add_event(&event) {
                                        tracing::error!(
                                            error = %db_err,
                                            "Failed to record delivery failure"
                                        );
                                    }
                                }
                            }
                        }
                        Err(error)
                    })
                }),
            );
        }
    }
}
