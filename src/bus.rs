// ABOUTME: Core message bus: inbound FIFO queue plus outbound fan-out by channel.
// ABOUTME: Defines InboundMessage/OutboundMessage and the cancellation-aware MessageBus.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Metadata key carrying the message type tag.
pub const META_KEY_MESSAGE_TYPE: &str = "message_type";
/// Metadata key carrying a verbatim session scope override.
pub const META_KEY_SESSION_SCOPE: &str = "session_scope";
/// Metadata key set by adapters when the chat is a group conversation.
pub const META_KEY_IS_GROUP: &str = "is_group";
/// Metadata key set by adapters when the bot was mentioned.
pub const META_KEY_WAS_MENTIONED: &str = "was_mentioned";

pub const MESSAGE_TYPE_EXTERNAL: &str = "external";
pub const MESSAGE_TYPE_INTERNAL: &str = "internal";

/// A message entering the bus from a channel adapter.
///
/// Owned by the bus from publish until a consumer removes it. Adapters inject
/// heterogeneous fields through `metadata`; the loop only reads the known keys
/// through the typed accessors below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    #[serde(default)]
    pub account_id: String,
    pub sender_id: String,
    pub chat_id: String,
    #[serde(default)]
    pub thread_id: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl InboundMessage {
    /// The message type tag; defaults to external.
    pub fn message_type(&self) -> &str {
        match self
            .metadata
            .get(META_KEY_MESSAGE_TYPE)
            .and_then(Value::as_str)
        {
            Some(MESSAGE_TYPE_INTERNAL) => MESSAGE_TYPE_INTERNAL,
            _ => MESSAGE_TYPE_EXTERNAL,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.message_type() == MESSAGE_TYPE_INTERNAL
    }

    /// Verbatim session scope override, when present and non-empty.
    pub fn session_scope_override(&self) -> Option<&str> {
        self.metadata
            .get(META_KEY_SESSION_SCOPE)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn is_group(&self) -> bool {
        self.metadata
            .get(META_KEY_IS_GROUP)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn was_mentioned(&self) -> bool {
        self.metadata
            .get(META_KEY_WAS_MENTIONED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A reply leaving the bus toward a channel adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Outbound subscriber callback. Awaited during dispatch, in registration
/// order.
pub type OutboundHandler =
    Arc<dyn Fn(OutboundMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("message bus is closed")]
    Closed,
    #[error("operation cancelled")]
    Cancelled,
}

/// Upper bound on queued outbound messages; publishing past it drops the
/// oldest queued message (observable via log + counter).
const OUTBOUND_QUEUE_LIMIT: usize = 1024;

struct BusInner {
    inbound: Mutex<VecDeque<InboundMessage>>,
    outbound: Mutex<VecDeque<OutboundMessage>>,
    inbound_ready: Notify,
    outbound_ready: Notify,
    subscribers: RwLock<HashMap<String, Vec<OutboundHandler>>>,
    closed: AtomicBool,
}

/// In-memory message bus.
///
/// Inbound is a FIFO queue consumed by exactly one consumer per message;
/// outbound fans out to every handler subscribed to the message's channel.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                inbound: Mutex::new(VecDeque::new()),
                outbound: Mutex::new(VecDeque::new()),
                inbound_ready: Notify::new(),
                outbound_ready: Notify::new(),
                subscribers: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue an inbound message, stamping its timestamp when unset.
    /// Non-blocking.
    pub fn publish_inbound(&self, mut msg: InboundMessage) {
        if msg.timestamp.is_none() {
            msg.timestamp = Some(Utc::now());
        }
        self.inner.inbound.lock().unwrap().push_back(msg);
        self.inner.inbound_ready.notify_one();
        metrics::counter!("kafclaw_bus_inbound_published_total").increment(1);
    }

    pub fn inbound_size(&self) -> usize {
        self.inner.inbound.lock().unwrap().len()
    }

    /// Block until an inbound message is available or `cancel` fires.
    ///
    /// On cancellation the queue is left intact. Each message is delivered to
    /// at most one consumer.
    pub async fn consume_inbound(
        &self,
        cancel: &CancellationToken,
    ) -> Result<InboundMessage, BusError> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }
            if let Some(msg) = self.inner.inbound.lock().unwrap().pop_front() {
                metrics::counter!("kafclaw_bus_inbound_consumed_total").increment(1);
                return Ok(msg);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(BusError::Cancelled),
                _ = self.inner.inbound_ready.notified() => {}
            }
        }
    }

    /// Register an outbound handler for a channel. Multiple handlers for the
    /// same channel are additive and run in registration order.
    pub fn subscribe(&self, channel: &str, handler: OutboundHandler) {
        self.inner
            .subscribers
            .write()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(handler);
    }

    /// Enqueue an outbound message. Non-blocking; past the queue limit the
    /// oldest queued message is dropped.
    pub fn publish_outbound(&self, msg: OutboundMessage) {
        {
            let mut queue = self.inner.outbound.lock().unwrap();
            if queue.len() >= OUTBOUND_QUEUE_LIMIT {
                if let Some(dropped) = queue.pop_front() {
                    tracing::warn!(
                        channel = %dropped.channel,
                        chat_id = %dropped.chat_id,
                        "Outbound queue full, dropping oldest message"
                    );
                    metrics::counter!("kafclaw_bus_outbound_dropped_total").increment(1);
                }
            }
            queue.push_back(msg);
        }
        self.inner.outbound_ready.notify_one();
        metrics::counter!("kafclaw_bus_outbound_published_total").increment(1);
    }

    pub fn outbound_size(&self) -> usize {
        self.inner.outbound.lock().unwrap().len()
    }

    /// Dequeue outbound messages and invoke every handler registered to each
    /// message's channel, strictly sequentially, until `cancel` fires.
    pub async fn dispatch_outbound(&self, cancel: &CancellationToken) -> Result<(), BusError> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }
            loop {
                let next = self.inner.outbound.lock().unwrap().pop_front();
                let Some(msg) = next else { break };
                let handlers: Vec<OutboundHandler> = self
                    .inner
                    .subscribers
                    .read()
                    .unwrap()
                    .get(&msg.channel)
                    .cloned()
                    .unwrap_or_default();
                if handlers.is_empty() {
                    tracing::debug!(channel = %msg.channel, "No outbound subscribers for channel");
                    continue;
                }
                for handler in handlers {
                    if let Err(error) = handler(msg.clone()).await {
                        tracing::warn!(
                            channel = %msg.channel,
                            chat_id = %msg.chat_id,
                            error = %error,
                            "Outbound handler failed"
                        );
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(BusError::Cancelled),
                _ = self.inner.outbound_ready.notified() => {}
            }
        }
    }

    /// Release bus resources. Subsequent consume/dispatch calls return
    /// `BusError::Closed`.
    pub fn stop(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.inbound_ready.notify_waiters();
        self.inner.outbound_ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_defaults_to_external() {
        let mut msg = InboundMessage::default();
        assert_eq!(msg.message_type(), MESSAGE_TYPE_EXTERNAL);

        msg.metadata.insert(
            META_KEY_MESSAGE_TYPE.to_string(),
            Value::String(MESSAGE_TYPE_INTERNAL.to_string()),
        );
        assert_eq!(msg.message_type(), MESSAGE_TYPE_INTERNAL);
        assert!(msg.is_internal());
    }

    #[test]
    fn session_scope_override_ignores_blank() {
        let mut msg = InboundMessage::default();
        assert!(msg.session_scope_override().is_none());
        msg.metadata.insert(
            META_KEY_SESSION_SCOPE.to_string(),
            Value::String("  ".to_string()),
        );
        assert!(msg.session_scope_override().is_none());
        msg.metadata.insert(
            META_KEY_SESSION_SCOPE.to_string(),
            Value::String("slack:C1".to_string()),
        );
        assert_eq!(msg.session_scope_override(), Some("slack:C1"));
    }

    #[tokio::test]
    async fn publish_stamps_timestamp_and_consume_returns_fifo() {
        let bus = MessageBus::new();
        bus.publish_inbound(InboundMessage {
            channel: "wa".into(),
            content: "first".into(),
            ..Default::default()
        });
        bus.publish_inbound(InboundMessage {
            channel: "wa".into(),
            content: "second".into(),
            ..Default::default()
        });
        assert_eq!(bus.inbound_size(), 2);

        let cancel = CancellationToken::new();
        let got = bus.consume_inbound(&cancel).await.unwrap();
        assert_eq!(got.content, "first");
        assert!(got.timestamp.is_some());
        let got = bus.consume_inbound(&cancel).await.unwrap();
        assert_eq!(got.content, "second");
        assert_eq!(bus.inbound_size(), 0);
    }

    #[tokio::test]
    async fn consume_returns_cancelled_on_cancelled_token() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = bus.consume_inbound(&cancel).await.unwrap_err();
        assert_eq!(err, BusError::Cancelled);
    }

    #[tokio::test]
    async fn dispatch_invokes_subscribers_in_order() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(
                "wa",
                Arc::new(move |msg: OutboundMessage| {
                    let seen = Arc::clone(&seen);
                    Box::pin(async move {
                        seen.lock().unwrap().push(format!("{tag}:{}", msg.content));
                        Ok(())
                    })
                }),
            );
        }

        let cancel = CancellationToken::new();
        let dispatcher = {
            let bus = bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bus.dispatch_outbound(&cancel).await })
        };

        bus.publish_outbound(OutboundMessage {
            channel: "wa".into(),
            chat_id: "c1".into(),
            content: "reply".into(),
            reply_to: None,
        });

        for _ in 0..50 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec!["a:reply".to_string(), "b:reply".to_string()]
        );

        cancel.cancel();
        let result = dispatcher.await.unwrap();
        assert_eq!(result.unwrap_err(), BusError::Cancelled);
    }

    #[tokio::test]
    async fn stop_closes_the_bus() {
        let bus = MessageBus::new();
        bus.stop();
        let cancel = CancellationToken::new();
        let err = bus.consume_inbound(&cancel).await.unwrap_err();
        assert_eq!(err, BusError::Closed);
        let err = bus.dispatch_outbound(&cancel).await.unwrap_err();
        assert_eq!(err, BusError::Closed);
    }

    #[tokio::test]
    async fn outbound_queue_drops_oldest_past_limit() {
        let bus = MessageBus::new();
        for i in 0..(OUTBOUND_QUEUE_LIMIT + 5) {
            bus.publish_outbound(OutboundMessage {
                channel: "wa".into(),
                chat_id: "c".into(),
                content: format!("m{i}"),
                reply_to: None,
            });
        }
        assert_eq!(bus.outbound_size(), OUTBOUND_QUEUE_LIMIT);
    }
}
