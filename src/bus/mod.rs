//! Message bus boundary.
//!
//! The transport itself lives behind [`MessageBus`]. A transport is handed a
//! [`BusSink`] when it connects; the sink is the only way inbound traffic
//! reaches the scheduler thread:
//!
//! ```text
//! transport thread ──deliver(topic, payload)──▶ privileged "message" mailbox
//!                  ──connection_changed(state)─▶ "connection" queue items
//! ```
//!
//! Topic layout per service: `{namespace}/{service}/control` (inbound
//! commands), `{namespace}/{service}/state` (public deltas) and
//! `{namespace}/{service}/in` (actor messages and EC responses).

pub mod loopback;

use std::sync::Arc;

use crate::scheduler::{Message, QueueItem, SchedulerHandle};
use crate::Result;

pub use loopback::{BrokerStats, LoopbackBroker, LoopbackBus};

/// Mailbox that receives every inbound bus message. Registered first, so it
/// is the scheduler's privileged mailbox.
pub const MESSAGE_MAILBOX: &str = "message";
/// Queue item kind carrying a [`ConnectionState`].
pub const CONNECTION_KIND: &str = "connection";

const MESSAGE_COMMAND: &str = "message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// A publish/subscribe transport.
///
/// Implementations may drop messages; nothing above this trait assumes
/// delivery.
pub trait MessageBus: Send + Sync {
    fn publish(&self, topic: &str, payload: &str) -> Result<()>;
    fn subscribe(&self, topic: &str) -> Result<()>;
    fn unsubscribe(&self, topic: &str) -> Result<()>;
    fn is_connected(&self) -> bool;
}

/// Creates a connected [`MessageBus`] that feeds the given sink.
pub trait BusConnector {
    fn connect(&self, sink: BusSink) -> Result<Arc<dyn MessageBus>>;
}

/// Thread-safe entry point for transport callbacks.
#[derive(Clone)]
pub struct BusSink {
    scheduler: SchedulerHandle,
}

impl BusSink {
    pub(crate) fn new(scheduler: SchedulerHandle) -> Self {
        Self { scheduler }
    }

    /// Hands one inbound message to the scheduler thread.
    pub fn deliver(&self, topic: &str, payload: &str) {
        let message = Message::new(topic, MESSAGE_COMMAND, vec![payload.to_string()]);
        if let Err(err) = self.scheduler.mailbox_put(MESSAGE_MAILBOX, message) {
            log::warn!("dropping message on {topic}: {err}");
        }
    }

    pub fn connection_changed(&self, state: ConnectionState) {
        self.scheduler
            .queue_put(QueueItem::new(CONNECTION_KIND, state));
    }
}

/// Topic names for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTopics {
    path: String,
}

impl ServiceTopics {
    pub fn new(namespace: &str, service: &str) -> Self {
        Self {
            path: format!("{namespace}/{service}"),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn control(&self) -> String {
        format!("{}/control", self.path)
    }

    pub fn state(&self) -> String {
        format!("{}/state", self.path)
    }

    pub fn inbound(&self) -> String {
        format!("{}/in", self.path)
    }
}

/// MQTT-style topic matching: `+` matches one level, a trailing `#` matches
/// the remaining levels (including none).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
