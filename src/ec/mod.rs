//! Eventual-consistency replication of a [`Share`].
//!
//! One [`Producer`] owns a share and publishes every change. Any number of
//! [`Consumer`]s hold a leased subscription, bootstrap from a snapshot
//! handshake and then follow the delta stream:
//!
//! ```text
//! consumer ──(share reply 300 *)──────────────▶ {service}/control
//! producer ──(item_count N), N × (add ..)─────▶ reply
//! producer ──(sync reply)─────────────────────▶ reply, {service}/state
//! producer ──(update ..) / (remove ..)────────▶ {service}/state, matching replies
//! ```
//!
//! Delivery is at-least-once at best. Lost renewals are covered by the
//! consumer's self-renewing lease, lost deltas by the next snapshot.

mod consumer;
mod filter;
mod producer;
mod share;

pub use consumer::{Consumer, ConsumerOptions, ConsumerState};
pub use filter::Filter;
pub use producer::{Producer, SubscriptionInfo};
pub use share::{Scalar, Share, SharePath, Value};

/// What happened to a share path, as reported to change handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Update,
    /// Reported for every accepted removal, whether or not the path was
    /// present, so replays notify the same way updates do.
    Remove,
    /// End of a snapshot handshake; the path is the response topic.
    Sync,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Update => "update",
            ChangeKind::Remove => "remove",
            ChangeKind::Sync => "sync",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
