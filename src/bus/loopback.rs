//! In-process broker.
//!
//! Every runtime that connects gets its own endpoint with its own
//! subscriptions; publishing fans out to every endpoint whose subscriptions
//! match. Taking the broker offline drops publishes and tells every endpoint
//! it is disconnected, which is how tests exercise transport loss.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{topic_matches, BusConnector, BusSink, ConnectionState, MessageBus};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

struct Endpoint {
    id: u64,
    sink: BusSink,
    topics: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl Endpoint {
    fn wants(&self, topic: &str) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        lock(&self.topics)
            .iter()
            .any(|filter| topic_matches(filter, topic))
    }
}

struct BrokerState {
    endpoints: Vec<Arc<Endpoint>>,
    online: bool,
    next_id: u64,
    stats: BrokerStats,
}

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                endpoints: Vec::new(),
                online: true,
                next_id: 0,
                stats: BrokerStats::default(),
            })),
        }
    }

    /// Simulates the transport going away or coming back.
    pub fn set_online(&self, online: bool) {
        let endpoints = {
            let mut state = lock(&self.state);
            if state.online == online {
                return;
            }
            state.online = online;
            state.endpoints.clone()
        };
        let connection = if online {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        log::info!("loopback broker {connection:?}");
        for endpoint in endpoints {
            endpoint.sink.connection_changed(connection);
        }
    }

    pub fn is_online(&self) -> bool {
        lock(&self.state).online
    }

    pub fn stats(&self) -> BrokerStats {
        lock(&self.state).stats
    }

    pub fn endpoint_count(&self) -> usize {
        lock(&self.state).endpoints.len()
    }
}

impl BusConnector for LoopbackBroker {
    fn connect(&self, sink: BusSink) -> Result<Arc<dyn MessageBus>> {
        let (endpoint, online) = {
            let mut state = lock(&self.state);
            let endpoint = Arc::new(Endpoint {
                id: state.next_id,
                sink,
                topics: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            });
            state.next_id += 1;
            state.endpoints.push(Arc::clone(&endpoint));
            (endpoint, state.online)
        };
        if online {
            endpoint.sink.connection_changed(ConnectionState::Connected);
        }
        Ok(Arc::new(LoopbackBus {
            endpoint,
            broker: Arc::clone(&self.state),
        }))
    }
}

/// One runtime's connection to a [`LoopbackBroker`].
pub struct LoopbackBus {
    endpoint: Arc<Endpoint>,
    broker: Arc<Mutex<BrokerState>>,
}

impl MessageBus for LoopbackBus {
    fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let targets = {
            let mut state = lock(&self.broker);
            state.stats.published += 1;
            if !state.online {
                state.stats.dropped += 1;
                return Err(Error::Bus(format!("offline, dropped publish to {topic}")));
            }
            let targets: Vec<Arc<Endpoint>> = state
                .endpoints
                .iter()
                .filter(|endpoint| endpoint.wants(topic))
                .cloned()
                .collect();
            state.stats.delivered += targets.len() as u64;
            targets
        };
        log::trace!("publish {topic} {payload} -> {} endpoints", targets.len());
        for endpoint in targets {
            endpoint.sink.deliver(topic, payload);
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        let mut topics = lock(&self.endpoint.topics);
        if !topics.iter().any(|existing| existing == topic) {
            topics.push(topic.to_string());
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<()> {
        lock(&self.endpoint.topics).retain(|existing| existing != topic);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.broker).online
    }
}

impl Drop for LoopbackBus {
    fn drop(&mut self) {
        self.endpoint.closed.store(true, Ordering::Release);
        let id = self.endpoint.id;
        lock(&self.broker)
            .endpoints
            .retain(|endpoint| endpoint.id != id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
