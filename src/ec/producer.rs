//! Writer side of EC replication.
//!
//! The producer is the single owner of its [`Share`]. Every accepted change is
//! applied locally, reported to local handlers, broadcast on
//! `{service}/state` and forwarded to each subscription whose filter matches
//! the changed path. Subscriptions are keyed by response topic and kept alive
//! by a [`Lease`]; when the lease runs out the subscription is dropped.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use super::{ChangeKind, Filter, Share, Value};
use crate::bus::ServiceTopics;
use crate::lease::Lease;
use crate::protocol::Command;
use crate::runtime::Runtime;
use crate::scheduler::HandlerId;
use crate::{Error, Result};

pub(super) type ChangeFn = Rc<RefCell<dyn FnMut(ChangeKind, &str, Option<&Value>)>>;

struct Subscription {
    filter: Filter,
    lease: Lease,
}

/// A snapshot of one live subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub response_topic: String,
    pub filter: Filter,
    pub lease: Duration,
}

struct ProducerInner {
    runtime: Runtime,
    service: String,
    topics: ServiceTopics,
    share: Share,
    subscriptions: BTreeMap<String, Subscription>,
    handlers: Vec<ChangeFn>,
    control_handler: Option<HandlerId>,
}

impl Drop for ProducerInner {
    fn drop(&mut self) {
        if let Some(id) = self.control_handler.take() {
            self.runtime.remove_message_handler(id);
        }
    }
}

/// Handle to an EC producer. Clones share the same producer.
#[derive(Clone)]
pub struct Producer {
    inner: Rc<RefCell<ProducerInner>>,
}

impl Producer {
    /// Starts a producer for `service` seeded with `share` and begins
    /// listening on `{namespace}/{service}/control`.
    pub fn new(runtime: &Runtime, service: &str, share: Share) -> Result<Self> {
        let topics = runtime.service_topics(service);
        let control = topics.control();
        let inner = Rc::new(RefCell::new(ProducerInner {
            runtime: runtime.clone(),
            service: service.to_string(),
            topics,
            share,
            subscriptions: BTreeMap::new(),
            handlers: Vec::new(),
            control_handler: None,
        }));

        let weak = Rc::downgrade(&inner);
        let id = runtime.add_message_handler(&control, move |_topic: &str, payload: &str| {
            if let Some(inner) = weak.upgrade() {
                Producer { inner }.handle_control(payload);
            }
        })?;
        inner.borrow_mut().control_handler = Some(id);
        log::info!("ec producer {service} listening on {control}");
        Ok(Self { inner })
    }

    /// Sets `path` to `value` and replicates the change.
    ///
    /// # Errors
    ///
    /// `Error::InvalidPath` for a malformed or too-deep path; nothing is
    /// mutated or published.
    pub fn update(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        self.apply(
            Command::Update {
                path: path.to_string(),
                value: value.into(),
            },
            None,
        )
    }

    /// Removes `path` and replicates the removal. Removing a missing path
    /// still broadcasts and notifies handlers.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.apply(
            Command::Remove {
                path: path.to_string(),
            },
            None,
        )
    }

    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        self.inner.borrow().share.get(path)
    }

    /// A copy of the whole share.
    pub fn share(&self) -> Share {
        self.inner.borrow().share.clone()
    }

    /// Registers `handler(kind, path, value)`, called synchronously for every
    /// change applied to the share.
    pub fn add_handler(&self, handler: impl FnMut(ChangeKind, &str, Option<&Value>) + 'static) {
        self.inner
            .borrow_mut()
            .handlers
            .push(Rc::new(RefCell::new(handler)));
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner
            .borrow()
            .subscriptions
            .iter()
            .map(|(topic, subscription)| SubscriptionInfo {
                response_topic: topic.clone(),
                filter: subscription.filter.clone(),
                lease: subscription.lease.duration(),
            })
            .collect()
    }

    pub fn topics(&self) -> ServiceTopics {
        self.inner.borrow().topics.clone()
    }

    /// Stops listening for control commands and cancels every subscription.
    pub fn close(&self) {
        let (runtime, control, subscriptions) = {
            let mut inner = self.inner.borrow_mut();
            (
                inner.runtime.clone(),
                inner.control_handler.take(),
                std::mem::take(&mut inner.subscriptions),
            )
        };
        if let Some(id) = control {
            runtime.remove_message_handler(id);
        }
        for subscription in subscriptions.values() {
            subscription.lease.terminate();
        }
        log::info!("ec producer {} closed", self.inner.borrow().service);
    }

    /// Applies `command` and replicates it. `echo` replaces the encoded
    /// command on the state topic for changes that arrived over the wire.
    fn apply(&self, command: Command, echo: Option<&str>) -> Result<()> {
        let (kind, path, value) = match &command {
            Command::Add { path, value } => (ChangeKind::Add, path, Some(value)),
            Command::Update { path, value } => (ChangeKind::Update, path, Some(value)),
            Command::Remove { path } => (ChangeKind::Remove, path, None),
            other => {
                log::debug!("producer cannot apply {}", other.name());
                return Ok(());
            }
        };

        let (runtime, state_topic, handlers, targets) = {
            let mut inner = self.inner.borrow_mut();
            let outcome = match value {
                Some(value) => inner.share.update(path, value.clone()),
                None => inner.share.remove(path).map(|_| ()),
            };
            if let Err(err) = outcome {
                log::warn!("ec producer {}: {} rejected: {err}", inner.service, kind);
                return Err(err);
            }
            let handlers = inner.handlers.clone();
            let targets: Vec<String> = inner
                .subscriptions
                .iter()
                .filter(|(_, subscription)| subscription.filter.matches(path))
                .map(|(topic, _)| topic.clone())
                .collect();
            (inner.runtime.clone(), inner.topics.state(), handlers, targets)
        };

        for handler in handlers {
            runtime.scheduler().guarded("ec producer handler", || {
                (&mut *handler.borrow_mut())(kind, path.as_str(), value)
            });
        }
        let payload = command.encode();
        publish(&runtime, &state_topic, echo.unwrap_or(&payload));
        for topic in targets {
            publish(&runtime, &topic, &payload);
        }
        Ok(())
    }

    fn handle_control(&self, payload: &str) {
        let command = match Command::decode(payload) {
            Ok(command) => command,
            Err(err) => {
                log::warn!("ec producer {}: bad control payload: {err}", self.service());
                return;
            }
        };
        match command {
            change @ (Command::Add { .. } | Command::Update { .. } | Command::Remove { .. }) => {
                if let Err(err) = self.apply(change, Some(payload)) {
                    log::debug!("ec producer {}: dropped control change: {err}", self.service());
                }
            }
            Command::Share {
                response_topic,
                lease_seconds,
                filter,
            } => self.share_request(&response_topic, lease_seconds, filter),
            other => log::debug!(
                "ec producer {}: ignoring {} on control topic",
                self.service(),
                other.name()
            ),
        }
    }

    fn share_request(&self, response_topic: &str, lease_seconds: u64, filter: Filter) {
        if lease_seconds == 0 {
            let removed = self.inner.borrow_mut().subscriptions.remove(response_topic);
            match removed {
                Some(subscription) => {
                    subscription.lease.terminate();
                    log::info!("subscription {response_topic} cancelled");
                }
                None => {
                    let unknown = Error::UnknownSubscription(response_topic.to_string());
                    log::debug!("{unknown}, sending one-off snapshot");
                    self.handshake(response_topic, &filter);
                }
            }
            return;
        }

        let duration = Duration::from_secs(lease_seconds);
        let existing = self
            .inner
            .borrow_mut()
            .subscriptions
            .get_mut(response_topic)
            .map(|subscription| {
                subscription.filter = filter.clone();
                subscription.lease.clone()
            });
        match existing {
            Some(lease) => {
                lease.extend(Some(duration));
                log::debug!("subscription {response_topic} renewed for {duration:?}");
            }
            None => {
                let scheduler = self.inner.borrow().runtime.scheduler().clone();
                let weak = Rc::downgrade(&self.inner);
                let lease = Lease::new(&scheduler, duration, response_topic, move |topic: &str| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let removed = inner.borrow_mut().subscriptions.remove(topic);
                    if removed.is_some() {
                        log::info!("subscription {topic} lease expired");
                    }
                });
                self.inner.borrow_mut().subscriptions.insert(
                    response_topic.to_string(),
                    Subscription {
                        filter: filter.clone(),
                        lease,
                    },
                );
                log::info!("subscription {response_topic} added ({filter}, {duration:?})");
            }
        }
        self.handshake(response_topic, &filter);
    }

    /// `item_count N`, N × `add`, then `sync` to the response and state topics.
    fn handshake(&self, response_topic: &str, filter: &Filter) {
        let (runtime, state_topic, leaves) = {
            let inner = self.inner.borrow();
            let leaves: Vec<_> = inner
                .share
                .leaves()
                .into_iter()
                .filter(|(path, _)| filter.matches(path))
                .collect();
            (inner.runtime.clone(), inner.topics.state(), leaves)
        };
        log::debug!("snapshot of {} items to {response_topic}", leaves.len());
        publish(&runtime, response_topic, &Command::ItemCount(leaves.len()).encode());
        for (path, scalar) in leaves {
            let add = Command::Add {
                path,
                value: Value::Scalar(scalar),
            };
            publish(&runtime, response_topic, &add.encode());
        }
        let sync = Command::Sync {
            response_topic: response_topic.to_string(),
        }
        .encode();
        publish(&runtime, response_topic, &sync);
        publish(&runtime, &state_topic, &sync);
    }

    fn service(&self) -> String {
        self.inner.borrow().service.clone()
    }
}

fn publish(runtime: &Runtime, topic: &str, payload: &str) {
    if let Err(err) = runtime.publish(topic, payload) {
        log::warn!("publish to {topic} failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBroker;
    use crate::clock::ManualClock;
    use crate::config::RuntimeConfig;
    use std::sync::Arc;

    struct Fixture {
        _broker: LoopbackBroker,
        clock: ManualClock,
        runtime: Runtime,
        wire: Rc<RefCell<Vec<String>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let broker = LoopbackBroker::new();
            let clock = ManualClock::new();
            let runtime = Runtime::with_clock(
                RuntimeConfig::default(),
                &broker,
                Arc::new(clock.clone()),
            )
            .unwrap();
            let wire = Rc::new(RefCell::new(Vec::new()));
            {
                let wire = Rc::clone(&wire);
                runtime
                    .add_message_handler("#", move |topic: &str, payload: &str| {
                        if !topic.ends_with("/control") {
                            wire.borrow_mut().push(format!("{topic} {payload}"));
                        }
                    })
                    .unwrap();
            }
            runtime.scheduler().run_once();
            Self {
                _broker: broker,
                clock,
                runtime,
                wire,
            }
        }

        fn step(&self) -> Vec<String> {
            self.runtime.scheduler().run_once();
            self.wire.borrow_mut().drain(..).collect()
        }

        fn control(&self, payload: &str) {
            self.runtime.publish("aiko/svc/control", payload).unwrap();
        }
    }

    fn producer(fixture: &Fixture) -> Producer {
        let share: Share = [("lifecycle", Value::from("ready"))].into_iter().collect();
        Producer::new(&fixture.runtime, "svc", share).unwrap()
    }

    #[test]
    fn update_broadcasts_and_notifies_every_change() {
        let fixture = Fixture::new();
        let producer = producer(&fixture);
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = Rc::clone(&seen);
            producer.add_handler(move |kind, path: &str, value: Option<&Value>| {
                seen.borrow_mut().push(format!("{kind} {path} {value:?}"))
            });
        }

        producer.update("stats.count", 2).unwrap();
        producer.remove("lifecycle").unwrap();
        producer.remove("lifecycle").unwrap();

        assert_eq!(
            fixture.step(),
            vec![
                "aiko/svc/state (update stats.count 2)",
                "aiko/svc/state (remove lifecycle)",
                "aiko/svc/state (remove lifecycle)",
            ]
        );
        assert_eq!(
            *seen.borrow(),
            vec![
                "update stats.count Some(Scalar(Int(2)))",
                "remove lifecycle None",
                "remove lifecycle None",
            ]
        );
        assert_eq!(producer.get("lifecycle").unwrap(), None);
    }

    #[test]
    fn invalid_path_is_not_broadcast() {
        let fixture = Fixture::new();
        let producer = producer(&fixture);
        let err = producer.update("a.b.c", 1).unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
        assert!(fixture.step().is_empty());
        assert_eq!(producer.share().len(), 1);
    }

    #[test]
    fn share_request_runs_handshake() {
        let fixture = Fixture::new();
        let producer = producer(&fixture);
        producer.update("stats.count", 2).unwrap();
        fixture.step();

        fixture.control("(share aiko/c/in 5 *)");
        assert_eq!(
            fixture.step(),
            vec![
                "aiko/c/in (item_count 2)",
                "aiko/c/in (add lifecycle ready)",
                "aiko/c/in (add stats.count 2)",
                "aiko/c/in (sync aiko/c/in)",
                "aiko/svc/state (sync aiko/c/in)",
            ]
        );
        assert_eq!(
            producer.subscriptions(),
            vec![SubscriptionInfo {
                response_topic: "aiko/c/in".to_string(),
                filter: Filter::All,
                lease: Duration::from_secs(5),
            }]
        );
    }

    #[test]
    fn deltas_forwarded_by_filter() {
        let fixture = Fixture::new();
        let producer = producer(&fixture);
        fixture.control("(share aiko/a/in 60 (stats))");
        fixture.control("(share aiko/b/in 60 (lifecycle))");
        fixture.step();

        producer.update("stats.count", 1).unwrap();
        producer.update("lifecycle", "busy").unwrap();
        assert_eq!(
            fixture.step(),
            vec![
                "aiko/svc/state (update stats.count 1)",
                "aiko/a/in (update stats.count 1)",
                "aiko/svc/state (update lifecycle busy)",
                "aiko/b/in (update lifecycle busy)",
            ]
        );
    }

    #[test]
    fn control_changes_echo_raw_payload() {
        let fixture = Fixture::new();
        let producer = producer(&fixture);
        fixture.control("(add   mode  \"5\")");
        assert_eq!(fixture.step(), vec!["aiko/svc/state (add   mode  \"5\")"]);
        assert_eq!(producer.get("mode").unwrap(), Some(Value::from("5")));

        fixture.control("(update a.b.c 1)");
        fixture.control("(nonsense");
        assert!(fixture.step().is_empty());
    }

    #[test]
    fn lease_expiry_drops_subscription() {
        let fixture = Fixture::new();
        let producer = producer(&fixture);
        fixture.control("(share aiko/c/in 5 *)");
        fixture.step();

        fixture.clock.advance(Duration::from_secs(4));
        fixture.control("(share aiko/c/in 5 *)");
        fixture.step();
        fixture.clock.advance(Duration::from_secs(4));
        fixture.step();
        assert_eq!(producer.subscriptions().len(), 1);

        fixture.clock.advance(Duration::from_secs(1));
        fixture.step();
        assert!(producer.subscriptions().is_empty());
        producer.update("lifecycle", "busy").unwrap();
        assert_eq!(fixture.step(), vec!["aiko/svc/state (update lifecycle busy)"]);
    }

    #[test]
    fn zero_lease_cancels_or_snapshots_once() {
        let fixture = Fixture::new();
        let producer = producer(&fixture);
        fixture.control("(share aiko/c/in 0 *)");
        assert_eq!(
            fixture.step(),
            vec![
                "aiko/c/in (item_count 1)",
                "aiko/c/in (add lifecycle ready)",
                "aiko/c/in (sync aiko/c/in)",
                "aiko/svc/state (sync aiko/c/in)",
            ]
        );
        assert!(producer.subscriptions().is_empty());

        fixture.control("(share aiko/c/in 30 *)");
        fixture.step();
        fixture.control("(share aiko/c/in 0 *)");
        assert!(fixture.step().is_empty());
        assert!(producer.subscriptions().is_empty());
        assert_eq!(fixture.runtime.scheduler().handler_count(), 2);
    }

    #[test]
    fn close_stops_control_handling() {
        let fixture = Fixture::new();
        let producer = producer(&fixture);
        fixture.control("(share aiko/c/in 30 *)");
        fixture.step();
        producer.close();
        assert!(producer.subscriptions().is_empty());
        fixture.control("(update lifecycle busy)");
        assert!(fixture.step().is_empty());
        assert_eq!(producer.get("lifecycle").unwrap(), Some(Value::from("ready")));
    }
}
