//! Reader side of EC replication.
//!
//! A consumer keeps a filtered mirror of one producer's share. While the
//! transport is up it holds a self-renewing [`Lease`]; every renewal (and a
//! lapse, should the loop ever stall past the lease) re-sends the `share`
//! request, so a lost request only delays the mirror.
//!
//! State machine:
//!
//! ```text
//! Unleased ──connected──▶ AwaitingSnapshot ──item_count N + N adds──▶ Ready
//!     ▲                          │    ▲                                 │
//!     └────────disconnected──────┘    └──────────item_count────────────┘
//! ```

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

use super::producer::ChangeFn;
use super::{ChangeKind, Filter, Share, Value};
use crate::bus::ConnectionState;
use crate::lease::{Lease, LeaseOptions};
use crate::protocol::Command;
use crate::runtime::Runtime;
use crate::scheduler::HandlerId;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unleased,
    AwaitingSnapshot,
    Ready,
}

#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    /// Paths to mirror.
    /// Default: `*`
    pub filter: Filter,
    /// Lease requested from the producer. Must be > 0.
    /// Default: `RuntimeConfig::ec_lease_seconds`
    pub lease_seconds: Option<u64>,
    /// Topic the producer answers on.
    /// Default: `{namespace}/{name}/in`
    pub response_topic: Option<String>,
}

impl ConsumerOptions {
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn lease_seconds(mut self, seconds: u64) -> Self {
        self.lease_seconds = Some(seconds);
        self
    }

    pub fn response_topic(mut self, topic: impl Into<String>) -> Self {
        self.response_topic = Some(topic.into());
        self
    }
}

/// Snapshot progress for the current lease.
#[derive(Debug, Default)]
struct Snapshot {
    /// `None` until the first `item_count` arrives.
    expected: Option<usize>,
    received: usize,
    paths: BTreeSet<String>,
}

type Event = (ChangeKind, String, Option<Value>);

struct ConsumerInner {
    runtime: Runtime,
    name: String,
    control_topic: String,
    response_topic: String,
    filter: Filter,
    lease_seconds: u64,
    state: ConsumerState,
    mirror: Share,
    snapshot: Snapshot,
    lease: Option<Lease>,
    handlers: Vec<ChangeFn>,
    inbound_handler: Option<HandlerId>,
    connection_handler: Option<HandlerId>,
}

impl ConsumerInner {
    fn share_request(&self, lease_seconds: u64) -> (Runtime, String, String) {
        let command = Command::Share {
            response_topic: self.response_topic.clone(),
            lease_seconds,
            filter: self.filter.clone(),
        };
        (self.runtime.clone(), self.control_topic.clone(), command.encode())
    }

    /// Applies one change to the mirror, returning the event to report.
    fn apply(&mut self, kind: ChangeKind, path: &str, value: Option<Value>) -> Option<Event> {
        let outcome = match &value {
            Some(value) => self.mirror.update(path, value.clone()),
            None => self.mirror.remove(path).map(|_| ()),
        };
        match outcome {
            Ok(()) => Some((kind, path.to_string(), value)),
            Err(err) => {
                log::warn!("ec consumer {}: dropping {kind}: {err}", self.name);
                None
            }
        }
    }

    /// Marks the snapshot complete and prunes mirrored leaves the snapshot
    /// no longer contains.
    fn complete_snapshot(&mut self, events: &mut Vec<Event>) {
        self.state = ConsumerState::Ready;
        let stale: Vec<String> = self
            .mirror
            .leaves()
            .into_iter()
            .map(|(path, _)| path)
            .filter(|path| self.filter.matches(path) && !self.snapshot.paths.contains(path))
            .collect();
        for path in stale {
            events.extend(self.apply(ChangeKind::Remove, &path, None));
        }
        log::debug!(
            "ec consumer {} ready with {} items",
            self.name,
            self.snapshot.received
        );
    }

    fn ingest(&mut self, command: Command, events: &mut Vec<Event>) {
        if self.state == ConsumerState::Unleased {
            log::debug!("ec consumer {}: unleased, dropping {}", self.name, command.name());
            return;
        }
        match command {
            Command::ItemCount(count) => {
                self.snapshot = Snapshot {
                    expected: Some(count),
                    ..Snapshot::default()
                };
                self.state = ConsumerState::AwaitingSnapshot;
                if count == 0 {
                    self.complete_snapshot(events);
                }
            }
            Command::Sync { response_topic } => {
                events.push((ChangeKind::Sync, response_topic, None));
            }
            Command::Add { path, value } if self.state == ConsumerState::AwaitingSnapshot => {
                // Before item_count nothing is expected yet.
                let expected = self.snapshot.expected.unwrap_or(0);
                if self.snapshot.received >= expected {
                    let overrun = Error::SnapshotOverrun { expected };
                    log::warn!("ec consumer {}: {overrun}, dropped add {path}", self.name);
                    return;
                }
                self.snapshot.received += 1;
                events.extend(self.apply(ChangeKind::Add, &path, Some(value)));
                self.snapshot.paths.insert(path);
                if self.snapshot.received == expected {
                    self.complete_snapshot(events);
                }
            }
            Command::Add { path, value } => {
                events.extend(self.apply(ChangeKind::Add, &path, Some(value)));
            }
            Command::Update { path, value } => {
                if self.awaiting_count(&path) {
                    return;
                }
                events.extend(self.apply(ChangeKind::Update, &path, Some(value)));
            }
            Command::Remove { path } => {
                if self.awaiting_count(&path) {
                    return;
                }
                events.extend(self.apply(ChangeKind::Remove, &path, None));
            }
            Command::Share { .. } => {
                log::debug!("ec consumer {}: ignoring share", self.name);
            }
        }
    }

    fn awaiting_count(&self, path: &str) -> bool {
        let waiting = self.snapshot.expected.is_none();
        if waiting {
            log::debug!("ec consumer {}: {path} before item_count, dropped", self.name);
        }
        waiting
    }
}

impl Drop for ConsumerInner {
    fn drop(&mut self) {
        if let Some(id) = self.inbound_handler.take() {
            self.runtime.remove_message_handler(id);
        }
        if let Some(id) = self.connection_handler.take() {
            self.runtime.remove_connection_handler(id);
        }
    }
}

/// Handle to an EC consumer. Clones share the same consumer.
#[derive(Clone)]
pub struct Consumer {
    inner: Rc<RefCell<ConsumerInner>>,
}

impl Consumer {
    /// Starts mirroring `producer`'s share on behalf of service `name`.
    ///
    /// The `share` request goes out as soon as the transport is connected.
    pub fn new(
        runtime: &Runtime,
        name: &str,
        producer: &str,
        options: ConsumerOptions,
    ) -> Result<Self> {
        let response_topic = options
            .response_topic
            .unwrap_or_else(|| runtime.service_topics(name).inbound());
        let lease_seconds = options
            .lease_seconds
            .unwrap_or(runtime.config().ec_lease_seconds);
        if lease_seconds == 0 {
            return Err(Error::Config(format!(
                "ec consumer {name}: lease_seconds must be > 0"
            )));
        }
        let inner = Rc::new(RefCell::new(ConsumerInner {
            runtime: runtime.clone(),
            name: name.to_string(),
            control_topic: runtime.service_topics(producer).control(),
            response_topic: response_topic.clone(),
            filter: options.filter,
            lease_seconds,
            state: ConsumerState::Unleased,
            mirror: Share::new(),
            snapshot: Snapshot::default(),
            lease: None,
            handlers: Vec::new(),
            inbound_handler: None,
            connection_handler: None,
        }));

        let weak = Rc::downgrade(&inner);
        let inbound = runtime.add_message_handler(&response_topic, move |_topic: &str, payload: &str| {
            if let Some(inner) = weak.upgrade() {
                Consumer { inner }.ingest(payload);
            }
        })?;
        let weak = Rc::downgrade(&inner);
        let connection = runtime.add_connection_handler(move |state| {
            if let Some(inner) = weak.upgrade() {
                Consumer { inner }.connection_changed(state);
            }
        });
        {
            let mut state = inner.borrow_mut();
            state.inbound_handler = Some(inbound);
            state.connection_handler = Some(connection);
        }
        log::info!("ec consumer {name} following {producer} on {response_topic}");

        let consumer = Self { inner };
        if runtime.is_connected() {
            consumer.start_lease();
        }
        Ok(consumer)
    }

    /// Registers `handler(kind, path, value)`, called for every change applied
    /// to the mirror and for every `sync` marker.
    pub fn add_handler(&self, handler: impl FnMut(ChangeKind, &str, Option<&Value>) + 'static) {
        self.inner
            .borrow_mut()
            .handlers
            .push(Rc::new(RefCell::new(handler)));
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.borrow().state
    }

    /// A copy of the mirrored share.
    pub fn mirror(&self) -> Share {
        self.inner.borrow().mirror.clone()
    }

    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        self.inner.borrow().mirror.get(path)
    }

    pub fn response_topic(&self) -> String {
        self.inner.borrow().response_topic.clone()
    }

    pub fn is_leased(&self) -> bool {
        self.inner
            .borrow()
            .lease
            .as_ref()
            .is_some_and(Lease::is_active)
    }

    /// Stops following the producer: drops the inbound handler, clears the
    /// mirror, cancels the lease and asks the producer to drop the
    /// subscription. The request is best effort.
    pub fn terminate(&self) {
        let (runtime, handlers, lease, request) = {
            let mut inner = self.inner.borrow_mut();
            inner.mirror.clear();
            inner.snapshot = Snapshot::default();
            inner.state = ConsumerState::Unleased;
            let handlers = (inner.inbound_handler.take(), inner.connection_handler.take());
            let request = inner.share_request(0);
            (inner.runtime.clone(), handlers, inner.lease.take(), request)
        };
        if let Some(id) = handlers.0 {
            runtime.remove_message_handler(id);
        }
        if let Some(id) = handlers.1 {
            runtime.remove_connection_handler(id);
        }
        if let Some(lease) = lease {
            lease.terminate();
        }
        send(request);
        log::info!("ec consumer {} terminated", self.inner.borrow().name);
    }

    fn connection_changed(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                if !self.is_leased() {
                    self.start_lease();
                }
            }
            ConnectionState::Disconnected => {
                let lease = {
                    let mut inner = self.inner.borrow_mut();
                    inner.state = ConsumerState::Unleased;
                    inner.snapshot = Snapshot::default();
                    inner.lease.take()
                };
                if let Some(lease) = lease {
                    lease.terminate();
                }
                log::info!("ec consumer {} unleased", self.inner.borrow().name);
            }
        }
    }

    fn start_lease(&self) {
        let (scheduler, duration, factor, topic) = {
            let inner = self.inner.borrow();
            (
                inner.runtime.scheduler().clone(),
                Duration::from_secs(inner.lease_seconds),
                inner.runtime.config().lease_extend_factor,
                inner.response_topic.clone(),
            )
        };
        let on_expire = {
            let weak = Rc::downgrade(&self.inner);
            move |_: &str| {
                if let Some(inner) = weak.upgrade() {
                    Consumer { inner }.lease_lapsed();
                }
            }
        };
        let on_extend = {
            let weak = Rc::downgrade(&self.inner);
            move |_: &str| {
                if let Some(inner) = weak.upgrade() {
                    send(inner.borrow().share_request(inner.borrow().lease_seconds));
                }
            }
        };
        let lease = Lease::with_options(
            &scheduler,
            duration,
            topic,
            LeaseOptions::auto_extend(factor),
            on_expire,
            Some(Box::new(on_extend)),
        );
        let request = {
            let mut inner = self.inner.borrow_mut();
            inner.lease = Some(lease);
            inner.state = ConsumerState::AwaitingSnapshot;
            inner.snapshot = Snapshot::default();
            inner.share_request(inner.lease_seconds)
        };
        send(request);
    }

    fn lease_lapsed(&self) {
        let connected = {
            let mut inner = self.inner.borrow_mut();
            inner.lease = None;
            inner.runtime.is_connected()
        };
        log::warn!("ec consumer {} lease lapsed", self.inner.borrow().name);
        if connected {
            self.start_lease();
        } else {
            self.inner.borrow_mut().state = ConsumerState::Unleased;
        }
    }

    fn ingest(&self, payload: &str) {
        let command = match Command::decode(payload) {
            Ok(command) => command,
            Err(err) => {
                log::warn!("ec consumer {}: bad payload: {err}", self.inner.borrow().name);
                return;
            }
        };
        let mut events = Vec::new();
        let handlers = {
            let mut inner = self.inner.borrow_mut();
            inner.ingest(command, &mut events);
            inner.handlers.clone()
        };
        if events.is_empty() {
            return;
        }
        let runtime = self.inner.borrow().runtime.clone();
        for (kind, path, value) in &events {
            for handler in &handlers {
                runtime.scheduler().guarded("ec consumer handler", || {
                    (&mut *handler.borrow_mut())(*kind, path.as_str(), value.as_ref())
                });
            }
        }
    }
}

fn send((runtime, topic, payload): (Runtime, String, String)) {
    if let Err(err) = runtime.publish(&topic, &payload) {
        log::warn!("share request to {topic} failed: {err}");
    }
}
