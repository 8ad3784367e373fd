//! Per-process runtime handle.
//!
//! A [`Runtime`] ties one [`Scheduler`] to one connected [`MessageBus`]. It
//! owns the privileged `message` mailbox that every inbound bus message lands
//! in, routes each message to the handlers registered for its topic, and fans
//! transport connection changes out to connection handlers.
//!
//! Components (actors, EC producers and consumers) take a `&Runtime` at
//! construction instead of reaching for process globals.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crate::bus::{
    topic_matches, BusConnector, BusSink, ConnectionState, MessageBus, ServiceTopics,
    CONNECTION_KIND, MESSAGE_MAILBOX,
};
use crate::clock::{Clock, QuantaClock};
use crate::config::RuntimeConfig;
use crate::scheduler::{HandlerId, Message, QueueItem, Scheduler, SchedulerHandle, SchedulerOptions};
use crate::{Error, Result};

type TopicFn = Rc<RefCell<dyn FnMut(&str, &str)>>;
type ConnectionFn = Rc<RefCell<dyn FnMut(ConnectionState)>>;

struct TopicHandler {
    id: HandlerId,
    topic: String,
    handler: TopicFn,
}

/// Routing tables shared between the runtime handle and its mailbox and
/// queue handlers.
struct Dispatch {
    bus: Arc<dyn MessageBus>,
    topics: RefCell<Vec<TopicHandler>>,
    connection_handlers: RefCell<Vec<(HandlerId, ConnectionFn)>>,
    connected: Cell<bool>,
    next_id: Cell<u64>,
}

impl Dispatch {
    fn next_id(&self) -> HandlerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        HandlerId(id)
    }

    fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .borrow()
            .iter()
            .map(|entry| entry.topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    fn route(&self, scheduler: &Scheduler, message: Message) {
        let Some(payload) = message.args.first() else {
            log::warn!("bus message on {} without payload", message.target);
            return;
        };
        let handlers: Vec<TopicFn> = self
            .topics
            .borrow()
            .iter()
            .filter(|entry| topic_matches(&entry.topic, &message.target))
            .map(|entry| Rc::clone(&entry.handler))
            .collect();
        if handlers.is_empty() {
            log::debug!("no handler for topic {}", message.target);
        }
        for handler in handlers {
            scheduler.guarded(&message.target, || {
                (&mut *handler.borrow_mut())(&message.target, payload)
            });
        }
    }

    fn connection_changed(&self, scheduler: &Scheduler, state: ConnectionState) {
        let connected = state == ConnectionState::Connected;
        if self.connected.replace(connected) == connected {
            return;
        }
        log::info!("transport {state:?}");
        if connected {
            for topic in self.subscribed_topics() {
                if let Err(err) = self.bus.subscribe(&topic) {
                    log::warn!("resubscribe {topic} failed: {err}");
                }
            }
        }
        let handlers: Vec<ConnectionFn> = self
            .connection_handlers
            .borrow()
            .iter()
            .map(|(_, handler)| Rc::clone(handler))
            .collect();
        for handler in handlers {
            scheduler.guarded("connection", || (&mut *handler.borrow_mut())(state));
        }
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    scheduler: Scheduler,
    dispatch: Rc<Dispatch>,
    connection_queue: HandlerId,
    closed: Cell<bool>,
}

impl RuntimeInner {
    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        for topic in self.dispatch.subscribed_topics() {
            if let Err(err) = self.dispatch.bus.unsubscribe(&topic) {
                log::debug!("unsubscribe {topic} on close: {err}");
            }
        }
        let topics = std::mem::take(&mut *self.dispatch.topics.borrow_mut());
        let connection_handlers =
            std::mem::take(&mut *self.dispatch.connection_handlers.borrow_mut());
        self.scheduler.remove_mailbox(MESSAGE_MAILBOX);
        self.scheduler.remove_queue_handler(self.connection_queue);
        self.scheduler.terminate();
        drop(topics);
        drop(connection_handlers);
        log::info!("runtime {} closed", self.config.namespace);
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to a process runtime. Clones share the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Builds a runtime on a fresh scheduler and connects it to the bus.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the configuration does not validate, or whatever
    /// the connector reports.
    pub fn new(config: RuntimeConfig, connector: &dyn BusConnector) -> Result<Self> {
        Self::with_clock(config, connector, Arc::new(QuantaClock::new()))
    }

    /// Like [`Runtime::new`], with the scheduler measuring time on `clock`.
    pub fn with_clock(
        config: RuntimeConfig,
        connector: &dyn BusConnector,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::with_clock(SchedulerOptions::from(&config), clock);
        let bus = connector.connect(BusSink::new(scheduler.handle()))?;
        let dispatch = Rc::new(Dispatch {
            bus,
            topics: RefCell::new(Vec::new()),
            connection_handlers: RefCell::new(Vec::new()),
            connected: Cell::new(false),
            next_id: Cell::new(0),
        });

        {
            let dispatch = Rc::clone(&dispatch);
            let router = scheduler.clone();
            scheduler.add_mailbox(MESSAGE_MAILBOX, move |message: Message| {
                dispatch.route(&router, message)
            })?;
        }
        let connection_queue = {
            let dispatch = Rc::clone(&dispatch);
            let router = scheduler.clone();
            scheduler.add_queue_handler(CONNECTION_KIND, move |item: &QueueItem| {
                match item.downcast_ref::<ConnectionState>() {
                    Some(state) => dispatch.connection_changed(&router, *state),
                    None => log::warn!("connection item with unexpected payload"),
                }
            })
        };
        log::info!("runtime {} started", config.namespace);

        Ok(Self {
            inner: Rc::new(RuntimeInner {
                config,
                scheduler,
                dispatch,
                connection_queue,
                closed: Cell::new(false),
            }),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Thread-safe handle for worker threads.
    pub fn remote(&self) -> SchedulerHandle {
        self.inner.scheduler.handle()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn service_topics(&self, service: &str) -> ServiceTopics {
        ServiceTopics::new(&self.inner.config.namespace, service)
    }

    /// # Errors
    ///
    /// `Error::Bus` when the runtime is closed or the transport refuses.
    pub fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::Bus(format!("runtime closed, cannot publish to {topic}")));
        }
        self.inner.dispatch.bus.publish(topic, payload)
    }

    /// Calls `handler(topic, payload)` for every inbound message whose topic
    /// matches `topic` (which may contain `+` or `#`). The first handler on a
    /// topic subscribes it on the bus.
    pub fn add_message_handler(
        &self,
        topic: &str,
        handler: impl FnMut(&str, &str) + 'static,
    ) -> Result<HandlerId> {
        let dispatch = &self.inner.dispatch;
        let first = !dispatch
            .topics
            .borrow()
            .iter()
            .any(|entry| entry.topic == topic);
        if first {
            dispatch.bus.subscribe(topic)?;
            log::debug!("subscribed {topic}");
        }
        let id = dispatch.next_id();
        dispatch.topics.borrow_mut().push(TopicHandler {
            id,
            topic: topic.to_string(),
            handler: Rc::new(RefCell::new(handler)),
        });
        Ok(id)
    }

    /// Removes a topic handler; the last handler on a topic unsubscribes it.
    pub fn remove_message_handler(&self, id: HandlerId) -> bool {
        let dispatch = &self.inner.dispatch;
        let removed = {
            let mut topics = dispatch.topics.borrow_mut();
            topics
                .iter()
                .position(|entry| entry.id == id)
                .map(|index| topics.remove(index))
        };
        let Some(removed) = removed else {
            return false;
        };
        let last = !dispatch
            .topics
            .borrow()
            .iter()
            .any(|entry| entry.topic == removed.topic);
        if last && !self.inner.closed.get() {
            if let Err(err) = dispatch.bus.unsubscribe(&removed.topic) {
                log::warn!("unsubscribe {} failed: {err}", removed.topic);
            }
        }
        true
    }

    /// Calls `handler` whenever the transport connects or disconnects.
    pub fn add_connection_handler(
        &self,
        handler: impl FnMut(ConnectionState) + 'static,
    ) -> HandlerId {
        let dispatch = &self.inner.dispatch;
        let id = dispatch.next_id();
        dispatch
            .connection_handlers
            .borrow_mut()
            .push((id, Rc::new(RefCell::new(handler))));
        id
    }

    pub fn remove_connection_handler(&self, id: HandlerId) -> bool {
        let removed = {
            let mut handlers = self.inner.dispatch.connection_handlers.borrow_mut();
            handlers
                .iter()
                .position(|(handler_id, _)| *handler_id == id)
                .map(|index| handlers.remove(index))
        };
        removed.is_some()
    }

    /// Connection state as last observed on the scheduler thread.
    pub fn is_connected(&self) -> bool {
        self.inner.dispatch.connected.get()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Runs the scheduler loop on the calling thread.
    pub fn run(&self) -> Result<()> {
        self.inner.scheduler.run()
    }

    /// Unsubscribes everything, drops all handlers and stops the loop.
    /// Idempotent.
    pub fn close(&self) {
        self.inner.close()
    }
}
