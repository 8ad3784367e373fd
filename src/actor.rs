//! Named actors with mailbox dispatch.
//!
//! An actor is a scheduler mailbox plus a table of command handlers. Messages
//! reach it three ways: [`Actor::post`] on the scheduler thread,
//! [`ActorRef::send`] from any thread, and `(command arg ...)` payloads
//! published to `{namespace}/{name}/in`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::protocol::Expr;
use crate::runtime::Runtime;
use crate::scheduler::{HandlerId, Message, SchedulerHandle};
use crate::{Error, Result};

type CommandFn = Rc<RefCell<dyn FnMut(&Message)>>;

struct ActorInner {
    runtime: Runtime,
    name: String,
    topic: String,
    commands: RefCell<HashMap<String, CommandFn>>,
    topic_handler: RefCell<Option<HandlerId>>,
}

impl ActorInner {
    fn dispatch(&self, message: Message) {
        let handler = self.commands.borrow().get(&message.command).cloned();
        match handler {
            Some(handler) => (&mut *handler.borrow_mut())(&message),
            None => log::debug!("actor {}: no handler for {}", self.name, message.command),
        }
    }

    fn close(&self) {
        if let Some(id) = self.topic_handler.borrow_mut().take() {
            self.runtime.remove_message_handler(id);
            self.runtime.scheduler().remove_mailbox(&self.name);
            log::debug!("actor {} closed", self.name);
        }
    }
}

impl Drop for ActorInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Scheduler-thread handle to an actor. Clones share the same actor.
#[derive(Clone)]
pub struct Actor {
    inner: Rc<ActorInner>,
}

impl Actor {
    /// Registers mailbox `name` and subscribes the actor's inbound topic.
    ///
    /// # Errors
    ///
    /// `Error::DuplicateMailbox` if `name` is already a mailbox on this
    /// runtime, or a bus error from subscribing.
    pub fn new(runtime: &Runtime, name: &str) -> Result<Self> {
        let topic = runtime.service_topics(name).inbound();
        let inner = Rc::new(ActorInner {
            runtime: runtime.clone(),
            name: name.to_string(),
            topic: topic.clone(),
            commands: RefCell::new(HashMap::new()),
            topic_handler: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        runtime.scheduler().add_mailbox(name, move |message: Message| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(message);
            }
        })?;

        let handle = runtime.remote();
        let target = name.to_string();
        let subscribed = runtime.add_message_handler(&topic, move |_topic: &str, payload: &str| {
            match decode_message(&target, payload) {
                Ok(message) => {
                    if let Err(err) = handle.mailbox_put(&target, message) {
                        log::warn!("actor {target}: {err}");
                    }
                }
                Err(err) => log::warn!("actor {target}: bad message: {err}"),
            }
        });
        match subscribed {
            Ok(id) => *inner.topic_handler.borrow_mut() = Some(id),
            Err(err) => {
                runtime.scheduler().remove_mailbox(name);
                return Err(err);
            }
        }
        log::info!("actor {name} listening on {topic}");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Sets the handler for `command`, replacing any previous one.
    pub fn on(&self, command: &str, handler: impl FnMut(&Message) + 'static) {
        self.inner
            .commands
            .borrow_mut()
            .insert(command.to_string(), Rc::new(RefCell::new(handler)));
    }

    /// Queues a message for this actor.
    pub fn post(&self, command: &str, args: Vec<String>) -> Result<()> {
        self.inner.runtime.scheduler().mailbox_put(
            &self.inner.name,
            Message::new(&self.inner.name, command, args),
        )
    }

    pub fn actor_ref(&self) -> ActorRef {
        ActorRef {
            name: self.inner.name.clone(),
            scheduler: self.inner.runtime.remote(),
        }
    }

    /// Drops the mailbox and the topic subscription. Idempotent.
    pub fn close(&self) {
        self.inner.close()
    }
}

/// Thread-safe address of an [`Actor`].
#[derive(Clone)]
pub struct ActorRef {
    name: String,
    scheduler: SchedulerHandle,
}

impl ActorRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// # Errors
    ///
    /// `Error::UnknownMailbox` once the actor is closed.
    pub fn send(&self, command: &str, args: Vec<String>) -> Result<()> {
        self.scheduler
            .mailbox_put(&self.name, Message::new(&self.name, command, args))
    }
}

/// Wire form of an actor message: `(command arg ...)`.
pub fn encode_message(command: &str, args: &[String]) -> String {
    let mut items = vec![Expr::text(command)];
    items.extend(args.iter().map(|arg| Expr::text(arg)));
    Expr::List(items).to_string()
}

/// Parses `(command arg ...)`. Nested list arguments are kept as their text.
pub fn decode_message(target: &str, payload: &str) -> Result<Message> {
    let expr = crate::protocol::sexp::parse(payload)?;
    let items = expr
        .as_list()
        .ok_or_else(|| Error::Codec(format!("actor message must be a list: {payload:?}")))?;
    let (command, args) = items
        .split_first()
        .ok_or_else(|| Error::Codec(format!("empty actor message: {payload:?}")))?;
    let command = command
        .as_text()
        .ok_or_else(|| Error::Codec(format!("command must be text: {payload:?}")))?;
    let args = args
        .iter()
        .map(|arg| match arg.as_text() {
            Some(text) => text.to_string(),
            None => arg.to_string(),
        })
        .collect();
    Ok(Message::new(target, command, args))
}
