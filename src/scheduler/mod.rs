//! Single-threaded, non-preemptive event loop.
//!
//! All timers, mailboxes, queue handlers and flatout handlers run on the thread
//! that drives [`Scheduler::run`]. Work from other threads enters only through
//! a [`SchedulerHandle`] (`mailbox_put`, `queue_put`, `terminate`).
//!
//! # Iteration
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ 1. due timers, by (next_fire, registration)             │
//! │ 2. generic queue, fanned out per item kind              │
//! │ 3. mailboxes, privileged first and preferred            │
//! │ 4. flatout handlers, once each                          │
//! │ 5. park for loop_period - flatout time (wakes on put)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Every handler call is wrapped in `catch_unwind`. A panicking handler is
//! logged and counted; the loop keeps going, because the loop dying would stop
//! every lease and keepalive in the process.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use aiko::scheduler::{Message, Scheduler, SchedulerOptions};
//!
//! let scheduler = Scheduler::new(SchedulerOptions::default());
//! let stopper = scheduler.clone();
//! scheduler.add_mailbox("jobs", move |message: Message| {
//!     if message.command == "stop" {
//!         stopper.terminate();
//!     }
//! })?;
//!
//! let handle = scheduler.handle();
//! std::thread::spawn(move || {
//!     std::thread::sleep(Duration::from_millis(5));
//!     handle.mailbox_put("jobs", Message::new("jobs", "stop", Vec::new()))
//! });
//! scheduler.run()?;
//! # Ok::<(), aiko::Error>(())
//! ```

mod mailbox;
mod park;
mod queue;
mod timer;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, QuantaClock};
use crate::config::RuntimeConfig;
use crate::{Error, Result};

pub use mailbox::{MailboxStats, Message};
pub use queue::QueueItem;
pub use timer::TimerId;

use mailbox::MailboxQueue;
use park::Parker;
use timer::{period_ns, Timer, TimerList};

type MailboxFn = Rc<RefCell<dyn FnMut(Message)>>;
type QueueFn = Rc<RefCell<dyn FnMut(&QueueItem)>>;
type FlatoutFn = Rc<RefCell<dyn FnMut()>>;

/// Identifies a queue or flatout handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub iterations: u64,
    pub timer_fires: u64,
    pub queue_items: u64,
    pub messages: u64,
    pub flatout_runs: u64,
    pub panics: u64,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Upper bound on the sleep between iterations.
    pub loop_period: Duration,
    /// Keep looping with no registered handlers.
    pub allow_idle: bool,
    /// Maximum mailbox items handled per iteration.
    pub mailbox_drain_limit: usize,
    /// Mailbox depth that triggers a one-time warning.
    pub mailbox_high_water_warn: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for SchedulerOptions {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            loop_period: config.loop_period(),
            allow_idle: config.allow_idle,
            mailbox_drain_limit: config.mailbox_drain_limit,
            mailbox_high_water_warn: config.mailbox_high_water_warn,
        }
    }
}

/// State reachable from any thread.
struct Shared {
    clock: Arc<dyn Clock>,
    mailboxes: Mutex<HashMap<String, Arc<MailboxQueue>>>,
    queue: Mutex<VecDeque<QueueItem>>,
    enabled: AtomicBool,
    running: AtomicBool,
    parker: Parker,
    high_water_warn: usize,
}

impl Shared {
    fn mailbox_put(&self, name: &str, mut message: Message) -> Result<()> {
        message.posted_at = self.clock.now();
        let queue = match self.mailboxes.lock() {
            Ok(mailboxes) => mailboxes.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        }
        .ok_or_else(|| Error::UnknownMailbox(name.to_string()))?;
        if !queue.push(message, self.high_water_warn) {
            return Err(Error::UnknownMailbox(name.to_string()));
        }
        self.parker.unpark();
        Ok(())
    }

    fn queue_put(&self, mut item: QueueItem) {
        item.posted_at = self.clock.now();
        match self.queue.lock() {
            Ok(mut queue) => queue.push_back(item),
            Err(poisoned) => poisoned.into_inner().push_back(item),
        }
        self.parker.unpark();
    }

    fn terminate(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            log::info!("scheduler terminate requested");
        }
        self.parker.unpark();
    }

    fn take_queue(&self) -> Vec<QueueItem> {
        match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        }
    }
}

/// The thread-safe face of a [`Scheduler`].
///
/// Cheap to clone and `Send + Sync`; worker threads use it to hand results back
/// to the scheduler thread.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Appends `message` to the named mailbox.
    ///
    /// # Errors
    ///
    /// `Error::UnknownMailbox` if no mailbox with that name is registered.
    pub fn mailbox_put(&self, name: &str, message: Message) -> Result<()> {
        self.shared.mailbox_put(name, message)
    }

    pub fn queue_put(&self, item: QueueItem) {
        self.shared.queue_put(item)
    }

    /// Stops the loop at the top of its next iteration. Idempotent.
    pub fn terminate(&self) {
        self.shared.terminate()
    }

    pub fn now(&self) -> u64 {
        self.shared.clock.now()
    }
}

#[derive(Clone)]
struct MailboxEntry {
    name: String,
    queue: Arc<MailboxQueue>,
    handler: MailboxFn,
}

struct Local {
    next_id: u64,
    timers: TimerList,
    mailboxes: Vec<MailboxEntry>,
    queue_handlers: Vec<(HandlerId, String, QueueFn)>,
    flatouts: Vec<(HandlerId, FlatoutFn)>,
    stats: SchedulerStats,
    options: SchedulerOptions,
}

impl Local {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Scheduler-thread handle. Clones share one loop.
#[derive(Clone)]
pub struct Scheduler {
    local: Rc<RefCell<Local>>,
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self::with_clock(options, Arc::new(QuantaClock::new()))
    }

    pub fn with_clock(options: SchedulerOptions, clock: Arc<dyn Clock>) -> Self {
        let shared = Arc::new(Shared {
            clock,
            mailboxes: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(true),
            running: AtomicBool::new(false),
            parker: Parker::default(),
            high_water_warn: options.mailbox_high_water_warn,
        });
        let local = Rc::new(RefCell::new(Local {
            next_id: 0,
            timers: TimerList::default(),
            mailboxes: Vec::new(),
            queue_handlers: Vec::new(),
            flatouts: Vec::new(),
            stats: SchedulerStats::default(),
            options,
        }));
        Self { local, shared }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current scheduler clock reading in nanoseconds.
    pub fn now(&self) -> u64 {
        self.shared.clock.now()
    }

    /// Registers a periodic timer that first fires `period` from now.
    ///
    /// One-shot timers remove themselves from inside their handler.
    pub fn add_timer(&self, period: Duration, handler: impl FnMut() + 'static) -> TimerId {
        let period_ns = period_ns(period);
        let next_fire = self.now().saturating_add(period_ns);
        let mut local = self.local.borrow_mut();
        let id = TimerId(local.next_id());
        local.timers.insert(Timer {
            id,
            period_ns,
            next_fire,
            handler: Rc::new(RefCell::new(handler)),
        });
        id
    }

    /// Returns false if the timer was not registered.
    pub fn remove_timer(&self, id: TimerId) -> bool {
        // Dropped outside the borrow: a handler's captures may remove timers too.
        let removed = self.local.borrow_mut().timers.remove(id);
        removed.is_some()
    }

    pub fn has_timer(&self, id: TimerId) -> bool {
        self.local.borrow().timers.contains(id)
    }

    /// Registers a named mailbox. The first mailbox registered is privileged.
    ///
    /// # Errors
    ///
    /// `Error::DuplicateMailbox` if the name is taken.
    pub fn add_mailbox(&self, name: &str, handler: impl FnMut(Message) + 'static) -> Result<()> {
        let mut local = self.local.borrow_mut();
        if local.mailboxes.iter().any(|entry| entry.name == name) {
            return Err(Error::DuplicateMailbox(name.to_string()));
        }
        let queue = Arc::new(MailboxQueue::new(name));
        match self.shared.mailboxes.lock() {
            Ok(mut mailboxes) => mailboxes.insert(name.to_string(), Arc::clone(&queue)),
            Err(poisoned) => poisoned
                .into_inner()
                .insert(name.to_string(), Arc::clone(&queue)),
        };
        if local.mailboxes.is_empty() {
            log::debug!("mailbox {name} registered (privileged)");
        } else {
            log::debug!("mailbox {name} registered");
        }
        local.mailboxes.push(MailboxEntry {
            name: name.to_string(),
            queue,
            handler: Rc::new(RefCell::new(handler)),
        });
        Ok(())
    }

    /// Removes a mailbox and drops its pending messages. Unknown names are a no-op.
    pub fn remove_mailbox(&self, name: &str) -> bool {
        let removed = {
            let mut local = self.local.borrow_mut();
            local
                .mailboxes
                .iter()
                .position(|entry| entry.name == name)
                .map(|index| local.mailboxes.remove(index))
        };
        let Some(entry) = removed else {
            return false;
        };
        entry.queue.close();
        match self.shared.mailboxes.lock() {
            Ok(mut mailboxes) => mailboxes.remove(name),
            Err(poisoned) => poisoned.into_inner().remove(name),
        };
        true
    }

    pub fn mailbox_put(&self, name: &str, message: Message) -> Result<()> {
        self.shared.mailbox_put(name, message)
    }

    pub fn mailbox_stats(&self, name: &str) -> Option<MailboxStats> {
        self.local
            .borrow()
            .mailboxes
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.queue.stats())
    }

    pub fn privileged_mailbox(&self) -> Option<String> {
        self.local
            .borrow()
            .mailboxes
            .first()
            .map(|entry| entry.name.clone())
    }

    /// Registers a handler for queue items of `kind`. Several handlers may share a kind.
    pub fn add_queue_handler(
        &self,
        kind: &str,
        handler: impl FnMut(&QueueItem) + 'static,
    ) -> HandlerId {
        let mut local = self.local.borrow_mut();
        let id = HandlerId(local.next_id());
        local
            .queue_handlers
            .push((id, kind.to_string(), Rc::new(RefCell::new(handler))));
        id
    }

    pub fn remove_queue_handler(&self, id: HandlerId) -> bool {
        let removed = {
            let mut local = self.local.borrow_mut();
            local
                .queue_handlers
                .iter()
                .position(|(handler_id, _, _)| *handler_id == id)
                .map(|index| local.queue_handlers.remove(index))
        };
        removed.is_some()
    }

    pub fn queue_put(&self, item: QueueItem) {
        self.shared.queue_put(item)
    }

    /// Registers a handler that runs once every iteration.
    pub fn add_flatout_handler(&self, handler: impl FnMut() + 'static) -> HandlerId {
        let mut local = self.local.borrow_mut();
        let id = HandlerId(local.next_id());
        local.flatouts.push((id, Rc::new(RefCell::new(handler))));
        id
    }

    pub fn remove_flatout_handler(&self, id: HandlerId) -> bool {
        let removed = {
            let mut local = self.local.borrow_mut();
            local
                .flatouts
                .iter()
                .position(|(handler_id, _)| *handler_id == id)
                .map(|index| local.flatouts.remove(index))
        };
        removed.is_some()
    }

    pub fn handler_count(&self) -> usize {
        let local = self.local.borrow();
        local.timers.len()
            + local.mailboxes.len()
            + local.queue_handlers.len()
            + local.flatouts.len()
    }

    pub fn terminate(&self) {
        self.shared.terminate()
    }

    pub fn state(&self) -> SchedulerState {
        if self.shared.running.load(Ordering::Acquire) {
            SchedulerState::Running
        } else if !self.shared.enabled.load(Ordering::Acquire) {
            SchedulerState::Stopped
        } else {
            SchedulerState::Idle
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.local.borrow().stats
    }

    /// Runs the loop on the calling thread until terminated, or until no
    /// handlers remain and idling is not allowed.
    ///
    /// # Errors
    ///
    /// `Error::AlreadyRunning` if the loop is already being driven.
    pub fn run(&self) -> Result<()> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }
        let loop_period = self.local.borrow().options.loop_period;
        log::info!("scheduler loop started (period {loop_period:?})");

        while self.should_continue() {
            let flatout_time = self.iterate();
            if !self.should_continue() {
                break;
            }
            let mut sleep = loop_period.saturating_sub(flatout_time);
            let next_due = self.local.borrow().timers.next_due();
            if let Some(due) = next_due {
                sleep = sleep.min(Duration::from_nanos(due.saturating_sub(self.now())));
            }
            self.shared.parker.park_timeout(sleep);
        }

        self.shared.running.store(false, Ordering::Release);
        log::info!("scheduler loop exited ({:?})", self.state());
        Ok(())
    }

    /// Runs exactly one iteration without sleeping.
    pub fn run_once(&self) {
        self.iterate();
    }

    fn should_continue(&self) -> bool {
        if !self.shared.enabled.load(Ordering::Acquire) {
            return false;
        }
        self.local.borrow().options.allow_idle || self.handler_count() > 0
    }

    /// Returns the time spent in flatout handlers.
    fn iterate(&self) -> Duration {
        self.fire_timers();
        self.drain_queue();
        self.drain_mailboxes();
        let flatout_time = self.run_flatouts();
        self.local.borrow_mut().stats.iterations += 1;
        flatout_time
    }

    fn fire_timers(&self) {
        let now = self.now();
        loop {
            let due = self.local.borrow_mut().timers.pop_due(now);
            let Some((_id, handler)) = due else {
                break;
            };
            self.guarded("timer", || (&mut *handler.borrow_mut())());
            self.local.borrow_mut().stats.timer_fires += 1;
        }
    }

    fn drain_queue(&self) {
        for item in self.shared.take_queue() {
            let handlers: Vec<QueueFn> = self
                .local
                .borrow()
                .queue_handlers
                .iter()
                .filter(|(_, kind, _)| *kind == item.kind)
                .map(|(_, _, handler)| Rc::clone(handler))
                .collect();
            if handlers.is_empty() {
                log::debug!("queue item {} has no handler, dropped", item.kind);
            }
            for handler in handlers {
                self.guarded(&item.kind, || (&mut *handler.borrow_mut())(&item));
            }
            self.local.borrow_mut().stats.queue_items += 1;
        }
    }

    fn drain_mailboxes(&self) {
        let mut budget = self.local.borrow().options.mailbox_drain_limit;
        'drain: while budget > 0 {
            let entries = self.local.borrow().mailboxes.clone();
            let Some((privileged, others)) = entries.split_first() else {
                return;
            };
            if let Some(message) = privileged.queue.pop() {
                self.deliver(privileged, message);
                budget -= 1;
                continue;
            }
            let mut handled = false;
            for entry in others {
                if budget == 0 {
                    break 'drain;
                }
                if !privileged.queue.is_empty() {
                    continue 'drain;
                }
                if let Some(message) = entry.queue.pop() {
                    self.deliver(entry, message);
                    budget -= 1;
                    handled = true;
                }
            }
            if !handled {
                break;
            }
        }
    }

    fn deliver(&self, entry: &MailboxEntry, message: Message) {
        let handler = Rc::clone(&entry.handler);
        self.guarded(&entry.name, move || (&mut *handler.borrow_mut())(message));
        self.local.borrow_mut().stats.messages += 1;
    }

    fn run_flatouts(&self) -> Duration {
        let handlers: Vec<FlatoutFn> = self
            .local
            .borrow()
            .flatouts
            .iter()
            .map(|(_, handler)| Rc::clone(handler))
            .collect();
        if handlers.is_empty() {
            return Duration::ZERO;
        }
        let start = self.now();
        for handler in &handlers {
            self.guarded("flatout", || (&mut *handler.borrow_mut())());
        }
        self.local.borrow_mut().stats.flatout_runs += handlers.len() as u64;
        Duration::from_nanos(self.now().saturating_sub(start))
    }

    /// Runs `f`, containing any panic. Returns false if `f` panicked.
    pub(crate) fn guarded(&self, what: &str, f: impl FnOnce()) -> bool {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => true,
            Err(payload) => {
                let err = Error::HandlerPanic {
                    handler: what.to_string(),
                    message: panic_message(payload.as_ref()),
                };
                log::error!("{err}");
                self.local.borrow_mut().stats.panics += 1;
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manual() -> (Scheduler, ManualClock) {
        let clock = ManualClock::new();
        let scheduler = Scheduler::with_clock(SchedulerOptions::default(), Arc::new(clock.clone()));
        (scheduler, clock)
    }

    fn msg(command: &str) -> Message {
        Message::new("test", command, Vec::new())
    }

    #[test]
    fn timers_fire_in_due_order() {
        let (scheduler, clock) = manual();
        let fired = Rc::new(RefCell::new(Vec::new()));
        for period in [30u64, 10, 20] {
            let fired = Rc::clone(&fired);
            scheduler.add_timer(Duration::from_millis(period), move || {
                fired.borrow_mut().push(period)
            });
        }

        clock.advance(Duration::from_millis(30));
        scheduler.run_once();
        assert_eq!(*fired.borrow(), vec![10, 20, 30]);
    }

    #[test]
    fn timer_can_remove_itself() {
        let (scheduler, clock) = manual();
        let count = Rc::new(RefCell::new(0));
        let id_cell = Rc::new(RefCell::new(None));
        let id = {
            let count = Rc::clone(&count);
            let id_cell = Rc::clone(&id_cell);
            let remover = scheduler.clone();
            scheduler.add_timer(Duration::from_millis(5), move || {
                *count.borrow_mut() += 1;
                if let Some(id) = *id_cell.borrow() {
                    remover.remove_timer(id);
                }
            })
        };
        *id_cell.borrow_mut() = Some(id);

        for _ in 0..3 {
            clock.advance(Duration::from_millis(5));
            scheduler.run_once();
        }
        assert_eq!(*count.borrow(), 1);
        assert!(!scheduler.has_timer(id));
        assert!(!scheduler.remove_timer(id));
    }

    #[test]
    fn duplicate_mailbox_rejected() {
        let (scheduler, _) = manual();
        scheduler.add_mailbox("a", |_| {}).unwrap();
        let err = scheduler.add_mailbox("a", |_| {}).unwrap_err();
        assert!(matches!(err, Error::DuplicateMailbox(name) if name == "a"));
    }

    #[test]
    fn unknown_mailbox_put_fails() {
        let (scheduler, _) = manual();
        let err = scheduler.mailbox_put("missing", msg("x")).unwrap_err();
        assert!(matches!(err, Error::UnknownMailbox(_)));
    }

    #[test]
    fn privileged_mailbox_preferred() {
        let (scheduler, _) = manual();
        let order = Rc::new(RefCell::new(Vec::new()));

        {
            let order = Rc::clone(&order);
            scheduler
                .add_mailbox("privileged", move |m: Message| {
                    order.borrow_mut().push(format!("p:{}", m.command))
                })
                .unwrap();
        }
        {
            let order = Rc::clone(&order);
            let poster = scheduler.clone();
            scheduler
                .add_mailbox("worker", move |m: Message| {
                    order.borrow_mut().push(format!("w:{}", m.command));
                    if m.command == "1" {
                        poster.mailbox_put("privileged", msg("late")).unwrap();
                    }
                })
                .unwrap();
        }

        scheduler.mailbox_put("worker", msg("1")).unwrap();
        scheduler.mailbox_put("worker", msg("2")).unwrap();
        scheduler.mailbox_put("privileged", msg("a")).unwrap();
        scheduler.mailbox_put("privileged", msg("b")).unwrap();
        scheduler.run_once();

        assert_eq!(
            *order.borrow(),
            vec!["p:a", "p:b", "w:1", "p:late", "w:2"]
        );
        assert_eq!(scheduler.privileged_mailbox().as_deref(), Some("privileged"));
    }

    #[test]
    fn mailbox_fifo_and_stats() {
        let (scheduler, _) = manual();
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = Rc::clone(&seen);
            scheduler
                .add_mailbox("box", move |m: Message| seen.borrow_mut().push(m.command))
                .unwrap();
        }
        for i in 0..5 {
            scheduler.mailbox_put("box", msg(&i.to_string())).unwrap();
        }
        scheduler.run_once();

        assert_eq!(*seen.borrow(), vec!["0", "1", "2", "3", "4"]);
        let stats = scheduler.mailbox_stats("box").unwrap();
        assert_eq!(stats.high_water, 5);
        assert_eq!(stats.delivered, 5);
        assert_eq!(stats.len, 0);
    }

    #[test]
    fn drain_limit_bounds_iteration() {
        let clock = ManualClock::new();
        let options = SchedulerOptions {
            mailbox_drain_limit: 2,
            ..SchedulerOptions::default()
        };
        let scheduler = Scheduler::with_clock(options, Arc::new(clock));
        let count = Rc::new(RefCell::new(0));
        {
            let count = Rc::clone(&count);
            scheduler
                .add_mailbox("box", move |_| *count.borrow_mut() += 1)
                .unwrap();
        }
        for _ in 0..5 {
            scheduler.mailbox_put("box", msg("x")).unwrap();
        }
        scheduler.run_once();
        assert_eq!(*count.borrow(), 2);
        scheduler.run_once();
        scheduler.run_once();
        assert_eq!(*count.borrow(), 5);
    }

    #[test]
    fn removed_mailbox_drops_pending() {
        let (scheduler, _) = manual();
        let count = Rc::new(RefCell::new(0));
        {
            let count = Rc::clone(&count);
            scheduler
                .add_mailbox("box", move |_| *count.borrow_mut() += 1)
                .unwrap();
        }
        scheduler.mailbox_put("box", msg("x")).unwrap();
        assert!(scheduler.remove_mailbox("box"));
        assert!(!scheduler.remove_mailbox("box"));
        scheduler.run_once();
        assert_eq!(*count.borrow(), 0);
        assert!(scheduler.mailbox_put("box", msg("x")).is_err());
    }

    #[test]
    fn queue_items_fan_out_by_kind() {
        let (scheduler, _) = manual();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Rc::clone(&seen);
            scheduler.add_queue_handler("number", move |item: &QueueItem| {
                let value = *item.downcast_ref::<i32>().unwrap();
                seen.borrow_mut().push(format!("{tag}:{value}"));
            });
        }
        let other = {
            let seen = Rc::clone(&seen);
            scheduler.add_queue_handler("other", move |_| seen.borrow_mut().push("other".into()))
        };

        scheduler.queue_put(QueueItem::new("number", 4));
        scheduler.queue_put(QueueItem::new("unclaimed", 1));
        scheduler.run_once();
        assert_eq!(*seen.borrow(), vec!["first:4", "second:4"]);

        assert!(scheduler.remove_queue_handler(other));
        assert!(!scheduler.remove_queue_handler(other));
        assert_eq!(scheduler.stats().queue_items, 2);
    }

    #[test]
    fn flatout_runs_every_iteration() {
        let (scheduler, _) = manual();
        let count = Rc::new(RefCell::new(0));
        let id = {
            let count = Rc::clone(&count);
            scheduler.add_flatout_handler(move || *count.borrow_mut() += 1)
        };
        scheduler.run_once();
        scheduler.run_once();
        assert!(scheduler.remove_flatout_handler(id));
        scheduler.run_once();
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn panicking_handler_does_not_stop_loop() {
        let (scheduler, clock) = manual();
        let count = Rc::new(RefCell::new(0));
        scheduler.add_timer(Duration::from_millis(1), || panic!("timer exploded"));
        {
            let count = Rc::clone(&count);
            scheduler
                .add_mailbox("box", move |m: Message| {
                    if m.command == "boom" {
                        panic!("mailbox exploded");
                    }
                    *count.borrow_mut() += 1;
                })
                .unwrap();
        }
        scheduler.mailbox_put("box", msg("boom")).unwrap();
        scheduler.mailbox_put("box", msg("ok")).unwrap();

        clock.advance(Duration::from_millis(1));
        scheduler.run_once();
        clock.advance(Duration::from_millis(1));
        scheduler.run_once();

        assert_eq!(*count.borrow(), 1);
        let stats = scheduler.stats();
        assert_eq!(stats.panics, 3);
        assert_eq!(stats.timer_fires, 2);
    }

    #[test]
    fn run_exits_without_handlers() {
        let (scheduler, _) = manual();
        scheduler.run().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.stats().iterations, 0);
    }

    #[test]
    fn terminate_is_idempotent_and_stops_loop() {
        let scheduler = Scheduler::new(SchedulerOptions {
            loop_period: Duration::from_millis(1),
            ..SchedulerOptions::default()
        });
        let stopper = scheduler.clone();
        let ticks = Rc::new(RefCell::new(0));
        {
            let ticks = Rc::clone(&ticks);
            scheduler.add_flatout_handler(move || {
                *ticks.borrow_mut() += 1;
                if *ticks.borrow() == 3 {
                    stopper.terminate();
                    stopper.terminate();
                }
            });
        }
        scheduler.run().unwrap();
        assert_eq!(*ticks.borrow(), 3);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        scheduler.run().unwrap();
        assert_eq!(*ticks.borrow(), 3);
    }

    #[test]
    fn nested_run_is_rejected() {
        let scheduler = Scheduler::new(SchedulerOptions::default());
        let inner = scheduler.clone();
        let result = Rc::new(RefCell::new(None));
        {
            let result = Rc::clone(&result);
            scheduler.add_flatout_handler(move || {
                *result.borrow_mut() = Some(inner.run().is_err());
                inner.terminate();
            });
        }
        scheduler.run().unwrap();
        assert_eq!(*result.borrow(), Some(true));
    }
}
