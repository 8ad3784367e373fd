use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// An opaque `(target, command, args)` tuple delivered through a mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub target: String,
    pub command: String,
    pub args: Vec<String>,
    /// Scheduler clock reading when the message was posted, in nanoseconds.
    pub posted_at: u64,
}

impl Message {
    pub fn new(target: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            target: target.into(),
            command: command.into(),
            args,
            posted_at: 0,
        }
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// Point-in-time view of one mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStats {
    pub len: usize,
    pub high_water: usize,
    pub delivered: usize,
}

/// FIFO shared between posting threads and the scheduler thread.
#[derive(Debug)]
pub(crate) struct MailboxQueue {
    name: String,
    items: Mutex<VecDeque<Message>>,
    high_water: AtomicUsize,
    delivered: AtomicUsize,
    warned: AtomicBool,
    closed: AtomicBool,
}

impl MailboxQueue {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Mutex::new(VecDeque::new()),
            high_water: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
            warned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns false if the mailbox was removed.
    pub(crate) fn push(&self, message: Message, warn_at: usize) -> bool {
        if self.is_closed() {
            return false;
        }
        let len = match self.items.lock() {
            Ok(mut items) => {
                items.push_back(message);
                items.len()
            }
            Err(poisoned) => {
                let mut items = poisoned.into_inner();
                items.push_back(message);
                items.len()
            }
        };
        let previous = self.high_water.fetch_max(len, Ordering::AcqRel);
        if len > previous
            && len >= warn_at
            && !self.warned.swap(true, Ordering::AcqRel)
        {
            log::warn!(
                "mailbox {} reached {} pending messages",
                self.name,
                len
            );
        }
        true
    }

    pub(crate) fn pop(&self) -> Option<Message> {
        if self.is_closed() {
            return None;
        }
        let message = match self.items.lock() {
            Ok(mut items) => items.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        if message.is_some() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        message
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn len(&self) -> usize {
        match self.items.lock() {
            Ok(items) => items.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        match self.items.lock() {
            Ok(mut items) => items.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> MailboxStats {
        MailboxStats {
            len: self.len(),
            high_water: self.high_water.load(Ordering::Acquire),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}
