use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

pub(crate) type TimerFn = Rc<RefCell<dyn FnMut()>>;

/// Identifies a timer registered with a [`Scheduler`](super::Scheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

pub(crate) struct Timer {
    pub(crate) id: TimerId,
    pub(crate) period_ns: u64,
    pub(crate) next_fire: u64,
    pub(crate) handler: TimerFn,
}

/// Timers sorted ascending by `(next_fire, id)`.
///
/// Ids increase with registration, so equal due times fire in registration
/// order.
#[derive(Default)]
pub(crate) struct TimerList {
    timers: Vec<Timer>,
}

impl TimerList {
    pub(crate) fn insert(&mut self, timer: Timer) {
        let key = (timer.next_fire, timer.id);
        let at = self
            .timers
            .partition_point(|t| (t.next_fire, t.id) <= key);
        self.timers.insert(at, timer);
    }

    pub(crate) fn remove(&mut self, id: TimerId) -> Option<Timer> {
        let index = self.timers.iter().position(|t| t.id == id)?;
        Some(self.timers.remove(index))
    }

    /// Pops the head timer if it is due at `now`, reschedules it, and returns
    /// its handler.
    ///
    /// The rescheduled fire time is always after `now`, so each timer fires at
    /// most once per call site loop over a fixed `now`.
    pub(crate) fn pop_due(&mut self, now: u64) -> Option<(TimerId, TimerFn)> {
        if self.timers.first()?.next_fire > now {
            return None;
        }
        let mut timer = self.timers.remove(0);
        let mut next = timer.next_fire.saturating_add(timer.period_ns);
        if next <= now {
            next = now.saturating_add(timer.period_ns);
        }
        timer.next_fire = next;
        let fired = (timer.id, Rc::clone(&timer.handler));
        self.insert(timer);
        Some(fired)
    }

    pub(crate) fn next_due(&self) -> Option<u64> {
        self.timers.first().map(|t| t.next_fire)
    }

    pub(crate) fn contains(&self, id: TimerId) -> bool {
        self.timers.iter().any(|t| t.id == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }
}

pub(crate) fn period_ns(period: Duration) -> u64 {
    u64::try_from(period.as_nanos()).unwrap_or(u64::MAX).max(1)
}
