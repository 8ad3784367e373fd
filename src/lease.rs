//! Renewable timeout guard built on scheduler timers.
//!
//! A lease owns one expiry timer, plus a periodic renewal timer when it
//! auto-extends. Leases are the only expiry primitive in the runtime: EC
//! subscriptions, consumer keepalives and handshake windows are all leases.
//!
//! - `extend` resets the expiry to a full duration from now. It never adds.
//! - `on_expire` fires at most once, and never after `terminate`.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::scheduler::{Scheduler, TimerId};

type LeaseFn = Rc<RefCell<dyn FnMut(&str)>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Active,
    Expired,
    Terminated,
}

#[derive(Debug, Clone, Copy)]
pub struct LeaseOptions {
    /// Renew automatically every `extend_factor × duration`.
    pub auto_extend: bool,
    pub extend_factor: f64,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            auto_extend: false,
            extend_factor: 0.8,
        }
    }
}

impl LeaseOptions {
    pub fn auto_extend(extend_factor: f64) -> Self {
        Self {
            auto_extend: true,
            extend_factor,
        }
    }
}

struct LeaseInner {
    id: String,
    duration: Duration,
    options: LeaseOptions,
    state: LeaseState,
    expire_timer: Option<TimerId>,
    extend_timer: Option<TimerId>,
    on_expire: LeaseFn,
    on_extend: Option<LeaseFn>,
    scheduler: Scheduler,
}

impl LeaseInner {
    fn cancel_timers(&mut self) {
        if let Some(id) = self.expire_timer.take() {
            self.scheduler.remove_timer(id);
        }
        if let Some(id) = self.extend_timer.take() {
            self.scheduler.remove_timer(id);
        }
    }
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

/// Handle to a lease. Clones refer to the same lease.
///
/// Dropping the last handle cancels the lease without firing `on_expire`.
#[derive(Clone)]
pub struct Lease {
    inner: Rc<RefCell<LeaseInner>>,
}

impl Lease {
    /// Arms a lease that calls `on_expire(id)` once `duration` elapses.
    pub fn new(
        scheduler: &Scheduler,
        duration: Duration,
        id: impl Into<String>,
        on_expire: impl FnMut(&str) + 'static,
    ) -> Self {
        Self::with_options(scheduler, duration, id, LeaseOptions::default(), on_expire, None)
    }

    /// Arms a lease with renewal options and an optional `on_extend(id)` hook.
    pub fn with_options(
        scheduler: &Scheduler,
        duration: Duration,
        id: impl Into<String>,
        options: LeaseOptions,
        on_expire: impl FnMut(&str) + 'static,
        on_extend: Option<Box<dyn FnMut(&str)>>,
    ) -> Self {
        let mut options = options;
        let id: String = id.into();
        if options.auto_extend && !(options.extend_factor > 0.0 && options.extend_factor <= 1.0) {
            let fallback = LeaseOptions::default().extend_factor;
            log::warn!(
                "lease {id}: extend_factor {} outside (0, 1], using {fallback}",
                options.extend_factor
            );
            options.extend_factor = fallback;
        }
        let on_extend: Option<LeaseFn> =
            on_extend.map(|handler| Rc::new(RefCell::new(handler)) as LeaseFn);
        let inner = Rc::new(RefCell::new(LeaseInner {
            id,
            duration,
            options,
            state: LeaseState::Active,
            expire_timer: None,
            extend_timer: None,
            on_expire: Rc::new(RefCell::new(on_expire)),
            on_extend,
            scheduler: scheduler.clone(),
        }));
        {
            let mut state = inner.borrow_mut();
            let scheduler = state.scheduler.clone();
            state.expire_timer = Some(arm_expire(&inner, &scheduler, duration));
            if options.auto_extend {
                state.extend_timer = Some(arm_extend(&inner, &scheduler, duration, options));
            }
            log::debug!(
                "lease {} armed for {:?} (auto_extend: {})",
                state.id,
                duration,
                options.auto_extend
            );
        }
        Self { inner }
    }

    /// Re-arms the expiry for a full `new_duration`, or the current duration.
    ///
    /// A new duration replaces the lease's duration, including the renewal
    /// cadence of an auto-extending lease. No-op unless active.
    pub fn extend(&self, new_duration: Option<Duration>) {
        let fired = {
            let mut state = self.inner.borrow_mut();
            if state.state != LeaseState::Active {
                return;
            }
            let scheduler = state.scheduler.clone();
            if let Some(id) = state.expire_timer.take() {
                scheduler.remove_timer(id);
            }
            let changed = new_duration.is_some_and(|d| d != state.duration);
            if let Some(duration) = new_duration {
                state.duration = duration;
            }
            let duration = state.duration;
            state.expire_timer = Some(arm_expire(&self.inner, &scheduler, duration));
            if changed && state.options.auto_extend {
                if let Some(id) = state.extend_timer.take() {
                    scheduler.remove_timer(id);
                }
                let options = state.options;
                state.extend_timer = Some(arm_extend(&self.inner, &scheduler, duration, options));
            }
            state
                .on_extend
                .as_ref()
                .map(|handler| (Rc::clone(handler), state.id.clone()))
        };
        if let Some((handler, id)) = fired {
            (&mut *handler.borrow_mut())(&id);
        }
    }

    /// Cancels the lease. `on_expire` will not fire afterwards. Idempotent.
    pub fn terminate(&self) {
        let mut state = self.inner.borrow_mut();
        if state.state == LeaseState::Active {
            state.state = LeaseState::Terminated;
            state.cancel_timers();
            log::debug!("lease {} terminated", state.id);
        }
    }

    pub fn id(&self) -> String {
        self.inner.borrow().id.clone()
    }

    pub fn duration(&self) -> Duration {
        self.inner.borrow().duration
    }

    pub fn state(&self) -> LeaseState {
        self.inner.borrow().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == LeaseState::Active
    }
}

fn arm_expire(inner: &Rc<RefCell<LeaseInner>>, scheduler: &Scheduler, duration: Duration) -> TimerId {
    let weak = Rc::downgrade(inner);
    scheduler.add_timer(duration, move || expire(&weak))
}

fn arm_extend(
    inner: &Rc<RefCell<LeaseInner>>,
    scheduler: &Scheduler,
    duration: Duration,
    options: LeaseOptions,
) -> TimerId {
    let weak = Rc::downgrade(inner);
    let period = duration.mul_f64(options.extend_factor);
    scheduler.add_timer(period, move || {
        if let Some(inner) = weak.upgrade() {
            Lease { inner }.extend(None);
        }
    })
}

fn expire(weak: &Weak<RefCell<LeaseInner>>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let (handler, id) = {
        let mut state = inner.borrow_mut();
        if state.state != LeaseState::Active {
            return;
        }
        state.state = LeaseState::Expired;
        state.cancel_timers();
        log::debug!("lease {} expired", state.id);
        (Rc::clone(&state.on_expire), state.id.clone())
    };
    (&mut *handler.borrow_mut())(&id);
}
