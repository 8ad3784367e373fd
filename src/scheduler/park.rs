use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Bounded sleep for the scheduler loop that other threads can cut short.
///
/// `unpark` before `park_timeout` is remembered, so a put that races with the
/// loop going to sleep is never lost.
#[derive(Debug, Default)]
pub(crate) struct Parker {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Parker {
    pub(crate) fn park_timeout(&self, timeout: Duration) {
        if timeout.is_zero() {
            self.reset();
            return;
        }
        let Ok(guard) = self.notified.lock() else {
            std::thread::sleep(timeout);
            return;
        };
        match self.cond.wait_timeout_while(guard, timeout, |notified| !*notified) {
            Ok((mut guard, _)) => *guard = false,
            Err(poisoned) => *poisoned.into_inner().0 = false,
        }
    }

    pub(crate) fn unpark(&self) {
        if let Ok(mut notified) = self.notified.lock() {
            *notified = true;
            self.cond.notify_one();
        }
    }

    fn reset(&self) {
        if let Ok(mut notified) = self.notified.lock() {
            *notified = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn park_times_out() {
        let parker = Parker::default();
        let start = Instant::now();
        parker.park_timeout(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn unpark_before_park_is_remembered() {
        let parker = Parker::default();
        parker.unpark();
        let start = Instant::now();
        parker.park_timeout(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn unpark_wakes_other_thread() {
        let parker = Arc::new(Parker::default());
        let remote = Arc::clone(&parker);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.unpark();
        });
        let start = Instant::now();
        parker.park_timeout(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }
}
