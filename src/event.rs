//! Blocking wake-up primitive shared by the socket servers.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::Wake;
use std::time::{Duration, Instant};

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until woken. Still interruptible by a wake-up.
    Forever,
    After(Duration),
}

impl Timeout {
    pub fn millis(ms: u64) -> Self {
        Timeout::After(Duration::from_millis(ms))
    }

    /// The instant this timeout expires, measured from `now`.
    pub fn deadline(&self, now: Instant) -> Option<Instant> {
        match self {
            Timeout::Forever => None,
            // Too far out to represent is as good as forever.
            Timeout::After(d) => now.checked_add(*d),
        }
    }

    /// The shorter of this timeout and `other`.
    pub fn min(self, other: Duration) -> Timeout {
        match self {
            Timeout::Forever => Timeout::After(other),
            Timeout::After(d) => Timeout::After(d.min(other)),
        }
    }
}

/// Beyond any deadline a caller can reach.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + d`, clamped instead of overflowing.
pub(crate) fn saturating_deadline(now: Instant, d: Duration) -> Instant {
    now.checked_add(d)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

/// Auto-reset event.
///
/// The signalled flag is persisted under the same lock the waiter checks
/// before blocking, so a `set()` that happens before `wait()` is never lost.
/// Any number of `set()` calls before a `wait()` collapse into one.
#[derive(Debug, Default)]
pub struct Event {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut signalled = self.lock();
        *signalled = true;
        self.cond.notify_all();
    }

    /// Whether a `set()` is pending, without consuming it.
    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Block until `set()` or the timeout. Returns true if woken by `set()`.
    pub fn wait(&self, timeout: Timeout) -> bool {
        let deadline = timeout.deadline(Instant::now());
        let mut signalled = self.lock();

        loop {
            if *signalled {
                *signalled = false;
                return true;
            }

            match deadline {
                None => {
                    signalled = self
                        .cond
                        .wait(signalled)
                        .unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    signalled = self
                        .cond
                        .wait_timeout(signalled, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // A panicking waker cannot leave the flag in a torn state.
        self.signalled.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Wake for Event {
    fn wake(self: Arc<Self>) {
        self.set();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Waker;
    use std::thread;

    #[test]
    fn set_before_wait_is_not_lost() {
        let event = Event::new();
        event.set();
        event.set();

        let start = Instant::now();
        assert!(event.wait(Timeout::Forever));
        assert!(start.elapsed() < Duration::from_millis(100));

        // The two sets collapsed into one.
        assert!(!event.wait(Timeout::millis(10)));
    }

    #[test]
    fn wait_times_out() {
        let event = Event::new();
        let start = Instant::now();
        assert!(!event.wait(Timeout::millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn waker_wakes_other_thread() {
        let event = Arc::new(Event::new());
        let waker = Waker::from(event.clone());

        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        assert!(event.wait(Timeout::millis(5000)));
        t.join().unwrap();
    }

    #[test]
    fn huge_timeout_does_not_overflow() {
        let event = Event::new();
        event.set();
        assert!(event.wait(Timeout::After(Duration::MAX)));
        assert_eq!(Timeout::After(Duration::MAX).deadline(Instant::now()), None);

        let now = Instant::now();
        assert!(saturating_deadline(now, Duration::MAX) > now);
    }

    #[test]
    fn timeout_min() {
        let t = Timeout::Forever.min(Duration::from_millis(5));
        assert_eq!(t, Timeout::millis(5));
        let t = Timeout::millis(3).min(Duration::from_millis(5));
        assert_eq!(t, Timeout::millis(3));
    }
}
