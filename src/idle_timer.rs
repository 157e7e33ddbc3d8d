//! Idle Timer: a single reschedulable per-connection timer that requests
//! disconnection after a configured idle duration, per §4.3.
//!
//! The Connection is confined to a `LocalSet` (see §5), so the timer is a
//! `tokio::task::spawn_local`'d future rather than a plain `tokio::spawn` —
//! it may close over the connection's `Rc`-backed state directly.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Owns at most one outstanding idle-expiry task.
///
/// Idempotent-restart per §4.3: `start` is a no-op if a timer is already
/// scheduled; callers must `stop` before re-arming with a different
/// duration.
#[derive(Default)]
pub(crate) struct IdleTimer {
    handle: Rc<RefCell<Option<JoinHandle<()>>>>,
}

impl IdleTimer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starts the timer if `duration` is non-zero and none is currently
    /// scheduled. `on_fire` runs on expiry, on the same `LocalSet`.
    pub(crate) fn start<F, Fut>(&self, duration: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        if duration.is_zero() {
            return;
        }
        let mut slot = self.handle.borrow_mut();
        if slot.is_some() {
            return;
        }
        *slot = Some(tokio::task::spawn_local(async move {
            tokio::time::sleep(duration).await;
            on_fire().await;
        }));
    }

    /// Cancels any outstanding timer. Safe to call when none is scheduled.
    pub(crate) fn stop(&self) {
        if let Some(handle) = self.handle.borrow_mut().take() {
            handle.abort();
        }
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.handle.borrow().is_some()
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn fires_after_duration() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let timer = IdleTimer::new();
                let fired = Rc::new(Cell::new(false));
                let fired_clone = fired.clone();
                timer.start(Duration::from_millis(10), move || async move {
                    fired_clone.set(true);
                });
                assert!(timer.is_scheduled());
                tokio::time::sleep(Duration::from_millis(40)).await;
                assert!(fired.get());
            })
            .await;
    }

    #[tokio::test]
    async fn restart_while_scheduled_is_a_no_op() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let timer = IdleTimer::new();
                let calls = Rc::new(Cell::new(0));

                let calls_a = calls.clone();
                timer.start(Duration::from_millis(20), move || async move {
                    calls_a.set(calls_a.get() + 1);
                });
                let calls_b = calls.clone();
                timer.start(Duration::from_millis(20), move || async move {
                    calls_b.set(calls_b.get() + 1);
                });

                tokio::time::sleep(Duration::from_millis(60)).await;
                assert_eq!(calls.get(), 1, "second start() must not schedule a second timer");
            })
            .await;
    }

    #[tokio::test]
    async fn stop_prevents_fire() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let timer = IdleTimer::new();
                let fired = Rc::new(Cell::new(false));
                let fired_clone = fired.clone();
                timer.start(Duration::from_millis(10), move || async move {
                    fired_clone.set(true);
                });
                timer.stop();
                assert!(!timer.is_scheduled());
                tokio::time::sleep(Duration::from_millis(30)).await;
                assert!(!fired.get());
            })
            .await;
    }

    #[test]
    fn zero_duration_never_schedules() {
        let timer = IdleTimer::new();
        timer.start(Duration::ZERO, || async {});
        assert!(!timer.is_scheduled());
    }
}
