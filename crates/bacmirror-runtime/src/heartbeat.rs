use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Cancelable, restartable interval driver for periodic liveness checks.
///
/// The timer only decides *when* a check happens and counts consecutive
/// failures; what a failure means for the device's operational status is
/// the owning actor's policy.
///
/// An interval of zero means "disabled": [`start`](Self::start) does
/// nothing and the tick handler never fires. Callers are expected to
/// check [`is_disabled`](Self::is_disabled) and skip the timer entirely.
#[derive(Debug)]
pub struct StatusTimer {
    interval: Duration,
    fail_count: AtomicU32,
    restart: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatusTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            fail_count: AtomicU32::new(0),
            restart: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.interval.is_zero()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Begins firing `tick(interval)` every interval. Replaces any
    /// previous run. No-op when the timer is disabled.
    pub fn start<F, Fut>(&self, mut tick: F)
    where
        F: FnMut(Duration) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        if self.is_disabled() {
            log::debug!("status timer disabled (zero interval), not starting");
            return;
        }
        let interval = self.interval;
        let restart = self.restart.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => tick(interval).await,
                    _ = restart.notified() => continue,
                }
            }
        });
        self.replace_task(Some(task));
    }

    /// Resets the consecutive-failure counter after a successful check.
    pub fn report_successful_check(&self) {
        self.fail_count.store(0, Ordering::Release);
    }

    /// Records a failed check; returns the new consecutive count.
    pub fn report_failed_check(&self) -> u32 {
        self.fail_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count.load(Ordering::Acquire)
    }

    /// Restarts the interval clock without touching the failure counter.
    pub fn reset(&self) {
        self.restart.notify_waiters();
    }

    /// Stops the timer. Idempotent.
    pub fn cancel(&self) {
        self.replace_task(None);
    }

    fn replace_task(&self, new: Option<JoinHandle<()>>) {
        let mut slot = match self.task.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = new;
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
