use std::sync::Mutex;
use tokio::task::JoinHandle;

/// A cancelable stream subscription (a spawned forwarding or timer task).
#[derive(Debug)]
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Cancels the subscription. Canceling an already-finished or
    /// already-canceled task is harmless.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The per-owner set of live subscriptions, with bulk teardown.
///
/// Every actor funnels its stream handles through one of these so that
/// stopping the actor releases all of its listeners on the shared
/// broadcast channels. After [`destroy`](Self::destroy) the set is empty
/// and unusable: handles added later are canceled on arrival.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    inner: Mutex<SetState>,
}

#[derive(Debug, Default)]
struct SetState {
    handles: Vec<SubscriptionHandle>,
    destroyed: bool,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handle`, or cancels it immediately if the set is already
    /// destroyed.
    pub fn add(&self, handle: SubscriptionHandle) {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.destroyed {
            handle.cancel();
            return;
        }
        state.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(state) => state.handles.len(),
            Err(poisoned) => poisoned.into_inner().handles.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every stored handle and clears the set. Safe to call more
    /// than once and safe on handles that already finished.
    pub fn destroy(&self) {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.destroyed = true;
        for handle in state.handles.drain(..) {
            handle.cancel();
        }
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::{SubscriptionHandle, SubscriptionSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    fn forwarding_handle(
        mut rx: mpsc::UnboundedReceiver<u32>,
        seen: Arc<AtomicUsize>,
    ) -> SubscriptionHandle {
        SubscriptionHandle::new(tokio::spawn(async move {
            while rx.recv().await.is_some() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }))
    }

    #[tokio::test]
    async fn destroy_silences_all_subscriptions() {
        let set = SubscriptionSet::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        set.add(forwarding_handle(rx, seen.clone()));

        tx.send(1).unwrap();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        set.destroy();
        assert!(set.is_empty());

        // Events published after destroy reach nobody.
        tx.send(2).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1, "callback fired after destroy");
    }

    #[tokio::test]
    async fn destroy_twice_and_with_finished_handles_is_safe() {
        let set = SubscriptionSet::new();
        let finished = SubscriptionHandle::new(tokio::spawn(async {}));
        sleep(Duration::from_millis(10)).await;
        finished.cancel(); // already finished: double-cancel must not propagate
        set.add(finished);

        set.destroy();
        set.destroy();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn add_after_destroy_cancels_immediately() {
        let set = SubscriptionSet::new();
        set.destroy();

        let seen = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        set.add(forwarding_handle(rx, seen.clone()));
        assert!(set.is_empty());

        tx.send(1).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
