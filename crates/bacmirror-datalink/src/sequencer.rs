use crate::LinkError;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, Semaphore};
use tokio::time::Instant;

/// One queued send: a deferred async operation producing a send result.
pub type SendJob = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), LinkError>> + Send>;

struct QueuedSend {
    job: SendJob,
    done: oneshot::Sender<Result<(), LinkError>>,
}

struct DestinationQueue {
    tx: mpsc::UnboundedSender<QueuedSend>,
    /// Entries queued or executing. The key is free at zero.
    pending: Arc<AtomicUsize>,
}

/// Per-destination FIFO send coordination.
///
/// For a given destination key at most `concurrency` entries execute at
/// once, and after each entry's result settles the coordinator waits
/// `delay` before admitting the next entry from that key's queue. Queues
/// for different keys are fully independent.
///
/// A failing entry surfaces its error only to its own submitter; the
/// queue proceeds to the next entry after the usual delay.
#[derive(Debug)]
pub struct SequenceCoordinator {
    queues: Mutex<HashMap<SocketAddr, DestinationQueue>>,
    concurrency: usize,
    delay: Duration,
    closed: AtomicBool,
    settled: Arc<Notify>,
}

impl std::fmt::Debug for DestinationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationQueue")
            .field("pending", &self.pending.load(Ordering::Acquire))
            .finish()
    }
}

impl SequenceCoordinator {
    pub fn new(concurrency: usize, delay: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            concurrency: concurrency.max(1),
            delay,
            closed: AtomicBool::new(false),
            settled: Arc::new(Notify::new()),
        }
    }

    /// Enqueues `job` on `key`'s queue and awaits its result.
    ///
    /// Fails with [`LinkError::Closed`] once [`shutdown`](Self::shutdown)
    /// has begun.
    pub async fn submit(&self, key: SocketAddr, job: SendJob) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut queues = self.queues.lock().await;
            // Re-check under the lock: shutdown clears the map while
            // holding it, and a queue created after that would never drain.
            if self.closed.load(Ordering::Acquire) {
                return Err(LinkError::Closed);
            }
            let queue = queues.entry(key).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let pending = Arc::new(AtomicUsize::new(0));
                tokio::spawn(run_queue(
                    rx,
                    self.concurrency,
                    self.delay,
                    pending.clone(),
                    self.settled.clone(),
                ));
                DestinationQueue { tx, pending }
            });
            queue.pending.fetch_add(1, Ordering::AcqRel);
            if queue
                .tx
                .send(QueuedSend { job, done: done_tx })
                .is_err()
            {
                queue.pending.fetch_sub(1, Ordering::AcqRel);
                return Err(LinkError::Closed);
            }
        }

        done_rx.await.unwrap_or(Err(LinkError::Closed))
    }

    /// True when no key has queued or executing entries.
    pub async fn is_idle(&self) -> bool {
        let queues = self.queues.lock().await;
        queues
            .values()
            .all(|queue| queue.pending.load(Ordering::Acquire) == 0)
    }

    /// Graceful drain: refuses new entries, waits until every key's queue
    /// is free, then releases the per-key workers. In-flight sends are
    /// never abandoned mid-socket-close.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        loop {
            let settled = self.settled.notified();
            if self.is_idle().await {
                break;
            }
            settled.await;
        }
        self.queues.lock().await.clear();
    }
}

async fn run_queue(
    mut rx: mpsc::UnboundedReceiver<QueuedSend>,
    concurrency: usize,
    delay: Duration,
    pending: Arc<AtomicUsize>,
    settled: Arc<Notify>,
) {
    let slots = Arc::new(Semaphore::new(concurrency));
    // Earliest instant the next entry may be admitted; pushed forward by
    // `delay` every time an entry settles.
    let gate = Arc::new(Mutex::new(Instant::now()));

    while let Some(entry) = rx.recv().await {
        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };
        let not_before = *gate.lock().await;
        tokio::time::sleep_until(not_before).await;

        let gate = gate.clone();
        let pending = pending.clone();
        let settled = settled.clone();
        tokio::spawn(async move {
            let result = (entry.job)().await;
            if let Err(err) = &result {
                log::debug!("sequenced send failed: {err}");
            }
            // Receiver may have stopped waiting; the queue moves on anyway.
            let _ = entry.done.send(result);
            *gate.lock().await = Instant::now() + delay;
            drop(permit);
            pending.fetch_sub(1, Ordering::AcqRel);
            settled.notify_waiters();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{SendJob, SequenceCoordinator};
    use crate::LinkError;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::time::{sleep, timeout, Instant};

    fn key(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn job_counting_peak(
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        hold: Duration,
    ) -> SendJob {
        Box::new(move || {
            Box::pin(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(hold).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn bounds_concurrency_per_key() {
        let coordinator = Arc::new(SequenceCoordinator::new(2, Duration::ZERO));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let coordinator = coordinator.clone();
            let job = job_counting_peak(active.clone(), peak.clone(), Duration::from_millis(30));
            handles.push(tokio::spawn(async move {
                coordinator.submit(key(47901), job).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak exceeded concurrency");
    }

    #[tokio::test]
    async fn paces_completions_on_one_key() {
        let delay = Duration::from_millis(60);
        let coordinator = Arc::new(SequenceCoordinator::new(1, delay));
        let completions: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..3 {
            let completions = completions.clone();
            coordinator
                .submit(
                    key(47902),
                    Box::new(move || {
                        Box::pin(async move {
                            completions.lock().await.push(Instant::now());
                            Ok(())
                        })
                    }),
                )
                .await
                .unwrap();
        }

        let completions = completions.lock().await;
        assert_eq!(completions.len(), 3);
        for pair in completions.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(50),
                "completion gap {gap:?} shorter than pacing delay"
            );
        }
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let coordinator = Arc::new(SequenceCoordinator::new(1, Duration::from_millis(200)));

        // Occupy the first key, then show a second key admits immediately.
        let blocker = coordinator.clone();
        tokio::spawn(async move {
            let _ = blocker
                .submit(
                    key(47903),
                    Box::new(|| {
                        Box::pin(async {
                            sleep(Duration::from_millis(300)).await;
                            Ok(())
                        })
                    }),
                )
                .await;
        });
        sleep(Duration::from_millis(20)).await;

        let other = timeout(
            Duration::from_millis(100),
            coordinator.submit(key(47904), Box::new(|| Box::pin(async { Ok(()) }))),
        )
        .await;
        assert!(other.is_ok(), "independent key was starved");
    }

    #[tokio::test]
    async fn failure_surfaces_to_submitter_and_queue_continues() {
        let coordinator = SequenceCoordinator::new(1, Duration::ZERO);

        let failed = coordinator
            .submit(
                key(47905),
                Box::new(|| {
                    Box::pin(async {
                        Err(LinkError::Io(std::io::Error::other("send refused")))
                    })
                }),
            )
            .await;
        assert!(failed.is_err());

        let next = coordinator
            .submit(key(47905), Box::new(|| Box::pin(async { Ok(()) })))
            .await;
        assert!(next.is_ok(), "queue halted after a failed entry");
    }

    #[tokio::test]
    async fn shutdown_drains_then_refuses() {
        let coordinator = Arc::new(SequenceCoordinator::new(1, Duration::ZERO));
        let finished = Arc::new(AtomicUsize::new(0));

        let flag = finished.clone();
        let submitter = coordinator.clone();
        let slow = tokio::spawn(async move {
            submitter
                .submit(
                    key(47906),
                    Box::new(move || {
                        Box::pin(async move {
                            sleep(Duration::from_millis(80)).await;
                            flag.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                    }),
                )
                .await
        });
        sleep(Duration::from_millis(10)).await;

        coordinator.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1, "shutdown abandoned an in-flight send");
        slow.await.unwrap().unwrap();

        let refused = coordinator
            .submit(key(47906), Box::new(|| Box::pin(async { Ok(()) })))
            .await;
        assert!(matches!(refused, Err(LinkError::Closed)));
    }
}
