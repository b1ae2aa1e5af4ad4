//! In-memory queue backend.
//!
//! A bounded mpsc channel feeds a worker task that hands each task to the
//! listener on its own tokio task, holding one semaphore permit per task so at
//! most `max_concurrent` run at once. Deferred and recurring tasks are driven
//! by timers that stop when the queue ends. Nothing is persisted: tasks still
//! buffered when the queue ends are dropped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use quarterback_core::{ClockSource, SystemClock, Task};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{QueueFactory, QueueSpec, TaskListener, TaskQueue};

/// `specific` option overriding the channel capacity of one type's queue.
pub const CAPACITY_OPTION: &str = "capacity";

const DEFAULT_CAPACITY: usize = 1024;

pub struct MemoryQueue {
    key: String,
    tx: mpsc::Sender<Task>,
    rx: Mutex<Option<mpsc::Receiver<Task>>>,
    permits: Arc<Semaphore>,
    max_concurrent: u32,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    clock: Arc<dyn ClockSource>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        capacity: usize,
        max_concurrent: usize,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let max_concurrent = u32::try_from(max_concurrent.max(1)).unwrap_or(u32::MAX);
        Self {
            key: key.into(),
            tx,
            rx: Mutex::new(Some(rx)),
            permits: Arc::new(Semaphore::new(max_concurrent as usize)),
            max_concurrent,
            shutdown,
            worker: Mutex::new(None),
            clock,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn max_concurrent(&self) -> u32 {
        self.max_concurrent
    }

    /// Tasks currently being processed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.max_concurrent as usize - self.permits.available_permits()
    }

    /// Tasks buffered and not yet delivered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    fn is_ended(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push(&self, task: Task) -> anyhow::Result<()> {
        if self.is_ended() {
            bail!("queue {} has ended", self.key);
        }
        self.tx
            .send(task)
            .await
            .map_err(|_| anyhow!("queue {} is closed", self.key))
    }

    async fn defer(&self, task: Task, when_ms: u64) -> anyhow::Result<()> {
        if self.is_ended() {
            bail!("queue {} has ended", self.key);
        }
        let delay = Duration::from_millis(when_ms.saturating_sub(self.clock.now()));
        let tx = self.tx.clone();
        let mut shutdown = self.shutdown.subscribe();
        let key = self.key.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.changed() => debug!(queue = %key, "deferred task dropped at shutdown"),
                () = tokio::time::sleep(delay) => {
                    if tx.send(task).await.is_err() {
                        debug!(queue = %key, "queue closed before deferred task became due");
                    }
                }
            }
        });
        Ok(())
    }

    async fn recur(&self, task: Task, interval_ms: u64) -> anyhow::Result<()> {
        if self.is_ended() {
            bail!("queue {} has ended", self.key);
        }
        if interval_ms == 0 {
            bail!("recurrence interval must be positive");
        }
        let tx = self.tx.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if tx.send(task.clone()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn listen(&self, listener: Arc<dyn TaskListener>) -> anyhow::Result<()> {
        if self.is_ended() {
            bail!("queue {} has ended", self.key);
        }
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| anyhow!("queue {} already has a listener", self.key))?;
        let mut shutdown = self.shutdown.subscribe();
        let permits = Arc::clone(&self.permits);
        let key = self.key.clone();

        let handle = tokio::spawn(async move {
            loop {
                // Take a permit before dequeuing so excess tasks stay buffered.
                let permit = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let task = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    task = rx.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                };

                let listener = Arc::clone(&listener);
                let key = key.clone();
                tokio::spawn(async move {
                    if let Err(error) = listener.on_task(task).await {
                        debug!(queue = %key, %error, "task failed");
                    }
                    drop(permit);
                });
            }
            debug!(queue = %key, "queue worker stopped");
        });

        *self.worker.lock() = Some(handle);
        Ok(())
    }

    async fn end(&self) -> anyhow::Result<()> {
        if self.shutdown.send_replace(true) {
            return Ok(());
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| anyhow!("queue {} worker failed: {e}", self.key))?;
        }

        // Every permit back means every in-flight task finished.
        let _drained = self
            .permits
            .acquire_many(self.max_concurrent)
            .await
            .map_err(|_| anyhow!("queue {} semaphore closed", self.key))?;
        self.permits.close();

        let dropped = self.pending();
        if dropped > 0 {
            warn!(queue = %self.key, dropped, "discarding undelivered tasks");
        }
        Ok(())
    }
}

/// Creates a [`MemoryQueue`] per capability type.
pub struct MemoryQueueFactory {
    capacity: usize,
    clock: Arc<dyn ClockSource>,
}

impl MemoryQueueFactory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clock: Arc::new(SystemClock),
        }
    }

    /// Uses `clock` to resolve deferred task due times.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for MemoryQueueFactory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl QueueFactory for MemoryQueueFactory {
    fn create(&self, spec: &QueueSpec) -> anyhow::Result<Arc<dyn TaskQueue>> {
        let capacity = spec
            .options
            .get(CAPACITY_OPTION)
            .and_then(Value::as_u64)
            .and_then(|c| usize::try_from(c).ok())
            .unwrap_or(self.capacity);
        Ok(Arc::new(MemoryQueue::new(
            spec.key.clone(),
            capacity,
            spec.max_concurrent,
            Arc::clone(&self.clock),
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use quarterback_core::{InterceptError, ManualClock};
    use serde_json::json;

    use super::*;

    /// Forwards every task to a channel after an optional delay and tracks
    /// peak concurrency.
    struct Probe {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        done: mpsc::UnboundedSender<Task>,
    }

    impl Probe {
        fn new(delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<Task>) {
            let (done, rx) = mpsc::unbounded_channel();
            let probe = Arc::new(Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                done,
            });
            (probe, rx)
        }
    }

    #[async_trait]
    impl TaskListener for Probe {
        async fn on_task(&self, task: Task) -> Result<(), InterceptError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            let _ = self.done.send(task);
            Ok(())
        }

        fn on_error(&self, _error: anyhow::Error) {}
    }

    fn queue(max_concurrent: usize) -> MemoryQueue {
        MemoryQueue::new("qb:service:test", 16, max_concurrent, Arc::new(SystemClock))
    }

    fn numbered(n: u64) -> Task {
        Task::from_value(json!({ "n": n })).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_tasks_within_concurrency_limit() {
        let queue = queue(2);
        let (probe, mut done) = Probe::new(Duration::from_millis(10));
        queue.listen(probe.clone()).unwrap();

        for n in 0..5 {
            queue.push(numbered(n)).await.unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(done.recv().await.unwrap()["n"].as_u64().unwrap());
        }
        seen.sort_unstable();

        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(probe.peak.load(Ordering::SeqCst), 2);
        queue.end().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn end_waits_for_in_flight_tasks() {
        let queue = queue(1);
        let (probe, mut done) = Probe::new(Duration::from_millis(100));
        queue.listen(probe.clone()).unwrap();
        queue.push(numbered(1)).await.unwrap();

        // Let the worker hand the task over.
        while probe.active.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        queue.end().await.unwrap();

        assert_eq!(queue.in_flight(), 0);
        assert!(done.try_recv().is_ok());
        assert!(queue.push(numbered(2)).await.is_err());
    }

    #[tokio::test]
    async fn second_listener_is_rejected() {
        let queue = queue(1);
        let (probe, _done) = Probe::new(Duration::ZERO);
        queue.listen(probe.clone()).unwrap();
        assert!(queue.listen(probe).is_err());
        queue.end().await.unwrap();
        queue.end().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_task_waits_until_due() {
        let clock = Arc::new(ManualClock::new(1_000));
        let queue = MemoryQueue::new("qb:service:later", 4, 1, clock);
        let (probe, mut done) = Probe::new(Duration::ZERO);
        queue.listen(probe).unwrap();

        queue.defer(numbered(7), 1_500).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(400), done.recv())
            .await
            .is_err());
        assert_eq!(done.recv().await.unwrap()["n"], json!(7));
        queue.end().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_task_repeats_until_end() {
        let queue = queue(1);
        let (probe, mut done) = Probe::new(Duration::ZERO);
        queue.listen(probe).unwrap();

        assert!(queue.recur(numbered(1), 0).await.is_err());
        queue.recur(numbered(1), 100).await.unwrap();
        for _ in 0..3 {
            assert_eq!(done.recv().await.unwrap()["n"], json!(1));
        }
        queue.end().await.unwrap();
    }

    #[test]
    fn factory_honours_capacity_option() {
        let factory = MemoryQueueFactory::new(8);
        let spec = QueueSpec {
            key: "qb:service:echo".into(),
            task_type: "echo".into(),
            max_concurrent: 3,
            options: json!({ "capacity": 2 }).as_object().cloned().unwrap(),
        };
        assert!(factory.create(&spec).is_ok());
    }
}
