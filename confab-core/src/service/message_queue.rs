//! Per-conversation FIFO message dispatch.
//!
//! Each `JobId` owns a queue of pending tasks ordered by sender timestamp
//! (stable on ties). A single runner drains one queue at a time, so at most
//! one task per conversation is in flight while different conversations
//! proceed concurrently. Queues that stay idle are swept periodically.

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::models::JobId;
use crate::{Error, Result};

type BoxedTask<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

struct QueuedTask<T> {
    timestamp: i64,
    task: BoxedTask<T>,
    waiter: oneshot::Sender<Result<T>>,
}

struct QueueState<T> {
    pending: Vec<QueuedTask<T>>,
    processing: bool,
    last_processed_timestamp: i64,
}

/// One conversation's ordered task queue with a single-runner drain loop.
pub struct JobMessageQueue<T> {
    job_id: JobId,
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T> Clone for JobMessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            job_id: self.job_id.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> JobMessageQueue<T> {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            state: Arc::new(Mutex::new(QueueState {
                pending: Vec::new(),
                processing: false,
                last_processed_timestamp: i64::MIN,
            })),
        }
    }

    /// Queue a task and receive its result when the runner reaches it.
    fn enqueue(&self, timestamp: i64, task: BoxedTask<T>) -> oneshot::Receiver<Result<T>> {
        let (waiter, receiver) = oneshot::channel();
        let queued = QueuedTask {
            timestamp,
            task,
            waiter,
        };

        let start_runner = {
            let mut state = self.state.lock();
            // Stable ascending insert: ties keep arrival order.
            let pos = state
                .pending
                .iter()
                .position(|t| t.timestamp > timestamp)
                .unwrap_or(state.pending.len());
            state.pending.insert(pos, queued);

            if state.processing {
                false
            } else {
                state.processing = true;
                true
            }
        };

        if start_runner {
            let queue = self.clone();
            tokio::spawn(async move { queue.run().await });
        }

        receiver
    }

    async fn run(self) {
        loop {
            let (item, high_water) = {
                let mut state = self.state.lock();
                if state.pending.is_empty() {
                    state.processing = false;
                    return;
                }
                let item = state.pending.remove(0);
                (item, state.last_processed_timestamp)
            };

            if item.timestamp < high_water {
                tracing::warn!(
                    job_id = %self.job_id,
                    timestamp = item.timestamp,
                    high_water = high_water,
                    "Late arrival: executing message older than the conversation high-water mark"
                );
            }

            let result = (item.task)().await;

            {
                let mut state = self.state.lock();
                state.last_processed_timestamp =
                    state.last_processed_timestamp.max(item.timestamp);
            }

            // The caller may have gone away; the result is then dropped.
            let _ = item.waiter.send(result);
        }
    }

    fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn is_processing(&self) -> bool {
        self.state.lock().processing
    }

    fn last_processed_timestamp(&self) -> i64 {
        self.state.lock().last_processed_timestamp
    }
}

/// Process-wide queue registry with idle sweeping.
pub struct MessageQueueManager<T> {
    queues: Arc<DashMap<JobId, JobMessageQueue<T>>>,
    last_activity: Arc<DashMap<JobId, Instant>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> MessageQueueManager<T> {
    /// Create the manager and start its idle sweeper.
    #[must_use]
    pub fn new(idle_after: Duration) -> Self {
        let manager = Self {
            queues: Arc::new(DashMap::new()),
            last_activity: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        };

        let queues = Arc::clone(&manager.queues);
        let last_activity = Arc::clone(&manager.last_activity);
        let cancel = manager.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(idle_after);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                Self::sweep_idle(&queues, &last_activity, idle_after);
            }
        });

        manager
    }

    /// Dispatch a task for `job_id`, awaiting its ordered execution.
    ///
    /// Tasks dispatched for the same conversation execute one at a time in
    /// ascending timestamp order; other conversations are unaffected.
    pub async fn dispatch<F>(&self, job_id: &JobId, timestamp: i64, task: F) -> Result<T>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T>> + Send + 'static,
    {
        let queue = self
            .queues
            .entry(job_id.clone())
            .or_insert_with(|| JobMessageQueue::new(job_id.clone()))
            .clone();
        self.last_activity.insert(job_id.clone(), Instant::now());

        let receiver = queue.enqueue(timestamp, Box::new(task));
        receiver
            .await
            .map_err(|_| Error::Internal("Message queue dropped before task completion".into()))?
    }

    #[must_use]
    pub fn pending_count(&self, job_id: &JobId) -> usize {
        self.queues
            .get(job_id)
            .map_or(0, |q| q.pending_count())
    }

    #[must_use]
    pub fn is_processing(&self, job_id: &JobId) -> bool {
        self.queues
            .get(job_id)
            .is_some_and(|q| q.is_processing())
    }

    #[must_use]
    pub fn last_processed_timestamp(&self, job_id: &JobId) -> Option<i64> {
        self.queues
            .get(job_id)
            .map(|q| q.last_processed_timestamp())
            .filter(|&ts| ts != i64::MIN)
    }

    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn sweep_idle(
        queues: &DashMap<JobId, JobMessageQueue<T>>,
        last_activity: &DashMap<JobId, Instant>,
        idle_after: Duration,
    ) {
        let mut removable = Vec::new();
        for entry in queues.iter() {
            let idle = last_activity
                .get(entry.key())
                .map_or(true, |at| at.elapsed() > idle_after);
            if idle && entry.value().pending_count() == 0 && !entry.value().is_processing() {
                removable.push(entry.key().clone());
            }
        }

        for job_id in removable {
            queues.remove(&job_id);
            last_activity.remove(&job_id);
            tracing::debug!(job_id = %job_id, "Swept idle conversation queue");
        }
    }

    /// Stop the sweeper and drop every queue.
    pub fn destroy(&self) {
        self.cancel.cancel();
        self.queues.clear();
        self.last_activity.clear();
    }
}

impl<T> Drop for MessageQueueManager<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> MessageQueueManager<i64> {
        MessageQueueManager::new(Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_out_of_order_timestamps_reordered() {
        let manager = Arc::new(manager());
        let order = Arc::new(Mutex::new(Vec::new()));
        let job = JobId::from("j2");

        // Hold the runner on a slow task so both later enqueues land while
        // the queue is busy and get sorted against each other.
        let first = {
            let manager = Arc::clone(&manager);
            let order = Arc::clone(&order);
            let job = job.clone();
            tokio::spawn(async move {
                manager
                    .dispatch(&job, 1, move || {
                        async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            order.lock().push(1);
                            Ok(1)
                        }
                        .boxed()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let late = {
            let manager = Arc::clone(&manager);
            let order = Arc::clone(&order);
            let job = job.clone();
            tokio::spawn(async move {
                manager
                    .dispatch(&job, 200, move || {
                        async move {
                            order.lock().push(200);
                            Ok(200)
                        }
                        .boxed()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let early = {
            let manager = Arc::clone(&manager);
            let order = Arc::clone(&order);
            let job = job.clone();
            tokio::spawn(async move {
                manager
                    .dispatch(&job, 100, move || {
                        async move {
                            order.lock().push(100);
                            Ok(100)
                        }
                        .boxed()
                    })
                    .await
            })
        };

        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(late.await.unwrap().unwrap(), 200);
        assert_eq!(early.await.unwrap().unwrap(), 100);

        // 100 ran before 200 despite arriving later.
        assert_eq!(*order.lock(), vec![1, 100, 200]);
        assert_eq!(manager.last_processed_timestamp(&job), Some(200));
    }

    #[tokio::test]
    async fn test_single_runner_per_job() {
        let manager = Arc::new(manager());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let job = JobId::from("j-serial");

        let mut handles = Vec::new();
        for i in 0..10 {
            let manager = Arc::clone(&manager);
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            let job = job.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .dispatch(&job, i, move || {
                        async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(i)
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_jobs_run_concurrently() {
        let manager = Arc::new(manager());
        let started = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let manager = Arc::clone(&manager);
            let started = Arc::clone(&started);
            let job = JobId::from(format!("j-par-{i}"));
            handles.push(tokio::spawn(async move {
                manager
                    .dispatch(&job, 1, move || {
                        async move {
                            started.fetch_add(1, Ordering::SeqCst);
                            // Block until every job's task has started, which
                            // only happens when the queues truly run in
                            // parallel.
                            let deadline = Instant::now() + Duration::from_secs(2);
                            while started.load(Ordering::SeqCst) < 4 {
                                if Instant::now() > deadline {
                                    return Err(Error::Internal("queues serialized".into()));
                                }
                                tokio::time::sleep(Duration::from_millis(2)).await;
                            }
                            Ok(0)
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_late_arrival_still_executes() {
        let manager = manager();
        let job = JobId::from("j-late");

        manager
            .dispatch(&job, 200, || async { Ok(200) }.boxed())
            .await
            .unwrap();
        // Lower timestamp after the high-water mark: runs anyway.
        let result = manager
            .dispatch(&job, 100, || async { Ok(100) }.boxed())
            .await
            .unwrap();
        assert_eq!(result, 100);
        // High-water mark is monotonic.
        assert_eq!(manager.last_processed_timestamp(&job), Some(200));
    }

    #[tokio::test]
    async fn test_idle_sweep_removes_quiet_queues() {
        let manager: MessageQueueManager<i64> =
            MessageQueueManager::new(Duration::from_millis(30));
        let job = JobId::from("j-idle");

        manager
            .dispatch(&job, 1, || async { Ok(1) }.boxed())
            .await
            .unwrap();
        assert_eq!(manager.queue_count(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(manager.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_drops_queues() {
        let manager = manager();
        let job = JobId::from("j-destroy");

        manager
            .dispatch(&job, 1, || async { Ok(1) }.boxed())
            .await
            .unwrap();
        manager.destroy();
        assert_eq!(manager.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_task_error_propagates() {
        let manager = manager();
        let job = JobId::from("j-err");

        let err = manager
            .dispatch(&job, 1, || {
                async { Err::<i64, _>(Error::Internal("boom".into())) }.boxed()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        // The runner survives a failed task.
        let ok = manager
            .dispatch(&job, 2, || async { Ok(2) }.boxed())
            .await
            .unwrap();
        assert_eq!(ok, 2);
    }
}
