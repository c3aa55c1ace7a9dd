//! Worker population for a single target.

use crate::{
    Error, Result,
    worker::{LiveGuard, Processor, WorkerTask, worker_loop},
};
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::{collections::VecDeque, sync::Arc};
use tokio::runtime::Handle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

struct WorkerHandle {
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Workers {
    /// Running workers, oldest first.
    handles: VecDeque<WorkerHandle>,
    next_id: u64,
}

/// Owns the workers bound to one target address.
///
/// [`set_concurrency`](Self::set_concurrency) spawns or cancels workers until
/// the number of running (not cancelled) workers matches the request. The
/// live count lags behind while cancelled workers finish their current step
/// and notify the target.
///
/// Every worker is tracked twice: by this target's own [`TaskTracker`], which
/// backs [`stop_all`](Self::stop_all), and by the pool-wide tracker handed in
/// at construction, so the pool can wait for workers of targets it has already
/// dropped.
pub struct TargetManager<C>
where
    C: Clone + Send + Sync + 'static,
{
    address: Arc<str>,
    connection: C,
    processor: Arc<dyn Processor<C>>,
    notify_timeout: Duration,
    workers: Mutex<Workers>,
    live: Arc<AtomicUsize>,
    desired: AtomicUsize,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    pool_tracker: TaskTracker,
    runtime: Handle,
}

impl<C> TargetManager<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Creates a target with no workers.
    ///
    /// `shutdown` is the parent of every worker token; cancelling it retires
    /// the target for good. Workers are spawned on `runtime`, so the target
    /// can be scaled from any thread.
    pub fn new(
        address: &str,
        connection: C,
        processor: Arc<dyn Processor<C>>,
        notify_timeout: Duration,
        shutdown: CancellationToken,
        pool_tracker: TaskTracker,
        runtime: Handle,
    ) -> Self {
        Self {
            address: Arc::from(address),
            connection,
            processor,
            notify_timeout,
            workers: Mutex::new(Workers::default()),
            live: Arc::new(AtomicUsize::new(0)),
            desired: AtomicUsize::new(0),
            shutdown,
            tracker: TaskTracker::new(),
            pool_tracker,
            runtime,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of workers that have not exited yet, including cancelled ones
    /// that are still draining.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// The concurrency most recently requested through
    /// [`set_concurrency`](Self::set_concurrency).
    pub fn desired_concurrency(&self) -> usize {
        self.desired.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Scales the number of running workers to `n`.
    ///
    /// Scale-up spawns new workers immediately. Scale-down cancels the oldest
    /// workers and returns without waiting for them. Ignored once the target
    /// has been stopped.
    pub fn set_concurrency(&self, n: usize) {
        let mut workers = self.workers.lock();

        if self.shutdown.is_cancelled() {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "Ignoring concurrency {n} for stopped target {}",
                self.address
            );
            return;
        }

        // Workers that exited on their own have already cancelled their token.
        workers.handles.retain(|w| !w.cancel.is_cancelled());
        self.desired.store(n, Ordering::Release);

        let current = workers.handles.len();
        if n == current {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Scaling {} from {current} to {n} workers ({} live)",
            self.address,
            self.live_count()
        );

        while workers.handles.len() < n {
            let id = workers.next_id;
            workers.next_id += 1;
            let cancel = self.shutdown.child_token();
            self.spawn_worker(id, cancel.clone());
            workers.handles.push_back(WorkerHandle { id, cancel });
        }

        while workers.handles.len() > n {
            if let Some(worker) = workers.handles.pop_front() {
                #[cfg(feature = "tracing")]
                tracing::trace!("Cancelling worker {} for {}", worker.id, self.address);
                worker.cancel.cancel();
            }
        }
    }

    fn spawn_worker(&self, worker_id: u64, cancel: CancellationToken) {
        let task = WorkerTask {
            worker_id,
            address: Arc::clone(&self.address),
            connection: self.connection.clone(),
            processor: Arc::clone(&self.processor),
            cancel,
            notify_timeout: self.notify_timeout,
            live: LiveGuard::acquire(&self.live),
        };

        self.pool_tracker
            .spawn_on(self.tracker.track_future(worker_loop(task)), &self.runtime);
    }

    /// Cancels every worker and retires the target without waiting.
    ///
    /// Later calls to [`set_concurrency`](Self::set_concurrency) are ignored.
    pub fn retire(&self) {
        let mut workers = self.workers.lock();
        self.shutdown.cancel();
        workers.handles.clear();
        self.desired.store(0, Ordering::Release);
        self.tracker.close();
    }

    /// Retires the target and waits up to `timeout` for every worker to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutdownTimeout`] if workers are still running when
    /// the timeout expires. They keep their cancellation and may still exit
    /// later.
    pub async fn stop_all(&self, timeout: Duration) -> Result<()> {
        self.retire();

        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_err()
        {
            let remaining = self.live_count();
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "{remaining} worker(s) for {} did not stop within {timeout:?}",
                self.address
            );
            return Err(Error::ShutdownTimeout { remaining, timeout });
        }

        Ok(())
    }
}

impl<C> core::fmt::Debug for TargetManager<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TargetManager")
            .field("address", &self.address)
            .field("desired", &self.desired_concurrency())
            .field("live", &self.live_count())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
