//! Worker capability and worker task lifecycle.
//!
//! A worker is one Tokio task bound to a target's connection. It drives a
//! [`Processor`] until its [`CancellationToken`] fires, then gives the
//! processor a bounded window to tell the target it is going away.
//!
//! Workers never get aborted. Scaling down and shutdown only cancel tokens, and
//! each worker exits on its own once the processor observes the cancellation.

use core::panic::AssertUnwindSafe;
use core::time::Duration;
use futures::FutureExt;
use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The work executed by every worker against its target.
///
/// Implementations must be safe to run concurrently: all workers of a target
/// share one connection, and all targets share one processor.
#[tonic::async_trait]
pub trait Processor<C>: Send + Sync + 'static
where
    C: Send + Sync + 'static,
{
    /// Pulls and executes work from `address` over `connection` until `cancel`
    /// fires.
    ///
    /// Returning before cancellation is allowed (the worker then exits and the
    /// next rebalance replaces it), but a processor that never observes
    /// `cancel` will stall shutdown until the pool's drain deadline.
    async fn process(&self, cancel: CancellationToken, connection: &C, address: &str);

    /// Best-effort notification that this worker is leaving the target.
    ///
    /// Invoked exactly once per worker after [`Processor::process`] returns,
    /// including when it panicked. The call is bounded by the pool's
    /// `notify_shutdown_timeout`.
    async fn notify_shutdown(&self, connection: &C, address: &str);
}

/// Keeps a target's live worker count accurate on every exit path.
///
/// The count is bumped when the guard is created, before the task is spawned,
/// and released when the worker future is dropped.
#[derive(Debug)]
pub(crate) struct LiveGuard {
    live: Arc<AtomicUsize>,
}

impl LiveGuard {
    pub(crate) fn acquire(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self {
            live: Arc::clone(live),
        }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything a spawned worker owns.
pub(crate) struct WorkerTask<C> {
    pub(crate) worker_id: u64,
    pub(crate) address: Arc<str>,
    pub(crate) connection: C,
    pub(crate) processor: Arc<dyn Processor<C>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) notify_timeout: Duration,
    pub(crate) live: LiveGuard,
}

/// Worker task body.
///
/// Runs the processor until it returns, then notifies shutdown under a
/// timeout. A panic in either call is caught so the notification is still
/// attempted and the live count still released.
#[allow(clippy::used_underscore_binding)]
pub(crate) async fn worker_loop<C>(task: WorkerTask<C>)
where
    C: Send + Sync + 'static,
{
    let WorkerTask {
        worker_id: _worker_id,
        address,
        connection,
        processor,
        cancel,
        notify_timeout,
        live: _live,
    } = task;

    // Marks the token cancelled however this worker exits, so the owning
    // target stops counting it as running.
    let _cancel_on_exit = cancel.clone().drop_guard();

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} for {address} started");

    let processed = AssertUnwindSafe(processor.process(cancel.clone(), &connection, &address))
        .catch_unwind()
        .await;

    if processed.is_err() {
        #[cfg(feature = "tracing")]
        tracing::error!("Worker {_worker_id} for {address} panicked while processing");
    } else if !cancel.is_cancelled() {
        #[cfg(feature = "tracing")]
        tracing::warn!("Worker {_worker_id} for {address} stopped processing before cancellation");
    }

    let notified = tokio::time::timeout(
        notify_timeout,
        AssertUnwindSafe(processor.notify_shutdown(&connection, &address)).catch_unwind(),
    )
    .await;

    match notified {
        Ok(Ok(())) => {
            #[cfg(feature = "tracing")]
            tracing::trace!("Worker {_worker_id} for {address} notified shutdown");
        }
        Ok(Err(_)) => {
            #[cfg(feature = "tracing")]
            tracing::error!("Worker {_worker_id} for {address} panicked while notifying shutdown");
        }
        Err(_) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Worker {_worker_id} for {address} shutdown notification timed out after {notify_timeout:?}"
            );
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} for {address} stopped");
}
