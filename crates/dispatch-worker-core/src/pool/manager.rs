//! Worker pools across a changing set of dispatch targets.
//!
//! This module defines [`WorkerPoolManager`], which owns one
//! [`TargetManager`] per target address and keeps the total worker population
//! in line with the configured concurrency budget.
//!
//! There is no scheduler loop. Every membership or lifecycle change
//! recomputes the full distribution from the current target set and pushes it
//! into every target, so concurrent callers converge on whatever distribution
//! was applied last.

use crate::{
    Config, Error, Result,
    connection::Connector,
    pool::{State, TargetManager, distribute},
    worker::Processor,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tokio::runtime::Handle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

struct Inner<C>
where
    C: Clone + Send + Sync + 'static,
{
    state: State,
    /// Keyed by address; iteration order is the distribution order.
    targets: BTreeMap<String, TargetManager<C>>,
    /// Captured by `start`; every worker runs here.
    runtime: Option<Handle>,
}

impl<C> Inner<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// The runtime workers are spawned on, if membership changes are
    /// currently accepted.
    fn accepting(&self, operation: &'static str) -> Result<Handle> {
        match &self.runtime {
            Some(runtime) if self.state.accepts_targets() => Ok(runtime.clone()),
            _ => Err(Error::InvalidState {
                operation,
                state: self.state,
            }),
        }
    }
}

/// Owns the worker pools of every known target.
///
/// Discovery reports membership through [`target_added`](Self::target_added)
/// and [`target_removed`](Self::target_removed); both are cheap and never wait
/// on workers. [`stop`](Self::stop) is the only operation that waits, bounded
/// by [`Config::shutdown_timeout`].
///
/// All methods take `&self`; share the manager behind an [`Arc`] between the
/// discovery source and the shutdown path. [`start`](Self::start) must run
/// inside a Tokio runtime; workers are spawned on that runtime, so membership
/// changes may come from any thread.
pub struct WorkerPoolManager<K>
where
    K: Connector,
{
    config: Config,
    connector: K,
    processor: Arc<dyn Processor<K::Connection>>,
    inner: Mutex<Inner<K::Connection>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<K> WorkerPoolManager<K>
where
    K: Connector,
{
    pub fn new(
        config: Config,
        connector: K,
        processor: Arc<dyn Processor<K::Connection>>,
    ) -> Self {
        Self {
            config,
            connector,
            processor,
            inner: Mutex::new(Inner {
                state: State::New,
                targets: BTreeMap::new(),
                runtime: None,
            }),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Current target addresses, in distribution order.
    pub fn targets(&self) -> Vec<String> {
        self.inner.lock().targets.keys().cloned().collect()
    }

    /// Total live workers across all current targets.
    ///
    /// Workers of removed targets that are still draining are not counted.
    pub fn live_concurrency(&self) -> usize {
        self.inner
            .lock()
            .targets
            .values()
            .map(TargetManager::live_count)
            .sum()
    }

    /// Moves the pool from `New` to `Running`.
    ///
    /// The pool starts empty; workers appear as targets are added.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless the pool is `New`.
    /// - [`Error::NoRuntime`] when called outside a Tokio runtime; the pool
    ///   stays `New`.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != State::New {
            return Err(Error::InvalidState {
                operation: "start",
                state: inner.state,
            });
        }

        let runtime =
            Handle::try_current().map_err(|_| Error::NoRuntime { operation: "start" })?;
        inner.runtime = Some(runtime);
        inner.state = State::Starting;
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting worker pool (parallelism={}, match_global_cap={}, global_cap={})",
            self.config.parallelism,
            self.config.match_global_cap,
            self.config.global_cap
        );
        inner.state = State::Running;

        Ok(())
    }

    /// Registers a new target and rebalances every target.
    ///
    /// Adding an address that is already known does nothing.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] outside `Starting`, `Running` or `Stopping`.
    /// - [`Error::Connect`] if the connector rejects the address; the target
    ///   set is left unchanged.
    pub fn target_added(&self, address: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let runtime = inner.accepting("add a target")?;

        if inner.targets.contains_key(address) {
            return Ok(());
        }

        // Connectors may spawn background tasks of their own.
        let _entered = runtime.enter();
        let connection = self.connector.connect(address)?;
        let target = TargetManager::new(
            address,
            connection,
            Arc::clone(&self.processor),
            self.config.notify_shutdown_timeout,
            self.shutdown.child_token(),
            self.tracker.clone(),
            runtime.clone(),
        );
        inner.targets.insert(address.to_owned(), target);

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Added target {address} ({} targets)",
            inner.targets.len()
        );

        self.rebalance(&inner);
        Ok(())
    }

    /// Cancels a target's workers, forgets it, and rebalances the rest.
    ///
    /// Returns as soon as the cancellations are issued; the removed workers
    /// drain in the background. Removing an unknown address does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] outside `Starting`, `Running` or
    /// `Stopping`.
    pub fn target_removed(&self, address: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.accepting("remove a target")?;

        let Some(target) = inner.targets.remove(address) else {
            return Ok(());
        };
        target.retire();

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Removed target {address} ({} workers draining, {} targets left)",
            target.live_count(),
            inner.targets.len()
        );

        self.rebalance(&inner);
        Ok(())
    }

    /// Stops every worker and waits for the pool to drain.
    ///
    /// Waits for workers of removed targets as well. Once drained, the target
    /// set is cleared and the pool is `Terminated`. Stopping a terminated pool
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the pool was never started.
    /// - [`Error::ShutdownTimeout`] if workers are still alive after
    ///   [`Config::shutdown_timeout`]. The pool stays `Stopping` and `stop`
    ///   may be called again.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                State::Running | State::Starting => {
                    inner.state = State::Stopping;
                    #[cfg(feature = "tracing")]
                    tracing::info!(
                        "Stopping worker pool ({} targets, {} workers in flight)",
                        inner.targets.len(),
                        self.tracker.len()
                    );
                    for target in inner.targets.values() {
                        target.retire();
                    }
                    self.shutdown.cancel();
                    self.tracker.close();
                }
                State::Stopping => {}
                State::Terminated => return Ok(()),
                state @ State::New => {
                    return Err(Error::InvalidState {
                        operation: "stop",
                        state,
                    });
                }
            }
        }

        let timeout = self.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_err()
        {
            let remaining = self.tracker.len();
            #[cfg(feature = "tracing")]
            tracing::error!(
                "Worker pool failed to drain within {timeout:?}: {remaining} worker(s) ignored cancellation"
            );
            return Err(Error::ShutdownTimeout { remaining, timeout });
        }

        let mut inner = self.inner.lock();
        inner.targets.clear();
        inner.state = State::Terminated;

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool terminated");

        Ok(())
    }

    /// Applies a fresh distribution to every current target.
    ///
    /// Runs under the mapping lock. `set_concurrency` only spawns and cancels,
    /// so nothing here waits on workers.
    fn rebalance(&self, inner: &Inner<K::Connection>) {
        // Targets registered during shutdown start out retired.
        if inner.state == State::Stopping {
            return;
        }

        let targets: Vec<&TargetManager<K::Connection>> = inner.targets.values().collect();
        for (target, desired) in distribute(&self.config, &targets) {
            target.set_concurrency(desired);
        }
    }
}

impl<K> Drop for WorkerPoolManager<K>
where
    K: Connector,
{
    fn drop(&mut self) {
        // Workers hold no reference back to the manager; make sure they wind
        // down if it goes away without `stop`.
        self.shutdown.cancel();
    }
}

impl<K> core::fmt::Debug for WorkerPoolManager<K>
where
    K: Connector,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WorkerPoolManager")
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("targets", &inner.targets.values().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
