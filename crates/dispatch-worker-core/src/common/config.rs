use core::time::Duration;

/// Default upper bound on how long [`WorkerPoolManager::stop`] waits for the
/// pool to drain.
///
/// [`WorkerPoolManager::stop`]: crate::pool::WorkerPoolManager::stop
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound on a single worker's shutdown notification.
pub const DEFAULT_NOTIFY_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Concurrency settings for a [`WorkerPoolManager`].
///
/// A manager is built from one `Config` and never changes it afterwards. When
/// `match_global_cap` is off, every target gets `parallelism` workers (at
/// least one). When it is on, `global_cap` workers are spread across all
/// targets, still with a floor of one worker per target.
///
/// [`WorkerPoolManager`]: crate::pool::WorkerPoolManager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Workers per target when the global cap is not matched.
    pub parallelism: usize,
    /// Spread `global_cap` across all targets instead of using `parallelism`.
    pub match_global_cap: bool,
    /// Total desired workers across every target when `match_global_cap` is
    /// set.
    pub global_cap: usize,
    /// How long `stop` waits for all workers to exit.
    pub shutdown_timeout: Duration,
    /// How long each worker may spend notifying its target that it is going
    /// away.
    pub notify_shutdown_timeout: Duration,
}

impl Config {
    /// Fixed per-target parallelism with no global cap.
    pub fn with_parallelism(parallelism: usize) -> Self {
        Self {
            parallelism,
            ..Self::default()
        }
    }

    /// Spread `global_cap` workers across however many targets exist.
    pub fn with_global_cap(global_cap: usize) -> Self {
        Self {
            match_global_cap: true,
            global_cap,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn notify_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.notify_shutdown_timeout = timeout;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallelism: 1,
            match_global_cap: false,
            global_cap: 0,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            notify_shutdown_timeout: DEFAULT_NOTIFY_SHUTDOWN_TIMEOUT,
        }
    }
}
