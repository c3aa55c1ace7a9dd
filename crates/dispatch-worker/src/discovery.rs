use crate::telemetry;
use dispatch_worker_core::{Connector, WorkerPoolManager};
use std::collections::BTreeSet;

/// Target discovery from a fixed address list.
///
/// Reports the difference between the previously applied list and a new one
/// to the pool. The binary applies the configured targets once at startup.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    known: BTreeSet<String>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }

    /// Applies `targets` to `pool`: removals first, then additions.
    ///
    /// Addresses the pool rejects are logged and skipped, so one bad entry
    /// does not keep the rest from being served. Returns how many addresses
    /// were rejected.
    ///
    /// # Errors
    ///
    /// Fails if the pool is not accepting membership changes.
    pub fn update<K, I, S>(
        &mut self,
        pool: &WorkerPoolManager<K>,
        targets: I,
    ) -> dispatch_worker_core::Result<usize>
    where
        K: Connector,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wanted: BTreeSet<String> = targets.into_iter().map(Into::into).collect();

        let gone: Vec<String> = self.known.difference(&wanted).cloned().collect();
        for address in gone {
            pool.target_removed(&address)?;
            self.known.remove(&address);
            telemetry::increment_targets_removed();
        }

        let mut rejected = 0;
        for address in wanted {
            if self.known.contains(&address) {
                continue;
            }
            match pool.target_added(&address) {
                Ok(()) => {
                    telemetry::increment_targets_added();
                    self.known.insert(address);
                }
                Err(e @ dispatch_worker_core::Error::Connect { .. }) => {
                    rejected += 1;
                    #[cfg(feature = "tracing")]
                    tracing::error!("Skipping target: {e}");
                    #[cfg(not(feature = "tracing"))]
                    let _ = e;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(rejected)
    }
}
