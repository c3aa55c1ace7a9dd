use crate::{
    Config, Error, LazyChannelConnector, Processor, State, WorkerPoolManager,
    connection::Connector,
};
use core::{fmt, time::Duration};
use portable_atomic::{AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

/// Polls `observe` until it returns `expected`, failing after `deadline`.
pub(crate) async fn poll_until<T, F>(deadline: Duration, expected: T, observe: F)
where
    T: PartialEq + fmt::Debug,
    F: Fn() -> T,
{
    let start = Instant::now();
    loop {
        let actual = observe();
        if actual == expected {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "expected {expected:?} within {deadline:?}, last observed {actual:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Processes until cancelled and counts lifecycle calls.
#[derive(Default)]
pub(crate) struct CountingProcessor {
    started: AtomicUsize,
    notified: AtomicUsize,
    exit_delay: Duration,
    return_immediately: bool,
    panic_on_process: bool,
}

impl CountingProcessor {
    pub(crate) fn with_exit_delay(exit_delay: Duration) -> Self {
        Self {
            exit_delay,
            ..Self::default()
        }
    }

    pub(crate) fn returning_immediately() -> Self {
        Self {
            return_immediately: true,
            ..Self::default()
        }
    }

    pub(crate) fn panicking() -> Self {
        Self {
            panic_on_process: true,
            ..Self::default()
        }
    }

    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn notified(&self) -> usize {
        self.notified.load(Ordering::Acquire)
    }
}

#[tonic::async_trait]
impl<C> Processor<C> for CountingProcessor
where
    C: Send + Sync + 'static,
{
    async fn process(&self, cancel: CancellationToken, _connection: &C, _address: &str) {
        self.started.fetch_add(1, Ordering::AcqRel);
        assert!(!self.panic_on_process, "processor blew up");
        if self.return_immediately {
            return;
        }
        cancel.cancelled().await;
        if !self.exit_delay.is_zero() {
            tokio::time::sleep(self.exit_delay).await;
        }
    }

    async fn notify_shutdown(&self, _connection: &C, _address: &str) {
        self.notified.fetch_add(1, Ordering::AcqRel);
    }
}

pub(crate) fn wait_for_cancel_processor<C>() -> Arc<dyn Processor<C>>
where
    C: Send + Sync + 'static,
{
    Arc::new(CountingProcessor::default())
}

/// Ignores cancellation entirely.
pub(crate) struct StubbornProcessor;

#[tonic::async_trait]
impl<C> Processor<C> for StubbornProcessor
where
    C: Send + Sync + 'static,
{
    async fn process(&self, _cancel: CancellationToken, _connection: &C, _address: &str) {
        futures::future::pending::<()>().await;
    }

    async fn notify_shutdown(&self, _connection: &C, _address: &str) {}
}

/// Never finishes notifying shutdown.
pub(crate) struct HangingNotifyProcessor;

#[tonic::async_trait]
impl<C> Processor<C> for HangingNotifyProcessor
where
    C: Send + Sync + 'static,
{
    async fn process(&self, cancel: CancellationToken, _connection: &C, _address: &str) {
        cancel.cancelled().await;
    }

    async fn notify_shutdown(&self, _connection: &C, _address: &str) {
        futures::future::pending::<()>().await;
    }
}

/// Hands out unit connections and rejects addresses starting with `bad`.
struct UnitConnector;

impl Connector for UnitConnector {
    type Connection = ();

    fn connect(&self, address: &str) -> crate::Result<()> {
        if address.starts_with("bad") {
            return Err(Error::Connect {
                address: address.to_owned(),
                reason: "rejected".to_owned(),
            });
        }
        Ok(())
    }
}

fn address(i: usize) -> String {
    format!("127.0.0.1:{i}")
}

fn channel_pool(config: Config) -> WorkerPoolManager<LazyChannelConnector> {
    let pool = WorkerPoolManager::new(
        config,
        LazyChannelConnector::new(),
        wait_for_cancel_processor(),
    );
    pool.start().unwrap();
    pool
}

fn unit_pool(config: Config, processor: Arc<dyn Processor<()>>) -> WorkerPoolManager<UnitConnector> {
    let pool = WorkerPoolManager::new(config, UnitConnector, processor);
    pool.start().unwrap();
    pool
}

async fn run_reset_concurrency(
    config: Config,
    num_targets: usize,
    expected: usize,
    expected_after_removal: usize,
) {
    let pool = channel_pool(config);

    // Channels are lazy, so the placeholder ports are never dialed.
    for i in 0..num_targets {
        pool.target_added(&address(i)).unwrap();
    }
    poll_until(WAIT, expected, || pool.live_concurrency()).await;

    pool.target_removed(&address(num_targets / 2)).unwrap();
    poll_until(WAIT, expected_after_removal, || pool.live_concurrency()).await;

    pool.stop().await.unwrap();
    assert_eq!(pool.live_concurrency(), 0);
    assert_eq!(pool.state(), State::Terminated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_least_one_worker_per_target() {
    run_reset_concurrency(Config::with_parallelism(0), 2, 2, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallelism_per_target() {
    run_reset_concurrency(Config::with_parallelism(4), 2, 8, 4).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_cap_with_remainder() {
    run_reset_concurrency(Config::with_global_cap(7), 4, 7, 7).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_cap_dividing_evenly() {
    run_reset_concurrency(Config::with_global_cap(6), 2, 6, 6).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_cap_keeps_one_worker_per_target() {
    run_reset_concurrency(Config::with_global_cap(3), 6, 6, 5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remainder_lands_on_lowest_addresses() {
    let pool = unit_pool(
        Config::with_global_cap(7),
        wait_for_cancel_processor(),
    );
    for name in ["d:1", "b:1", "a:1", "c:1"] {
        pool.target_added(name).unwrap();
    }

    assert_eq!(pool.targets(), vec!["a:1", "b:1", "c:1", "d:1"]);
    poll_until(WAIT, 7, || pool.live_concurrency()).await;

    pool.target_removed("a:1").unwrap();
    poll_until(WAIT, 7, || pool.live_concurrency()).await;
    assert_eq!(pool.targets(), vec!["b:1", "c:1", "d:1"]);

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_add_and_unknown_remove_are_noops() {
    let processor = Arc::new(CountingProcessor::default());
    let pool = unit_pool(Config::with_parallelism(2), processor.clone());

    pool.target_added("a:1").unwrap();
    pool.target_added("a:1").unwrap();
    pool.target_removed("z:9").unwrap();

    assert_eq!(pool.targets(), vec!["a:1"]);
    poll_until(WAIT, 2, || pool.live_concurrency()).await;
    poll_until(WAIT, 2, || processor.started()).await;

    pool.stop().await.unwrap();
    assert_eq!(processor.notified(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_address_leaves_targets_untouched() {
    let pool = unit_pool(Config::with_parallelism(1), wait_for_cancel_processor());
    pool.target_added("a:1").unwrap();

    let err = pool.target_added("bad:1").unwrap_err();
    assert!(matches!(err, Error::Connect { .. }));
    assert_eq!(pool.targets(), vec!["a:1"]);
    assert_eq!(pool.live_concurrency(), 1);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn lifecycle_violations_fail_loudly() {
    let pool = WorkerPoolManager::new(
        Config::default(),
        UnitConnector,
        wait_for_cancel_processor(),
    );

    assert_eq!(pool.state(), State::New);
    assert_eq!(
        pool.target_added("a:1"),
        Err(Error::InvalidState {
            operation: "add a target",
            state: State::New,
        })
    );
    assert!(matches!(pool.stop().await, Err(Error::InvalidState { .. })));

    pool.start().unwrap();
    assert_eq!(pool.state(), State::Running);
    assert_eq!(
        pool.start(),
        Err(Error::InvalidState {
            operation: "start",
            state: State::Running,
        })
    );

    pool.stop().await.unwrap();
    assert_eq!(
        pool.target_removed("a:1"),
        Err(Error::InvalidState {
            operation: "remove a target",
            state: State::Terminated,
        })
    );
    // Stopping twice is harmless.
    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_waits_for_removed_targets_to_drain() {
    let processor = Arc::new(CountingProcessor::with_exit_delay(Duration::from_millis(100)));
    let pool = unit_pool(Config::with_parallelism(3), processor.clone());

    pool.target_added("a:1").unwrap();
    pool.target_added("b:1").unwrap();
    poll_until(WAIT, 6, || processor.started()).await;

    pool.target_removed("a:1").unwrap();
    assert_eq!(pool.live_concurrency(), 3);

    pool.stop().await.unwrap();
    assert_eq!(processor.notified(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_surfaces_workers_that_ignore_cancellation() {
    let config = Config::with_parallelism(2).shutdown_timeout(Duration::from_millis(50));
    let pool = unit_pool(config, Arc::new(StubbornProcessor));
    pool.target_added("a:1").unwrap();

    let err = pool.stop().await.unwrap_err();
    assert_eq!(
        err,
        Error::ShutdownTimeout {
            remaining: 2,
            timeout: Duration::from_millis(50),
        }
    );
    assert_eq!(pool.state(), State::Stopping);
    assert_eq!(pool.live_concurrency(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn targets_added_while_stopping_get_no_workers() {
    let config = Config::with_parallelism(1).shutdown_timeout(Duration::from_millis(50));
    let pool = unit_pool(config, Arc::new(StubbornProcessor));
    pool.target_added("a:1").unwrap();

    assert!(pool.stop().await.is_err());
    assert_eq!(pool.state(), State::Stopping);

    pool.target_added("b:1").unwrap();
    assert_eq!(pool.targets(), vec!["a:1", "b:1"]);
    assert_eq!(pool.live_concurrency(), 1);

    pool.target_removed("a:1").unwrap();
    assert_eq!(pool.live_concurrency(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_processor_still_notifies_and_exits() {
    let processor = Arc::new(CountingProcessor::panicking());
    let pool = unit_pool(Config::with_parallelism(2), processor.clone());

    pool.target_added("a:1").unwrap();
    poll_until(WAIT, 2, || processor.notified()).await;
    poll_until(WAIT, 0, || pool.live_concurrency()).await;

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_notification_is_bounded() {
    let config = Config::with_parallelism(2)
        .notify_shutdown_timeout(Duration::from_millis(20))
        .shutdown_timeout(WAIT);
    let pool = unit_pool(config, Arc::new(HangingNotifyProcessor));

    pool.target_added("a:1").unwrap();
    assert_eq!(pool.live_concurrency(), 2);

    pool.stop().await.unwrap();
    assert_eq!(pool.live_concurrency(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_membership_changes_converge() {
    let pool = Arc::new(unit_pool(
        Config::with_global_cap(10),
        wait_for_cancel_processor(),
    ));

    let mut handles = Vec::new();
    for i in 0..16 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let name = address(i);
            pool.target_added(&name).unwrap();
            tokio::task::yield_now().await;
            if i % 2 == 0 {
                pool.target_removed(&name).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // 8 targets survive; the cap of 10 is spread as 2,2,1,1,1,1,1,1.
    assert_eq!(pool.targets().len(), 8);
    poll_until(WAIT, 10, || pool.live_concurrency()).await;

    pool.stop().await.unwrap();
    assert_eq!(pool.live_concurrency(), 0);
}

#[test]
fn start_requires_a_runtime() {
    let pool = WorkerPoolManager::new(
        Config::default(),
        UnitConnector,
        wait_for_cancel_processor(),
    );
    assert_eq!(pool.start(), Err(Error::NoRuntime { operation: "start" }));
    assert_eq!(pool.state(), State::New);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_changes_from_plain_threads() {
    let pool = Arc::new(channel_pool(Config::with_global_cap(6)));

    let discovery = Arc::clone(&pool);
    std::thread::spawn(move || {
        discovery.target_added(&address(1))?;
        discovery.target_added(&address(2))
    })
    .join()
    .unwrap()
    .unwrap();
    assert_eq!(pool.targets(), [address(1), address(2)]);
    poll_until(WAIT, 6, || pool.live_concurrency()).await;

    let discovery = Arc::clone(&pool);
    std::thread::spawn(move || discovery.target_removed(&address(1)))
        .join()
        .unwrap()
        .unwrap();
    poll_until(WAIT, 6, || pool.live_concurrency()).await;

    pool.stop().await.unwrap();
    assert_eq!(pool.live_concurrency(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn membership_changes_racing_stop() {
    let processor = Arc::new(CountingProcessor::default());
    let pool = Arc::new(unit_pool(Config::with_global_cap(12), processor.clone()));
    for i in 0..4 {
        pool.target_added(&address(i)).unwrap();
    }

    let mut churn = Vec::new();
    for task in 0..8 {
        let pool = Arc::clone(&pool);
        churn.push(tokio::spawn(async move {
            // Keeps changing membership until the pool refuses.
            for round in 0..1000 {
                let name = address(1000 + task * 1000 + round);
                if pool.target_added(&name).is_err() {
                    break;
                }
                tokio::task::yield_now().await;
                if round % 4 != 0 && pool.target_removed(&name).is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }));
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.stop().await.unwrap();
    assert_eq!(pool.state(), State::Terminated);
    assert_eq!(pool.live_concurrency(), 0);
    assert!(pool.targets().is_empty());

    for handle in churn {
        handle.await.unwrap();
    }

    // Every worker that ever started also left, and nothing started since.
    let started = processor.started();
    assert_eq!(processor.notified(), started);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(processor.started(), started);
}
