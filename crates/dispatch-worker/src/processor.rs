//! Health watching processor run by every worker.
//!
//! Each worker keeps a `grpc.health.v1.Health/Watch` stream open against its
//! target and logs serving status transitions. Broken streams are retried
//! with capped exponential backoff until the worker is cancelled.
//!
//! Outgoing calls carry the forwarded headers in scope and, with the
//! `tracing` feature, the worker span's trace context.

use crate::telemetry;
use core::time::Duration;
use dispatch_worker_core::{ForwardingInterceptor, Processor};
use tokio_util::sync::CancellationToken;
use tonic::{
    Request, Status,
    service::{Interceptor, interceptor::InterceptedService},
    transport::Channel,
};
use tonic_health::pb::{HealthCheckRequest, health_client::HealthClient};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

type Client = HealthClient<InterceptedService<Channel, WorkerInterceptor>>;

/// Header forwarding followed by trace context injection.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerInterceptor {
    forwarding: ForwardingInterceptor,
}

impl Interceptor for WorkerInterceptor {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let mut request = self.forwarding.call(request)?;
        telemetry::inject_trace_context(request.metadata_mut());
        Ok(request)
    }
}

#[derive(Debug, Clone)]
pub struct HealthWatchProcessor {
    /// Empty watches the server as a whole.
    service: String,
    check_timeout: Duration,
}

impl HealthWatchProcessor {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    /// Bounds the final `Check` sent when a worker leaves its target.
    #[must_use]
    pub const fn check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    fn client(channel: &Channel) -> Client {
        HealthClient::with_interceptor(channel.clone(), WorkerInterceptor::default())
    }

    fn request(&self) -> HealthCheckRequest {
        HealthCheckRequest {
            service: self.service.clone(),
        }
    }

    /// Holds a single watch stream until the target closes it.
    ///
    /// Returns whether any status update arrived, so a healthy stream resets
    /// the caller's backoff.
    async fn watch(&self, client: &mut Client, _address: &str) -> Result<bool, Status> {
        let mut stream = client.watch(self.request()).await?.into_inner();
        let mut last = None;

        while let Some(response) = stream.message().await? {
            let status = response.status();
            if last != Some(status) {
                #[cfg(feature = "tracing")]
                tracing::info!(
                    "Target {_address} is {} (service={:?})",
                    status.as_str_name(),
                    self.service
                );
                last = Some(status);
            }
        }

        Ok(last.is_some())
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "health_watch", skip_all, fields(target = address))
    )]
    async fn watch_until_cancelled(
        &self,
        cancel: CancellationToken,
        channel: &Channel,
        address: &str,
    ) {
        let mut client = Self::client(channel);
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let outcome = tokio::select! {
                () = cancel.cancelled() => return,
                outcome = self.watch(&mut client, address) => outcome,
            };

            match outcome {
                Ok(received) => {
                    if received {
                        backoff = INITIAL_BACKOFF;
                    }
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Watch stream to {address} closed, retrying in {backoff:?}");
                }
                Err(_status) => {
                    telemetry::increment_worker_stream_errors();
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "Watch stream to {address} failed ({}), retrying in {backoff:?}",
                        _status.message()
                    );
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "final_check", skip_all, fields(target = _address))
    )]
    async fn final_check(&self, channel: &Channel, _address: &str) {
        let mut client = Self::client(channel);
        let checked = tokio::time::timeout(self.check_timeout, client.check(self.request())).await;

        match checked {
            Ok(Ok(_response)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "Leaving {_address} while it is {}",
                    _response.into_inner().status().as_str_name()
                );
            }
            Ok(Err(_status)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Final check against {_address} failed: {}", _status.message());
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "Final check against {_address} timed out after {:?}",
                    self.check_timeout
                );
            }
        }
    }
}

#[tonic::async_trait]
impl Processor<Channel> for HealthWatchProcessor {
    async fn process(&self, cancel: CancellationToken, channel: &Channel, address: &str) {
        self.watch_until_cancelled(cancel, channel, address).await;
    }

    async fn notify_shutdown(&self, channel: &Channel, address: &str) {
        self.final_check(channel, address).await;
    }
}
