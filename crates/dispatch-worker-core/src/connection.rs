//! Connection handles for dispatch targets.
//!
//! The pool asks a [`Connector`] for one handle per target and shares it
//! between all of that target's workers. Handles are virtual: producing one
//! must not touch the network, so an unreachable target only shows up as an
//! error once a worker actually uses the connection.

use crate::{Error, Result};
use core::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// Produces connection handles for target addresses.
pub trait Connector: Send + Sync + 'static {
    /// Handle shared by every worker of a target.
    type Connection: Clone + Send + Sync + 'static;

    /// Builds a handle for `address` without performing any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] if the address cannot be turned into a
    /// handle at all (for example, it is not a valid URI).
    fn connect(&self, address: &str) -> Result<Self::Connection>;
}

/// [`Connector`] backed by lazily-connecting tonic [`Channel`]s.
///
/// Addresses without a scheme are treated as `http://host:port`. The returned
/// channel dials on first use and reconnects on its own afterwards.
///
/// Must be used from within a Tokio runtime, since each channel spawns its
/// own buffer task.
#[derive(Debug, Clone, Default)]
pub struct LazyChannelConnector {
    connect_timeout: Option<Duration>,
    tcp_keepalive: Option<Duration>,
    http2_keepalive_interval: Option<Duration>,
}

impl LazyChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn tcp_keepalive(mut self, interval: Duration) -> Self {
        self.tcp_keepalive = Some(interval);
        self
    }

    #[must_use]
    pub const fn http2_keepalive_interval(mut self, interval: Duration) -> Self {
        self.http2_keepalive_interval = Some(interval);
        self
    }

    fn endpoint(&self, address: &str) -> Result<Endpoint> {
        let uri = if address.contains("://") {
            address.to_owned()
        } else {
            format!("http://{address}")
        };

        let mut endpoint = Endpoint::from_shared(uri).map_err(|e| Error::Connect {
            address: address.to_owned(),
            reason: e.to_string(),
        })?;

        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        if self.tcp_keepalive.is_some() {
            endpoint = endpoint.tcp_keepalive(self.tcp_keepalive);
        }
        if let Some(interval) = self.http2_keepalive_interval {
            endpoint = endpoint
                .http2_keep_alive_interval(interval)
                .keep_alive_while_idle(true);
        }

        Ok(endpoint)
    }
}

impl Connector for LazyChannelConnector {
    type Connection = Channel;

    fn connect(&self, address: &str) -> Result<Channel> {
        Ok(self.endpoint(address)?.connect_lazy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_address_still_yields_a_channel() {
        let connector = LazyChannelConnector::new().connect_timeout(Duration::from_millis(10));
        assert!(connector.connect("127.0.0.1:1").is_ok());
        assert!(connector.connect("http://127.0.0.1:2").is_ok());
    }

    #[tokio::test]
    async fn malformed_address_is_rejected() {
        let connector = LazyChannelConnector::new();
        let err = connector.connect("not a valid address").unwrap_err();
        assert!(matches!(
            err,
            Error::Connect { ref address, .. } if address == "not a valid address"
        ));
    }
}
