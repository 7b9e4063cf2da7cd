//! Opening connections to peers.

use std::future::Future;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::error::{HealthError, HealthResult};

/// Default time allowed to establish a connection to a peer.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Opens a gRPC connection to a `host:port` address.
///
/// Implement this to apply a transport-security policy other than
/// plaintext.
pub trait Dialer: Send + Sync {
    fn dial(&self, address: &str) -> impl Future<Output = HealthResult<Channel>> + Send;
}

/// Dials peers over plaintext HTTP/2.
///
/// The connection is established eagerly, so dialing an address with no
/// listener fails here rather than on first use.
#[derive(Debug, Clone, Copy)]
pub struct InsecureDialer {
    connect_timeout: Duration,
}

impl InsecureDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for InsecureDialer {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Dialer for InsecureDialer {
    async fn dial(&self, address: &str) -> HealthResult<Channel> {
        let endpoint = Endpoint::from_shared(plaintext_uri(address))
            .map_err(|source| HealthError::InvalidAddress {
                address: address.to_string(),
                source,
            })?
            .connect_timeout(self.connect_timeout);

        debug!(peer_address = address, "dialing peer");
        endpoint
            .connect()
            .await
            .map_err(|source| HealthError::Connect {
                address: address.to_string(),
                source: source.into(),
            })
    }
}

/// `host:port` becomes `http://host:port`; addresses that already carry a
/// scheme are left alone.
fn plaintext_uri(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}
