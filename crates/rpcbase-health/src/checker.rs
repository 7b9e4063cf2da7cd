//! Aggregate health probing across a fixed set of peers.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tonic::transport::Channel;
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tracing::{info, warn};

use crate::dialer::Dialer;
use crate::error::HealthResult;

/// Default bound on a single health probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Serving status of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    Serving,
    NotServing,
    /// The peer could not be reached, timed out, or reported no status.
    Unknown,
}

impl HealthStatus {
    pub fn is_serving(self) -> bool {
        self == HealthStatus::Serving
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Serving => "SERVING",
            HealthStatus::NotServing => "NOT_SERVING",
            HealthStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ServingStatus> for HealthStatus {
    fn from(status: ServingStatus) -> Self {
        match status {
            ServingStatus::Serving => HealthStatus::Serving,
            ServingStatus::NotServing => HealthStatus::NotServing,
            ServingStatus::Unknown | ServingStatus::ServiceUnknown => HealthStatus::Unknown,
        }
    }
}

/// Outcome of one [`HealthChecker::check`] round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// True only if every peer reported `SERVING`.
    pub all_healthy: bool,
    /// Status per probed address.
    pub statuses: HashMap<String, HealthStatus>,
}

impl HealthReport {
    pub fn status(&self, address: &str) -> Option<HealthStatus> {
        self.statuses.get(address).copied()
    }

    /// Addresses that are not serving, sorted.
    pub fn unhealthy(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .statuses
            .iter()
            .filter(|(_, status)| !status.is_serving())
            .map(|(address, _)| address.as_str())
            .collect();
        out.sort_unstable();
        out
    }

    /// Process exit code for this report: 0 when healthy, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.all_healthy { 0 } else { 1 }
    }
}

#[derive(Debug)]
struct Peer {
    address: String,
    client: HealthClient<Channel>,
}

/// Polls the `grpc.health.v1.Health` service of a fixed set of peers.
///
/// Every peer is dialed up front; if any dial fails no checker is built.
/// Each [`check`](HealthChecker::check) is an independent round of probes
/// over the connections opened at construction.
#[derive(Debug)]
pub struct HealthChecker {
    peers: Vec<Peer>,
    probe_timeout: Duration,
}

impl HealthChecker {
    /// Dial every address with `dialer`. Duplicate addresses are probed once.
    pub async fn new<D, I>(dialer: &D, addresses: I) -> HealthResult<Self>
    where
        D: Dialer,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut peers: Vec<Peer> = Vec::new();
        for address in addresses {
            let address = address.into();
            if peers.iter().any(|p| p.address == address) {
                continue;
            }
            let channel = dialer.dial(&address).await?;
            peers.push(Peer {
                address,
                client: HealthClient::new(channel),
            });
        }

        Ok(Self {
            peers,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        })
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.peers.iter().map(|p| p.address.as_str())
    }

    /// Probe every peer concurrently and aggregate the results.
    ///
    /// An empty peer set is healthy.
    pub async fn check(&self) -> HealthReport {
        let probes: Vec<_> = self
            .peers
            .iter()
            .map(|peer| {
                let address = peer.address.clone();
                let handle = tokio::spawn(probe(
                    peer.client.clone(),
                    peer.address.clone(),
                    self.probe_timeout,
                ));
                (address, handle)
            })
            .collect();

        let mut statuses = HashMap::with_capacity(probes.len());
        for (address, handle) in probes {
            let status = match handle.await {
                Ok(status) => status,
                Err(e) => {
                    warn!(peer_address = %address, error = %e, "health probe task failed");
                    HealthStatus::Unknown
                }
            };
            statuses.insert(address, status);
        }

        HealthReport {
            all_healthy: statuses.values().all(|s| s.is_serving()),
            statuses,
        }
    }
}

async fn probe(
    mut client: HealthClient<Channel>,
    address: String,
    timeout: Duration,
) -> HealthStatus {
    let request = HealthCheckRequest {
        service: String::new(),
    };

    match tokio::time::timeout(timeout, client.check(request)).await {
        Ok(Ok(response)) => {
            let status = HealthStatus::from(response.into_inner().status());
            if status.is_serving() {
                info!(peer_address = %address, "peer is healthy");
            } else {
                warn!(peer_address = %address, %status, "peer is not healthy");
            }
            status
        }
        Ok(Err(e)) => {
            info!(peer_address = %address, error = %e, "peer is not reachable");
            HealthStatus::Unknown
        }
        Err(_) => {
            info!(
                peer_address = %address,
                timeout_ms = timeout.as_millis() as u64,
                "peer is not reachable, health probe timed out"
            );
            HealthStatus::Unknown
        }
    }
}
