//! Error types for the health checker.

use thiserror::Error;

/// Result type alias for health checker operations.
pub type HealthResult<T> = Result<T, HealthError>;

/// Errors raised while building a [`HealthChecker`](crate::HealthChecker).
///
/// Probing never fails; an unreachable peer is reported as
/// [`HealthStatus::Unknown`](crate::HealthStatus::Unknown) instead.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("invalid peer address {address}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("failed to connect to peer {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
