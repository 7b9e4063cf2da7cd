//! rpcbase-health — aggregate health checks over a set of gRPC peers.
//!
//! ```text
//! HealthChecker::new(&dialer, peers)   dial every peer, fail fast
//!   └── check()                        one concurrent probe per peer
//!         ├── grpc.health.v1.Health/Check, bounded by the probe timeout
//!         └── HealthReport { all_healthy, statuses }
//! ```
//!
//! A peer that cannot be reached during a check is reported as
//! [`HealthStatus::Unknown`]; only construction returns errors.

pub mod checker;
pub mod dialer;
pub mod error;

pub use checker::{DEFAULT_PROBE_TIMEOUT, HealthChecker, HealthReport, HealthStatus};
pub use dialer::{Dialer, InsecureDialer};
pub use error::{HealthError, HealthResult};
