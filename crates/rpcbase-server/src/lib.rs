//! rpcbase-server — lifecycle supervisor for gRPC services.
//!
//! A [`BaseServer`] owns the listening socket of one gRPC service and
//! everything around it:
//!
//! - the standard `grpc.health.v1.Health` service, `NOT_SERVING` until the
//!   server has started and again once a stop is requested
//! - gRPC server reflection for the health service and any registered
//!   descriptor sets
//! - per-method request metrics, served at `GET /metrics` on the metrics port
//! - CPU profiler endpoints under `/debug/pprof` when profiling is enabled
//! - SIGINT, SIGTERM and SIGQUIT handling
//! - a graceful stop that turns forceful after the grace period
//!
//! ```no_run
//! use std::sync::Arc;
//! use rpcbase_server::{BaseServer, ServerSettings};
//!
//! # async fn run() -> rpcbase_server::ServerResult<()> {
//! let server = Arc::new(BaseServer::new(ServerSettings::default()));
//! server
//!     .serve(
//!         |routes| {
//!             // routes.add_service(MyService::default().into_service());
//!             let _ = routes;
//!         },
//!         || tracing::info!("ready"),
//!     )
//!     .await
//! # }
//! ```

pub mod completion;
pub mod error;
pub mod force_close;
pub mod logging;
pub mod metrics;
pub mod os_signals;
pub mod profiler;
pub mod server;
pub mod settings;

pub use completion::Completion;
pub use error::{ServerError, ServerResult, SettingsError};
pub use server::{BaseServer, State};
pub use settings::{LogLevel, ServerSettings};
