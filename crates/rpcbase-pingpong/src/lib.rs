//! rpcbase-pingpong — the smallest useful embedding service.
//!
//! A single unary `Ping` RPC that answers `pong = true`, optionally after
//! sleeping for `delay_ms`. The daemon serves it as its business logic and
//! the lifecycle tests use the delay to hold a request in flight across a
//! shutdown.

pub mod messages;
pub mod service;

/// Generated gRPC service stubs.
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/rpcbase.pingpong.PingPong.rs"));
}

pub use messages::{PingRequest, PingResponse};
pub use proto::ping_pong_client::PingPongClient;
pub use service::PingPongService;
