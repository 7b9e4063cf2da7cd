//! PingPong gRPC server implementation.

use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::messages::{PingRequest, PingResponse};
use crate::proto::ping_pong_server::{PingPong, PingPongServer};

/// Answers every ping with a pong.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingPongService;

impl PingPongService {
    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> PingPongServer<Self> {
        PingPongServer::new(self)
    }
}

#[tonic::async_trait]
impl PingPong for PingPongService {
    async fn ping(
        &self,
        request: Request<PingRequest>,
    ) -> Result<Response<PingResponse>, Status> {
        let req = request.into_inner();

        if req.delay_ms > 0 {
            debug!(delay_ms = req.delay_ms, "holding ping");
            tokio::time::sleep(Duration::from_millis(req.delay_ms)).await;
        }

        Ok(Response::new(PingResponse { pong: true }))
    }
}
