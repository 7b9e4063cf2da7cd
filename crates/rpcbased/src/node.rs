//! The PingPong node: a base server with the PingPong service registered.

use std::sync::Arc;

use rpcbase_pingpong::PingPongService;
use rpcbase_server::{BaseServer, ServerResult, ServerSettings};
use tokio::sync::oneshot;
use tracing::debug;

pub struct Node {
    server: Arc<BaseServer>,
}

impl Node {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            server: Arc::new(BaseServer::new(settings)),
        }
    }

    /// Serve until stopped, handing the server to `up` once it is serving.
    pub async fn run(&self, up: oneshot::Sender<Arc<BaseServer>>) -> ServerResult<()> {
        let server = Arc::clone(&self.server);
        self.server
            .serve(
                |routes| {
                    routes.add_service(PingPongService.into_service());
                },
                move || {
                    if up.send(server).is_err() {
                        debug!("nobody waiting for the node to come up");
                    }
                },
            )
            .await
    }
}

/// Build a node from `settings` and serve it.
pub async fn start(settings: ServerSettings, up: oneshot::Sender<Arc<BaseServer>>) -> ServerResult<()> {
    Node::new(settings).run(up).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rpcbase_pingpong::{PingPongClient, PingRequest};
    use rpcbase_server::State;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_publishes_serving_instance() {
        let settings = ServerSettings::default()
            .with_server_port(0)
            .with_metrics_port(0)
            .with_post_listen_delay(Duration::from_millis(10));
        let (up, ready) = oneshot::channel();

        let serving = tokio::spawn(start(settings, up));
        let server = tokio::time::timeout(Duration::from_secs(5), ready)
            .await
            .expect("node should come up")
            .unwrap();
        assert_eq!(server.state(), State::Started);

        let addr = server.listen_addr().unwrap();
        let mut client = PingPongClient::connect(format!("http://127.0.0.1:{}", addr.port()))
            .await
            .unwrap();
        let pong = client.ping(PingRequest { delay_ms: 0 }).await.unwrap();
        assert!(pong.into_inner().pong);

        server.stop_server().await;
        serving.await.unwrap().unwrap();
    }
}
