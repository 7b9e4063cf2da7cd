//! A real SIGTERM stops a serving base server.
//!
//! Lives in its own test binary: the signal is delivered to the whole
//! process.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use rpcbase_server::{BaseServer, ServerSettings, State};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sigterm_stops_server() {
    let server = Arc::new(BaseServer::new(
        ServerSettings::default()
            .with_server_port(0)
            .with_metrics_port(0)
            .with_post_listen_delay(Duration::from_millis(10)),
    ));

    let serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve(|_| {}, || {}).await }
    });
    assert!(server.wait_until_started().await);

    // Handlers are installed before `started` fires.
    let rc = unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
    assert_eq!(rc, 0);

    tokio::time::timeout(Duration::from_secs(5), server.wait_until_stopped())
        .await
        .expect("SIGTERM should stop the server");
    assert_eq!(server.state(), State::Stopped);
    serving.await.unwrap().unwrap();
}
