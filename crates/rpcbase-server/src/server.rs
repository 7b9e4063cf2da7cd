//! The base server lifecycle supervisor.
//!
//! ```text
//!  Starting ──listening + SERVING──▶ Started ──stop requested──▶ Stopping ──drained/forced──▶ Stopped
//! ```
//!
//! Three completion signals drive everything: `started`, `stop_requested`
//! and `stopped`. A stop can be requested by an OS signal, by
//! [`BaseServer::stop_server`] / [`BaseServer::request_stop`], or by an
//! auxiliary endpoint that failed. Once requested, the gRPC server drains
//! gracefully; if it has not finished after the grace period the force
//! token trips and every open connection is aborted.

use std::fmt;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;
use tonic_reflection::server::v1::{ServerReflection, ServerReflectionServer};
use tonic_reflection::server::v1alpha::{
    ServerReflection as ServerReflectionV1Alpha, ServerReflectionServer as ServerReflectionServerV1Alpha,
};
use tracing::{debug, error, info, warn};

use crate::completion::Completion;
use crate::error::{ServerError, ServerResult};
use crate::force_close::{ForceClosable, ForceClosableListener};
use crate::metrics::{GrpcMetricsLayer, metrics_router, prometheus_handle};
use crate::os_signals::spawn_signal_watcher;
use crate::profiler::profiler_router;
use crate::settings::ServerSettings;

/// How long an auxiliary HTTP endpoint may drain after a stop request
/// before it is dropped.
pub const AUX_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Health service name covering the whole server.
const WHOLE_SERVICE: &str = "";

/// Lifecycle state of a [`BaseServer`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Starting => "starting",
            State::Started => "started",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervises one gRPC server from listen to shutdown.
///
/// A `BaseServer` is single use: it is served once and, after it reaches
/// [`State::Stopped`], cannot be served again. Share it behind an `Arc` so
/// other tasks can stop it or observe its state while `serve` runs.
#[derive(Debug)]
pub struct BaseServer {
    settings: ServerSettings,
    started: Completion,
    stop_requested: Completion,
    stopped: Completion,
    force: CancellationToken,
    served: AtomicBool,
    file_descriptor_sets: Vec<&'static [u8]>,
    listen_addr: OnceLock<SocketAddr>,
    metrics_addr: OnceLock<SocketAddr>,
    profiler_addr: OnceLock<SocketAddr>,
}

impl BaseServer {
    pub fn new(settings: ServerSettings) -> Self {
        info!(
            server_port = settings.server_port,
            metrics_port = settings.metrics_port,
            profiler_port = settings.profiler_port,
            profile = settings.profile,
            max_concurrent_streams = settings.max_concurrent_streams,
            log_level = %settings.log_level,
            shutdown_grace_ms = settings.shutdown_grace_ms,
            post_listen_delay_ms = settings.post_listen_delay_ms,
            "base server configured"
        );

        Self {
            settings,
            started: Completion::new(),
            stop_requested: Completion::new(),
            stopped: Completion::new(),
            force: CancellationToken::new(),
            served: AtomicBool::new(false),
            file_descriptor_sets: Vec::new(),
            listen_addr: OnceLock::new(),
            metrics_addr: OnceLock::new(),
            profiler_addr: OnceLock::new(),
        }
    }

    /// Describe the registered services to reflection clients with an
    /// encoded `FileDescriptorSet`, as emitted by `tonic-build`.
    pub fn with_file_descriptor_set(mut self, set: &'static [u8]) -> Self {
        self.file_descriptor_sets.push(set);
        self
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Current lifecycle state. Never blocks.
    pub fn state(&self) -> State {
        if self.stopped.is_fired() {
            State::Stopped
        } else if self.stop_requested.is_fired() {
            State::Stopping
        } else if self.started.is_fired() {
            State::Started
        } else {
            State::Starting
        }
    }

    /// Address the gRPC server is bound to, once listening.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr.get().copied()
    }

    /// Address of the metrics endpoint, if metrics are enabled and bound.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr.get().copied()
    }

    /// Address of the profiler endpoint, if profiling is enabled and bound.
    pub fn profiler_addr(&self) -> Option<SocketAddr> {
        self.profiler_addr.get().copied()
    }

    /// Serve until a stop is requested and the server has drained or been
    /// forcibly closed.
    ///
    /// `register` adds the embedding service's handlers; the standard
    /// `grpc.health.v1.Health` and server reflection services are added
    /// after it. `on_serving` runs
    /// once, right after the health service reports `SERVING` and the
    /// server has entered [`State::Started`].
    ///
    /// Returns `Ok(())` for any deliberate stop, forced or not. A bind
    /// failure on the server port is returned as [`ServerError::Bind`], and
    /// an undecodable descriptor set as [`ServerError::Reflection`]; both
    /// leave the server in [`State::Stopped`].
    pub async fn serve<R, F>(&self, register: R, on_serving: F) -> ServerResult<()>
    where
        R: FnOnce(&mut RoutesBuilder),
        F: FnOnce(),
    {
        if self.served.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyServed);
        }
        if self.stop_requested.is_fired() {
            debug!("stop requested before serve, not listening");
            self.stopped.fire();
            return Ok(());
        }

        let (reflection_v1, reflection_v1alpha) = match self.reflection_services() {
            Ok(services) => services,
            Err(e) => {
                error!(error = %e, "invalid file descriptor set");
                self.stop_requested.fire();
                self.stopped.fire();
                return Err(e);
            }
        };

        let (mut reporter, health_service) = tonic_health::server::health_reporter();
        reporter
            .set_service_status(WHOLE_SERVICE, ServingStatus::NotServing)
            .await;

        let mut routes = RoutesBuilder::default();
        register(&mut routes);
        routes.add_service(health_service);
        routes.add_service(reflection_v1);
        routes.add_service(reflection_v1alpha);

        let mut builder = Server::builder()
            .max_concurrent_streams(Some(self.settings.max_concurrent_streams))
            .layer(GrpcMetricsLayer);
        let router = builder.add_routes(routes.routes());

        let watcher = tokio::spawn(watch_for_stop(
            self.stop_requested.clone(),
            self.force.clone(),
            reporter.clone(),
            self.settings.shutdown_grace(),
        ));

        let mut background = vec![watcher];
        background.extend(self.start_aux_routines().await);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.settings.server_port));
        let listener = match bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(%addr, error = %e, "failed to listen");
                self.finish(background).await;
                return Err(e);
            }
        };
        if let Ok(local) = listener.local_addr() {
            let _ = self.listen_addr.set(local);
        }
        info!(port = self.settings.server_port, addr = ?self.listen_addr(), "listening for requests");

        let force = self.force.clone();
        let incoming = TcpListenerStream::new(listener)
            .map(move |conn| conn.map(|tcp| ForceClosable::new(tcp, force.clone())));

        let serving = async {
            let result = tokio::select! {
                res = router.serve_with_incoming_shutdown(incoming, self.stop_requested.wait_owned()) => {
                    res.map_err(ServerError::from)
                }
                () = self.force.cancelled() => {
                    warn!("grace period elapsed, forcibly closed open connections");
                    Ok(())
                }
            };
            self.stop_requested.fire();
            result
        };

        let (result, ()) = tokio::join!(serving, self.announce(&mut reporter, on_serving));

        if let Err(e) = &result {
            error!(error = %e, "server stopped serving");
        }
        self.finish(background).await;
        result
    }

    fn reflection_services(
        &self,
    ) -> ServerResult<(
        ServerReflectionServer<impl ServerReflection>,
        ServerReflectionServerV1Alpha<impl ServerReflectionV1Alpha>,
    )> {
        let builder = || {
            self.file_descriptor_sets.iter().copied().fold(
                tonic_reflection::server::Builder::configure()
                    .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET),
                |builder, set| builder.register_encoded_file_descriptor_set(set),
            )
        };
        Ok((builder().build_v1()?, builder().build_v1alpha()?))
    }

    /// Request a stop and wait until the server is [`State::Stopped`].
    ///
    /// Idempotent; any number of concurrent callers observe the same
    /// shutdown.
    pub async fn stop_server(&self) {
        self.request_stop();
        if !self.served.load(Ordering::SeqCst) {
            self.stopped.fire();
        }
        self.stopped.wait().await;
    }

    /// Request a stop without waiting for it to complete.
    pub fn request_stop(&self) {
        if self.stop_requested.fire() {
            info!("stop requested");
        }
    }

    /// Wait until the server is listening and reports `SERVING`.
    ///
    /// Returns `false` if the server stopped without ever starting.
    pub async fn wait_until_started(&self) -> bool {
        tokio::select! {
            biased;
            () = self.started.wait() => true,
            () = self.stopped.wait() => self.started.is_fired(),
        }
    }

    /// Wait until the server is [`State::Stopped`].
    pub async fn wait_until_stopped(&self) {
        self.stopped.wait().await;
    }

    /// After the post-listen delay, flip the whole-service health status to
    /// `SERVING` and fire `started`, unless a stop got there first.
    async fn announce<F: FnOnce()>(&self, reporter: &mut HealthReporter, on_serving: F) {
        tokio::select! {
            () = tokio::time::sleep(self.settings.post_listen_delay()) => {}
            () = self.stop_requested.wait() => return,
        }

        reporter
            .set_service_status(WHOLE_SERVICE, ServingStatus::Serving)
            .await;
        if self.stop_requested.is_fired() {
            reporter
                .set_service_status(WHOLE_SERVICE, ServingStatus::NotServing)
                .await;
            return;
        }

        self.started.fire();
        info!(addr = ?self.listen_addr(), "server started");
        on_serving();
    }

    /// Bind and spawn the metrics and profiler endpoints and the signal
    /// watcher. Endpoint bind failures request a stop.
    async fn start_aux_routines(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.settings.metrics_enabled() {
            let addr = SocketAddr::from(([0, 0, 0, 0], self.settings.metrics_port));
            let router = metrics_router(prometheus_handle());
            if let Some(handle) = self
                .spawn_endpoint("metrics", addr, router, &self.metrics_addr)
                .await
            {
                handles.push(handle);
            }
        }

        if self.settings.profile {
            let addr = SocketAddr::from(([0, 0, 0, 0], self.settings.profiler_port));
            if let Some(handle) = self
                .spawn_endpoint("profiler", addr, profiler_router(), &self.profiler_addr)
                .await
            {
                handles.push(handle);
            }
        }

        match spawn_signal_watcher(self.stop_requested.clone()) {
            Ok(handle) => handles.push(handle),
            Err(e) => warn!(error = %e, "failed to install signal handlers"),
        }

        handles
    }

    async fn spawn_endpoint(
        &self,
        name: &'static str,
        addr: SocketAddr,
        router: Router,
        bound: &OnceLock<SocketAddr>,
    ) -> Option<JoinHandle<()>> {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(endpoint = name, %addr, error = %e, "failed to listen, stopping server");
                self.request_stop();
                return None;
            }
        };
        if let Ok(local) = listener.local_addr() {
            let _ = bound.set(local);
            info!(endpoint = name, addr = %local, "endpoint listening");
        }

        Some(tokio::spawn(run_endpoint(
            name,
            listener,
            router,
            self.stop_requested.clone(),
        )))
    }

    /// Tear down everything `serve` started, then fire `stopped`.
    async fn finish(&self, background: Vec<JoinHandle<()>>) {
        self.stop_requested.fire();
        self.force.cancel();
        for handle in background {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task failed");
            }
        }
        if self.stopped.fire() {
            info!("server stopped");
        }
    }
}

async fn bind(addr: SocketAddr) -> ServerResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Once a stop is requested, report `NOT_SERVING` and give in-flight
/// requests the grace period before tripping the force token.
async fn watch_for_stop(
    stop: Completion,
    force: CancellationToken,
    mut reporter: HealthReporter,
    grace: Duration,
) {
    tokio::select! {
        () = stop.wait() => {}
        () = force.cancelled() => return,
    }

    info!(grace_ms = grace.as_millis() as u64, "gracefully stopping server");
    reporter
        .set_service_status(WHOLE_SERVICE, ServingStatus::NotServing)
        .await;

    tokio::select! {
        () = tokio::time::sleep(grace) => {
            warn!("graceful stop timed out, forcing");
            force.cancel();
        }
        () = force.cancelled() => {}
    }
}

/// Serve an auxiliary HTTP endpoint until a stop is requested, allowing it
/// [`AUX_SHUTDOWN_TIMEOUT`] to drain. Requests still running at the deadline
/// are dropped and their connections aborted. An endpoint that exits on its
/// own requests a stop of the whole server.
async fn run_endpoint(name: &'static str, listener: TcpListener, router: Router, stop: Completion) {
    let force = CancellationToken::new();
    let router = router.layer(middleware::from_fn_with_state(force.clone(), abort_on_force));
    let server = axum::serve(ForceClosableListener::new(listener, force.clone()), router)
        .with_graceful_shutdown(stop.wait_owned())
        .into_future();
    let drain_deadline = async {
        stop.wait().await;
        tokio::time::sleep(AUX_SHUTDOWN_TIMEOUT).await;
    };

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!(endpoint = name, error = %e, "endpoint failed, stopping server");
            }
            if stop.fire() {
                error!(endpoint = name, "endpoint exited unexpectedly, stopping server");
            }
        }
        () = drain_deadline => {
            warn!(endpoint = name, "endpoint did not drain in time, closing");
        }
    }
    force.cancel();
    debug!(endpoint = name, "endpoint stopped");
}

/// Drops the handler once `force` is cancelled. The placeholder response
/// is never delivered since the connection is aborted with it.
async fn abort_on_force(
    axum::extract::State(force): axum::extract::State<CancellationToken>,
    req: Request,
    next: Next,
) -> Response {
    tokio::select! {
        resp = next.run(req) => resp,
        () = force.cancelled() => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn quiet_settings() -> ServerSettings {
        ServerSettings::default()
            .with_server_port(0)
            .with_metrics_port(0)
    }

    #[test]
    fn states_are_ordered() {
        assert!(State::Starting < State::Started);
        assert!(State::Started < State::Stopping);
        assert!(State::Stopping < State::Stopped);
        assert_eq!(State::Stopping.to_string(), "stopping");
    }

    #[test]
    fn new_server_is_starting() {
        let server = BaseServer::new(quiet_settings());
        assert_eq!(server.state(), State::Starting);
        assert!(server.listen_addr().is_none());
    }

    #[tokio::test]
    async fn stop_before_serve_stops_immediately() {
        let server = BaseServer::new(quiet_settings());
        tokio::time::timeout(Duration::from_secs(1), server.stop_server())
            .await
            .expect("stop without serve should not hang");
        assert_eq!(server.state(), State::Stopped);

        server.serve(|_| {}, || {}).await.unwrap();
        assert!(server.listen_addr().is_none());
        assert!(!server.wait_until_started().await);
    }

    #[tokio::test]
    async fn request_stop_moves_to_stopping() {
        let server = BaseServer::new(quiet_settings());
        server.request_stop();
        server.request_stop();
        assert_eq!(server.state(), State::Stopping);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serve_twice_is_rejected() {
        let server = Arc::new(BaseServer::new(
            quiet_settings().with_post_listen_delay(Duration::from_millis(10)),
        ));

        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(|_| {}, || {}).await }
        });
        assert!(server.wait_until_started().await);
        assert_eq!(server.state(), State::Started);

        let second = server.serve(|_| {}, || {}).await;
        assert!(matches!(second, Err(ServerError::AlreadyServed)));

        server.stop_server().await;
        serving.await.unwrap().unwrap();
        assert_eq!(server.state(), State::Stopped);
    }

    #[tokio::test]
    async fn undecodable_descriptor_set_fails_serve() {
        let server = BaseServer::new(quiet_settings()).with_file_descriptor_set(b"not a descriptor set");

        let result = server.serve(|_| {}, || {}).await;
        assert!(matches!(result, Err(ServerError::Reflection(_))), "{result:?}");
        assert_eq!(server.state(), State::Stopped);
        assert!(server.listen_addr().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn on_serving_runs_once_started() {
        let server = Arc::new(BaseServer::new(
            quiet_settings().with_post_listen_delay(Duration::from_millis(10)),
        ));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                server
                    .serve(|_| {}, move || {
                        let _ = tx.send(());
                    })
                    .await
            }
        });

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("on_serving should run")
            .unwrap();
        assert_eq!(server.state(), State::Started);

        server.stop_server().await;
        serving.await.unwrap().unwrap();
    }
}
