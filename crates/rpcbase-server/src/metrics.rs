//! gRPC request metrics and the Prometheus scrape endpoint.
//!
//! [`GrpcMetricsLayer`] wraps the tonic server and records, per RPC method:
//!
//! ```text
//! grpc_server_started_total{grpc_service, grpc_method}
//! grpc_server_handled_total{grpc_service, grpc_method, grpc_code}
//! grpc_server_handling_seconds{grpc_service, grpc_method, grpc_code}   (histogram)
//! ```
//!
//! The recorder is process-wide and installed on first use; every base
//! server in the process renders the same registry at `GET /metrics`.

use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::Router;
use axum::routing::get;
use http::HeaderMap;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tonic::Code;
use tower::{Layer, Service};
use tracing::warn;

const STARTED_TOTAL: &str = "grpc_server_started_total";
const HANDLED_TOTAL: &str = "grpc_server_handled_total";
const HANDLING_SECONDS: &str = "grpc_server_handling_seconds";

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handle to the process-wide Prometheus registry, installing it if needed.
pub fn prometheus_handle() -> PrometheusHandle {
    PROMETHEUS.get_or_init(install_recorder).clone()
}

fn install_recorder() -> PrometheusHandle {
    let recorder = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(HANDLING_SECONDS.to_string()), LATENCY_BUCKETS)
        .unwrap_or_else(|e| {
            warn!(error = %e, "latency buckets rejected, handling time exported as a summary");
            PrometheusBuilder::new()
        })
        .build_recorder();
    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        warn!("a global metrics recorder is already installed; /metrics only shows rpcbase series");
    }

    handle
}

/// Router serving the Prometheus text exposition at `/metrics`.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || std::future::ready(handle.render())),
    )
}

/// Split a gRPC request path (`/package.Service/Method`) into service and method.
pub fn split_grpc_path(path: &str) -> (String, String) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((service, method)) => (service.to_string(), method.to_string()),
        None => ("unknown".to_string(), trimmed.to_string()),
    }
}

/// gRPC status code of a response, read from its headers.
///
/// Trailers-only responses (errors) carry `grpc-status` in the headers;
/// successful unary responses put it in trailers, so absence means `Ok`.
fn grpc_code(headers: &HeaderMap) -> Code {
    headers
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i32>().ok())
        .map(Code::from_i32)
        .unwrap_or(Code::Ok)
}

/// Tower layer recording per-method gRPC metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcMetricsLayer;

impl<S> Layer<S> for GrpcMetricsLayer {
    type Service = GrpcMetrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcMetrics { inner }
    }
}

/// Service produced by [`GrpcMetricsLayer`].
#[derive(Debug, Clone)]
pub struct GrpcMetrics<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for GrpcMetrics<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        // The ready service must be the one called; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let (service, method) = split_grpc_path(req.uri().path());

        Box::pin(async move {
            let labels = [("grpc_service", service.clone()), ("grpc_method", method.clone())];
            metrics::counter!(STARTED_TOTAL, &labels).increment(1);

            let start = Instant::now();
            let result = inner.call(req).await;
            let elapsed = start.elapsed().as_secs_f64();

            let code = match &result {
                Ok(resp) => grpc_code(resp.headers()),
                Err(_) => Code::Unavailable,
            };
            let labels = [
                ("grpc_service", service),
                ("grpc_method", method),
                ("grpc_code", format!("{code:?}")),
            ];
            metrics::counter!(HANDLED_TOTAL, &labels).increment(1);
            metrics::histogram!(HANDLING_SECONDS, &labels).record(elapsed);

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use axum::body::Body;
    use http::{Request, Response, StatusCode};
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn splits_service_and_method() {
        assert_eq!(
            split_grpc_path("/grpc.health.v1.Health/Check"),
            ("grpc.health.v1.Health".to_string(), "Check".to_string())
        );
        assert_eq!(
            split_grpc_path("/oddball"),
            ("unknown".to_string(), "oddball".to_string())
        );
    }

    #[test]
    fn missing_status_header_is_ok() {
        assert_eq!(grpc_code(&HeaderMap::new()), Code::Ok);
    }

    #[test]
    fn status_header_is_decoded() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", "5".parse().unwrap());
        assert_eq!(grpc_code(&headers), Code::NotFound);
    }

    #[tokio::test]
    async fn layer_records_handled_requests() {
        let handle = prometheus_handle();

        let svc = tower::service_fn(|_req: Request<Body>| async {
            let mut resp = Response::new(Body::empty());
            resp.headers_mut().insert("grpc-status", "14".parse().unwrap());
            Ok::<_, Infallible>(resp)
        });
        let svc = GrpcMetricsLayer.layer(svc);

        let req = Request::builder()
            .uri("/metrics.test.Recorder/Record")
            .body(Body::empty())
            .unwrap();
        svc.oneshot(req).await.unwrap();

        let rendered = handle.render();
        assert!(rendered.contains(STARTED_TOTAL));
        assert!(rendered.contains("grpc_service=\"metrics.test.Recorder\""));
        assert!(rendered.contains("grpc_code=\"Unavailable\""));
        assert!(rendered.contains(HANDLING_SECONDS));
    }

    #[tokio::test]
    async fn metrics_route_renders_text() {
        let router = metrics_router(prometheus_handle());
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let router = metrics_router(prometheus_handle());
        let req = Request::builder()
            .uri("/debug/pprof")
            .body(Body::empty())
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
