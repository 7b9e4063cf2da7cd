//! Profiler introspection endpoints.
//!
//! Served under `/debug/pprof` on the profiler port when profiling is on:
//!
//! ```text
//! GET /debug/pprof/                              index
//! GET /debug/pprof/profile?seconds=30&frequency=100   gzipped pprof CPU profile
//! GET /debug/pprof/flamegraph?seconds=30&frequency=100  SVG flamegraph
//! ```
//!
//! Only one CPU profile can run per process at a time; a concurrent request
//! gets a 500 with the profiler's error.

use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use flate2::Compression;
use flate2::write::GzEncoder;
use pprof::ProfilerGuardBuilder;
use pprof::protos::Message;
use serde::Deserialize;
use tracing::{debug, warn};

const DEFAULT_SECONDS: u64 = 30;
const MAX_SECONDS: u64 = 300;
const DEFAULT_FREQUENCY: i32 = 100;

const INDEX: &str = "\
/debug/pprof/

profile     CPU profile in pprof protobuf format (gzip). Params: seconds, frequency.
flamegraph  CPU profile rendered as an SVG flamegraph. Params: seconds, frequency.
";

#[derive(Debug, Default, Deserialize)]
pub struct ProfileParams {
    /// Seconds to sample before reporting.
    pub seconds: Option<u64>,
    /// Sampling frequency in Hz.
    pub frequency: Option<i32>,
}

impl ProfileParams {
    fn seconds(&self) -> u64 {
        self.seconds.unwrap_or(DEFAULT_SECONDS).clamp(1, MAX_SECONDS)
    }

    fn frequency(&self) -> i32 {
        match self.frequency {
            Some(f) if f > 0 => f,
            _ => DEFAULT_FREQUENCY,
        }
    }
}

/// Router serving the profiler endpoints.
pub fn profiler_router() -> Router {
    Router::new()
        .route("/debug/pprof", get(index))
        .route("/debug/pprof/", get(index))
        .route("/debug/pprof/profile", get(profile))
        .route("/debug/pprof/flamegraph", get(flamegraph))
}

async fn index() -> &'static str {
    INDEX
}

async fn profile(Query(params): Query<ProfileParams>) -> Response {
    match cpu_profile(params.seconds(), params.frequency()).await {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "application/octet-stream"), (CONTENT_ENCODING, "gzip")],
            body,
        )
            .into_response(),
        Err(e) => profiler_error(e),
    }
}

async fn flamegraph(Query(params): Query<ProfileParams>) -> Response {
    match cpu_flamegraph(params.seconds(), params.frequency()).await {
        Ok(svg) => (StatusCode::OK, [(CONTENT_TYPE, "image/svg+xml")], svg).into_response(),
        Err(e) => profiler_error(e),
    }
}

fn profiler_error(e: anyhow::Error) -> Response {
    warn!(error = %e, "profiler request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response()
}

async fn sample(seconds: u64, frequency: i32) -> anyhow::Result<pprof::Report> {
    let guard = ProfilerGuardBuilder::default()
        .frequency(frequency)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()
        .context("failed to start CPU profiler")?;

    debug!(seconds, frequency, "sampling CPU profile");
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    guard.report().build().context("failed to build profile report")
}

async fn cpu_profile(seconds: u64, frequency: i32) -> anyhow::Result<Vec<u8>> {
    let profile = sample(seconds, frequency)
        .await?
        .pprof()
        .context("failed to encode pprof profile")?;

    let mut body = Vec::new();
    let mut encoder = GzEncoder::new(&mut body, Compression::default());
    profile
        .write_to_writer(&mut encoder)
        .context("failed to write profile")?;
    encoder.finish().context("failed to finish gzip stream")?;

    Ok(body)
}

async fn cpu_flamegraph(seconds: u64, frequency: i32) -> anyhow::Result<Vec<u8>> {
    let report = sample(seconds, frequency).await?;

    let mut svg = Vec::new();
    report
        .flamegraph(&mut svg)
        .context("failed to render flamegraph")?;

    Ok(svg)
}
