//! Base server settings.
//!
//! Settings are plain data handed to [`BaseServer::new`](crate::BaseServer::new).
//! They can be built in code with the `with_*` setters or read from a TOML
//! file; missing keys fall back to the defaults below.
//!
//! ```toml
//! server_port = 10100
//! metrics_port = 0          # 0 disables the metrics endpoint
//! profiler_port = 10102
//! profile = true
//! max_concurrent_streams = 256
//! log_level = "debug"
//! shutdown_grace_ms = 3000
//! post_listen_delay_ms = 100
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

use crate::error::SettingsError;

/// Default port for the main gRPC service.
pub const DEFAULT_SERVER_PORT: u16 = 10100;

/// Default port for Prometheus metrics.
pub const DEFAULT_METRICS_PORT: u16 = 10101;

/// Default port for profiler endpoints.
pub const DEFAULT_PROFILER_PORT: u16 = 10102;

/// Default maximum number of concurrent streams per server transport.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 128;

/// Default grace period before a graceful stop is forced.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;

/// Default delay between listening and reporting the service as serving.
pub const DEFAULT_POST_LISTEN_DELAY_MS: u64 = 100;

/// Log verbosity for the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lowercase name, as accepted by `EnvFilter` directives.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(SettingsError::UnknownLogLevel(s.to_string())),
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Settings for a [`BaseServer`](crate::BaseServer).
///
/// A `server_port` or `profiler_port` of 0 binds an ephemeral port; the
/// bound address is available from the server once it is listening.
/// A `metrics_port` of 0 disables the metrics endpoint entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Port on which the main gRPC service listens.
    pub server_port: u16,
    /// Port serving Prometheus metrics; 0 disables metrics.
    pub metrics_port: u16,
    /// Port serving profiler endpoints when `profile` is set.
    pub profiler_port: u16,
    /// Whether the profiler endpoints are enabled.
    pub profile: bool,
    /// Maximum number of concurrent streams per server transport.
    pub max_concurrent_streams: u32,
    /// Log verbosity.
    pub log_level: LogLevel,
    /// How long a graceful stop may drain before it is forced.
    pub shutdown_grace_ms: u64,
    /// Delay between listening and reporting the service as serving.
    pub post_listen_delay_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            profiler_port: DEFAULT_PROFILER_PORT,
            profile: false,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            log_level: LogLevel::default(),
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            post_listen_delay_ms: DEFAULT_POST_LISTEN_DELAY_MS,
        }
    }
}

impl ServerSettings {
    /// Read and validate settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate settings from a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        let settings: ServerSettings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check that the settings describe a server that can actually run.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_concurrent_streams == 0 {
            return Err(SettingsError::Invalid(
                "max_concurrent_streams must be greater than zero".to_string(),
            ));
        }
        if collides(self.metrics_port, self.server_port) {
            return Err(SettingsError::Invalid(format!(
                "metrics_port {} is also the server_port",
                self.metrics_port
            )));
        }
        if self.profile {
            if collides(self.profiler_port, self.server_port) {
                return Err(SettingsError::Invalid(format!(
                    "profiler_port {} is also the server_port",
                    self.profiler_port
                )));
            }
            if collides(self.profiler_port, self.metrics_port) {
                return Err(SettingsError::Invalid(format!(
                    "profiler_port {} is also the metrics_port",
                    self.profiler_port
                )));
            }
        }
        Ok(())
    }

    /// Whether the metrics endpoint should be served.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port != 0
    }

    /// Grace period before a graceful stop is forced.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Delay between listening and reporting the service as serving.
    pub fn post_listen_delay(&self) -> Duration {
        Duration::from_millis(self.post_listen_delay_ms)
    }

    /// Set the gRPC port; 0 binds an ephemeral port, reported by
    /// [`BaseServer::listen_addr`](crate::BaseServer::listen_addr).
    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    /// Set the metrics port; 0 disables metrics.
    pub fn with_metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = port;
        self
    }

    /// Set the profiler port; 0 binds an ephemeral port.
    pub fn with_profiler_port(mut self, port: u16) -> Self {
        self.profiler_port = port;
        self
    }

    pub fn with_profile(mut self, on: bool) -> Self {
        self.profile = on;
        self
    }

    /// Set the stream limit; 0 restores the default.
    pub fn with_max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = if max == 0 {
            DEFAULT_MAX_CONCURRENT_STREAMS
        } else {
            max
        };
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_post_listen_delay(mut self, delay: Duration) -> Self {
        self.post_listen_delay_ms = delay.as_millis() as u64;
        self
    }
}

/// Two nonzero ports that are equal would fight over the same socket.
fn collides(a: u16, b: u16) -> bool {
    a != 0 && a == b
}
