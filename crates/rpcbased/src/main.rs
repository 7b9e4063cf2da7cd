//! rpcbased — the rpcbase daemon.
//!
//! Serves the PingPong service on a base server, or checks the health of
//! running instances.
//!
//! # Usage
//!
//! ```text
//! rpcbased start --config /etc/rpcbase.toml --port 10100 --profile
//! rpcbased health --addrs 10.0.0.1:10100,10.0.0.2:10100
//! ```

mod node;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use rpcbase_health::{HealthChecker, InsecureDialer};
use rpcbase_server::{BaseServer, LogLevel, ServerSettings, SettingsError, logging};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Parser)]
#[command(name = "rpcbased", about = "rpcbase daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve PingPong until SIGINT, SIGTERM or SIGQUIT.
    Start(StartArgs),

    /// Check the health of one or more running instances.
    Health(HealthArgs),
}

#[derive(Args)]
struct StartArgs {
    /// TOML settings file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// gRPC listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Prometheus metrics port (0 disables metrics).
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Profiler port.
    #[arg(long)]
    profiler_port: Option<u16>,

    /// Serve profiler endpoints.
    #[arg(long)]
    profile: bool,

    /// Maximum concurrent streams per connection (0 restores the default).
    #[arg(long)]
    max_concurrent_streams: Option<u32>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long)]
    log_level: Option<LogLevel>,
}

impl StartArgs {
    fn settings(&self) -> Result<ServerSettings, SettingsError> {
        let mut settings = match &self.config {
            Some(path) => ServerSettings::from_file(path)?,
            None => ServerSettings::default(),
        };

        if let Some(port) = self.port {
            settings = settings.with_server_port(port);
        }
        if let Some(port) = self.metrics_port {
            settings = settings.with_metrics_port(port);
        }
        if let Some(port) = self.profiler_port {
            settings = settings.with_profiler_port(port);
        }
        if self.profile {
            settings = settings.with_profile(true);
        }
        if let Some(max) = self.max_concurrent_streams {
            settings = settings.with_max_concurrent_streams(max);
        }
        if let Some(level) = self.log_level {
            settings = settings.with_log_level(level);
        }

        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Args)]
struct HealthArgs {
    /// Comma-separated `host:port` addresses to check.
    #[arg(long, value_delimiter = ',', required = true)]
    addrs: Vec<String>,

    /// Per-peer probe timeout in milliseconds.
    #[arg(long, default_value = "3000")]
    timeout_ms: u64,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start(args) => run_start(args).await,
        Command::Health(args) => {
            let code = run_health(args).await?;
            std::process::exit(code);
        }
    }
}

async fn run_start(args: StartArgs) -> anyhow::Result<()> {
    let settings = args.settings()?;
    logging::init(settings.log_level);

    let (up, ready) = oneshot::channel::<Arc<BaseServer>>();
    log_when_serving(ready);

    node::start(settings, up).await?;
    info!("rpcbased stopped");
    Ok(())
}

/// Log the listen address once the node is serving, handing the server back.
fn log_when_serving(ready: oneshot::Receiver<Arc<BaseServer>>) -> JoinHandle<Option<Arc<BaseServer>>> {
    tokio::spawn(async move {
        let server = ready.await.ok()?;
        info!(addr = ?server.listen_addr(), "rpcbased serving");
        Some(server)
    })
}

async fn run_health(args: HealthArgs) -> anyhow::Result<i32> {
    logging::init(args.log_level);

    let checker = HealthChecker::new(&InsecureDialer::new(), args.addrs)
        .await?
        .with_probe_timeout(Duration::from_millis(args.timeout_ms));
    let report = checker.check().await;

    let mut addresses: Vec<&String> = report.statuses.keys().collect();
    addresses.sort();
    for address in addresses {
        println!("{address}\t{}", report.statuses[address]);
    }

    Ok(report.exit_code())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serving_node_is_announced() {
        let settings = ServerSettings::default()
            .with_server_port(0)
            .with_metrics_port(0)
            .with_post_listen_delay(Duration::from_millis(10));
        let (up, ready) = oneshot::channel::<Arc<BaseServer>>();
        let announced = log_when_serving(ready);

        let serving = tokio::spawn(node::start(settings, up));
        let server = tokio::time::timeout(Duration::from_secs(5), announced)
            .await
            .expect("node should be announced")
            .unwrap()
            .expect("node should come up");
        assert!(server.listen_addr().is_some());

        server.stop_server().await;
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn node_that_never_serves_is_not_announced() {
        let (up, ready) = oneshot::channel::<Arc<BaseServer>>();
        drop(up);
        assert!(log_when_serving(ready).await.unwrap().is_none());
    }

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn start_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "rpcbased",
            "start",
            "--port",
            "20100",
            "--metrics-port",
            "0",
            "--profile",
            "--max-concurrent-streams",
            "0",
            "--log-level",
            "debug",
        ])
        .unwrap();
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };

        let settings = args.settings().unwrap();
        assert_eq!(settings.server_port, 20100);
        assert!(!settings.metrics_enabled());
        assert!(settings.profile);
        assert_eq!(
            settings.max_concurrent_streams,
            rpcbase_server::settings::DEFAULT_MAX_CONCURRENT_STREAMS
        );
        assert_eq!(settings.log_level, LogLevel::Debug);
    }

    #[test]
    fn start_rejects_colliding_ports() {
        let cli = Cli::try_parse_from(["rpcbased", "start", "--port", "9000", "--metrics-port", "9000"])
            .unwrap();
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert!(matches!(args.settings(), Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn start_reports_missing_config_file() {
        let cli = Cli::try_parse_from(["rpcbased", "start", "--config", "/nonexistent/rpcbase.toml"])
            .unwrap();
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert!(matches!(args.settings(), Err(SettingsError::Read { .. })));
    }

    #[test]
    fn health_splits_addresses() {
        let cli = Cli::try_parse_from(["rpcbased", "health", "--addrs", "a:1,b:2"]).unwrap();
        let Command::Health(args) = cli.command else {
            panic!("expected health");
        };
        assert_eq!(args.addrs, vec!["a:1", "b:2"]);
        assert_eq!(args.timeout_ms, 3000);
        assert_eq!(args.log_level, LogLevel::Info);
    }

    #[test]
    fn health_requires_addresses() {
        assert!(Cli::try_parse_from(["rpcbased", "health"]).is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        assert!(Cli::try_parse_from(["rpcbased", "health", "--addrs", "a:1", "--log-level", "loud"]).is_err());
    }
}
