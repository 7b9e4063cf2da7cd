//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::settings::LogLevel;

/// Transport crates are noisy below `warn`.
const QUIET_TRANSPORTS: &str = "h2=warn,hyper=warn,tower=warn";

/// Install the global fmt subscriber at `level`.
///
/// `RUST_LOG`, when set, takes precedence. Calling this more than once is
/// harmless; later calls leave the first subscriber in place.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn default_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from(level).into())
        .parse_lossy(QUIET_TRANSPORTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_uses_configured_level() {
        assert_eq!(
            default_filter(LogLevel::Debug).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
        assert_eq!(
            default_filter(LogLevel::Trace).max_level_hint(),
            Some(LevelFilter::TRACE)
        );
    }

    #[test]
    fn filter_quiets_transport_crates() {
        let filter = default_filter(LogLevel::Debug).to_string();
        assert!(filter.contains("h2=warn"), "{filter}");
        assert!(filter.contains("hyper=warn"), "{filter}");
    }

    #[test]
    fn init_twice_does_not_panic() {
        init(LogLevel::Info);
        init(LogLevel::Debug);
    }
}
