use crate::config::Config;
use log::LevelFilter;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// Dependency targets hidden unless running at Trace. The WebSocket stack logs
/// every frame at debug level.
const FILTERED_MODULES: &[&str] = &[
    "tower",
    "tracing",
    "hyper",
    "axum",
    "tungstenite",
    "tokio_tungstenite",
];

pub struct Logger {}

impl Logger {
    /// Installs the global terminal logger at the configured level.
    ///
    /// Calling this more than once keeps the first logger.
    pub fn init_logger(config: &Config) {
        let level = config.log_level_filter;

        if let Err(e) = TermLogger::init(
            level,
            Self::log_config(level),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ) {
            eprintln!("Logger already initialized: {e}");
        }
    }

    fn log_config(level: LevelFilter) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();

        if level != LevelFilter::Trace {
            for module in FILTERED_MODULES {
                builder.add_filter_ignore_str(module);
            }
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn websocket_stack_is_filtered() {
        for module in ["hyper", "axum", "tungstenite", "tokio_tungstenite"] {
            assert!(FILTERED_MODULES.contains(&module), "{module} should be filtered");
        }
    }

    #[test]
    fn our_crates_are_never_filtered() {
        for module in ["realtime", "web", "events", "peer_support_rs"] {
            assert!(!FILTERED_MODULES.contains(&module));
        }
    }

    #[test]
    fn log_config_builds_at_every_level() {
        for level in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            let _config = Logger::log_config(level);
        }
    }

    #[test]
    fn init_logger_twice_does_not_panic() {
        let config = Config::parse_from(["peer_support_rs", "--log-level-filter", "WARN"]);
        Logger::init_logger(&config);
        Logger::init_logger(&config);
    }
}
