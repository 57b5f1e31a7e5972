use clap::{ArgAction, Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;

/// Console log encoding.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Per-category log switches. A disabled category is silenced entirely.
///
/// `payload` is the odd one out: it is off by default and only adds the
/// event payload lines (`relay::events::payload`, debug level), so it has no
/// effect while `events` is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CategoryToggles {
    pub connection: bool,
    pub events: bool,
    pub forwards: bool,
    pub retry: bool,
    pub stats: bool,
    pub errors: bool,
    pub payload: bool,
}

impl CategoryToggles {
    /// Filter directives silencing the disabled categories.
    pub fn directives(&self) -> Vec<String> {
        [
            (self.connection, "relay::connection"),
            (self.events, "relay::events"),
            (self.forwards, "relay::forwards"),
            (self.retry, "relay::retry"),
            (self.stats, "relay::stats"),
            (self.errors, "relay::errors"),
            (self.payload && self.events, "relay::events::payload"),
        ]
        .into_iter()
        .filter(|(enabled, _)| !enabled)
        .map(|(_, target)| format!("{}=off", target))
        .collect()
    }
}

/// Process settings of the relay server. The relay settings themselves
/// (upstream, sources, webhooks, retries) are read from the environment by
/// `lib_relay`.
#[derive(Parser, Debug, Clone)]
#[clap(about = "Relays upstream Socket.IO events to HTTP webhooks", version)]
pub struct Config {
    #[clap(long, env = "PORT", default_value_t = 3000, help = "Port of the HTTP control plane.")]
    pub port: u16,

    #[clap(long, env = "LOG_LEVEL", default_value = "info", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: String,

    #[clap(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, help = "Console log format.")]
    pub log_format: LogFormat,

    #[clap(long, env = "LOG_STATS_INTERVAL", default_value_t = 5, help = "Minutes between stats reports, 0 disables them.")]
    pub log_stats_interval: u64,

    #[clap(long, env = "LOG_TO_FILE", default_value_t = false, action = ArgAction::Set, help = "Also write JSON logs to a daily rolling file.")]
    pub log_to_file: bool,

    #[clap(long, env = "LOG_DIR", default_value = "./logs", help = "Directory for log files.")]
    pub log_dir: PathBuf,

    #[clap(long, env = "LOG_CONNECTION", default_value_t = true, action = ArgAction::Set, help = "Log upstream connection events.")]
    pub log_connection: bool,

    #[clap(long, env = "LOG_EVENTS", default_value_t = true, action = ArgAction::Set, help = "Log received and filtered events.")]
    pub log_events: bool,

    #[clap(long, env = "LOG_FORWARDS", default_value_t = true, action = ArgAction::Set, help = "Log delivery outcomes.")]
    pub log_forwards: bool,

    #[clap(long, env = "LOG_RETRY", default_value_t = true, action = ArgAction::Set, help = "Log delivery retries.")]
    pub log_retry: bool,

    #[clap(long, env = "LOG_STATS", default_value_t = true, action = ArgAction::Set, help = "Log periodic stats reports.")]
    pub log_stats: bool,

    #[clap(long, env = "LOG_ERRORS", default_value_t = true, action = ArgAction::Set, help = "Log connection, decoding and routing errors.")]
    pub log_errors: bool,

    #[clap(long, env = "LOG_PAYLOAD", default_value_t = false, action = ArgAction::Set, help = "Log the payload of every accepted event at debug level.")]
    pub log_payload: bool,

    #[clap(long, env = "ENV_FILE", help = "Path to a .env file, defaults to ./.env when present.")]
    pub env_file: Option<PathBuf>,
}

impl Config {
    pub fn toggles(&self) -> CategoryToggles {
        CategoryToggles {
            connection: self.log_connection,
            events: self.log_events,
            forwards: self.log_forwards,
            retry: self.log_retry,
            stats: self.log_stats,
            errors: self.log_errors,
            payload: self.log_payload,
        }
    }
}

/// Loads the `.env` file, then parses CLI arguments over the environment.
///
/// Arguments are parsed twice: once to find `--env-file`, and again after the
/// file is loaded so its values reach the `env` fallbacks. Variables already
/// set in the process environment win over the file.
pub fn load_config() -> Config {
    let early = Config::parse();

    let loaded = match &early.env_file {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };
    // A missing default .env is normal; a missing explicit one is not. Logging
    // is not up yet.
    if let (Err(e), Some(path)) = (loaded, &early.env_file) {
        eprintln!("Failed to load env file {}: {}", path.display(), e);
    }

    Config::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let config = Config::try_parse_from([
            "server_relay",
            "--port",
            "8080",
            "--log-format",
            "json",
            "--log-events",
            "false",
            "--log-stats-interval",
            "0",
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_stats_interval, 0);
        assert!(!config.log_events);
        assert!(config.log_errors);
        assert!(!config.log_payload);
    }

    #[test]
    fn test_directives_for_disabled_categories() {
        let toggles = CategoryToggles {
            connection: true,
            events: false,
            forwards: true,
            retry: false,
            stats: true,
            errors: false,
            payload: true,
        };
        assert_eq!(
            toggles.directives(),
            vec![
                "relay::events=off",
                "relay::retry=off",
                "relay::errors=off",
                "relay::events::payload=off",
            ]
        );
    }

    #[test]
    fn test_payload_off_by_default() {
        let config = Config::try_parse_from(["server_relay"]).unwrap();
        assert_eq!(config.toggles().directives(), vec!["relay::events::payload=off"]);

        let config = Config::try_parse_from(["server_relay", "--log-payload", "true"]).unwrap();
        assert!(config.toggles().directives().is_empty());
    }

    #[test]
    fn test_rejects_unknown_format() {
        assert!(Config::try_parse_from(["server_relay", "--log-format", "xml"]).is_err());
    }
}
