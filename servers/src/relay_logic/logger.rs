use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::{Mutex, PoisonError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::relay_logic::config::{CategoryToggles, Config, LogFormat};

/// Levels accepted at runtime.
pub const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Builds the filter: the global level plus the directives of the category
/// toggles.
pub fn build_filter(level: &str, toggles: &CategoryToggles) -> Result<EnvFilter> {
    let mut directives = vec![level.to_string()];
    directives.extend(toggles.directives());
    EnvFilter::try_new(directives.join(",")).with_context(|| format!("Invalid log level '{}'", level))
}

/// A partial change of the log configuration. Absent fields keep their
/// current value.
#[derive(Debug, Default, Deserialize)]
pub struct LogUpdate {
    pub level: Option<String>,
    pub connection: Option<bool>,
    pub events: Option<bool>,
    pub forwards: Option<bool>,
    pub retry: Option<bool>,
    pub stats: Option<bool>,
    pub errors: Option<bool>,
    pub payload: Option<bool>,
}

impl LogUpdate {
    fn apply(&self, toggles: &CategoryToggles) -> CategoryToggles {
        CategoryToggles {
            connection: self.connection.unwrap_or(toggles.connection),
            events: self.events.unwrap_or(toggles.events),
            forwards: self.forwards.unwrap_or(toggles.forwards),
            retry: self.retry.unwrap_or(toggles.retry),
            stats: self.stats.unwrap_or(toggles.stats),
            errors: self.errors.unwrap_or(toggles.errors),
            payload: self.payload.unwrap_or(toggles.payload),
        }
    }
}

/// The live log configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSettings {
    pub level: String,
    #[serde(flatten)]
    pub toggles: CategoryToggles,
}

/// Runtime access to the log level and the category toggles.
pub struct LogControl {
    handle: Option<FilterHandle>,
    current: Mutex<LogSettings>,
}

impl LogControl {
    /// `handle` is `None` when no subscriber was installed; updates are then
    /// only recorded.
    pub fn new(handle: Option<FilterHandle>, level: &str, toggles: CategoryToggles) -> Self {
        Self {
            handle,
            current: Mutex::new(LogSettings {
                level: level.to_string(),
                toggles,
            }),
        }
    }

    pub fn settings(&self) -> LogSettings {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Applies `update` and swaps the live filter. Nothing changes when the
    /// level is unknown.
    pub fn update(&self, update: &LogUpdate) -> Result<LogSettings> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        let level = match &update.level {
            Some(level) => {
                let level = level.trim().to_lowercase();
                if !LEVELS.contains(&level.as_str()) {
                    anyhow::bail!("Unknown log level '{}', expected one of {}", level, LEVELS.join(", "));
                }
                level
            }
            None => current.level.clone(),
        };
        let toggles = update.apply(&current.toggles);

        if let Some(handle) = &self.handle {
            handle
                .reload(build_filter(&level, &toggles)?)
                .context("Failed to reload log filter")?;
        }
        *current = LogSettings { level, toggles };
        Ok(current.clone())
    }
}

/// Installs the global subscriber: console (text or JSON) and, when enabled,
/// a daily rolling JSON file. The returned guard must live as long as the
/// process or buffered file lines are lost.
pub fn setup_logging(config: &Config) -> Result<(LogControl, Option<WorkerGuard>)> {
    let toggles = config.toggles();
    let filter = build_filter(&config.log_level, &toggles)?;
    let (filter_layer, handle) = reload::Layer::new(filter);

    let console_text = (config.log_format == LogFormat::Text).then(|| fmt::layer().with_target(true));
    let console_json = (config.log_format == LogFormat::Json).then(|| fmt::layer().json());

    let (file_layer, guard) = if config.log_to_file {
        fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Failed to create log directory {}", config.log_dir.display()))?;
        let appender = rolling::daily(&config.log_dir, "server_relay.log");
        let (writer, guard) = non_blocking(appender);
        let layer = fmt::layer().with_ansi(false).with_writer(writer).json();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_text)
        .with(console_json)
        .with(file_layer)
        .try_init()
        .context("Failed to install the tracing subscriber")?;

    tracing::info!("Logging initialized with level: {}", config.log_level);
    Ok((LogControl::new(Some(handle), &config.log_level, toggles), guard))
}
