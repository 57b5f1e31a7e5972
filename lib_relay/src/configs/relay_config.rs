//! # Relay Settings
//!
//! The immutable configuration value consumed by the relay core. Values come
//! from environment-style key/value pairs (the process environment after an
//! optional `.env` file has been loaded) using the key names of existing
//! forwarder deployments, so their `.env` files keep working unchanged.
//!
//! Sources are declared as numbered groups:
//!
//! ```text
//! INSTANCE_1_NAME=shop1
//! INSTANCE_1_WEBHOOKS=https://a.example/hook,https://c.example/hook
//! INSTANCE_1_EVENTS=messages.upsert,connection.update
//! GLOBAL_WEBHOOKS=https://b.example/hook
//! ```
//!
//! Scanning starts at `1` and stops at the first number whose name or webhook
//! list is missing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Upstream used when `EVOLUTION_API_URL` is not set.
pub const DEFAULT_API_URL: &str = "https://evo-api.pro";

/// Prefix used by the source tag when `INSTANCE_PREFIX` is not set.
pub const DEFAULT_SOURCE_PREFIX: &str = "evolution";

/// Errors raised while building [`RelaySettings`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A mandatory key is absent or empty.
    #[error("Missing required setting: {0}")]
    MissingSetting(String),

    /// A key holds a value that cannot be parsed.
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue {
        /// The offending key.
        key: String,
        /// The raw value found.
        value: String,
    },

    /// The upstream base URL is malformed or uses an unsupported scheme.
    #[error("Invalid upstream URL '{url}': {reason}")]
    InvalidUpstreamUrl {
        /// The raw URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An endpoint is not an absolute http(s) URL.
    #[error("Endpoint '{0}' must start with http:// or https://")]
    InvalidEndpoint(String),

    /// Neither sources nor shared endpoints are configured.
    #[error("No webhook configuration found: set GLOBAL_WEBHOOKS or INSTANCE_1_NAME and INSTANCE_1_WEBHOOKS")]
    NothingToRelay,

    /// A source ends up with an empty effective target list.
    #[error("Source '{0}' has no webhooks and no GLOBAL_WEBHOOKS are configured")]
    SourceWithoutEndpoints(String),

    /// Two sources share a name.
    #[error("Source '{0}' is declared more than once")]
    DuplicateSource(String),
}

/// Bounded reconnect policy for upstream connections: a fixed delay between
/// attempts and a hard cap on consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect attempts allowed after a failure before giving up.
    pub max_attempts: u32,
    /// Delay before every reconnect attempt.
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Where and how to reach the upstream event server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    /// Base URL of the upstream; each source connects to a namespace below it.
    pub base_url: Url,
    /// Shared credential presented on every connection.
    pub api_key: String,
    /// Reconnect cap and delay.
    pub reconnect: ReconnectPolicy,
    /// Upper bound for the WebSocket upgrade plus the Socket.IO handshake.
    pub connect_timeout: Duration,
}

/// Delivery retry and timeout settings shared by every endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    /// Total attempts per (event, endpoint) pair, first attempt included.
    pub max_attempts: u32,
    /// Fixed wait between two attempts.
    pub retry_delay: Duration,
    /// Per-call HTTP timeout.
    pub timeout: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1000),
            timeout: Duration::from_millis(10_000),
        }
    }
}

/// Global feature switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Adds a `source` tag of the form `<prefix>-<sourceName>` to envelopes.
    pub add_source_prefix: bool,
    /// The prefix used by the tag.
    pub source_prefix: String,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            add_source_prefix: false,
            source_prefix: DEFAULT_SOURCE_PREFIX.to_string(),
        }
    }
}

impl FeatureFlags {
    /// The envelope tag for `source_name`, or `None` when tagging is off.
    pub fn source_tag(&self, source_name: &str) -> Option<String> {
        self.add_source_prefix
            .then(|| format!("{}-{}", self.source_prefix, source_name))
    }
}

/// One named source as declared in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    /// Unique source name; also the upstream namespace.
    pub name: String,
    /// The source's own endpoints, in declaration order.
    pub endpoints: Vec<String>,
    /// Allowed event types; empty means every event is accepted.
    pub events: Vec<String>,
}

/// The complete, read-only relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Upstream location, credential and reconnect policy.
    pub upstream: UpstreamSettings,
    /// Named sources; empty means a catch-all source is used.
    pub sources: Vec<SourceSettings>,
    /// Endpoints appended to every source's own list. Shared by reference.
    pub shared_endpoints: Arc<[String]>,
    /// Delivery retry and timeout settings.
    pub delivery: DeliverySettings,
    /// Feature switches.
    pub features: FeatureFlags,
}

impl RelaySettings {
    /// Loads the settings from the current process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_pairs(std::env::vars())
    }

    /// Loads the settings from arbitrary key/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        // --- Upstream ---
        let raw_url = lookup(&vars, "EVOLUTION_API_URL").unwrap_or(DEFAULT_API_URL);
        let base_url = parse_upstream_url(raw_url)?;
        let api_key = lookup(&vars, "EVOLUTION_API_KEY")
            .ok_or_else(|| ConfigError::MissingSetting("EVOLUTION_API_KEY".to_string()))?;

        let upstream = UpstreamSettings {
            base_url,
            api_key: api_key.to_string(),
            reconnect: ReconnectPolicy {
                max_attempts: parse_count(&vars, "RECONNECT_ATTEMPTS", 10)?,
                delay: Duration::from_millis(parse_number(&vars, "RECONNECT_DELAY", 1000)?),
            },
            connect_timeout: Duration::from_millis(parse_number(&vars, "CONNECT_TIMEOUT", 20_000)?),
        };

        // --- Delivery ---
        let max_attempts = parse_count(&vars, "RETRY_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RETRY_ATTEMPTS".to_string(),
                value: "0".to_string(),
            });
        }
        let delivery = DeliverySettings {
            max_attempts,
            retry_delay: Duration::from_millis(parse_number(&vars, "RETRY_DELAY", 1000)?),
            timeout: Duration::from_millis(parse_number(&vars, "TIMEOUT", 10_000)?),
        };

        // --- Features ---
        let features = FeatureFlags {
            add_source_prefix: lookup(&vars, "ADD_INSTANCE_PREFIX") == Some("true"),
            source_prefix: lookup(&vars, "INSTANCE_PREFIX")
                .unwrap_or(DEFAULT_SOURCE_PREFIX)
                .to_string(),
        };

        let settings = Self {
            upstream,
            sources: scan_sources(&vars),
            shared_endpoints: split_list(lookup(&vars, "GLOBAL_WEBHOOKS").unwrap_or("")).into(),
            delivery,
            features,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Checks the cross-field rules that a key-by-key parse cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() && self.shared_endpoints.is_empty() {
            return Err(ConfigError::NothingToRelay);
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
            if source.endpoints.is_empty() && self.shared_endpoints.is_empty() {
                return Err(ConfigError::SourceWithoutEndpoints(source.name.clone()));
            }
        }

        let all_endpoints = self
            .sources
            .iter()
            .flat_map(|s| s.endpoints.iter())
            .chain(self.shared_endpoints.iter());
        for endpoint in all_endpoints {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(ConfigError::InvalidEndpoint(endpoint.clone()));
            }
        }

        Ok(())
    }

    /// Own endpoints plus shared endpoints for a named source, in delivery order.
    pub fn effective_endpoint_count(&self, source: &SourceSettings) -> usize {
        source.endpoints.len() + self.shared_endpoints.len()
    }
}

/// Returns the trimmed value of `key`, treating blank values as absent.
fn lookup<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn parse_number(vars: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, ConfigError> {
    match lookup(vars, key) {
        None => Ok(default),
        Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// Like [`parse_number`] for counters that must fit a `u32`.
fn parse_count(vars: &HashMap<String, String>, key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = parse_number(vars, key, u64::from(default))?;
    u32::try_from(value).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_upstream_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUpstreamUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidUpstreamUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

/// Splits a comma-separated list, trimming entries and dropping empty ones.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn scan_sources(vars: &HashMap<String, String>) -> Vec<SourceSettings> {
    let mut sources = Vec::new();

    for number in 1.. {
        let name = lookup(vars, &format!("INSTANCE_{}_NAME", number));
        let webhooks = lookup(vars, &format!("INSTANCE_{}_WEBHOOKS", number));
        let (Some(name), Some(webhooks)) = (name, webhooks) else {
            break;
        };

        sources.push(SourceSettings {
            name: name.to_string(),
            endpoints: split_list(webhooks),
            events: split_list(lookup(vars, &format!("INSTANCE_{}_EVENTS", number)).unwrap_or("")),
        });
    }

    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_pairs() -> Vec<(&'static str, &'static str)> {
        vec![("EVOLUTION_API_KEY", "secret")]
    }

    #[test]
    fn test_defaults_with_global_webhooks_only() {
        let mut pairs = base_pairs();
        pairs.push(("GLOBAL_WEBHOOKS", " https://b.example/hook , ,https://c.example/hook"));

        let settings = RelaySettings::from_pairs(pairs).unwrap();

        assert_eq!(settings.upstream.base_url.as_str(), "https://evo-api.pro/");
        assert_eq!(settings.upstream.api_key, "secret");
        assert_eq!(settings.upstream.reconnect, ReconnectPolicy::default());
        assert!(settings.sources.is_empty());
        assert_eq!(
            &*settings.shared_endpoints,
            &["https://b.example/hook".to_string(), "https://c.example/hook".to_string()]
        );
        assert_eq!(settings.delivery, DeliverySettings::default());
        assert!(!settings.features.add_source_prefix);
    }

    #[test]
    fn test_scans_numbered_sources_until_gap() {
        let mut pairs = base_pairs();
        pairs.extend([
            ("INSTANCE_1_NAME", "shop1"),
            ("INSTANCE_1_WEBHOOKS", "https://a.example/hook"),
            ("INSTANCE_1_EVENTS", "messages.upsert, connection.update"),
            ("INSTANCE_2_NAME", "shop2"),
            ("INSTANCE_2_WEBHOOKS", "https://d.example/hook"),
            // 3 is missing, so 4 is never read.
            ("INSTANCE_4_NAME", "shop4"),
            ("INSTANCE_4_WEBHOOKS", "https://e.example/hook"),
        ]);

        let settings = RelaySettings::from_pairs(pairs).unwrap();

        assert_eq!(settings.sources.len(), 2);
        assert_eq!(settings.sources[0].name, "shop1");
        assert_eq!(settings.sources[0].events, vec!["messages.upsert", "connection.update"]);
        assert_eq!(settings.sources[1].name, "shop2");
        assert!(settings.sources[1].events.is_empty());
    }

    #[test]
    fn test_numeric_overrides_and_prefix_flag() {
        let mut pairs = base_pairs();
        pairs.extend([
            ("GLOBAL_WEBHOOKS", "https://b.example/hook"),
            ("RETRY_ATTEMPTS", "5"),
            ("RETRY_DELAY", "250"),
            ("TIMEOUT", "3000"),
            ("RECONNECT_ATTEMPTS", "4"),
            ("ADD_INSTANCE_PREFIX", "true"),
            ("INSTANCE_PREFIX", "evo"),
        ]);

        let settings = RelaySettings::from_pairs(pairs).unwrap();

        assert_eq!(settings.delivery.max_attempts, 5);
        assert_eq!(settings.delivery.retry_delay, Duration::from_millis(250));
        assert_eq!(settings.delivery.timeout, Duration::from_secs(3));
        assert_eq!(settings.upstream.reconnect.max_attempts, 4);
        assert_eq!(settings.features.source_tag("shop1").as_deref(), Some("evo-shop1"));
    }

    #[test]
    fn test_missing_api_key() {
        let result = RelaySettings::from_pairs([("GLOBAL_WEBHOOKS", "https://b.example/hook")]);
        assert_eq!(
            result.unwrap_err(),
            ConfigError::MissingSetting("EVOLUTION_API_KEY".to_string())
        );
    }

    #[test]
    fn test_nothing_to_relay() {
        let result = RelaySettings::from_pairs(base_pairs());
        assert_eq!(result.unwrap_err(), ConfigError::NothingToRelay);
    }

    #[test]
    fn test_invalid_number() {
        let mut pairs = base_pairs();
        pairs.extend([("GLOBAL_WEBHOOKS", "https://b.example/hook"), ("RETRY_DELAY", "soon")]);
        assert!(matches!(
            RelaySettings::from_pairs(pairs),
            Err(ConfigError::InvalidValue { key, .. }) if key == "RETRY_DELAY"
        ));
    }

    #[test]
    fn test_zero_retry_attempts_rejected() {
        let mut pairs = base_pairs();
        pairs.extend([("GLOBAL_WEBHOOKS", "https://b.example/hook"), ("RETRY_ATTEMPTS", "0")]);
        assert!(RelaySettings::from_pairs(pairs).is_err());
    }

    #[test]
    fn test_attempt_counts_must_fit_u32() {
        for key in ["RETRY_ATTEMPTS", "RECONNECT_ATTEMPTS"] {
            let mut pairs = base_pairs();
            pairs.push(("GLOBAL_WEBHOOKS", "https://b.example/hook"));
            pairs.push((key, "4294967296"));
            assert_eq!(
                RelaySettings::from_pairs(pairs).unwrap_err(),
                ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: "4294967296".to_string(),
                }
            );
        }
    }

    #[test]
    fn test_invalid_endpoint_scheme() {
        let mut pairs = base_pairs();
        pairs.push(("GLOBAL_WEBHOOKS", "ftp://b.example/hook"));
        assert_eq!(
            RelaySettings::from_pairs(pairs).unwrap_err(),
            ConfigError::InvalidEndpoint("ftp://b.example/hook".to_string())
        );
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let mut pairs = base_pairs();
        pairs.extend([
            ("INSTANCE_1_NAME", "shop1"),
            ("INSTANCE_1_WEBHOOKS", "https://a.example/hook"),
            ("INSTANCE_2_NAME", "shop1"),
            ("INSTANCE_2_WEBHOOKS", "https://a.example/hook"),
        ]);
        assert_eq!(
            RelaySettings::from_pairs(pairs).unwrap_err(),
            ConfigError::DuplicateSource("shop1".to_string())
        );
    }

    #[test]
    fn test_source_tag_disabled_by_default() {
        assert_eq!(FeatureFlags::default().source_tag("shop1"), None);
    }
}
