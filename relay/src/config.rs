use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_BASE_URI: &str = "https://app.launchdarkly.com";
pub const DEFAULT_STREAM_URI: &str = "https://stream.launchdarkly.com";
pub const DEFAULT_EVENTS_URI: &str = "https://events.launchdarkly.com";

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 180;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Fully parsed relay configuration. Parsing from files or the environment
/// happens in the binary; the core only ever sees this record.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub main: MainConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub proxy: ProxyParams,
    #[serde(default)]
    pub big_segments: Option<BigSegmentsConfig>,
    pub environments: HashMap<String, EnvConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MainConfig {
    pub listener: Listener,
    pub base_uri: String,
    pub stream_uri: String,
    pub heartbeat_interval_secs: u64,
    pub ignore_connection_errors: bool,
    pub exit_on_error: bool,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            listener: Listener::default(),
            base_uri: DEFAULT_BASE_URI.to_string(),
            stream_uri: DEFAULT_STREAM_URI.to_string(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            ignore_connection_errors: false,
            exit_on_error: false,
        }
    }
}

impl MainConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8030,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub send_events: bool,
    pub events_uri: String,
    pub flush_interval_secs: u64,
    /// Maximum number of queued payloads per endpoint; also the batch size
    /// that triggers an early flush.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            send_events: false,
            events_uri: DEFAULT_EVENTS_URI.to_string(),
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl EventsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Outbound HTTP options, passed through to the HTTP-client factory.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyParams {
    pub url: Option<String>,
    pub ntlm_auth: bool,
    pub user: Option<String>,
    pub password: Option<String>,
    pub domain: Option<String>,
    pub ca_cert_files: Vec<String>,
    pub connect_timeout_secs: Option<u64>,
}

impl ProxyParams {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BigSegmentsConfig {
    pub poll_uri: String,
    pub stream_uri: String,
    #[serde(default)]
    pub stream_retry_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct EnvConfig {
    pub sdk_key: String,
    #[serde(default)]
    pub mobile_key: Option<String>,
    #[serde(default)]
    pub env_id: Option<String>,
    #[serde(default)]
    pub secure_mode: bool,
    /// Poll-response cacheability advertised to clients; zero means none.
    #[serde(default)]
    pub cache_ttl_secs: u64,
    /// Reconcile this environment's big segments via the sync service.
    #[serde(default)]
    pub big_segments: bool,
}

impl EnvConfig {
    pub fn new(sdk_key: impl Into<String>) -> Self {
        Self {
            sdk_key: sdk_key.into(),
            mobile_key: None,
            env_id: None,
            secure_mode: false,
            cache_ttl_secs: 0,
            big_segments: false,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Lenient boolean parsing for request query parameters. Unrecognized values
/// map to `false`; the original relay did this silently, which is surprising
/// enough to deserve a debug line.
pub fn parse_bool_param(value: &str) -> bool {
    match value {
        "true" | "1" => true,
        "false" | "0" | "" => false,
        other => {
            tracing::debug!(value = %other, "Unrecognized boolean value, treating as false");
            false
        }
    }
}
