use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use crate::query::QuerySettings;
use crate::registry::ControllerSettings;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub mdns: MdnsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default)]
    pub description: String,
    /// Defaults to the system hostname
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Unicast DNS-SD domain, e.g. "example.com"
    pub search_domain: Option<String>,
    #[serde(default = "default_true")]
    pub allow_multicast: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_cooldown")]
    pub registry_cooldown_ms: u64,
    #[serde(default = "default_rediscovery_interval")]
    pub rediscovery_interval_ms: u64,
    #[serde(default = "default_quiet_window")]
    pub multicast_quiet_window_ms: u64,
    #[serde(default = "default_max_registration_attempts")]
    pub max_registration_attempts: u32,
    #[serde(default = "default_max_reregistrations")]
    pub max_reregistrations: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_reaction_delay")]
    pub reaction_delay_ms: u64,
    #[serde(default = "default_reaction_grace")]
    pub reaction_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub search_domain: Option<String>,
    #[serde(default = "default_true")]
    pub allow_multicast: bool,
    #[serde(default = "default_true")]
    pub allow_peer_to_peer: bool,
    #[serde(default = "default_freshness_window")]
    pub freshness_window_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_quiet_window")]
    pub multicast_quiet_window_ms: u64,
    #[serde(default = "default_cooldown")]
    pub service_cooldown_ms: u64,
    #[serde(default = "default_rediscovery_interval")]
    pub rediscovery_interval_ms: u64,
    #[serde(default = "default_reaction_delay")]
    pub reaction_delay_ms: u64,
    #[serde(default = "default_reaction_grace")]
    pub reaction_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MdnsConfig {
    /// Restrict mDNS to one interface; all interfaces when unset
    pub interface: Option<String>,
}

fn default_label() -> String {
    "nmos-discoveryd".to_string()
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    5000
}

fn default_cooldown() -> u64 {
    45_000
}

fn default_rediscovery_interval() -> u64 {
    60_000
}

fn default_quiet_window() -> u64 {
    2000
}

fn default_max_registration_attempts() -> u32 {
    5
}

fn default_max_reregistrations() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_reaction_delay() -> u64 {
    1000
}

fn default_reaction_grace() -> u64 {
    500
}

fn default_freshness_window() -> u64 {
    10_000
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_listen() -> String {
    "[::]:3212".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            description: String::new(),
            hostname: None,
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            search_domain: None,
            allow_multicast: true,
            heartbeat_interval_ms: default_heartbeat_interval(),
            registry_cooldown_ms: default_cooldown(),
            rediscovery_interval_ms: default_rediscovery_interval(),
            multicast_quiet_window_ms: default_quiet_window(),
            max_registration_attempts: default_max_registration_attempts(),
            max_reregistrations: default_max_reregistrations(),
            retry_backoff_ms: default_retry_backoff(),
            reaction_delay_ms: default_reaction_delay(),
            reaction_grace_ms: default_reaction_grace(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            search_domain: None,
            allow_multicast: true,
            allow_peer_to_peer: true,
            freshness_window_ms: default_freshness_window(),
            request_timeout_ms: default_request_timeout(),
            multicast_quiet_window_ms: default_quiet_window(),
            service_cooldown_ms: default_cooldown(),
            rediscovery_interval_ms: default_rediscovery_interval(),
            reaction_delay_ms: default_reaction_delay(),
            reaction_grace_ms: default_reaction_grace(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl RegistrationConfig {
    /// Controller settings; the advertisement is left at its default for
    /// the caller to fill in.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            search_domain: self.search_domain.clone(),
            allow_multicast: self.allow_multicast,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            registry_cooldown: Duration::from_millis(self.registry_cooldown_ms),
            rediscovery_interval: Duration::from_millis(self.rediscovery_interval_ms),
            quiet_window: Duration::from_millis(self.multicast_quiet_window_ms),
            max_registration_attempts: self.max_registration_attempts,
            max_reregistrations: self.max_reregistrations,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            reaction_delay: Duration::from_millis(self.reaction_delay_ms),
            reaction_grace: Duration::from_millis(self.reaction_grace_ms),
            ..Default::default()
        }
    }
}

impl QueryConfig {
    pub fn query_settings(&self) -> QuerySettings {
        QuerySettings {
            search_domain: self.search_domain.clone(),
            allow_multicast: self.allow_multicast,
            allow_peer_to_peer: self.allow_peer_to_peer,
            freshness_window: Duration::from_millis(self.freshness_window_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            quiet_window: Duration::from_millis(self.multicast_quiet_window_ms),
            service_cooldown: Duration::from_millis(self.service_cooldown_ms),
            rediscovery_interval: Duration::from_millis(self.rediscovery_interval_ms),
            reaction_delay: Duration::from_millis(self.reaction_delay_ms),
            reaction_grace: Duration::from_millis(self.reaction_grace_ms),
        }
    }
}

impl ApiConfig {
    /// Port of the listen address, used in node endpoints and advertisements.
    pub fn port(&self) -> u16 {
        self.listen
            .rsplit(':')
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(3212)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}
