//! # Messaging Configuration
//!
//! Configuration for the cluster messaging subsystem. Exactly one transport
//! is active per process, selected by `[transport]`; every transport shares
//! the same channel name so heterogeneous deployments stay wire-compatible.
//!
//! ## Configuration Structure
//!
//! ```toml
//! transport = "multicast"           # topic, key_value, broker, multicast, membership
//! channel = "appng-messaging"
//!
//! [keyvalue]
//! host = "localhost"
//! port = 6379
//!
//! [broker]
//! addresses = ["localhost:5672"]
//! user = "guest"
//! password = "guest"
//!
//! [multicast]
//! group_address = "224.2.2.4"
//! port = 4000
//!
//! [reload]
//! max_random_delay_ms = 6000
//! quorum_enabled = true
//! ```
//!
//! Process-level switches for the datagram transport are environment
//! variables applied by [`MessagingConfig::apply_env_overrides`]:
//! `SITEPLEX_MULTICAST_DISABLED`, `SITEPLEX_MULTICAST_BIND` and
//! `SITEPLEX_MULTICAST_ALLOWED` (comma-separated sender allow-list).

use crate::error::{MessagingError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default topic/channel/exchange name shared by all transports
pub const DEFAULT_CHANNEL: &str = "appng-messaging";

/// Environment variable disabling datagram sends entirely
pub const ENV_MULTICAST_DISABLED: &str = "SITEPLEX_MULTICAST_DISABLED";
/// Environment variable overriding the local bind address for datagram sends
pub const ENV_MULTICAST_BIND: &str = "SITEPLEX_MULTICAST_BIND";
/// Environment variable holding the comma-separated sender allow-list
pub const ENV_MULTICAST_ALLOWED: &str = "SITEPLEX_MULTICAST_ALLOWED";

/// Which transport adapter is active for this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Reliable topic over the shared cluster client
    Topic,
    /// Key-value store pub/sub
    KeyValue,
    /// Message-broker fanout exchange
    Broker,
    /// Raw datagram multicast, needs no infrastructure
    #[default]
    Multicast,
    /// Group-membership channel (heartbeats + reliable delivery)
    Membership,
}

/// Main messaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Active transport for this deployment
    #[serde(default)]
    pub transport: TransportMode,
    /// Topic/channel name
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub topic: TopicConfig,
    #[serde(default)]
    pub keyvalue: KeyValueConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub multicast: MulticastConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub reload: ReloadConfig,
}

/// Reliable-topic transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Address the cluster client listens on
    pub bind_address: String,
    /// Listen addresses of the peer cluster clients
    pub peers: Vec<String>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5800".to_string(),
            peers: Vec::new(),
        }
    }
}

/// Key-value store pub/sub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValueConfig {
    pub host: String,
    pub port: u16,
    /// Empty means no authentication
    pub password: String,
    /// None falls back to the driver default
    pub timeout_ms: Option<u64>,
}

impl Default for KeyValueConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
            timeout_ms: None,
        }
    }
}

/// Message-broker fanout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker addresses, tried in order
    pub addresses: Vec<String>,
    pub user: String,
    pub password: String,
    /// Fanout exchange name; the per-node queue is named `<exchange>@<node>`
    pub exchange: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["localhost:5672".to_string()],
            user: "guest".to_string(),
            password: "guest".to_string(),
            exchange: DEFAULT_CHANNEL.to_string(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Raw datagram multicast settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    /// Multicast group address
    pub group_address: String,
    pub port: u16,
    /// Local bind override for the transient send socket ("ip" or "ip:port")
    pub bind_address: Option<String>,
    /// Permitted sender addresses; empty means any sender is accepted
    pub allowed_senders: Vec<String>,
    /// Kill switch: when set, sends are intentional no-ops
    pub send_disabled: bool,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group_address: "224.2.2.4".to_string(),
            port: 4000,
            bind_address: None,
            allowed_senders: Vec::new(),
            send_disabled: false,
        }
    }
}

/// Group-membership transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// TCP address the reliable delivery channel listens on
    pub bind_address: String,
    /// UDP address heartbeats are received on
    pub heartbeat_bind_address: String,
    /// Heartbeat addresses of the seed peers
    pub peers: Vec<String>,
    /// Address advertised to peers; defaults to the bound channel address
    pub advertised_address: Option<String>,
    pub heartbeat_interval_ms: u64,
    /// Members silent for longer than this are dropped from the member table
    pub member_timeout_ms: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5801".to_string(),
            heartbeat_bind_address: "0.0.0.0:5802".to_string(),
            peers: Vec::new(),
            advertised_address: None,
            heartbeat_interval_ms: 1_000,
            member_timeout_ms: 5_000,
        }
    }
}

/// Site-reload coordination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Upper bound of the random pre-reload delay; the actual delay is drawn
    /// uniformly from `[max, 2*max)`
    pub max_random_delay_ms: u64,
    /// Gate the reload on enough peers reporting the site as started
    pub quorum_enabled: bool,
    /// Interval between cluster-state polls while waiting for quorum
    pub poll_interval_ms: u64,
    /// Maximum wait before proceeding without quorum (best-effort gate)
    pub max_wait_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            max_random_delay_ms: 6_000,
            quorum_enabled: true,
            poll_interval_ms: 5_000,
            max_wait_ms: 30_000,
        }
    }
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::default(),
            channel: default_channel(),
            topic: TopicConfig::default(),
            keyvalue: KeyValueConfig::default(),
            broker: BrokerConfig::default(),
            multicast: MulticastConfig::default(),
            membership: MembershipConfig::default(),
            reload: ReloadConfig::default(),
        }
    }
}

impl MessagingConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| MessagingError::configuration(
                format!("failed to read config file: {}", e),
                None,
            ))?;

        toml::from_str(&contents)
            .map_err(|e| MessagingError::configuration(format!("failed to parse config: {}", e), None))
    }

    /// Apply the process-level environment switches for the datagram
    /// transport on top of the file-based configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(ENV_MULTICAST_DISABLED) {
            self.multicast.send_disabled = matches!(value.as_str(), "1" | "true" | "TRUE");
        }
        if let Ok(value) = std::env::var(ENV_MULTICAST_BIND) {
            if !value.trim().is_empty() {
                self.multicast.bind_address = Some(value);
            }
        }
        if let Ok(value) = std::env::var(ENV_MULTICAST_ALLOWED) {
            self.multicast.allowed_senders = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = MessagingConfig::default();
        assert_eq!(config.transport, TransportMode::Multicast);
        assert_eq!(config.channel, "appng-messaging");
        assert_eq!(config.keyvalue.host, "localhost");
        assert_eq!(config.keyvalue.port, 6379);
        assert!(config.keyvalue.password.is_empty());
        assert_eq!(config.broker.addresses, vec!["localhost:5672".to_string()]);
        assert_eq!(config.broker.user, "guest");
        assert_eq!(config.broker.exchange, "appng-messaging");
        assert!(config.broker.auto_delete);
        assert!(config.broker.exclusive);
        assert!(!config.broker.durable);
        assert_eq!(config.reload.max_random_delay_ms, 6_000);
        assert_eq!(config.reload.poll_interval_ms, 5_000);
        assert_eq!(config.reload.max_wait_ms, 30_000);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            transport = "key_value"
            channel = "cluster-events"

            [keyvalue]
            host = "redis.internal"
            port = 6380
            password = "secret"
        "#;

        let config: MessagingConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.transport, TransportMode::KeyValue);
        assert_eq!(config.channel, "cluster-events");
        assert_eq!(config.keyvalue.host, "redis.internal");
        assert_eq!(config.keyvalue.port, 6380);
        // untouched sections keep their defaults
        assert_eq!(config.multicast.group_address, "224.2.2.4");
        assert_eq!(config.multicast.port, 4000);
        assert!(config.reload.quorum_enabled);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messaging.toml");
        std::fs::write(
            &path,
            r#"
                transport = "broker"

                [broker]
                addresses = ["amqp1:5672", "amqp2:5672"]
                user = "siteplex"
                password = "siteplex"
            "#,
        )
        .unwrap();

        let config = MessagingConfig::from_file(&path).unwrap();
        assert_eq!(config.transport, TransportMode::Broker);
        assert_eq!(config.broker.addresses.len(), 2);
        assert_eq!(config.broker.user, "siteplex");

        let missing = MessagingConfig::from_file(dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(MessagingError::Configuration { .. })));
    }

    #[test]
    fn test_allow_list_env_override_parsing() {
        let mut config = MessagingConfig::default();
        std::env::set_var(ENV_MULTICAST_ALLOWED, "10.0.0.1, 10.0.0.2 ,,");
        std::env::set_var(ENV_MULTICAST_DISABLED, "true");
        config.apply_env_overrides();
        std::env::remove_var(ENV_MULTICAST_ALLOWED);
        std::env::remove_var(ENV_MULTICAST_DISABLED);

        assert_eq!(config.multicast.allowed_senders, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(config.multicast.send_disabled);
    }
}
