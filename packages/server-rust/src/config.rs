//! Node configuration and the named-property provider it is built from.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Failure to interpret a named property.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("property {name} has invalid value {value:?}: expected {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

// ---------------------------------------------------------------------------
// PropertySource
// ---------------------------------------------------------------------------

/// Source of named string properties with typed accessors.
///
/// Loading and change notification are the caller's business; the node only
/// reads values once at startup through [`NodeConfig::from_properties`].
pub trait PropertySource {
    /// Raw value for `name`, if set.
    fn get(&self, name: &str) -> Option<String>;

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the value is not a signed 32-bit integer.
    fn get_int(&self, name: &'static str) -> Result<Option<i32>, ConfigError> {
        parse_property(self.get(name), name, "an integer")
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the value is not a signed 64-bit integer.
    fn get_long(&self, name: &'static str) -> Result<Option<i64>, ConfigError> {
        parse_property(self.get(name), name, "a long")
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] unless the value is `true` or `false`.
    fn get_bool(&self, name: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.get(name) {
            None => Ok(None),
            Some(v) if v.trim().eq_ignore_ascii_case("true") => Ok(Some(true)),
            Some(v) if v.trim().eq_ignore_ascii_case("false") => Ok(Some(false)),
            Some(value) => Err(ConfigError::Invalid {
                name,
                value,
                expected: "true or false",
            }),
        }
    }

    fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).map(|v| v.trim().to_string())
    }
}

impl PropertySource for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

fn parse_property<T: std::str::FromStr>(
    raw: Option<String>,
    name: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    raw.map(|value| {
        value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            expected,
        })
    })
    .transpose()
}

/// A period or timeout in milliseconds. Zero is rejected: timers cannot
/// tick with a zero period.
fn millis(
    props: &impl PropertySource,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match props.get_long(name)? {
        Some(ms) => u64::try_from(ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .ok_or_else(|| ConfigError::Invalid {
                name,
                value: ms.to_string(),
                expected: "a positive duration",
            }),
        None => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

/// Top-level configuration for one relay node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity announced to peers in `START`/`NEW NODE` lines.
    pub node_id: Uuid,
    pub cluster: ClusterConfig,
    pub storage: StorageConfig,
    pub connection: ConnectionConfig,
    /// Period of the delivery loop over owned messages.
    pub delivery_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: Uuid::new_v4(),
            cluster: ClusterConfig::default(),
            storage: StorageConfig::default(),
            connection: ConnectionConfig::default(),
            delivery_interval: Duration::from_millis(1000),
        }
    }
}

impl NodeConfig {
    /// Builds a config from named properties, falling back to defaults for
    /// anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first malformed property.
    pub fn from_properties(props: &impl PropertySource) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let node_id = match props.get_string("UUID") {
            Some(raw) => Uuid::try_parse(&raw).map_err(|_| ConfigError::Invalid {
                name: "UUID",
                value: raw,
                expected: "a UUID",
            })?,
            None => defaults.node_id,
        };

        let port = match props.get_int("ports.cluster")? {
            Some(p) => u16::try_from(p).map_err(|_| ConfigError::Invalid {
                name: "ports.cluster",
                value: p.to_string(),
                expected: "a port number",
            })?,
            None => defaults.cluster.port,
        };

        let cache_load_limit = match props.get_long("cache.loadLimit")? {
            Some(limit) => usize::try_from(limit).map_err(|_| ConfigError::Invalid {
                name: "cache.loadLimit",
                value: limit.to_string(),
                expected: "a non-negative byte count",
            })?,
            None => defaults.storage.cache_load_limit,
        };

        let seeds = props
            .get_string("cluster.seeds")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            node_id,
            cluster: ClusterConfig {
                host: props.get_string("host").unwrap_or(defaults.cluster.host),
                port,
                seeds,
                heartbeat_interval: millis(
                    props,
                    "heartBeatInterval",
                    defaults.cluster.heartbeat_interval,
                )?,
                heartbeat_timeout: millis(
                    props,
                    "timeouts.heart_beat",
                    defaults.cluster.heartbeat_timeout,
                )?,
                bid_timeout: millis(props, "timeouts.bid", defaults.cluster.bid_timeout)?,
                reconnect_interval: millis(
                    props,
                    "cluster.retry",
                    defaults.cluster.reconnect_interval,
                )?,
                orphan_scan_interval: millis(
                    props,
                    "orphanScan",
                    defaults.cluster.orphan_scan_interval,
                )?,
            },
            storage: StorageConfig {
                message_log: props
                    .get_string("messageLog")
                    .map_or(defaults.storage.message_log, PathBuf::from),
                owner_log: props
                    .get_string("ownerFile")
                    .map_or(defaults.storage.owner_log, PathBuf::from),
                cache_load_limit,
                compaction_interval: millis(
                    props,
                    "compaction.time",
                    defaults.storage.compaction_interval,
                )?,
            },
            connection: defaults.connection,
            delivery_interval: millis(props, "deliveryInterval", defaults.delivery_interval)?,
        })
    }
}

/// Peer protocol settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Bind address for the cluster listener.
    pub host: String,
    /// Cluster listener port. 0 means OS-assigned.
    pub port: u16,
    /// `host:port` addresses dialed at startup.
    pub seeds: Vec<String>,
    /// Idle time after which a connection is probed with `HEART BEAT START`.
    pub heartbeat_interval: Duration,
    /// How long a probe may go unanswered before the peer is declared dead.
    pub heartbeat_timeout: Duration,
    /// Read bound while one of our bids is outstanding.
    pub bid_timeout: Duration,
    /// Delay between attempts to dial an unreachable seed.
    pub reconnect_interval: Duration,
    /// Period of the scan for messages whose owner is unreachable.
    pub orphan_scan_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2020,
            seeds: Vec::new(),
            heartbeat_interval: Duration::from_millis(5000),
            heartbeat_timeout: Duration::from_millis(500),
            bid_timeout: Duration::from_millis(500),
            reconnect_interval: Duration::from_millis(10_000),
            orphan_scan_interval: Duration::from_millis(30_000),
        }
    }
}

/// Durable store locations and cache sizing.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub message_log: PathBuf,
    pub owner_log: PathBuf,
    /// Upper bound on the summed size of resident message contents.
    pub cache_load_limit: usize,
    pub compaction_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            message_log: PathBuf::from("messages.log"),
            owner_log: PathBuf::from("owners.log"),
            cache_load_limit: 104_856_700,
            compaction_interval: Duration::from_millis(10_000),
        }
    }
}

/// Per-connection configuration controlling backpressure and timeouts.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for outbound lines per connection.
    pub outbound_channel_capacity: usize,
    /// Maximum time to wait when queueing a line for a connection.
    pub send_timeout: Duration,
    /// Longest line accepted from a peer, in bytes.
    pub max_line_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
            max_line_length: 64 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_shipped_properties() {
        let config = NodeConfig::default();
        assert_eq!(config.cluster.port, 2020);
        assert_eq!(config.cluster.heartbeat_interval, Duration::from_millis(5000));
        assert_eq!(config.cluster.heartbeat_timeout, Duration::from_millis(500));
        assert_eq!(config.cluster.bid_timeout, Duration::from_millis(500));
        assert_eq!(config.storage.cache_load_limit, 104_856_700);
        assert_eq!(config.storage.message_log, PathBuf::from("messages.log"));
        assert_eq!(config.storage.owner_log, PathBuf::from("owners.log"));
        assert_eq!(config.storage.compaction_interval, Duration::from_secs(10));
    }

    #[test]
    fn properties_override_defaults() {
        let id = Uuid::new_v4();
        let id_text = id.to_string();
        let source = props(&[
            ("UUID", id_text.as_str()),
            ("ports.cluster", "4040"),
            ("heartBeatInterval", "250"),
            ("timeouts.heart_beat", "75"),
            ("cache.loadLimit", "1024"),
            ("messageLog", "/var/lib/courier/m.log"),
            ("cluster.seeds", "10.0.0.1:2020, 10.0.0.2:2020,"),
        ]);
        let config = NodeConfig::from_properties(&source).unwrap();
        assert_eq!(config.node_id, id);
        assert_eq!(config.cluster.port, 4040);
        assert_eq!(config.cluster.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.cluster.heartbeat_timeout, Duration::from_millis(75));
        assert_eq!(config.storage.cache_load_limit, 1024);
        assert_eq!(
            config.storage.message_log,
            PathBuf::from("/var/lib/courier/m.log")
        );
        assert_eq!(config.cluster.seeds, vec!["10.0.0.1:2020", "10.0.0.2:2020"]);
        // untouched values keep their defaults
        assert_eq!(config.storage.owner_log, PathBuf::from("owners.log"));
    }

    #[test]
    fn malformed_property_is_reported_by_name() {
        let err = NodeConfig::from_properties(&props(&[("ports.cluster", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "ports.cluster", .. }));

        let err = NodeConfig::from_properties(&props(&[("ports.cluster", "70000")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "ports.cluster", .. }));

        let err = NodeConfig::from_properties(&props(&[("heartBeatInterval", "-5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "heartBeatInterval", .. }));
    }

    #[test]
    fn zero_periods_are_rejected() {
        for name in [
            "heartBeatInterval",
            "deliveryInterval",
            "compaction.time",
            "orphanScan",
            "cluster.retry",
            "timeouts.bid",
        ] {
            let ConfigError::Invalid {
                name: reported,
                expected,
                ..
            } = NodeConfig::from_properties(&props(&[(name, "0")])).unwrap_err();
            assert_eq!(reported, name);
            assert_eq!(expected, "a positive duration");
        }
    }

    #[test]
    fn bool_accessor_is_case_insensitive() {
        let source = props(&[("a", "TRUE"), ("b", "false"), ("c", "yes")]);
        assert_eq!(source.get_bool("a").unwrap(), Some(true));
        assert_eq!(source.get_bool("b").unwrap(), Some(false));
        assert!(source.get_bool("c").is_err());
        assert_eq!(source.get_bool("missing").unwrap(), None);
    }
}
