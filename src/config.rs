// ABOUTME: Relay configuration loaded once at startup (JSON, or TOML by extension)
// ABOUTME: Accepts legacy key names and validates before anything connects

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::broker::kafka::{Acks, Compression, KafkaSettings};
use crate::error::RelayError;
use crate::normalize::{BinaryEncoding, PayloadEncoder, PayloadFormat};
use crate::source::mysql::MysqlSourceConfig;

/// Schema name → tables eligible for relay. Everything else is dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Whitelist(HashMap<String, HashSet<String>>);

impl Whitelist {
    pub fn allows(&self, schema: &str, table: &str) -> bool {
        self.0
            .get(schema)
            .map(|tables| tables.contains(table))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(HashSet::is_empty)
    }

    /// Whitelisted schema names, sorted.
    pub fn schemas(&self) -> Vec<&str> {
        let mut schemas: Vec<&str> = self.0.keys().map(String::as_str).collect();
        schemas.sort_unstable();
        schemas
    }

    /// Number of whitelisted schema/table pairs.
    pub fn table_count(&self) -> usize {
        self.0.values().map(HashSet::len).sum()
    }
}

impl<S, T, I> FromIterator<(S, I)> for Whitelist
where
    S: Into<String>,
    T: Into<String>,
    I: IntoIterator<Item = T>,
{
    fn from_iter<It: IntoIterator<Item = (S, I)>>(iter: It) -> Self {
        let mut map: HashMap<String, HashSet<String>> = HashMap::new();
        for (schema, tables) in iter {
            map.entry(schema.into())
                .or_default()
                .extend(tables.into_iter().map(Into::into));
        }
        Whitelist(map)
    }
}

/// Source database connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConnection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, alias = "passwd")]
    pub password: Option<String>,
}

/// Producer tuning passed through to the Kafka client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerTuning {
    pub acks: Acks,
    pub compression: Compression,
    pub linger_ms: u64,
    /// How long `send` waits for room when the local queue is full.
    pub queue_full_timeout_secs: u64,
    /// Raw librdkafka properties, applied last.
    pub properties: HashMap<String, String>,
}

impl Default for BrokerTuning {
    fn default() -> Self {
        Self {
            acks: Acks::All,
            compression: Compression::None,
            linger_ms: 5,
            queue_full_timeout_secs: 60,
            properties: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn broker_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
        OneOrMany::Many(list) => list,
    })
}

/// Everything the relay needs to start.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(alias = "kafka_brokers", deserialize_with = "broker_list")]
    pub broker_addresses: Vec<String>,
    #[serde(alias = "mysql_config")]
    pub source_connection: SourceConnection,
    #[serde(alias = "whitelist_db_stream")]
    pub whitelist: Whitelist,
    /// Replica server id announced to the source; must be unique per replica.
    #[serde(default = "default_server_id")]
    pub server_id: u32,
    /// Bounded wait for the broker drain at shutdown.
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
    /// Periodic checkpointing; disabled when absent.
    #[serde(default)]
    pub checkpoint_interval_secs: Option<u64>,
    #[serde(default)]
    pub payload_format: PayloadFormat,
    #[serde(default)]
    pub binary_encoding: BinaryEncoding,
    #[serde(default)]
    pub broker: BrokerTuning,
}

fn default_port() -> u16 {
    3306
}

fn default_server_id() -> u32 {
    100
}

fn default_flush_timeout_secs() -> u64 {
    30
}

impl RelayConfig {
    /// Default configuration location, relative to the working directory.
    pub fn default_path() -> PathBuf {
        PathBuf::from("configuration.json")
    }

    /// Load and validate the configuration file.
    ///
    /// Files ending in `.toml` are parsed as TOML, anything else as JSON.
    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(RelayError::ConfigMissing {
                    path: path.to_path_buf(),
                })
            }
            Err(err) => return Err(malformed(path, format!("unreadable: {}", err))),
        };
        let config = Self::parse(path, &contents)?;
        config.validate(path)?;
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, RelayError> {
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        if is_toml {
            toml::from_str(contents).map_err(|err| malformed(path, err))
        } else {
            serde_json::from_str(contents).map_err(|err| malformed(path, err))
        }
    }

    fn validate(&self, path: &Path) -> Result<(), RelayError> {
        if self.broker_addresses.is_empty() {
            return Err(malformed(path, "broker_addresses must not be empty"));
        }
        if self.broker_addresses.iter().any(|a| a.trim().is_empty()) {
            return Err(malformed(path, "broker_addresses contains an empty entry"));
        }
        if self.source_connection.host.trim().is_empty() {
            return Err(malformed(path, "source_connection.host must not be empty"));
        }
        if self.source_connection.user.trim().is_empty() {
            return Err(malformed(path, "source_connection.user must not be empty"));
        }
        if self.flush_timeout_secs == 0 {
            return Err(malformed(path, "flush_timeout_secs must be greater than 0"));
        }
        if self.checkpoint_interval_secs == Some(0) {
            return Err(malformed(
                path,
                "checkpoint_interval_secs must be greater than 0 when set",
            ));
        }
        if self.whitelist.is_empty() {
            tracing::warn!("Whitelist is empty: every event will be filtered out");
        }
        Ok(())
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        self.checkpoint_interval_secs.map(Duration::from_secs)
    }

    pub fn encoder(&self) -> PayloadEncoder {
        PayloadEncoder::new(self.payload_format, self.binary_encoding)
    }

    pub fn kafka_settings(&self) -> KafkaSettings {
        KafkaSettings {
            bootstrap_servers: self.broker_addresses.clone(),
            acks: self.broker.acks,
            compression: self.broker.compression,
            linger_ms: self.broker.linger_ms,
            queue_full_timeout: Duration::from_secs(self.broker.queue_full_timeout_secs),
            properties: self.broker.properties.clone(),
        }
    }

    pub fn source_settings(&self) -> MysqlSourceConfig {
        MysqlSourceConfig {
            host: self.source_connection.host.clone(),
            port: self.source_connection.port,
            user: self.source_connection.user.clone(),
            password: self.source_connection.password.clone(),
            server_id: self.server_id,
        }
    }
}

fn malformed(path: &Path, reason: impl std::fmt::Display) -> RelayError {
    RelayError::ConfigMalformed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
