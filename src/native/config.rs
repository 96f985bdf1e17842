//! Connection configuration.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use super::compression::CompressionMethod;

/// Default native protocol port.
pub const DEFAULT_PORT: u16 = 9000;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default send and receive timeout.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of rows per Data packet on bulk insert.
pub const DEFAULT_INSERT_BLOCK_SIZE: usize = 1_048_576;

/// Connection configuration.
///
/// Deserializes from any serde format; every field is optional and
/// timeouts are given in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 9000)
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Name reported to the server in Hello and client info
    pub client_name: String,
    /// Codec for data blocks; fixed for the connection's lifetime
    pub compression: CompressionMethod,
    #[serde(deserialize_with = "seconds")]
    pub connect_timeout: Duration,
    /// Limit for each write; `None` waits forever
    #[serde(deserialize_with = "optional_seconds")]
    pub send_timeout: Option<Duration>,
    /// Limit for each read; `None` waits forever
    #[serde(deserialize_with = "optional_seconds")]
    pub receive_timeout: Option<Duration>,
    /// Settings sent with every query
    pub settings: Vec<(String, String)>,
    pub insert_block_size: usize,
    pub quota_key: String,
}

impl ClientConfig {
    /// Configuration for `host` with every other field at its default.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            database: "default".to_string(),
            user: "default".to_string(),
            password: String::new(),
            client_name: "chnative".to_string(),
            compression: CompressionMethod::None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: Some(DEFAULT_IO_TIMEOUT),
            receive_timeout: Some(DEFAULT_IO_TIMEOUT),
            settings: Vec::new(),
            insert_block_size: DEFAULT_INSERT_BLOCK_SIZE,
            quota_key: String::new(),
        }
    }

    pub fn localhost() -> Self {
        Self::new("127.0.0.1")
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set user and password.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_compression(mut self, compression: CompressionMethod) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Add a setting sent with every query.
    pub fn with_setting(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.push((name.into(), value.into()));
        self
    }

    pub fn with_insert_block_size(mut self, rows: usize) -> Self {
        self.insert_block_size = rows.max(1);
        self
    }

    pub fn with_quota_key(mut self, quota_key: impl Into<String>) -> Self {
        self.quota_key = quota_key.into();
        self
    }

    /// `host:port` for socket connection.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::localhost()
    }
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn optional_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    match Option::<f64>::deserialize(deserializer)? {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
