use crate::error::{LinkError, Result};
use crate::protocol::ClientId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_PORT: u16 = 5555;
pub const DEFAULT_RECORD_SIZE: usize = 1024;

/// Settings shared by the responder, the relay and the bundled binary.
///
/// Durations are given in milliseconds when loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub bind_host: String,
    pub base_port: u16,
    pub relay_id: ClientId,
    #[serde(with = "millis")]
    pub client_timeout: Duration,
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
    #[serde(with = "opt_millis")]
    pub sync_interval: Option<Duration>,
    pub record_size: usize,
    pub record_dir: PathBuf,
    pub publish_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            base_port: DEFAULT_BASE_PORT,
            relay_id: 255,
            client_timeout: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(1),
            sync_interval: None,
            record_size: DEFAULT_RECORD_SIZE,
            record_dir: PathBuf::from("."),
            publish_capacity: 4096,
        }
    }
}

impl LinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn with_relay_id(mut self, relay_id: ClientId) -> Self {
        self.relay_id = relay_id;
        self
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_record_size(mut self, size: usize) -> Self {
        self.record_size = size;
        self
    }

    pub fn with_record_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.record_dir = dir.into();
        self
    }

    pub fn with_publish_capacity(mut self, capacity: usize) -> Self {
        self.publish_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.record_size == 0 {
            return Err(LinkError::Config("record_size must be at least 1".to_string()));
        }
        if self.publish_capacity == 0 {
            return Err(LinkError::Config("publish_capacity must be at least 1".to_string()));
        }
        if self.sweep_interval.is_zero() {
            return Err(LinkError::Config("sweep_interval must be non-zero".to_string()));
        }
        if matches!(self.sync_interval, Some(interval) if interval.is_zero()) {
            return Err(LinkError::Config("sync_interval must be non-zero".to_string()));
        }
        if self.base_port > u16::MAX - 2 {
            return Err(LinkError::Config(format!(
                "base_port {} leaves no room for the relay ports",
                self.base_port
            )));
        }
        Ok(())
    }

    fn addr(&self, offset: u16) -> Result<SocketAddr> {
        let port = self.base_port.checked_add(offset).ok_or_else(|| {
            LinkError::Config(format!("base_port {} + {} overflows", self.base_port, offset))
        })?;
        format!("{}:{}", self.bind_host, port)
            .parse()
            .map_err(|e| LinkError::Config(format!("Invalid bind address '{}': {}", self.bind_host, e)))
    }

    /// Scene request/reply endpoint, `BASE`.
    pub fn responder_addr(&self) -> Result<SocketAddr> {
        self.addr(0)
    }

    /// Relay ingest endpoint where clients push, `BASE + 1`.
    pub fn ingest_addr(&self) -> Result<SocketAddr> {
        self.addr(1)
    }

    /// Relay publish endpoint where clients subscribe, `BASE + 2`.
    pub fn publish_addr(&self) -> Result<SocketAddr> {
        self.addr(2)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
