//! Configuration types loaded from a TOML file.
//!
//! The daemon and the sync tool share this file; both only use the pieces
//! they need.

use crate::error::ConfigError;
use bytesize::ByteSize;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::CHUNK_SIZE;

/// Root configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address for the NBD server
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Worker threads processing I/O requests
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
    /// Backend connection settings
    pub s3: S3Config,
    /// Exported devices
    #[serde(rename = "device", default)]
    pub devices: Vec<Device>,
}

fn default_listen() -> String {
    "0.0.0.0:10809".to_string()
}

fn default_io_threads() -> usize {
    16
}

/// Backend (S3-compatible) settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3Config {
    /// Backend hostnames, tried round-robin
    pub hosts: Vec<String>,
    /// Backend ports, combined with every host
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    /// Wrap connections in TLS
    #[serde(default)]
    pub tls: bool,
    /// Host header value; defaults to the connected host
    #[serde(default)]
    pub host_header: Option<String>,
    /// Bucket holding all device folders
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    /// Socket read/write timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Requests served per connection before it is recycled
    #[serde(default = "default_max_requests")]
    pub max_requests_per_connection: u16,
    /// Concurrent backend connections (pool size)
    #[serde(default = "default_fetchers")]
    pub fetchers: usize,
}

fn default_ports() -> Vec<u16> {
    vec![443]
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_requests() -> u16 {
    100
}

fn default_fetchers() -> usize {
    4
}

impl S3Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One exported block device.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Device {
    /// Export name, also the object folder in the bucket
    pub name: String,
    /// Directory holding the chunk cache for this device
    pub cache_dir: PathBuf,
    /// Device size; rounded semantics are not applied, must be a chunk multiple
    pub size: ByteSize,
}

impl Device {
    pub fn size_bytes(&self) -> u64 {
        self.size.as_u64()
    }
}

/// Lookup table from export name to device.
///
/// The table is published as a swappable snapshot: a reload builds a new
/// device list and replaces the whole thing at once, so readers never see
/// a half-updated catalog.
#[derive(Debug)]
pub struct DeviceTable {
    devices: parking_lot::RwLock<Arc<Vec<Device>>>,
}

impl DeviceTable {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: parking_lot::RwLock::new(Arc::new(devices)),
        }
    }

    pub fn get(&self, name: &str) -> Option<Device> {
        self.snapshot().iter().find(|d| d.name == name).cloned()
    }

    /// Current catalog; stays consistent across a concurrent [`replace`].
    ///
    /// [`replace`]: DeviceTable::replace
    pub fn snapshot(&self) -> Arc<Vec<Device>> {
        Arc::clone(&self.devices.read())
    }

    /// Atomically publish a new catalog.
    pub fn replace(&self, devices: Vec<Device>) {
        *self.devices.write() = Arc::new(devices);
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.s3.hosts.is_empty() {
            return Err(ConfigError::Invalid("s3.hosts must not be empty".into()));
        }
        if self.s3.ports.is_empty() {
            return Err(ConfigError::Invalid("s3.ports must not be empty".into()));
        }
        if self.s3.fetchers == 0 {
            return Err(ConfigError::Invalid("s3.fetchers must be at least 1".into()));
        }
        if self.io_threads == 0 {
            return Err(ConfigError::Invalid("io_threads must be at least 1".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for dev in &self.devices {
            if dev.name.is_empty() || dev.name.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "invalid device name {:?}",
                    dev.name
                )));
            }
            if !seen.insert(dev.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device name {:?}",
                    dev.name
                )));
            }
            let size = dev.size_bytes();
            if size == 0 || size % CHUNK_SIZE != 0 {
                return Err(ConfigError::Invalid(format!(
                    "device {:?} size {} is not a positive multiple of {} bytes",
                    dev.name, size, CHUNK_SIZE
                )));
            }
        }
        Ok(())
    }

    pub fn device_table(&self) -> DeviceTable {
        DeviceTable::new(self.devices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        listen = "127.0.0.1:10809"
        io_threads = 8

        [s3]
        hosts = ["s3.example.com"]
        ports = [443]
        tls = true
        bucket = "blockdev"
        access_key = "AKID"
        secret_key = "secret"
        fetchers = 2

        [[device]]
        name = "disk0"
        cache_dir = "/var/cache/s3nbd/disk0"
        size = "1 GiB"
    "#;

    #[test]
    fn parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen, "127.0.0.1:10809");
        assert_eq!(config.io_threads, 8);
        assert_eq!(config.s3.max_requests_per_connection, 100);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].size_bytes(), 1 << 30);
    }

    #[test]
    fn rejects_non_chunk_multiple_size() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.devices[0].size = ByteSize::b(CHUNK_SIZE + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_device() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.devices.push(config.devices[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_device_name_with_slash() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.devices[0].name = "a/b".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn device_table_lookup() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let table = config.device_table();
        assert!(table.get("disk0").is_some());
        assert!(table.get("nope").is_none());
    }

    #[test]
    fn device_table_replace_swaps_whole_catalog() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let table = config.device_table();
        let old = table.snapshot();

        let mut disk1 = config.devices[0].clone();
        disk1.name = "disk1".into();
        table.replace(vec![disk1]);

        assert!(table.get("disk0").is_none());
        assert!(table.get("disk1").is_some());
        // an already-taken snapshot is unaffected
        assert_eq!(old[0].name, "disk0");
    }
}
