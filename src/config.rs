//! Server configuration.

use serde::Deserialize;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

/// Settings loaded from a TOML file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server name; prefixes connection names and loop-thread names.
    #[serde(default = "default_name")]
    pub name: String,

    /// IPv4 listen endpoint.
    #[serde(default = "default_address")]
    pub address: SocketAddrV4,

    /// Subordinate I/O loops. Zero keeps everything on the main loop.
    #[serde(default)]
    pub io_threads: usize,

    /// Enable SO_REUSEPORT on the listening socket.
    #[serde(default)]
    pub reuse_port: bool,

    /// Output-buffer length that triggers the back-pressure callback.
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,

    /// Log level used when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_name() -> String {
    "loomio".to_string()
}

fn default_address() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 9999)
}

fn default_high_water_mark() -> usize {
    64 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            address: default_address(),
            io_threads: 0,
            reuse_port: false,
            high_water_mark: default_high_water_mark(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.name, "loomio");
        assert_eq!(config.address, "0.0.0.0:9999".parse().unwrap());
        assert_eq!(config.io_threads, 0);
        assert!(!config.reuse_port);
        assert_eq!(config.high_water_mark, 64 * 1024 * 1024);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            name = "echo"
            address = "127.0.0.1:4000"
            io_threads = 4
            reuse_port = true
            high_water_mark = 1024
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "echo");
        assert_eq!(config.address.port(), 4000);
        assert_eq!(config.io_threads, 4);
        assert!(config.reuse_port);
        assert_eq!(config.high_water_mark, 1024);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<Config>("unknown = 1").is_err());
    }
}
