//! Configuration for producer and consumer endpoints

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use crate::codec::TRAILER_SIZE;

/// Largest payload a single UDP datagram can carry.
const MAX_DATAGRAM: usize = 65507;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Endpoint configuration, shared by producer and consumer.
///
/// For the producer `host` is the bind address; for the consumer it is the
/// producer's address to connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Producer address.
    #[serde(default = "default_host")]
    pub host: String,

    /// UDP port of the data channel.
    #[serde(default = "default_data_port")]
    pub data_port: u16,

    /// TCP port of the control channel.
    #[serde(default = "default_status_port")]
    pub status_port: u16,

    /// Frame width in pixels.
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height in pixels.
    #[serde(default = "default_height")]
    pub height: u32,

    /// Capture rate in frames per second.
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Largest datagram emitted on the data channel.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Consumer-side frame buffer capacity.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            data_port: default_data_port(),
            status_port: default_status_port(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            max_packet_size: default_max_packet_size(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_data_port() -> u16 {
    8000
}
fn default_status_port() -> u16 {
    8080
}
fn default_width() -> u32 {
    800
}
fn default_height() -> u32 {
    600
}
fn default_fps() -> u32 {
    30
}
fn default_max_packet_size() -> usize {
    1024
}
fn default_buffer_capacity() -> usize {
    60
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads the file if present, falling back to defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            warn!(path = %path.as_ref().display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Parses configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Control-channel socket address.
    pub fn control_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.host_ip()?, self.status_port))
    }

    /// Data-channel socket address.
    pub fn data_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.host_ip()?, self.data_port))
    }

    fn host_ip(&self) -> Result<IpAddr, ConfigError> {
        self.host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("host {:?} is not an IP address", self.host)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.host_ip()?;

        // the rendezvous greeting carries each dimension as 4 digits
        if !(1..=9999).contains(&self.width) || !(1..=9999).contains(&self.height) {
            return Err(ConfigError::Invalid(format!(
                "geometry {}x{} must be within 1..=9999 per axis",
                self.width, self.height
            )));
        }

        if self.fps == 0 || self.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "fps must be between 1 and 120, got {}",
                self.fps
            )));
        }

        if self.max_packet_size <= TRAILER_SIZE || self.max_packet_size > MAX_DATAGRAM {
            return Err(ConfigError::Invalid(format!(
                "max_packet_size must be between {} and {MAX_DATAGRAM}, got {}",
                TRAILER_SIZE + 1,
                self.max_packet_size
            )));
        }

        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "buffer_capacity must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Saves configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data_port, 8000);
        assert_eq!(config.status_port, 8080);
        assert_eq!(config.max_packet_size, 1024);
        assert_eq!(config.buffer_capacity, 60);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
host = "192.168.1.25"
data_port = 8004
status_port = 8005
width = 1280
height = 720
fps = 25
max_packet_size = 1400
buffer_capacity = 30
        "#;

        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.host, "192.168.1.25");
        assert_eq!(config.data_port, 8004);
        assert_eq!(config.status_port, 8005);
        assert_eq!(config.width, 1280);
        assert_eq!(config.height, 720);
        assert_eq!(config.fps, 25);
        assert_eq!(config.max_packet_size, 1400);
        assert_eq!(config.buffer_capacity, 30);

        assert_eq!(
            config.data_addr().unwrap(),
            "192.168.1.25:8004".parse().unwrap()
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_str("width = 640\nheight = 480\n").unwrap();
        assert_eq!(config.width, 640);
        assert_eq!(config.fps, 30);
    }

    #[test]
    fn test_invalid_packet_size() {
        assert!(Config::from_str("max_packet_size = 9").is_err());
        assert!(Config::from_str("max_packet_size = 70000").is_err());
    }

    #[test]
    fn test_invalid_geometry() {
        assert!(Config::from_str("width = 0").is_err());
        assert!(Config::from_str("height = 10000").is_err());
    }

    #[test]
    fn test_invalid_host() {
        assert!(Config::from_str("host = \"not-an-ip\"").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let config = Config::load_or_default(&path).unwrap();
        assert_eq!(config.width, 800);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.fps = 15;
        config.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.fps, 15);
    }
}
