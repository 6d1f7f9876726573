//! Session configuration
//!
//! Stored as JSON, by default at `$MOOSHI_HOME/config.json`. Every field is
//! optional in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::transport::DeviceId;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds to scan before giving up
    pub scan_timeout: u64,
    /// Seconds between keep-alive reads once the session is ready
    pub heartbeat_interval: u64,
    /// Node read by the heartbeat
    pub heartbeat_node: String,
    /// Largest single write to the serial-in characteristic
    pub fragment_size: usize,
    /// Connect attempts before the session fails
    pub connect_attempts: u32,
    /// Seconds to wait for the tree description before asking again
    pub discovery_timeout: u64,
    /// Tree requests sent before settling for the tree already held
    pub discovery_attempts: u32,
    /// Rescan automatically after the meter drops the link
    pub reconnect: bool,
    /// Only connect to a device whose name or address contains this
    pub device: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout: 10,
            heartbeat_interval: 10,
            heartbeat_node: "PCB_VERSION".to_string(),
            fragment_size: mooshi_proto::ble::DEFAULT_FRAGMENT_SIZE,
            connect_attempts: 3,
            discovery_timeout: 5,
            discovery_attempts: 3,
            reconnect: false,
            device: None,
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))?;
        let config: SessionConfig = serde_json::from_str(&content)
            .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`SessionConfig::load`], but a missing file yields the defaults
    pub fn load_or_default(path: &Path) -> Result<Self, SessionError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SessionError::Config(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.fragment_size == 0 {
            return Err(SessionError::Config("fragment_size must be at least 1".into()));
        }
        if self.heartbeat_interval == 0 {
            return Err(SessionError::Config("heartbeat_interval must be at least 1".into()));
        }
        if self.connect_attempts == 0 {
            return Err(SessionError::Config("connect_attempts must be at least 1".into()));
        }
        if self.discovery_timeout == 0 || self.discovery_attempts == 0 {
            return Err(SessionError::Config(
                "discovery_timeout and discovery_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }

    /// Whether a scan result is the meter we are looking for
    pub fn matches(&self, device: &DeviceId, name: Option<&str>) -> bool {
        match &self.device {
            None => true,
            Some(pattern) => {
                let pattern = pattern.to_lowercase();
                device.0.to_lowercase().contains(&pattern)
                    || name.is_some_and(|n| n.to_lowercase().contains(&pattern))
            }
        }
    }
}

/// MOOSHI_HOME, or `~/.mooshi` when unset
pub fn mooshi_home() -> PathBuf {
    std::env::var("MOOSHI_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".mooshi")
        })
}

pub fn default_config_path() -> PathBuf {
    mooshi_home().join(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"scan_timeout": 30, "reconnect": true}"#).unwrap();
        assert_eq!(config.scan_timeout, 30);
        assert!(config.reconnect);
        assert_eq!(config.heartbeat_interval, 10);
        assert_eq!(config.fragment_size, 20);
        assert_eq!(config.heartbeat_node, "PCB_VERSION");
        assert_eq!(config.discovery_attempts, 3);
    }

    #[test]
    fn device_filter() {
        let addr = DeviceId("C4:BE:84:12:34:56".into());
        let any = SessionConfig::default();
        assert!(any.matches(&addr, None));

        let by_addr = SessionConfig {
            device: Some("12:34".into()),
            ..Default::default()
        };
        assert!(by_addr.matches(&addr, None));

        let by_name = SessionConfig {
            device: Some("mooshi".into()),
            ..Default::default()
        };
        assert!(by_name.matches(&addr, Some("Mooshimeter V.1")));
        assert!(!by_name.matches(&addr, Some("Thermometer")));
        assert!(!by_name.matches(&addr, None));
    }

    #[test]
    fn load_and_validate() {
        let dir = std::env::temp_dir().join(format!("mooshi-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);

        assert_eq!(SessionConfig::load_or_default(&path).unwrap(), SessionConfig::default());

        let config = SessionConfig {
            device: Some("meter".into()),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap(), config);

        std::fs::write(&path, r#"{"fragment_size": 0}"#).unwrap();
        assert!(matches!(SessionConfig::load(&path), Err(SessionError::Config(_))));
        std::fs::write(&path, r#"{"discovery_attempts": 0}"#).unwrap();
        assert!(matches!(SessionConfig::load(&path), Err(SessionError::Config(_))));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
