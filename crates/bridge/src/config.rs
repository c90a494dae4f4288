//! Bridge configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the usbforward byte stream comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Character device such as a virtio-serial port
    #[default]
    Device,
    /// Unix stream socket
    Unix,
    /// Descriptor inherited from the parent process
    Fd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub bridge: BridgeSettings,
    pub transport: TransportSettings,
    pub usbip: UsbIpSettings,
    pub vhci: VhciSettings,
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default)]
    pub kind: TransportKind,
    /// Device node or socket path (`device` and `unix` kinds)
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Inherited descriptor number (`fd` kind)
    #[serde(default)]
    pub fd: Option<i32>,
    /// Delay between reconnect attempts after the stub goes away
    pub reconnect_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbIpSettings {
    pub listen_addr: SocketAddr,
    /// Largest `transfer_buffer_length` accepted before the client is dropped
    pub max_transfer_length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VhciSettings {
    /// Directory holding the `vhci_hcd*` platform devices
    pub sysfs_root: PathBuf,
    /// Port to try first when it is free
    #[serde(default)]
    pub preferred_port: Option<u32>,
    pub retry_interval_ms: u64,
    /// `(bus, dev)` written to `attach` as `bus << 16 | dev`
    pub device_id: (u16, u16),
    /// Kernel `usb_device_speed` written to `attach`
    pub speed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// 0 disables the heartbeat
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeSettings {
                log_level: "info".to_string(),
            },
            transport: TransportSettings {
                kind: TransportKind::Device,
                path: None,
                fd: None,
                reconnect_interval_ms: 1000,
            },
            usbip: UsbIpSettings {
                listen_addr: SocketAddr::from((
                    std::net::Ipv6Addr::LOCALHOST,
                    protocol::usbip::USBIP_PORT,
                )),
                max_transfer_length: 16 * 1024 * 1024,
            },
            vhci: VhciSettings {
                sysfs_root: PathBuf::from("/sys/devices/platform"),
                preferred_port: None,
                retry_interval_ms: 1000,
                device_id: (1, 1),
                speed: 3,
            },
            proxy: ProxySettings {
                heartbeat_interval_secs: 5,
                heartbeat_timeout_secs: 15,
            },
        }
    }
}

impl TransportSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl VhciSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn devid(&self) -> u32 {
        (u32::from(self.device_id.0) << 16) | u32::from(self.device_id.1)
    }
}

impl ProxySettings {
    /// `None` when disabled
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/vusb-bridge/bridge.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.expand_paths();
        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "Config: transport={:?}, listen={}, sysfs_root={}",
            config.transport.kind,
            config.usbip.listen_addr,
            config.vhci.sysfs_root.display()
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Print to stderr since logging might not be initialized yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("vusb-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/vusb-bridge/bridge.toml")
        }
    }

    fn expand_paths(&mut self) {
        let expand = |p: &Path| PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref());
        if let Some(path) = &self.transport.path {
            self.transport.path = Some(expand(path));
        }
        self.vhci.sysfs_root = expand(&self.vhci.sysfs_root);
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !common::logging::is_valid_level(&self.bridge.log_level) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.bridge.log_level,
                common::logging::LOG_LEVELS.join(", ")
            ));
        }

        match self.transport.kind {
            TransportKind::Fd if self.transport.fd.is_none() => {
                return Err(anyhow!("Transport kind 'fd' requires transport.fd"));
            }
            TransportKind::Device | TransportKind::Unix if self.transport.path.is_none() => {
                return Err(anyhow!(
                    "Transport kind '{:?}' requires transport.path",
                    self.transport.kind
                ));
            }
            _ => {}
        }

        if self.usbip.max_transfer_length == 0 {
            return Err(anyhow!("usbip.max_transfer_length must be non-zero"));
        }

        if !(1..=i32::MAX as u64).contains(&self.vhci.retry_interval_ms) {
            return Err(anyhow!(
                "Invalid vhci.retry_interval_ms {}, must be between 1 and {}",
                self.vhci.retry_interval_ms,
                i32::MAX
            ));
        }

        if !(1..=6).contains(&self.vhci.speed) {
            return Err(anyhow!(
                "Invalid VHCI speed {}, must be between 1 and 6",
                self.vhci.speed
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.transport.path = Some(PathBuf::from("/dev/vport0p1"));
        config
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.bridge.log_level, "info");
        assert_eq!(config.usbip.listen_addr.to_string(), "[::1]:3240");
        assert_eq!(config.usbip.max_transfer_length, 16 * 1024 * 1024);
        assert_eq!(config.vhci.sysfs_root, PathBuf::from("/sys/devices/platform"));
        assert_eq!(config.vhci.devid(), 0x0001_0001);
        assert_eq!(config.vhci.speed, 3);
        assert_eq!(config.proxy.heartbeat_interval(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_config_serialization() {
        let config = valid_config();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: BridgeConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.bridge.log_level, parsed.bridge.log_level);
        assert_eq!(config.transport.path, parsed.transport.path);
        assert_eq!(config.usbip.listen_addr, parsed.usbip.listen_addr);
        assert_eq!(config.vhci.device_id, parsed.vhci.device_id);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());

        config.bridge.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.bridge.log_level = "trace".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_transport_source() {
        let mut config = BridgeConfig::default();
        assert!(config.validate().is_err());

        config.transport.kind = TransportKind::Fd;
        assert!(config.validate().is_err());
        config.transport.fd = Some(3);
        assert!(config.validate().is_ok());

        config.transport.kind = TransportKind::Unix;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_limits() {
        let mut config = valid_config();
        config.usbip.max_transfer_length = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.vhci.speed = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_retry_interval() {
        let mut config = valid_config();
        config.vhci.retry_interval_ms = 0;
        assert!(config.validate().is_err());

        config.vhci.retry_interval_ms = 70_000;
        assert!(config.validate().is_ok());

        config.vhci.retry_interval_ms = i32::MAX as u64 + 1;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("retry_interval_ms"));
    }

    #[test]
    fn test_heartbeat_disabled() {
        let mut config = valid_config();
        config.proxy.heartbeat_interval_secs = 0;
        assert_eq!(config.proxy.heartbeat_interval(), None);
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bridge.toml");

        let mut config = valid_config();
        config.vhci.preferred_port = Some(2);
        config.save(&path).unwrap();

        let loaded = BridgeConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.vhci.preferred_port, Some(2));
        assert_eq!(loaded.transport.kind, TransportKind::Device);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        fs::write(&path, "[bridge]\nlog_level = 'info'\n").unwrap();

        assert!(BridgeConfig::load(Some(path)).is_err());
    }
}
