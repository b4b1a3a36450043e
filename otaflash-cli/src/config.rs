//! Configuration file support for otaflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (OTAFLASH_*)
//! 3. File given with `--config`
//! 4. Local config file (./otaflash.toml)
//! 5. Global config file (~/.config/otaflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "otaflash.toml";

/// Firmware server settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Server host name.
    pub host: Option<String>,
    /// Server port.
    pub port: Option<u16>,
    /// SHA-256 fingerprint of the server certificate.
    pub fingerprint: Option<String>,
    /// Release directory on the server.
    pub base_path: Option<String>,
    /// Name of the latest-version file.
    pub version_file: Option<String>,
    /// Use plain HTTP instead of HTTPS.
    #[serde(default)]
    pub insecure_http: bool,
}

/// Artifact store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store directory.
    pub dir: Option<PathBuf>,
}

/// Bus bridge settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Serial port of the bridge (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
}

/// Update policy settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSection {
    /// Failed attempts allowed before giving up.
    pub max_retries: Option<u8>,
    /// Seconds between cycles in watch mode.
    pub watch_interval_secs: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Firmware server.
    #[serde(default)]
    pub source: SourceConfig,
    /// Artifact store.
    #[serde(default)]
    pub store: StoreConfig,
    /// Bus bridge.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Update policy.
    #[serde(default)]
    pub update: UpdateSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load(explicit: Option<&Path>) -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        if let Some(path) = explicit {
            config.merge(Self::load_from_path(path));
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse TOML config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "otaflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Default artifact store directory.
    pub fn default_store_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "otaflash").map(|dirs| dirs.data_dir().join("store"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Source
        if other.source.host.is_some() {
            self.source.host = other.source.host;
        }
        if other.source.port.is_some() {
            self.source.port = other.source.port;
        }
        if other.source.fingerprint.is_some() {
            self.source.fingerprint = other.source.fingerprint;
        }
        if other.source.base_path.is_some() {
            self.source.base_path = other.source.base_path;
        }
        if other.source.version_file.is_some() {
            self.source.version_file = other.source.version_file;
        }
        if other.source.insecure_http {
            self.source.insecure_http = true;
        }

        if other.store.dir.is_some() {
            self.store.dir = other.store.dir;
        }

        // Device
        if other.device.serial.is_some() {
            self.device.serial = other.device.serial;
        }
        if other.device.baud.is_some() {
            self.device.baud = other.device.baud;
        }

        // Update policy
        if other.update.max_retries.is_some() {
            self.update.max_retries = other.update.max_retries;
        }
        if other.update.watch_interval_secs.is_some() {
            self.update.watch_interval_secs = other.update.watch_interval_secs;
        }
    }
}
