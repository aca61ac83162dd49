//! Configuration file support for fota.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (FOTA_*)
//! 3. Local config file (./fota.toml)
//! 4. Global config file (~/.config/fota/config.toml)
//!
//! An explicit `--config PATH` replaces sources 3 and 4.

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "fota.toml";

/// HTTP server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    pub bind: Option<String>,
    /// Seconds without body data before an upload is aborted.
    pub idle_timeout_secs: Option<u64>,
}

/// Flash simulation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Directory holding the slot files.
    pub dir: Option<PathBuf>,
    /// Number of OTA slots.
    pub slots: Option<u8>,
    /// Size of each slot in bytes.
    pub slot_size: Option<u32>,
}

/// Upload behavior configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Bytes per network read and flash write.
    pub chunk_size: Option<usize>,
    /// Reject images built for another project.
    #[serde(default)]
    pub check_project_name: bool,
    /// Do not restart after a successful update.
    #[serde(default)]
    pub skip_reboot: bool,
    /// Delay between the response and the restart.
    pub restart_delay_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Update configuration.
    #[serde(default)]
    pub update: UpdateConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
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

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
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
        ProjectDirs::from("", "", "fota").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.server.bind.is_some() {
            self.server.bind = other.server.bind;
        }
        if other.server.idle_timeout_secs.is_some() {
            self.server.idle_timeout_secs = other.server.idle_timeout_secs;
        }

        if other.flash.dir.is_some() {
            self.flash.dir = other.flash.dir;
        }
        if other.flash.slots.is_some() {
            self.flash.slots = other.flash.slots;
        }
        if other.flash.slot_size.is_some() {
            self.flash.slot_size = other.flash.slot_size;
        }

        if other.update.chunk_size.is_some() {
            self.update.chunk_size = other.update.chunk_size;
        }
        if other.update.check_project_name {
            self.update.check_project_name = true;
        }
        if other.update.skip_reboot {
            self.update.skip_reboot = true;
        }
        if other.update.restart_delay_ms.is_some() {
            self.update.restart_delay_ms = other.update.restart_delay_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.server.bind.is_none());
        assert!(config.flash.dir.is_none());
        assert!(config.flash.slots.is_none());
        assert!(config.update.chunk_size.is_none());
        assert!(!config.update.check_project_name);
        assert!(!config.update.skip_reboot);
    }

    #[test]
    fn test_config_merge_overrides() {
        let mut base = Config::default();
        base.server.bind = Some("127.0.0.1:8080".to_string());
        base.flash.slots = Some(2);

        let mut other = Config::default();
        other.server.bind = Some("0.0.0.0:80".to_string());
        other.update.chunk_size = Some(1024);
        other.update.skip_reboot = true;

        base.merge(other);
        assert_eq!(base.server.bind.as_deref(), Some("0.0.0.0:80"));
        assert_eq!(base.flash.slots, Some(2));
        assert_eq!(base.update.chunk_size, Some(1024));
        assert!(base.update.skip_reboot);
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.flash.dir = Some(PathBuf::from("slots"));
        base.update.restart_delay_ms = Some(250);

        base.merge(Config::default());
        assert_eq!(base.flash.dir.as_deref(), Some(Path::new("slots")));
        assert_eq!(base.update.restart_delay_ms, Some(250));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[server]
bind = "0.0.0.0:8070"
idle_timeout_secs = 5

[flash]
dir = "/tmp/fota"
slots = 3
slot_size = 1048576

[update]
chunk_size = 2048
check_project_name = true
restart_delay_ms = 0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.bind.as_deref(), Some("0.0.0.0:8070"));
        assert_eq!(config.server.idle_timeout_secs, Some(5));
        assert_eq!(config.flash.dir.as_deref(), Some(Path::new("/tmp/fota")));
        assert_eq!(config.flash.slots, Some(3));
        assert_eq!(config.flash.slot_size, Some(0x100000));
        assert_eq!(config.update.chunk_size, Some(2048));
        assert!(config.update.check_project_name);
        assert!(!config.update.skip_reboot);
        assert_eq!(config.update.restart_delay_ms, Some(0));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.server.bind.is_none());
        assert!(config.flash.slot_size.is_none());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fota.toml");
        fs::write(&path, "[flash]\nslots = 4\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.flash.slots, Some(4));

        fs::write(&path, "[flash\nslots = ").unwrap();
        let config = Config::load_from_path(&path);
        assert!(config.flash.slots.is_none());

        let config = Config::load_from_path(&dir.path().join("missing.toml"));
        assert!(config.flash.slots.is_none());
    }

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("fota"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
