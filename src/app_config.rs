//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn msg_fs_runtime_dir() -> Option<PathBuf> {
    if let Some(path) = dirs::runtime_dir() {
        return Some(path.join("msg-fs"));
    }

    dirs::home_dir().map(|path| path.join(".local").join("share").join("msg-fs"))
}

fn default_mount_point() -> PathBuf {
    msg_fs_runtime_dir().map_or_else(|| PathBuf::from("/tmp/msg-fs/mnt"), |rd| rd.join("mnt"))
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

const fn default_attr_ttl_ms() -> u64 {
    1000
}

const fn default_update_channel_capacity() -> usize {
    64
}

const fn default_rescan_interval_ms() -> u64 {
    2000
}

fn default_tree_path() -> String {
    "/".to_owned()
}

/// A host directory mirrored into the virtual tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceConfig {
    /// Host directory to mirror.
    pub path: PathBuf,

    /// Where the mirrored content appears inside the mount.
    #[serde(default = "default_tree_path")]
    pub tree_path: String,

    /// Hide directories with nothing in them.
    #[serde(default)]
    pub exclude_empty: bool,

    /// Show `.zip` files as directories of their entries.
    #[serde(default)]
    pub expand_archives: bool,
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The mount point for the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    /// The user owning every entry. If not specified, the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// The group owning every entry. If not specified, the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,

    /// How long the kernel may cache entries and attributes.
    #[serde(default = "default_attr_ttl_ms")]
    pub attr_ttl_ms: u64,

    /// Producer commands queued before producers wait.
    #[serde(default = "default_update_channel_capacity")]
    pub update_channel_capacity: usize,

    /// How often sources are rescanned. `0` scans once at startup.
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,

    /// Host directories to mirror.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
            uid: current_uid(),
            gid: current_gid(),
            attr_ttl_ms: default_attr_ttl_ms(),
            update_channel_capacity: default_update_channel_capacity(),
            rescan_interval_ms: default_rescan_interval_ms(),
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Entry and attribute cache lifetime handed to the kernel.
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms)
    }

    /// Rescan period, or `None` when sources are scanned only once.
    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_ms > 0).then(|| Duration::from_millis(self.rescan_interval_ms))
    }

    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing every validation error message found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.mount_point.is_absolute() {
            errors.push(format!(
                "Mount point '{}' must be an absolute path.",
                self.mount_point.display()
            ));
        }

        if self.update_channel_capacity == 0 {
            errors.push("update-channel-capacity must be at least 1.".to_owned());
        }

        for source in &self.sources {
            if !source.path.is_dir() {
                errors.push(format!(
                    "Source '{}' is not a directory.",
                    source.path.display()
                ));
            }
            if !source.tree_path.starts_with('/') {
                errors.push(format!(
                    "Source tree path '{}' must start with '/'.",
                    source.tree_path
                ));
            }
            if source.path.starts_with(&self.mount_point) {
                errors.push(format!(
                    "Source '{}' lies inside the mount point.",
                    source.path.display()
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("msg-fs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("msg-fs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/msg-fs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config, falling back to defaults when no file exists.
    /// Errors if a config file exists but is malformed or invalid.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(res) = Self::load(external_config_path) else {
            debug!("No configuration file found, using defaults.");
            return Ok(Self::default());
        };
        let config = res?;
        if let Err(validation_errors) = config.validate() {
            return Err(ConfigError::ValidationErrors(validation_errors));
        }
        debug!("Loaded configuration successfully.");
        Ok(config)
    }
}
