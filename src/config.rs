//! Attachment Configuration
//!
//! Host-level settings shared by the connector factory, the property
//! aggregator and the binary. Loaded from YAML and overridden by CLI flags.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of device polling attempts after a rescan
pub const DEVICE_SCAN_ATTEMPTS_DEFAULT: u32 = 3;

/// Configuration for the attachment layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Command prefix for privileged operations
    pub root_helper: String,
    /// IP address reported in host properties
    pub my_ip: String,
    /// Request multipath
    pub multipath: bool,
    /// Fail property collection when multipathd is not running
    pub enforce_multipath: bool,
    /// Polling attempts while waiting for a device after a rescan
    pub device_scan_attempts: u32,
    /// Initial delay between polling attempts
    pub scan_interval_ms: u64,
    /// Path to sysfs (for testing)
    pub sysfs_root: PathBuf,
    /// Path to /dev (for testing)
    pub dev_root: PathBuf,
    /// Prefix applied to every per-resource lock key
    pub lock_prefix: String,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            root_helper: "sudo".to_string(),
            my_ip: "127.0.0.1".to_string(),
            multipath: false,
            enforce_multipath: false,
            device_scan_attempts: DEVICE_SCAN_ATTEMPTS_DEFAULT,
            scan_interval_ms: 2000,
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            lock_prefix: "volume-attach-".to_string(),
        }
    }
}

impl AttachConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_scan_attempts == 0 {
            return Err(Error::Configuration(
                "device_scan_attempts must be at least 1".into(),
            ));
        }
        if !self.sysfs_root.is_absolute() || !self.dev_root.is_absolute() {
            return Err(Error::Configuration(format!(
                "sysfs_root ({}) and dev_root ({}) must be absolute",
                self.sysfs_root.display(),
                self.dev_root.display()
            )));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}
