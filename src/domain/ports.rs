//! Domain Ports - Core trait definitions for the attachment layer
//!
//! These traits define the boundaries between connector dispatch and the
//! protocol backends, the volume service, and the key manager.

use crate::domain::properties::ConnectionProperties;
use crate::error::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

// =============================================================================
// Platform Tags
// =============================================================================

/// CPU platform a connector variant applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlatformTag {
    All,
    X86,
    S390,
}

impl PlatformTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformTag::All => "ALL",
            PlatformTag::X86 => "X86",
            PlatformTag::S390 => "S390",
        }
    }
}

impl std::fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operating system a connector variant applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OsTypeTag {
    All,
    Linux,
    Win,
}

impl OsTypeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsTypeTag::All => "ALL",
            OsTypeTag::Linux => "LINUX",
            OsTypeTag::Win => "WIN",
        }
    }
}

impl std::fmt::Display for OsTypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Does a connector tagged `tag` apply to a host reporting `current`?
pub fn platform_matches(current: &str, tag: PlatformTag) -> bool {
    tag_matches(current, tag.as_str())
}

/// Does a connector tagged `tag` apply to a host running `current`?
pub fn os_matches(current: &str, tag: OsTypeTag) -> bool {
    tag_matches(current, tag.as_str())
}

fn tag_matches(current: &str, tag: &str) -> bool {
    if tag == "ALL" {
        return true;
    }
    let current = current.to_uppercase();
    current == tag || current.contains(tag)
}

/// The running host's architecture and operating system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPlatform {
    /// e.g. `x86_64`, `s390x`
    pub arch: String,
    /// e.g. `linux`, `windows`
    pub os: String,
}

impl HostPlatform {
    pub fn current() -> Self {
        Self {
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }

    pub fn new(arch: impl Into<String>, os: impl Into<String>) -> Self {
        Self {
            arch: arch.into(),
            os: os.into(),
        }
    }

    pub fn is_windows(&self) -> bool {
        let os = self.os.to_ascii_lowercase();
        os == "windows" || os == "win32"
    }

    pub fn is_s390(&self) -> bool {
        matches!(self.arch.to_ascii_lowercase().as_str(), "s390" | "s390x")
    }
}

// =============================================================================
// Connector Port
// =============================================================================

/// Attached device description returned by `connect_volume`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device type, e.g. `block`
    #[serde(rename = "type")]
    pub device_type: String,
    /// Path to the usable device
    pub path: String,
    /// SCSI WWN of the device, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scsi_wwn: Option<String>,
    /// Multipath map id, when the device is a multipath map
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipath_id: Option<String>,
    /// Protocol-specific extras
    #[serde(default, flatten)]
    pub extra: IndexMap<String, Value>,
}

impl DeviceInfo {
    pub fn new(device_type: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            path: path.into(),
            scsi_wwn: None,
            multipath_id: None,
            extra: IndexMap::new(),
        }
    }
}

/// Capability contract every protocol backend implements
pub trait Connector: Send + Sync {
    /// Human-readable variant name
    fn name(&self) -> &'static str;

    /// Attach the volume and return the local device.
    ///
    /// Calling it again for an attached volume re-verifies the device.
    fn connect_volume(&self, props: &ConnectionProperties) -> Result<DeviceInfo>;

    /// Detach the volume; a volume that is already gone is not an error
    fn disconnect_volume(
        &self,
        props: &ConnectionProperties,
        device_info: Option<&DeviceInfo>,
    ) -> Result<()>;

    /// Existing local paths for the volume, without attaching anything
    fn get_volume_paths(&self, props: &ConnectionProperties) -> Result<Vec<String>>;

    /// Directory where attached volumes show up, if any
    fn get_search_path(&self) -> Option<String>;

    /// Everything the search directory currently exposes
    fn get_all_available_volumes(&self) -> Result<Vec<String>>;

    /// New size in bytes after a backend resize; `None` when the size
    /// could not be determined
    fn extend_volume(&self, props: &ConnectionProperties) -> Result<Option<u64>>;
}

pub type ConnectorRef = Arc<dyn Connector>;

impl std::fmt::Debug for dyn Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector").field("name", &self.name()).finish()
    }
}

// =============================================================================
// Volume Service / Key Manager Ports
// =============================================================================

/// Caller context forwarded to external services
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }
}

/// Port for the volume metadata service
pub trait VolumeApi: Send + Sync {
    /// Encryption metadata for a volume, as a raw mapping
    fn get_volume_encryption_metadata(
        &self,
        context: &RequestContext,
        volume_id: &str,
    ) -> Result<IndexMap<String, Value>>;
}

/// Port for the key manager holding volume encryption keys
pub trait KeyManager: Send + Sync {
    fn get_key(&self, context: &RequestContext, key_id: &str) -> Result<Vec<u8>>;
}

pub type KeyManagerRef = Arc<dyn KeyManager>;
