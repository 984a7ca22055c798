//! StorPool Connector
//!
//! Attachment is negotiated with the StorPool block service through its API
//! bindings, injected as a [`StorPoolApi`]. The block service then exposes the
//! volume under `/dev/storpool`.

use super::base::LinuxScsi;
use crate::domain::ports::{Connector, DeviceInfo};
use crate::domain::properties::{AccessMode, ConnectionProperties};
use crate::error::{Error, Result};
use crate::initiator::factory::ConnectorContext;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Attachment record handed to the StorPool API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachRequest {
    pub volume: String,
    #[serde(rename = "type")]
    pub request_type: String,
    pub id: String,
    /// 1 for read-only, 2 for read-write
    pub rights: u8,
    pub volsnap: bool,
}

impl AttachRequest {
    pub fn new(request_id: &str, volume: &str, mode: AccessMode) -> Self {
        Self {
            volume: volume.to_string(),
            request_type: "brick".to_string(),
            id: request_id.to_string(),
            rights: match mode {
                AccessMode::ReadOnly => 1,
                AccessMode::ReadWrite => 2,
            },
            volsnap: false,
        }
    }
}

/// The StorPool attach database
pub trait StorPoolApi: Send + Sync {
    /// Verify the bindings can reach the API
    fn check(&self) -> Result<()>;

    /// StorPool volume name for a volume id; `volume_name("")` is the
    /// common prefix
    fn volume_name(&self, volume_id: &str) -> String;

    fn add(&self, request_id: &str, request: AttachRequest) -> Result<()>;

    /// Wait until the block service has applied `request_id`; `detached`
    /// names the volume expected to go away
    fn sync(&self, request_id: &str, detached: Option<&str>) -> Result<()>;

    fn remove(&self, request_id: &str) -> Result<()>;
}

pub type StorPoolApiRef = Arc<dyn StorPoolApi>;

/// Attach/detach of StorPool volumes
#[derive(Clone)]
pub struct StorPoolConnector {
    context: ConnectorContext,
    api: StorPoolApiRef,
    scsi: LinuxScsi,
}

impl StorPoolConnector {
    /// Fails when the API bindings are absent or cannot be initialised
    pub fn new(context: ConnectorContext, api: Option<StorPoolApiRef>) -> Result<Self> {
        let connector = context.kind.name().to_string();
        let api = api.ok_or_else(|| Error::ConnectorUnavailable {
            connector: connector.clone(),
            reason: "Could not import the StorPool API bindings".to_string(),
        })?;
        api.check().map_err(|e| Error::ConnectorUnavailable {
            connector,
            reason: format!("Could not initialize the StorPool API bindings: {}", e),
        })?;

        let scsi = LinuxScsi::new(&context);
        Ok(Self { context, api, scsi })
    }

    fn storpool_dir(&self) -> PathBuf {
        self.context.dev_root.join("storpool")
    }

    fn volume_path(&self, name: &str) -> String {
        self.storpool_dir().join(name).to_string_lossy().to_string()
    }

    fn request_id(props: &ConnectionProperties) -> Result<(String, String)> {
        let client_id = props.require_scalar("client_id")?;
        let volume_id = props.require_scalar("volume")?;
        Ok((format!("brick-{}-{}", client_id, volume_id), volume_id))
    }
}

impl std::fmt::Debug for StorPoolConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorPoolConnector")
            .field("dev_root", &self.context.dev_root)
            .finish()
    }
}

impl Connector for StorPoolConnector {
    fn name(&self) -> &'static str {
        self.context.kind.name()
    }

    fn connect_volume(&self, props: &ConnectionProperties) -> Result<DeviceInfo> {
        let (request_id, volume_id) = Self::request_id(props)?;
        let mode = props.access_mode()?;
        let volume = self.api.volume_name(&volume_id);

        let _guard = self.context.locks.lock(&format!("storpool:{}", request_id));
        self.api
            .add(&request_id, AttachRequest::new(&request_id, &volume, mode))?;
        self.api.sync(&request_id, None)?;

        info!("Attached StorPool volume {} ({})", volume, mode);
        Ok(DeviceInfo::new("block", self.volume_path(&volume)))
    }

    fn disconnect_volume(
        &self,
        props: &ConnectionProperties,
        _device_info: Option<&DeviceInfo>,
    ) -> Result<()> {
        let (request_id, volume_id) = Self::request_id(props)?;
        let volume = self.api.volume_name(&volume_id);

        let _guard = self.context.locks.lock(&format!("storpool:{}", request_id));
        self.api.sync(&request_id, Some(&volume))?;
        self.api.remove(&request_id)?;
        debug!("Detached StorPool volume {}", volume);
        Ok(())
    }

    fn get_volume_paths(&self, props: &ConnectionProperties) -> Result<Vec<String>> {
        let volume_id = props.require_scalar("volume")?;
        let path = self.volume_path(&self.api.volume_name(&volume_id));

        if let Some(device_path) = props.get_str("device_path") {
            if device_path != path {
                error!("StorPool volume path {} does not match {}", path, device_path);
                return Err(Error::Internal(format!(
                    "StorPool volume path {} does not match device path {}",
                    path, device_path
                )));
            }
        }
        Ok(vec![path])
    }

    fn get_search_path(&self) -> Option<String> {
        Some(self.storpool_dir().to_string_lossy().to_string())
    }

    fn get_all_available_volumes(&self) -> Result<Vec<String>> {
        let dir = self.storpool_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let prefix = self.api.volume_name("");
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stripped) = name.strip_prefix(&prefix) else {
                continue;
            };
            let path = entry.path();
            let is_link = std::fs::symlink_metadata(&path)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            if is_link && !path.is_dir() {
                names.push(stripped.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn extend_volume(&self, props: &ConnectionProperties) -> Result<Option<u64>> {
        let (request_id, volume_id) = Self::request_id(props)?;
        let path = self.volume_path(&self.api.volume_name(&volume_id));

        let _guard = self.context.locks.lock(&format!("storpool:{}", request_id));
        self.scsi.get_device_size(&path)
    }
}
