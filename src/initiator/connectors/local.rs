//! Local and GPFS Connectors
//!
//! The volume is already a path on this host, so attach just hands it back.

use crate::domain::ports::{Connector, DeviceInfo};
use crate::domain::properties::ConnectionProperties;
use crate::error::{Error, Result};
use crate::initiator::factory::ConnectorContext;
use crate::initiator::registry::ConnectorKind;
use tracing::debug;

/// Passes `device_path` through unchanged
#[derive(Debug, Clone)]
pub struct LocalConnector {
    context: ConnectorContext,
}

impl LocalConnector {
    pub fn new(context: ConnectorContext) -> Self {
        Self { context }
    }

    fn device_type(&self) -> &'static str {
        match self.context.kind {
            ConnectorKind::Gpfs => "gpfs",
            _ => "local",
        }
    }

    fn device_path(props: &ConnectionProperties) -> Result<String> {
        props.require_str("device_path").map(str::to_string).map_err(|_| {
            Error::invalid_property(
                "device_path",
                "Invalid connection_properties specified no device_path attribute",
            )
        })
    }
}

impl Connector for LocalConnector {
    fn name(&self) -> &'static str {
        self.context.kind.name()
    }

    fn connect_volume(&self, props: &ConnectionProperties) -> Result<DeviceInfo> {
        let path = Self::device_path(props)?;
        debug!("Local volume at {}", path);
        Ok(DeviceInfo::new(self.device_type(), path))
    }

    fn disconnect_volume(
        &self,
        _props: &ConnectionProperties,
        _device_info: Option<&DeviceInfo>,
    ) -> Result<()> {
        Ok(())
    }

    fn get_volume_paths(&self, props: &ConnectionProperties) -> Result<Vec<String>> {
        Ok(Self::device_path(props).into_iter().collect())
    }

    fn get_search_path(&self) -> Option<String> {
        None
    }

    fn get_all_available_volumes(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn extend_volume(&self, _props: &ConnectionProperties) -> Result<Option<u64>> {
        Err(Error::OperationNotSupported {
            connector: self.name().to_string(),
            operation: "extend_volume".to_string(),
        })
    }
}
