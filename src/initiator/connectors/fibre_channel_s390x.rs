//! Fibre Channel on S390X
//!
//! Same attach flow as the PCI variant, but LUNs must be registered with the
//! zfcp driver before they show up and unregistered on detach.

use super::fibre_channel::{FcDialect, FibreChannelConnector};
use crate::domain::properties::ConnectionProperties;
use crate::error::Result;
use crate::hardware::discovery::{zfcp_lun_string, Hba, LinuxFibreChannelS390x};
use crate::initiator::factory::ConnectorContext;
use tracing::debug;

impl FibreChannelConnector {
    /// Connector speaking the zfcp dialect
    pub fn s390x(context: ConnectorContext) -> Self {
        let mut connector = Self::new(context);
        connector.dialect = FcDialect::Zfcp(LinuxFibreChannelS390x::new(connector.fc.clone()));
        connector
    }

    pub fn is_s390x(&self) -> bool {
        matches!(self.dialect, FcDialect::Zfcp(_))
    }

    fn zfcp_units(
        &self,
        props: &ConnectionProperties,
        hbas: &[Hba],
    ) -> Result<(Vec<(String, String)>, String)> {
        let wwns = props.string_list("target_wwn")?;
        let lun = zfcp_lun_string(props.require_u64("target_lun")?);
        Ok((self.possible_devices(hbas, &wwns), lun))
    }

    pub(crate) fn configure_zfcp_units(
        &self,
        zfcp: &LinuxFibreChannelS390x,
        props: &ConnectionProperties,
        hbas: &[Hba],
    ) -> Result<()> {
        let (units, lun) = self.zfcp_units(props, hbas)?;
        for (device_number, target_wwn) in &units {
            debug!("Configuring zfcp unit {} {} {}", device_number, target_wwn, lun);
            zfcp.configure_scsi_device(device_number, target_wwn, &lun);
        }
        Ok(())
    }

    pub(crate) fn deconfigure_zfcp_units(
        &self,
        zfcp: &LinuxFibreChannelS390x,
        props: &ConnectionProperties,
        hbas: &[Hba],
    ) -> Result<()> {
        let (units, lun) = self.zfcp_units(props, hbas)?;
        for (device_number, target_wwn) in &units {
            zfcp.deconfigure_scsi_device(device_number, target_wwn, &lun);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Connector;
    use crate::executor::{CommandOutput, RecordingExecutor};
    use crate::hardware::discovery::hba::fixtures::SYSTOOL_FC_S390X;
    use crate::initiator::factory::ConnectorOptions;
    use crate::initiator::registry::ConnectorKind;
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    const BY_PATH: &str = "ccw-0.0.3080-zfcp-0x500a0982991b8dc5:0x0001000000000000";

    fn connector(dev: &Path, sysfs: &Path) -> (Arc<RecordingExecutor>, FibreChannelConnector) {
        let executor = Arc::new(RecordingExecutor::with_responder(|request| {
            match request.program.as_str() {
                "systool" => Ok(CommandOutput::stdout(SYSTOOL_FC_S390X)),
                _ => Ok(CommandOutput::default()),
            }
        }));
        let options = ConnectorOptions::new("sudo")
            .device_scan_attempts(1)
            .scan_interval(Duration::ZERO);
        let context =
            ConnectorContext::new(ConnectorKind::FibreChannelS390x, options, executor.clone())
                .with_roots(sysfs, dev);
        (executor, FibreChannelConnector::s390x(context))
    }

    fn props() -> ConnectionProperties {
        ConnectionProperties::new()
            .with("target_wwn", json!(["500a0982991b8dc5"]))
            .with("target_lun", 1)
    }

    #[test]
    fn test_zfcp_volume_paths() {
        let dev = tempfile::tempdir().unwrap();
        let sysfs = tempfile::tempdir().unwrap();
        let (_, fc) = connector(dev.path(), sysfs.path());
        assert!(fc.is_s390x());

        let hbas = fc.fc.discover_hbas();
        let paths = fc.possible_volume_paths(&props(), &hbas).unwrap();

        assert_eq!(
            paths,
            vec![dev
                .path()
                .join("disk/by-path")
                .join(BY_PATH)
                .to_string_lossy()
                .to_string()]
        );
    }

    #[test]
    fn test_get_volume_paths_has_no_side_effects() {
        let dev = tempfile::tempdir().unwrap();
        let sysfs = tempfile::tempdir().unwrap();
        let (executor, fc) = connector(dev.path(), sysfs.path());

        assert!(fc.get_volume_paths(&props()).unwrap().is_empty());
        assert_eq!(executor.command_lines(), vec!["systool -c fc_host -v"]);
    }

    #[test]
    fn test_connect_adds_zfcp_unit_first() {
        let dev = tempfile::tempdir().unwrap();
        let sysfs = tempfile::tempdir().unwrap();
        let by_path = dev.path().join("disk/by-path");
        std::fs::create_dir_all(&by_path).unwrap();
        std::fs::write(by_path.join(BY_PATH), b"").unwrap();
        let (executor, fc) = connector(dev.path(), sysfs.path());

        let info = fc.connect_volume(&props()).unwrap();
        assert!(info.path.ends_with(BY_PATH));

        let unit_add = format!(
            "tee -a {}/bus/ccw/drivers/zfcp/0.0.3080/0x500a0982991b8dc5/unit_add",
            sysfs.path().display()
        );
        let requests = executor.requests();
        let add = requests
            .iter()
            .find(|r| r.command_line() == unit_add)
            .expect("unit_add written");
        assert_eq!(add.input.as_deref(), Some("0x0001000000000000"));
    }

    #[test]
    fn test_disconnect_removes_zfcp_unit() {
        let dev = tempfile::tempdir().unwrap();
        let sysfs = tempfile::tempdir().unwrap();
        let (executor, fc) = connector(dev.path(), sysfs.path());

        fc.disconnect_volume(&props(), None).unwrap();

        let lines = executor.command_lines();
        assert_eq!(
            lines.last().map(String::as_str),
            Some(
                format!(
                    "tee -a {}/bus/ccw/drivers/zfcp/0.0.3080/0x500a0982991b8dc5/unit_remove",
                    sysfs.path().display()
                )
                .as_str()
            )
        );
    }
}
