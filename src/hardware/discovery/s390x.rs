//! zfcp (IBM Z) Fibre Channel Dialect
//!
//! On S390X, FC LUNs are attached explicitly through the zfcp driver's
//! `port_rescan`, `unit_add` and `unit_remove` files, addressed by CCW
//! device number and target WWPN rather than by SCSI host index.

use super::hba::{Hba, LinuxFibreChannel};
use tracing::{debug, warn};

/// zfcp control files live under this driver directory
const ZFCP_DRIVER_DIR: &str = "bus/ccw/drivers/zfcp";

/// LUN string understood by zfcp.
///
/// LUNs up to 0xffff use the single-level format, larger ones the flat
/// 32-bit format.
pub fn zfcp_lun_string(lun: u64) -> String {
    if lun <= 0xffff {
        format!("0x{:04x}000000000000", lun)
    } else {
        format!("0x{:08x}00000000", lun)
    }
}

/// CCW device number of an HBA, e.g. `0.0.3080` from
/// `/sys/devices/css0/0.0.02ea/0.0.3080/host0/fc_host/host0`
pub fn ccw_device_number(device_path: &str) -> Option<&str> {
    device_path.split('/').nth(5).filter(|s| !s.is_empty())
}

/// by-path entry for a zfcp LUN
pub fn zfcp_by_path_name(device_number: &str, target_wwn: &str, lun: u64) -> String {
    format!(
        "ccw-{}-zfcp-{}:{}",
        device_number,
        target_wwn,
        zfcp_lun_string(lun)
    )
}

impl Hba {
    pub fn ccw_device_number(&self) -> Option<&str> {
        ccw_device_number(&self.device_path)
    }
}

/// Fibre Channel operations on an S390X host
#[derive(Debug, Clone)]
pub struct LinuxFibreChannelS390x {
    inner: LinuxFibreChannel,
}

impl LinuxFibreChannelS390x {
    pub fn new(inner: LinuxFibreChannel) -> Self {
        Self { inner }
    }

    /// Discovery and rescans are shared with the generic Linux code
    pub fn fc(&self) -> &LinuxFibreChannel {
        &self.inner
    }

    fn zfcp_path(&self, rest: &str) -> String {
        format!(
            "{}/{}/{}",
            self.inner.sysfs_root().display(),
            ZFCP_DRIVER_DIR,
            rest
        )
    }

    /// Make `lun` behind `target_wwn` visible through adapter `device_number`.
    ///
    /// The port is rescanned first when the driver does not know it yet.
    /// Write failures are logged, not returned.
    pub fn configure_scsi_device(&self, device_number: &str, target_wwn: &str, lun: &str) {
        let port_dir = self.zfcp_path(&format!("{}/{}", device_number, target_wwn));
        if !std::path::Path::new(&port_dir).exists() {
            let port_rescan = self.zfcp_path(&format!("{}/port_rescan", device_number));
            if let Err(e) = self.inner.echo_scsi_command(&port_rescan, "1") {
                warn!("port_rescan call for {} failed: {}", device_number, e);
            }
        }

        let unit_add = self.zfcp_path(&format!("{}/{}/unit_add", device_number, target_wwn));
        match self.inner.echo_scsi_command(&unit_add, lun) {
            Ok(()) => debug!("Added zfcp unit {} {} {}", device_number, target_wwn, lun),
            Err(e) => warn!(
                "unit_add call for {} {} {} failed: {}",
                device_number, target_wwn, lun, e
            ),
        }
    }

    /// Remove `lun` behind `target_wwn` from adapter `device_number`
    pub fn deconfigure_scsi_device(&self, device_number: &str, target_wwn: &str, lun: &str) {
        let unit_remove =
            self.zfcp_path(&format!("{}/{}/unit_remove", device_number, target_wwn));
        match self.inner.echo_scsi_command(&unit_remove, lun) {
            Ok(()) => debug!("Removed zfcp unit {} {} {}", device_number, target_wwn, lun),
            Err(e) => warn!(
                "unit_remove call for {} {} {} failed: {}",
                device_number, target_wwn, lun, e
            ),
        }
    }
}
