//! SCSI Bus Rescan
//!
//! Resolves the channel and target of a remote port behind each HBA and asks
//! the SCSI midlayer to scan exactly those addresses. When the lookup is
//! inconclusive the HBA gets a wildcard scan instead.

use super::hba::{Hba, LinuxFibreChannel};
use crate::error::Result;
use crate::executor::ExecRequest;
use crate::metrics;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// =============================================================================
// Rescan Target
// =============================================================================

/// One field of a SCSI address: a number or the `-` wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScsiId {
    Number(u64),
    Wildcard,
}

impl std::fmt::Display for ScsiId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScsiId::Number(n) => write!(f, "{}", n),
            ScsiId::Wildcard => write!(f, "-"),
        }
    }
}

/// `channel target lun` written to a host's scan file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RescanTarget {
    pub channel: ScsiId,
    pub target: ScsiId,
    pub lun: ScsiId,
}

impl RescanTarget {
    pub fn targeted(channel: u64, target: u64, lun: u64) -> Self {
        Self {
            channel: ScsiId::Number(channel),
            target: ScsiId::Number(target),
            lun: ScsiId::Number(lun),
        }
    }

    /// Every channel and target of the host, for one LUN
    pub fn wildcard(lun: u64) -> Self {
        Self {
            channel: ScsiId::Wildcard,
            target: ScsiId::Wildcard,
            lun: ScsiId::Number(lun),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.channel == ScsiId::Wildcard || self.target == ScsiId::Wildcard
    }
}

impl std::fmt::Display for RescanTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.channel, self.target, self.lun)
    }
}

/// Pull `(channel, target)` pairs out of grep output.
///
/// `prefix` is the target directory stem up to the host index, e.g.
/// `/sys/class/fc_transport/target10:`; a matching line continues with
/// `2:3/node_name:0x5006016090203181`. Other lines are ignored.
pub fn parse_target_lines(output: &str, prefix: &str) -> Vec<(u64, u64)> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix(prefix))
        .filter_map(|rest| {
            let segment = rest.split('/').next()?;
            let mut fields = segment.split(':');
            let channel = fields.next()?.trim().parse().ok()?;
            let target = fields.next()?.trim().parse().ok()?;
            Some((channel, target))
        })
        .collect()
}

// =============================================================================
// Rescan Engine
// =============================================================================

impl LinuxFibreChannel {
    fn fc_transport_prefix(&self) -> String {
        format!("{}/class/fc_transport/", self.sysfs_root.display())
    }

    fn scan_path(&self, hba: &Hba) -> String {
        format!(
            "{}/class/scsi_host/{}/scan",
            self.sysfs_root.display(),
            hba.host_device
        )
    }

    /// Channel/target pairs where `hba` sees its remote node.
    ///
    /// `None` when the lookup itself failed or the HBA has no node name.
    pub fn get_hba_channel_scsi_target(&self, hba: &Hba) -> Option<Vec<(u64, u64)>> {
        if hba.node_name.is_empty() {
            debug!("{} has no node name to look up", hba.host_device);
            return None;
        }
        let prefix = self.fc_transport_prefix();
        let glob = format!("{}target{}:", prefix, hba.host_number());
        let command = format!("grep {} {}*/node_name", hba.node_name, glob);

        match self.executor.execute(&ExecRequest::shell(command)) {
            Ok(output) => Some(parse_target_lines(&output.stdout, &glob)),
            Err(e) => {
                debug!(
                    "Could not get HBA channel and SCSI target ID for {}: {}",
                    hba.host_device, e
                );
                None
            }
        }
    }

    /// Targets to scan on `hba` for `lun`
    pub fn rescan_targets(&self, hba: &Hba, lun: u64) -> Vec<RescanTarget> {
        match self.get_hba_channel_scsi_target(hba) {
            Some(pairs) if !pairs.is_empty() => pairs
                .into_iter()
                .map(|(channel, target)| RescanTarget::targeted(channel, target, lun))
                .collect(),
            _ => {
                warn!(
                    "No channel/target found for node {} on {}, scanning all targets",
                    hba.node_name, hba.host_device
                );
                vec![RescanTarget::wildcard(lun)]
            }
        }
    }

    /// Scan every HBA for `lun`.
    ///
    /// A failure on one HBA is logged and does not stop the others.
    pub fn rescan_hosts(&self, hbas: &[Hba], lun: u64) {
        for hba in hbas {
            let _guard = self.locks.lock(&format!("scsi_host:{}", hba.host_device));
            let path = self.scan_path(hba);

            for target in self.rescan_targets(hba, lun) {
                match self.write_scan(&path, &target) {
                    Ok(()) => {
                        metrics::record_rescan_write(target.is_wildcard());
                        info!("Rescanned {} with '{}'", hba.host_device, target);
                    }
                    Err(e) => {
                        metrics::record_rescan_failure();
                        warn!("Rescan of {} with '{}' failed: {}", hba.host_device, target, e);
                    }
                }
            }
        }
    }

    fn write_scan(&self, path: &str, target: &RescanTarget) -> Result<()> {
        self.echo_scsi_command(path, &target.to_string())
    }
}
