//! Fibre Channel HBA Discovery
//!
//! Parses `systool -c fc_host -v` output into HBA descriptors. Adapter
//! topology can change between calls, so nothing here is cached.

use crate::config::AttachConfig;
use crate::error::Result;
use crate::executor::{ExecRequest, ExecutorRef};
use crate::locking::ResourceLocks;
use crate::metrics;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw `key = value` record for one adapter, keys with spaces removed
pub type SystoolRecord = IndexMap<String, String>;

// =============================================================================
// HBA Descriptor
// =============================================================================

/// One Fibre Channel host bus adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hba {
    /// sysfs device path of the fc_host
    pub device_path: String,
    /// SCSI host name, e.g. `host10`
    pub host_device: String,
    /// WWNN, bare lower-case hex
    pub node_name: String,
    /// WWPN, bare lower-case hex
    pub port_name: String,
}

impl Hba {
    /// Numeric SCSI host index (`host10` -> `10`)
    pub fn host_number(&self) -> &str {
        self.host_device
            .strip_prefix("host")
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.host_device)
    }

    /// Build from a parsed record. `None` when the host device or its path
    /// is missing.
    pub fn from_record(record: &SystoolRecord) -> Option<Self> {
        let host_device = record.get("ClassDevice").filter(|v| !v.is_empty())?;
        let device_path = record.get("ClassDevicepath").filter(|v| !v.is_empty())?;

        Some(Self {
            device_path: device_path.clone(),
            host_device: host_device.clone(),
            node_name: normalize_wwn(record.get("node_name").map(String::as_str)),
            port_name: normalize_wwn(record.get("port_name").map(String::as_str)),
        })
    }
}

fn normalize_wwn(raw: Option<&str>) -> String {
    raw.map(|v| v.replace("0x", "").to_lowercase())
        .unwrap_or_default()
}

// =============================================================================
// systool Parsing
// =============================================================================

/// Split systool output into per-adapter records.
///
/// The first two lines (the class header) are skipped, two consecutive blank
/// lines end a record, and only lines with exactly one `=` are kept.
pub fn parse_systool_output(output: &str) -> Vec<SystoolRecord> {
    let mut records = Vec::new();
    let mut current = SystoolRecord::new();
    let mut last_line: Option<&str> = None;

    for raw in output.split('\n').skip(2) {
        let line = raw.trim();

        if line.is_empty() && last_line == Some("") {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
        } else {
            let parts: Vec<&str> = line.split('=').collect();
            if let [key, value] = parts.as_slice() {
                let key = key.trim().replace(' ', "");
                let value = value.trim().replace('"', "");
                current.insert(key, value);
            }
        }
        last_line = Some(line);
    }

    if !current.is_empty() {
        records.push(current);
    }
    records
}

/// Parse systool output straight into HBA descriptors
pub fn parse_hbas(output: &str) -> Vec<Hba> {
    hbas_from_records(&parse_systool_output(output))
}

fn hbas_from_records(records: &[SystoolRecord]) -> Vec<Hba> {
    records
        .iter()
        .filter_map(|record| {
            let hba = Hba::from_record(record);
            if hba.is_none() {
                warn!("Skipping fc_host record without a class device: {:?}", record);
            }
            hba
        })
        .collect()
}

// =============================================================================
// Linux Fibre Channel
// =============================================================================

/// Fibre Channel discovery and rescan on a Linux host
#[derive(Clone)]
pub struct LinuxFibreChannel {
    pub(crate) executor: ExecutorRef,
    pub(crate) root_helper: String,
    pub(crate) sysfs_root: PathBuf,
    pub(crate) locks: Arc<ResourceLocks>,
}

impl LinuxFibreChannel {
    pub fn new(executor: ExecutorRef, root_helper: impl Into<String>) -> Self {
        Self {
            executor,
            root_helper: root_helper.into(),
            sysfs_root: PathBuf::from("/sys"),
            locks: Arc::new(ResourceLocks::default()),
        }
    }

    /// Root helper, sysfs mount and lock prefix taken from `config`
    pub fn from_config(config: &AttachConfig, executor: ExecutorRef) -> Self {
        Self::new(executor, config.root_helper.clone())
            .with_sysfs_root(config.sysfs_root.clone())
            .with_locks(ResourceLocks::shared(config.lock_prefix.clone()))
    }

    pub fn locks(&self) -> &Arc<ResourceLocks> {
        &self.locks
    }

    /// Use a different sysfs mount (tests point this at a temp dir)
    pub fn with_sysfs_root(mut self, sysfs_root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = sysfs_root.into();
        self
    }

    pub fn with_locks(mut self, locks: Arc<ResourceLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    pub fn root_helper(&self) -> &str {
        &self.root_helper
    }

    /// Does the host expose an `fc_host` class at all?
    pub fn has_fc_support(&self) -> bool {
        self.sysfs_root.join("class/fc_host").is_dir()
    }

    /// Raw `systool` records, empty when the query fails or prints nothing
    pub fn get_fc_hbas(&self) -> Vec<SystoolRecord> {
        match self.run_systool() {
            Ok(output) if !output.trim().is_empty() => parse_systool_output(&output),
            Ok(_) => {
                debug!("systool returned no fc_host records");
                Vec::new()
            }
            Err(e) => {
                debug!("Could not query fc_host via systool: {}", e);
                Vec::new()
            }
        }
    }

    /// HBA descriptors for every adapter on the host
    pub fn discover_hbas(&self) -> Vec<Hba> {
        let hbas = hbas_from_records(&self.get_fc_hbas());

        metrics::set_hbas_discovered(hbas.len());
        debug!("Discovered {} Fibre Channel HBA(s)", hbas.len());
        hbas
    }

    /// Port names of every HBA that reports one
    pub fn get_fc_wwpns(&self) -> Vec<String> {
        self.discover_hbas()
            .into_iter()
            .map(|hba| hba.port_name)
            .filter(|wwpn| !wwpn.is_empty())
            .collect()
    }

    /// Node names of every HBA that reports one
    pub fn get_fc_wwnns(&self) -> Vec<String> {
        self.discover_hbas()
            .into_iter()
            .map(|hba| hba.node_name)
            .filter(|wwnn| !wwnn.is_empty())
            .collect()
    }

    fn run_systool(&self) -> Result<String> {
        let request = ExecRequest::new("systool")
            .args(["-c", "fc_host", "-v"])
            .as_root(&self.root_helper);
        Ok(self.executor.execute(&request)?.stdout)
    }

    /// Append `content` to a sysfs control file as root
    pub(crate) fn echo_scsi_command(&self, path: &str, content: &str) -> Result<()> {
        let request = ExecRequest::new("tee")
            .args(["-a", path])
            .input(content)
            .as_root(&self.root_helper);
        self.executor.execute(&request)?;
        Ok(())
    }
}

impl std::fmt::Debug for LinuxFibreChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxFibreChannel")
            .field("root_helper", &self.root_helper)
            .field("sysfs_root", &self.sysfs_root)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Two QLogic adapters as printed by `systool -c fc_host -v`
    pub const SYSTOOL_FC: &str = r#"
Class = "fc_host"

  Class Device = "host0"
  Class Device path = "/sys/devices/pci0000:20/0000:20:03.0/0000:21:00.0/host0/fc_host/host0"
    dev_loss_tmo        = "16"
    fabric_name         = "0x100000051ea338b9"
    issue_lip           = <store method only>
    max_npiv_vports     = "0"
    node_name           = "0x50014380242b9751"
    npiv_vports_inuse   = "0"
    port_id             = "0x960d0d"
    port_name           = "0x50014380242b9750"
    port_state          = "Online"
    port_type           = "NPort (fabric via point-to-point)"
    speed               = "8 Gbit"
    supported_classes   = "Class 3"
    supported_speeds    = "1 Gbit, 2 Gbit, 4 Gbit, 8 Gbit"
    symbolic_name       = "QMH2572 FW:v4.04.04 DVR:v8.03.07.12-k"
    system_hostname     = ""
    tgtid_bind_type     = "wwpn (World Wide Port Name)"
    uevent              =
    vport_create        = <store method only>
    vport_delete        = <store method only>

    Device = "host0"
    Device path = "/sys/devices/pci0000:20/0000:20:03.0/0000:21:00.0/host0"
      edc                 = <store method only>
      optrom_ctl          = <store method only>
      reset               = <store method only>
      uevent              = "DEVTYPE=scsi_host"


  Class Device = "host2"
  Class Device path = "/sys/devices/pci0000:20/0000:20:03.0/0000:21:00.1/host2/fc_host/host2"
    dev_loss_tmo        = "16"
    fabric_name         = "0x100000051ea33b79"
    issue_lip           = <store method only>
    max_npiv_vports     = "0"
    node_name           = "0x50014380242b9753"
    npiv_vports_inuse   = "0"
    port_id             = "0x970e09"
    port_name           = "0x50014380242b9752"
    port_state          = "Online"
    port_type           = "NPort (fabric via point-to-point)"
    speed               = "8 Gbit"
    supported_classes   = "Class 3"
    supported_speeds    = "1 Gbit, 2 Gbit, 4 Gbit, 8 Gbit"
    symbolic_name       = "QMH2572 FW:v4.04.04 DVR:v8.03.07.12-k"
    system_hostname     = ""
    tgtid_bind_type     = "wwpn (World Wide Port Name)"
    uevent              =
    vport_create        = <store method only>
    vport_delete        = <store method only>

    Device = "host2"
    Device path = "/sys/devices/pci0000:20/0000:20:03.0/0000:21:00.1/host2"
      edc                 = <store method only>
      optrom_ctl          = <store method only>
      reset               = <store method only>
      uevent              = "DEVTYPE=scsi_host"


"#;

    /// A single zfcp adapter on an IBM Z host
    pub const SYSTOOL_FC_S390X: &str = r#"
Class = "fc_host"

  Class Device = "host0"
  Class Device path = "/sys/devices/css0/0.0.02ea/0.0.3080/host0/fc_host/host0"
    active_fc4s         = "0x00 0x00 0x01 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 0x00 "
    dev_loss_tmo        = "60"
    maxframe_size       = "2112 bytes"
    node_name           = "0x1234567898765432"
    permanent_port_name = "0xc05076ffe6803081"
    port_id             = "0x010014"
    port_name           = "0xc05076ffe680a960"
    port_state          = "Online"
    port_type           = "NPIV VPORT"
    serial_number       = "IBM00000000000P30"
    speed               = "8 Gbit"
    supported_classes   = "Class 2, Class 3"
    supported_speeds    = "2 Gbit, 4 Gbit"
    symbolic_name       = "IBM     2827            00000000000P30  PCHID: 0308 NPIV UlpId: 01EA0A00   DEVNO: 0.0.1234 NAME: dummy"
    tgtid_bind_type     = "wwpn (World Wide Port Name)"
    uevent              =

    Device = "host0"
    Device path = "/sys/devices/css0/0.0.02ea/0.0.3080/host0"
      uevent              = "DEVTYPE=scsi_host"

"#;
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::error::Error;
    use crate::executor::{CommandOutput, RecordingExecutor};

    fn fc_with(executor: RecordingExecutor) -> (Arc<RecordingExecutor>, LinuxFibreChannel) {
        let executor = Arc::new(executor);
        let fc = LinuxFibreChannel::new(executor.clone(), "sudo");
        (executor, fc)
    }

    #[test]
    fn test_from_config_applies_lock_prefix() {
        let config = AttachConfig {
            root_helper: "sudo -n".to_string(),
            sysfs_root: PathBuf::from("/tmp/sysfs"),
            lock_prefix: "compute-7-".to_string(),
            ..Default::default()
        };
        let fc = LinuxFibreChannel::from_config(&config, Arc::new(RecordingExecutor::new()));

        assert_eq!(fc.root_helper(), "sudo -n");
        assert_eq!(fc.sysfs_root(), Path::new("/tmp/sysfs"));
        assert_eq!(fc.locks().prefix(), "compute-7-");
    }

    #[test]
    fn test_parse_two_adapters() {
        let records = parse_systool_output(SYSTOOL_FC);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["ClassDevice"], "host0");
        assert_eq!(records[1]["ClassDevice"], "host2");
        // Lines with more than one '=' are dropped
        assert!(records[0].get("uevent").map_or(true, |v| v.is_empty()));
    }

    #[test]
    fn test_discover_hbas_fields() {
        let (executor, fc) = fc_with(RecordingExecutor::with_script(vec![Ok(
            CommandOutput::stdout(SYSTOOL_FC),
        )]));

        let hbas = fc.discover_hbas();

        assert_eq!(
            hbas,
            vec![
                Hba {
                    device_path: "/sys/devices/pci0000:20/0000:20:03.0/0000:21:00.0/host0/fc_host/host0".into(),
                    host_device: "host0".into(),
                    node_name: "50014380242b9751".into(),
                    port_name: "50014380242b9750".into(),
                },
                Hba {
                    device_path: "/sys/devices/pci0000:20/0000:20:03.0/0000:21:00.1/host2/fc_host/host2".into(),
                    host_device: "host2".into(),
                    node_name: "50014380242b9753".into(),
                    port_name: "50014380242b9752".into(),
                },
            ]
        );

        let requests = executor.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].command_line(), "systool -c fc_host -v");
        assert!(requests[0].run_as_root);
    }

    #[test]
    fn test_discover_s390x_adapter() {
        let (_, fc) = fc_with(RecordingExecutor::with_script(vec![Ok(
            CommandOutput::stdout(SYSTOOL_FC_S390X),
        )]));

        let hbas = fc.discover_hbas();
        assert_eq!(hbas.len(), 1);
        assert_eq!(
            hbas[0].device_path,
            "/sys/devices/css0/0.0.02ea/0.0.3080/host0/fc_host/host0"
        );
        assert_eq!(hbas[0].node_name, "1234567898765432");
        assert_eq!(hbas[0].port_name, "c05076ffe680a960");
    }

    #[test]
    fn test_discover_hbas_failures_yield_empty() {
        let (_, fc) = fc_with(RecordingExecutor::with_script(vec![Err(
            Error::ProcessExecution {
                command: "systool -c fc_host -v".into(),
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "None found".into(),
            },
        )]));
        assert!(fc.discover_hbas().is_empty());

        let (_, fc) = fc_with(RecordingExecutor::new());
        assert!(fc.discover_hbas().is_empty());
    }

    #[test]
    fn test_malformed_record_does_not_hide_others() {
        let output = "\nClass = \"fc_host\"\n\n  node_name = \"0xabc\"\n\n\n  Class Device = \"host3\"\n  Class Device path = \"/sys/devices/pci0000:00/0000:00:02.0/host3/fc_host/host3\"\n";
        let hbas = parse_hbas(output);

        assert_eq!(hbas.len(), 1);
        assert_eq!(hbas[0].host_device, "host3");
        assert_eq!(hbas[0].node_name, "");
        assert_eq!(hbas[0].host_number(), "3");
    }

    #[test]
    fn test_wwpns_and_wwnns() {
        let executor = RecordingExecutor::with_responder(|_| Ok(CommandOutput::stdout(SYSTOOL_FC)));
        let (_, fc) = fc_with(executor);

        assert_eq!(fc.get_fc_wwpns(), vec!["50014380242b9750", "50014380242b9752"]);
        assert_eq!(fc.get_fc_wwnns(), vec!["50014380242b9751", "50014380242b9753"]);
    }

    #[test]
    fn test_has_fc_support() {
        let dir = tempfile::tempdir().unwrap();
        let (_, fc) = fc_with(RecordingExecutor::new());
        let fc = fc.with_sysfs_root(dir.path());
        assert!(!fc.has_fc_support());

        std::fs::create_dir_all(dir.path().join("class/fc_host")).unwrap();
        assert!(fc.has_fc_support());
    }
}
