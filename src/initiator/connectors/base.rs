//! Linux Base Connector
//!
//! SCSI and multipath plumbing shared by the block connectors, the
//! `multipathd` probe contributed by the base variant, and bounded polling
//! for device nodes that appear some time after a rescan.

use crate::domain::properties::PropertyMap;
use crate::error::{Error, Result};
use crate::executor::{ExecRequest, Executor, ExecutorRef};
use crate::initiator::factory::ConnectorContext;
use crate::initiator::properties::ProbeContext;
use backoff::ExponentialBackoffBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Leading tokens `multipath` prints before the map name on some lines
const MULTIPATH_DEVICE_ACTIONS: &[&str] = &[
    "unchanged:",
    "reject:",
    "reload:",
    "switchpg:",
    "rename:",
    "create:",
    "resize:",
];

// =============================================================================
// Host Probe
// =============================================================================

/// Is `multipathd` up? When it is not, `enforce` turns that into an error.
pub fn check_multipathd_running(
    executor: &dyn Executor,
    root_helper: &str,
    enforce: bool,
) -> Result<bool> {
    let request = ExecRequest::new("multipathd")
        .args(["show", "status"])
        .as_root(root_helper);

    match executor.execute(&request) {
        Ok(_) => Ok(true),
        Err(e) if enforce => {
            error!("multipathd is not running: {}", e);
            Err(Error::MultipathNotRunning {
                reason: e.to_string(),
            })
        }
        Err(e) => {
            warn!("multipathd is not running, continuing without multipath: {}", e);
            Ok(false)
        }
    }
}

/// Properties contributed by the base Linux variant
pub fn get_connector_properties(ctx: &ProbeContext) -> Result<PropertyMap> {
    let multipath = ctx.multipath
        && check_multipathd_running(&*ctx.executor, &ctx.root_helper, ctx.enforce_multipath)?;

    let mut props = PropertyMap::new();
    props.insert("multipath".to_string(), Value::Bool(multipath));
    Ok(props)
}

// =============================================================================
// Device Polling
// =============================================================================

/// Poll until `check` yields a value, at most `attempts` extra rounds.
///
/// `check` receives the attempt number (starting at 0) and returns
/// `Ok(None)` to keep waiting. Between rounds `between` runs (typically a
/// rescan) and the wait grows exponentially from `interval`.
pub fn wait_for<T, C, B>(
    attempts: u32,
    interval: Duration,
    exhausted: impl Fn() -> Error,
    mut check: C,
    mut between: B,
) -> Result<T>
where
    C: FnMut(u32) -> Result<Option<T>>,
    B: FnMut(u32),
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(interval)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build();

    let mut tries = 0u32;
    let operation = || -> std::result::Result<T, backoff::Error<Error>> {
        if let Some(found) = check(tries).map_err(backoff::Error::permanent)? {
            return Ok(found);
        }
        if tries >= attempts {
            return Err(backoff::Error::permanent(exhausted()));
        }
        between(tries);
        tries += 1;
        Err(backoff::Error::transient(exhausted()))
    };

    backoff::retry(policy, operation).map_err(|e| match e {
        backoff::Error::Permanent(err) => err,
        backoff::Error::Transient { err, .. } => err,
    })
}

// =============================================================================
// Multipath
// =============================================================================

/// A device-mapper multipath map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipathDevice {
    /// WWID of the map
    pub id: String,
    /// Map name (WWID or friendly alias)
    pub name: String,
    /// `/dev/mapper/<name>`
    pub device: String,
}

static MULTIPATH_ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\w{3} \d+ \d\d:\d\d:\d\d \|.*$").expect("valid multipath error regex")
});

/// Lines like `Oct 19 12:00:00 | sdb: checker msg` are daemon noise
pub fn is_multipath_error_line(line: &str) -> bool {
    MULTIPATH_ERROR_REGEX.is_match(line)
}

/// Map name and WWID from `multipath -l <dev>` output
pub fn parse_multipath_output(output: &str) -> Option<(String, String)> {
    let first = output
        .trim()
        .lines()
        .find(|line| !is_multipath_error_line(line))?;

    let mut tokens = first.split(' ');
    let mut name = tokens.next()?;
    if MULTIPATH_DEVICE_ACTIONS.contains(&name) {
        name = tokens.next()?;
    }
    if name.is_empty() {
        return None;
    }

    let id = match (first.find('('), first.find(')')) {
        (Some(open), Some(close)) if close > open + 1 => &first[open + 1..close],
        _ => name,
    };
    Some((id.to_string(), name.to_string()))
}

// =============================================================================
// Linux SCSI
// =============================================================================

/// Block device helpers, all privileged work through the executor
#[derive(Clone)]
pub struct LinuxScsi {
    executor: ExecutorRef,
    root_helper: String,
    sysfs_root: PathBuf,
    dev_root: PathBuf,
}

impl LinuxScsi {
    pub fn new(context: &ConnectorContext) -> Self {
        Self {
            executor: context.executor.clone(),
            root_helper: context.options.root_helper.clone(),
            sysfs_root: context.sysfs_root.clone(),
            dev_root: context.dev_root.clone(),
        }
    }

    fn root(&self, request: ExecRequest) -> ExecRequest {
        request.as_root(&self.root_helper)
    }

    /// Kernel name behind a symlink such as a by-path entry
    pub fn get_name_from_path(&self, path: &str) -> String {
        std::fs::canonicalize(path)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.to_string())
    }

    /// SCSI WWN from VPD page 0x83; `None` when `scsi_id` fails
    pub fn get_scsi_wwn(&self, path: &str) -> Option<String> {
        let request = self.root(
            ExecRequest::new("/lib/udev/scsi_id").args(["--page", "0x83", "--whitelisted", path]),
        );
        match self.executor.execute(&request) {
            Ok(output) => Some(output.stdout.trim().to_string()).filter(|w| !w.is_empty()),
            Err(e) => {
                warn!("Could not read the SCSI WWN of {}: {}", path, e);
                None
            }
        }
    }

    /// Size in bytes; `Ok(None)` when `blockdev` prints something that is
    /// not a number
    pub fn get_device_size(&self, device: &str) -> Result<Option<u64>> {
        let request = self.root(ExecRequest::new("blockdev").args(["--getsize64", device]));
        let output = self.executor.execute(&request).map_err(|e| {
            error!("Could not query the size of {}: {}", device, e);
            e
        })?;
        Ok(parse_size(&output.stdout))
    }

    pub fn flush_device_io(&self, device: &str) -> Result<()> {
        debug!("Flushing IO for device {}", device);
        let request = self.root(ExecRequest::new("blockdev").args(["--flushbufs", device]));
        self.executor.execute(&request)?;
        Ok(())
    }

    fn block_control_file(&self, device: &str, control: &str) -> PathBuf {
        let name = device.rsplit('/').next().unwrap_or(device);
        self.sysfs_root
            .join("block")
            .join(name)
            .join("device")
            .join(control)
    }

    fn echo(&self, path: &Path, content: &str) -> Result<()> {
        let request = self.root(
            ExecRequest::new("tee")
                .args(["-a".to_string(), path.to_string_lossy().to_string()])
                .input(content),
        );
        self.executor.execute(&request)?;
        Ok(())
    }

    /// Flush and delete a SCSI device; an absent device is a no-op
    pub fn remove_scsi_device(&self, device: &str) -> Result<()> {
        let delete = self.block_control_file(device, "delete");
        if !delete.exists() {
            debug!("{} is already gone", device);
            return Ok(());
        }
        self.flush_device_io(device)?;
        info!("Removing SCSI device {}", device);
        self.echo(&delete, "1")
    }

    /// Ask the SCSI layer to re-read a device's capacity
    pub fn rescan_device(&self, device: &str) -> Result<()> {
        let rescan = self.block_control_file(device, "rescan");
        debug!("Rescanning {}", device);
        self.echo(&rescan, "1")
    }

    /// Multipath map holding `device`, when one exists on this host
    pub fn find_multipath_device(&self, device: &str) -> Option<MultipathDevice> {
        let request = self.root(ExecRequest::new("multipath").args(["-l", device]));
        let output = match self.executor.execute(&request) {
            Ok(output) => output,
            Err(e) => {
                warn!("multipath call for {} failed: {}", device, e);
                return None;
            }
        };

        let (id, name) = parse_multipath_output(&output.stdout)?;
        let mapper = self.dev_root.join("mapper").join(&name);
        if !mapper.exists() {
            warn!("Couldn't find multipath device {}", mapper.display());
            return None;
        }
        Some(MultipathDevice {
            id,
            name,
            device: mapper.to_string_lossy().to_string(),
        })
    }

    /// `/dev/disk/by-id/dm-uuid-mpath-<wwn>` when udev created it
    pub fn find_multipath_device_path(&self, wwn: &str) -> Option<String> {
        let path = self
            .dev_root
            .join("disk/by-id")
            .join(format!("dm-uuid-mpath-{}", wwn));
        path.exists().then(|| path.to_string_lossy().to_string())
    }

    /// Flush a multipath map; failures are logged only
    pub fn flush_multipath_device(&self, id: &str) {
        let request = self.root(ExecRequest::new("multipath").args(["-f", id]));
        if let Err(e) = self.executor.execute(&request) {
            warn!("multipath flush of {} failed: {}", id, e);
        }
    }

    pub fn resize_multipath_device(&self, name: &str) -> Result<()> {
        let request = self.root(ExecRequest::new("multipathd").args(["resize", "map", name]));
        self.executor.execute(&request)?;
        Ok(())
    }
}

impl std::fmt::Debug for LinuxScsi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxScsi")
            .field("sysfs_root", &self.sysfs_root)
            .field("dev_root", &self.dev_root)
            .finish()
    }
}

/// Parse `blockdev --getsize64` output
pub fn parse_size(output: &str) -> Option<u64> {
    let trimmed = output.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}

/// LUN component of an FC by-path name
pub fn process_lun_id(lun: u64) -> String {
    if lun < 256 {
        lun.to_string()
    } else {
        format!("0x{:04x}{:04x}00000000", lun & 0xffff, (lun >> 16) & 0xffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandOutput, RecordingExecutor};
    use std::cell::Cell;

    #[test]
    fn test_multipathd_probe() {
        let ok = RecordingExecutor::new();
        assert!(check_multipathd_running(&ok, "sudo", true).unwrap());

        let down = || {
            RecordingExecutor::with_script(vec![Err(Error::ProcessExecution {
                command: "multipathd show status".into(),
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "error receiving packet".into(),
            })])
        };
        assert!(!check_multipathd_running(&down(), "sudo", false).unwrap());
        assert!(matches!(
            check_multipathd_running(&down(), "sudo", true),
            Err(Error::MultipathNotRunning { .. })
        ));
    }

    #[test]
    fn test_parse_multipath_output() {
        let output = "Oct 19 10:12:01 | sdb: alua not supported\n\
                      3600508b400105e210000900000490000 dm-2 HP,HSV200\n\
                      size=1.0G features='0' hwhandler='0' wp=rw";
        assert_eq!(
            parse_multipath_output(output),
            Some((
                "3600508b400105e210000900000490000".to_string(),
                "3600508b400105e210000900000490000".to_string()
            ))
        );

        let friendly = "mpatha (36005076303ffc48e0000000000000101) dm-0 IBM,2107900";
        assert_eq!(
            parse_multipath_output(friendly),
            Some((
                "36005076303ffc48e0000000000000101".to_string(),
                "mpatha".to_string()
            ))
        );

        let action = "create: mpathb (3600a0b800049d9f0000000000000001) dm-3 NETAPP,LUN";
        assert_eq!(parse_multipath_output(action).unwrap().1, "mpathb");
        assert_eq!(parse_multipath_output(""), None);
    }

    #[test]
    fn test_multipath_error_line_detection() {
        assert!(is_multipath_error_line("Oct 19 10:12:01 | sdb: alua not supported"));
        assert!(is_multipath_error_line("Jan 2 03:04:05 | checker failed"));
        assert!(!is_multipath_error_line("mpatha (36005076303ffc48e0000000000000101) dm-0 IBM,2107900"));
        assert!(!is_multipath_error_line("Oct 19 10:12 | short clock"));
        assert!(!is_multipath_error_line("October 19 10:12:01 | long month"));
        assert!(!is_multipath_error_line(" Oct 19 10:12:01 | leading space"));
    }

    #[test]
    fn test_size_and_lun_formatting() {
        assert_eq!(parse_size("1073741824\n"), Some(1_073_741_824));
        assert_eq!(parse_size("blockdev: cannot open"), None);
        assert_eq!(parse_size(""), None);

        assert_eq!(process_lun_id(1), "1");
        assert_eq!(process_lun_id(255), "255");
        assert_eq!(process_lun_id(0x4001_0123), "0x0123400100000000");
    }

    #[test]
    fn test_wait_for_rescans_between_attempts() {
        let rescans = Cell::new(0);
        let found = wait_for(
            3,
            Duration::ZERO,
            || Error::VolumeDeviceNotFound { device: "/dev/sdz".into() },
            |attempt| Ok((attempt == 2).then_some("/dev/sdb")),
            |_| rescans.set(rescans.get() + 1),
        )
        .unwrap();
        assert_eq!(found, "/dev/sdb");
        assert_eq!(rescans.get(), 2);

        let rescans = Cell::new(0);
        let err = wait_for::<(), _, _>(
            2,
            Duration::ZERO,
            || Error::VolumeDeviceNotFound { device: "/dev/sdz".into() },
            |_| Ok(None),
            |_| rescans.set(rescans.get() + 1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::VolumeDeviceNotFound { .. }));
        assert_eq!(rescans.get(), 2);
    }

    #[test]
    fn test_device_size_non_numeric_is_none() {
        let executor = std::sync::Arc::new(RecordingExecutor::with_script(vec![Ok(
            CommandOutput::stdout("unknown"),
        )]));
        let scsi = LinuxScsi {
            executor: executor.clone(),
            root_helper: "sudo".into(),
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
        };
        assert_eq!(scsi.get_device_size("/dev/sdb").unwrap(), None);
        assert_eq!(
            executor.command_lines(),
            vec!["blockdev --getsize64 /dev/sdb"]
        );
    }
}
