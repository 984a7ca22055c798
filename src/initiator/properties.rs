//! Host Property Aggregator
//!
//! Builds the host description handed to a storage backend before it
//! exports a volume: the seed facts (`platform`, `os_type`, `ip`, `host`)
//! plus whatever each applicable connector variant probes locally, merged
//! in master list order.

use super::connectors;
use super::registry::CONNECTOR_LIST;
use crate::config::AttachConfig;
use crate::domain::ports::HostPlatform;
use crate::domain::properties::{merge_properties, PropertyMap};
use crate::error::Result;
use crate::executor::{ExecRequest, ExecutorRef, ProcessExecutor};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Where open-iscsi keeps the initiator name
pub const ISCSI_INITIATOR_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

/// Inputs shared by every connector probe
#[derive(Clone)]
pub struct ProbeContext {
    pub root_helper: String,
    pub my_ip: String,
    /// Reported host name; the local hostname when unset
    pub host: Option<String>,
    pub multipath: bool,
    pub enforce_multipath: bool,
    pub executor: ExecutorRef,
    pub platform: HostPlatform,
    pub sysfs_root: PathBuf,
    pub iscsi_initiator_file: PathBuf,
}

impl ProbeContext {
    pub fn new(root_helper: impl Into<String>, my_ip: impl Into<String>, executor: ExecutorRef) -> Self {
        Self {
            root_helper: root_helper.into(),
            my_ip: my_ip.into(),
            host: None,
            multipath: false,
            enforce_multipath: false,
            executor,
            platform: HostPlatform::current(),
            sysfs_root: PathBuf::from("/sys"),
            iscsi_initiator_file: PathBuf::from(ISCSI_INITIATOR_FILE),
        }
    }

    pub fn from_config(config: &AttachConfig, executor: ExecutorRef) -> Self {
        let mut ctx = Self::new(config.root_helper.clone(), config.my_ip.clone(), executor);
        ctx.multipath = config.multipath;
        ctx.enforce_multipath = config.enforce_multipath;
        ctx.sysfs_root = config.sysfs_root.clone();
        ctx
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn multipath(mut self, multipath: bool, enforce: bool) -> Self {
        self.multipath = multipath;
        self.enforce_multipath = enforce;
        self
    }

    pub fn platform(mut self, platform: HostPlatform) -> Self {
        self.platform = platform;
        self
    }

    pub fn sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub fn iscsi_initiator_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.iscsi_initiator_file = path.into();
        self
    }
}

impl std::fmt::Debug for ProbeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeContext")
            .field("root_helper", &self.root_helper)
            .field("my_ip", &self.my_ip)
            .field("host", &self.host)
            .field("multipath", &self.multipath)
            .field("platform", &self.platform)
            .finish()
    }
}

/// Host properties for the running machine
pub fn get_connector_properties(
    root_helper: &str,
    my_ip: &str,
    multipath: bool,
    enforce_multipath: bool,
    host: Option<&str>,
    executor: Option<ExecutorRef>,
) -> Result<PropertyMap> {
    let executor = executor.unwrap_or_else(ProcessExecutor::shared);
    let mut ctx = ProbeContext::new(root_helper, my_ip, executor)
        .multipath(multipath, enforce_multipath);
    ctx.host = host.map(str::to_string);
    collect_properties(&ctx)
}

/// Seed facts plus every applicable probe, merged in master list order
pub fn collect_properties(ctx: &ProbeContext) -> Result<PropertyMap> {
    let host = match &ctx.host {
        Some(host) => host.clone(),
        None => local_hostname(ctx),
    };

    let mut props = PropertyMap::new();
    props.insert("platform".to_string(), Value::String(ctx.platform.arch.clone()));
    props.insert("os_type".to_string(), Value::String(ctx.platform.os.clone()));
    props.insert("ip".to_string(), Value::String(ctx.my_ip.clone()));
    props.insert("host".to_string(), Value::String(host));

    for kind in CONNECTOR_LIST {
        if !kind.applies_to(&ctx.platform.arch, &ctx.platform.os) {
            continue;
        }
        let contributed = connectors::probe(*kind, ctx)?;
        if !contributed.is_empty() {
            debug!("{} contributed {:?}", kind, contributed.keys().collect::<Vec<_>>());
        }
        merge_properties(&mut props, contributed);
    }
    Ok(props)
}

fn local_hostname(ctx: &ProbeContext) -> String {
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let name = contents.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }

    match ctx.executor.execute(&ExecRequest::new("hostname")) {
        Ok(output) if !output.stdout.trim().is_empty() => output.stdout.trim().to_string(),
        Ok(_) => "localhost".to_string(),
        Err(e) => {
            warn!("Could not determine the local hostname: {}", e);
            "localhost".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::executor::{CommandOutput, RecordingExecutor};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;

    const INITIATOR: &str = "InitiatorName=iqn.1993-08.org.debian:01:2e5f4c2a1b\n";

    fn probing_executor(multipathd_up: bool) -> Arc<RecordingExecutor> {
        Arc::new(RecordingExecutor::with_responder(move |request| {
            match request.program.as_str() {
                "cat" => Ok(CommandOutput::stdout(INITIATOR)),
                "multipathd" if !multipathd_up => Err(Error::ProcessExecution {
                    command: request.command_line(),
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: "can't connect to multipathd".into(),
                }),
                "systool" => Ok(CommandOutput::stdout(
                    crate::hardware::discovery::hba::fixtures::SYSTOOL_FC,
                )),
                _ => Ok(CommandOutput::default()),
            }
        }))
    }

    fn context(executor: Arc<RecordingExecutor>, sysfs: &std::path::Path) -> ProbeContext {
        ProbeContext::new("sudo", "10.0.0.5", executor)
            .host("compute-1")
            .platform(HostPlatform::new("x86_64", "linux"))
            .sysfs_root(sysfs)
    }

    #[test]
    fn test_seed_keys_always_present() {
        let sysfs = tempfile::tempdir().unwrap();
        let props = collect_properties(&context(probing_executor(true), sysfs.path())).unwrap();

        assert_eq!(props["platform"], json!("x86_64"));
        assert_eq!(props["os_type"], json!("linux"));
        assert_eq!(props["ip"], json!("10.0.0.5"));
        assert_eq!(props["host"], json!("compute-1"));
        assert_eq!(props["multipath"], json!(false));
        assert_eq!(props["initiator"], json!("iqn.1993-08.org.debian:01:2e5f4c2a1b"));
        // No fc_host class in the fake sysfs
        assert!(!props.contains_key("wwpns"));
        let keys: Vec<_> = props.keys().take(4).cloned().collect();
        assert_eq!(keys, vec!["platform", "os_type", "ip", "host"]);
    }

    #[test]
    fn test_fc_hosts_contribute_wwns() {
        let sysfs = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(sysfs.path().join("class/fc_host")).unwrap();

        let props = collect_properties(&context(probing_executor(true), sysfs.path())).unwrap();

        assert_eq!(props["wwpns"], json!(["50014380242b9750", "50014380242b9752"]));
        assert_eq!(props["wwnns"], json!(["50014380242b9751", "50014380242b9753"]));
    }

    #[test]
    fn test_properties_are_idempotent() {
        let sysfs = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(sysfs.path().join("class/fc_host")).unwrap();
        let ctx = context(probing_executor(true), sysfs.path()).multipath(true, false);

        let first = collect_properties(&ctx).unwrap();
        let second = collect_properties(&ctx).unwrap();

        assert_eq!(first, second);
        assert_eq!(first["multipath"], json!(true));
    }

    #[test]
    fn test_multipath_enforcement() {
        let sysfs = tempfile::tempdir().unwrap();

        let lenient = context(probing_executor(false), sysfs.path()).multipath(true, false);
        assert_eq!(collect_properties(&lenient).unwrap()["multipath"], json!(false));

        let strict = context(probing_executor(false), sysfs.path()).multipath(true, true);
        assert_matches!(
            collect_properties(&strict),
            Err(Error::MultipathNotRunning { .. })
        );
    }

    #[test]
    fn test_windows_host_skips_linux_probes() {
        let sysfs = tempfile::tempdir().unwrap();
        let executor = probing_executor(true);
        let ctx = context(executor.clone(), sysfs.path())
            .platform(HostPlatform::new("AMD64", "win32"));

        let props = collect_properties(&ctx).unwrap();

        assert_eq!(props.len(), 4);
        assert!(executor.requests().is_empty());
    }

    #[test]
    fn test_hostname_fallback_is_never_empty() {
        let sysfs = tempfile::tempdir().unwrap();
        let mut ctx = context(probing_executor(true), sysfs.path());
        ctx.host = None;

        let props = collect_properties(&ctx).unwrap();
        assert!(!props["host"].as_str().unwrap().is_empty());
    }
}
