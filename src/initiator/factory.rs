//! Connector Factory
//!
//! Turns a protocol name into a ready connector. The host platform picks
//! the mapping table, the table picks the [`ConnectorKind`], and the kind is
//! built either by a registered [`ConnectorBuilder`] or by one of the
//! connectors implemented in this crate.

use super::connectors::{FibreChannelConnector, LocalConnector, StorPoolApiRef, StorPoolConnector};
use super::registry::{ConnectorKind, MappingTable, ISER, REMOTE_FS_PROTOCOLS};
use crate::config::{AttachConfig, DEVICE_SCAN_ATTEMPTS_DEFAULT};
use crate::domain::ports::{ConnectorRef, HostPlatform};
use crate::error::{Error, Result};
use crate::executor::{ExecutorRef, ProcessExecutor};
use crate::locking::{ResourceLocks, DEFAULT_LOCK_PREFIX};
use crate::metrics;
use indexmap::IndexMap;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

// =============================================================================
// Connector Options
// =============================================================================

/// Per-connector settings supplied by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorOptions {
    /// Command prefix for privileged operations
    pub root_helper: String,
    /// Opaque driver handle forwarded to plugins
    pub driver: Option<String>,
    pub use_multipath: bool,
    /// Polling rounds while waiting for a device after a rescan
    pub device_scan_attempts: u32,
    /// Initial delay between polling rounds
    pub scan_interval: Duration,
    /// Set for the remote filesystem family, e.g. `nfs`
    pub mount_type: Option<String>,
    /// Set to `iser` for ISER
    pub transport: Option<String>,
    /// Protocol-specific keyword options
    pub extra: IndexMap<String, Value>,
}

impl ConnectorOptions {
    pub fn new(root_helper: impl Into<String>) -> Self {
        Self {
            root_helper: root_helper.into(),
            driver: None,
            use_multipath: false,
            device_scan_attempts: DEVICE_SCAN_ATTEMPTS_DEFAULT,
            scan_interval: Duration::from_secs(2),
            mount_type: None,
            transport: None,
            extra: IndexMap::new(),
        }
    }

    /// Seed options from the host configuration
    pub fn from_config(config: &AttachConfig) -> Self {
        Self::new(config.root_helper.clone())
            .use_multipath(config.multipath)
            .device_scan_attempts(config.device_scan_attempts)
            .scan_interval(config.scan_interval())
    }

    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    pub fn use_multipath(mut self, use_multipath: bool) -> Self {
        self.use_multipath = use_multipath;
        self
    }

    pub fn device_scan_attempts(mut self, attempts: u32) -> Self {
        self.device_scan_attempts = attempts;
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self::new("sudo")
    }
}

// =============================================================================
// Connector Context
// =============================================================================

/// Everything a connector is constructed with
#[derive(Clone)]
pub struct ConnectorContext {
    pub kind: ConnectorKind,
    pub options: ConnectorOptions,
    pub executor: ExecutorRef,
    pub locks: Arc<ResourceLocks>,
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
}

impl ConnectorContext {
    pub fn new(kind: ConnectorKind, options: ConnectorOptions, executor: ExecutorRef) -> Self {
        Self {
            kind,
            options,
            executor,
            locks: ResourceLocks::shared(DEFAULT_LOCK_PREFIX),
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
        }
    }

    pub fn with_roots(mut self, sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = sysfs_root.into();
        self.dev_root = dev_root.into();
        self
    }

    pub fn with_locks(mut self, locks: Arc<ResourceLocks>) -> Self {
        self.locks = locks;
        self
    }
}

impl std::fmt::Debug for ConnectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorContext")
            .field("kind", &self.kind)
            .field("options", &self.options)
            .field("sysfs_root", &self.sysfs_root)
            .field("dev_root", &self.dev_root)
            .finish()
    }
}

// =============================================================================
// Plugins
// =============================================================================

/// Builds a connector for a kind this crate does not implement
pub trait ConnectorBuilder: Send + Sync {
    fn build(&self, context: ConnectorContext) -> Result<ConnectorRef>;
}

impl<F> ConnectorBuilder for F
where
    F: Fn(ConnectorContext) -> Result<ConnectorRef> + Send + Sync,
{
    fn build(&self, context: ConnectorContext) -> Result<ConnectorRef> {
        self(context)
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Outcome of a protocol lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Upper-cased protocol
    pub protocol: String,
    pub kind: ConnectorKind,
    pub table: MappingTable,
    pub mount_type: Option<String>,
    pub transport: Option<String>,
}

/// Builds connectors for one host
pub struct ConnectorFactory {
    executor: ExecutorRef,
    platform: HostPlatform,
    locks: Arc<ResourceLocks>,
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    storpool_api: Option<StorPoolApiRef>,
    plugins: IndexMap<ConnectorKind, Arc<dyn ConnectorBuilder>>,
}

impl ConnectorFactory {
    pub fn builder() -> ConnectorFactoryBuilder {
        ConnectorFactoryBuilder::default()
    }

    pub fn platform(&self) -> &HostPlatform {
        &self.platform
    }

    pub fn table(&self) -> MappingTable {
        MappingTable::for_platform(&self.platform)
    }

    pub fn locks(&self) -> &Arc<ResourceLocks> {
        &self.locks
    }

    /// Protocols this host's table knows, in table order
    pub fn protocols(&self) -> Vec<&'static str> {
        self.table().protocols()
    }

    /// Map a protocol name to its connector kind
    pub fn resolve(&self, protocol: &str) -> Result<Resolution> {
        let table = self.table();
        let protocol = protocol.to_uppercase();

        let kind = table.lookup(&protocol).ok_or_else(|| {
            error!("Invalid InitiatorConnector protocol specified {}", protocol);
            Error::InvalidConnectorProtocol {
                protocol: protocol.clone(),
            }
        })?;

        let mount_type = REMOTE_FS_PROTOCOLS
            .contains(&protocol.as_str())
            .then(|| protocol.to_lowercase());
        let transport = (protocol == ISER).then(|| "iser".to_string());

        debug!("Protocol {} resolves to {} ({} table)", protocol, kind, table);
        Ok(Resolution {
            protocol,
            kind,
            table,
            mount_type,
            transport,
        })
    }

    /// Build the connector for `protocol`
    pub fn build(&self, protocol: &str, options: ConnectorOptions) -> Result<ConnectorRef> {
        let result = self.resolve(protocol).and_then(|resolution| {
            let mut options = options;
            if resolution.mount_type.is_some() {
                options.mount_type = resolution.mount_type.clone();
            }
            if resolution.transport.is_some() {
                options.transport = resolution.transport.clone();
            }
            self.instantiate(resolution.kind, options)
        });

        metrics::record_connector_build(&protocol.to_uppercase(), result.is_ok());
        match &result {
            Ok(connector) => info!("Built {} for protocol {}", connector.name(), protocol),
            Err(e) => error!("Could not build a connector for {}: {}", protocol, e),
        }
        result
    }

    /// Positional form of [`Self::build`]
    pub fn build_connector(
        &self,
        protocol: &str,
        root_helper: &str,
        driver: Option<&str>,
        use_multipath: bool,
        device_scan_attempts: u32,
    ) -> Result<ConnectorRef> {
        let mut options = ConnectorOptions::new(root_helper)
            .use_multipath(use_multipath)
            .device_scan_attempts(device_scan_attempts);
        options.driver = driver.map(str::to_string);
        self.build(protocol, options)
    }

    fn context(&self, kind: ConnectorKind, options: ConnectorOptions) -> ConnectorContext {
        ConnectorContext::new(kind, options, self.executor.clone())
            .with_roots(self.sysfs_root.clone(), self.dev_root.clone())
            .with_locks(self.locks.clone())
    }

    fn instantiate(&self, kind: ConnectorKind, options: ConnectorOptions) -> Result<ConnectorRef> {
        let context = self.context(kind, options);
        if let Some(plugin) = self.plugins.get(&kind) {
            debug!("Using registered builder for {}", kind);
            return plugin.build(context);
        }

        match kind {
            ConnectorKind::FibreChannel => Ok(Arc::new(FibreChannelConnector::new(context))),
            ConnectorKind::FibreChannelS390x => Ok(Arc::new(FibreChannelConnector::s390x(context))),
            ConnectorKind::Local | ConnectorKind::Gpfs => Ok(Arc::new(LocalConnector::new(context))),
            ConnectorKind::StorPool => Ok(Arc::new(StorPoolConnector::new(
                context,
                self.storpool_api.clone(),
            )?)),
            other => Err(Error::ConnectorUnavailable {
                connector: other.name().to_string(),
                reason: "no implementation registered".to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for ConnectorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorFactory")
            .field("platform", &self.platform)
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Assembles a [`ConnectorFactory`]
pub struct ConnectorFactoryBuilder {
    executor: Option<ExecutorRef>,
    platform: HostPlatform,
    locks: Option<Arc<ResourceLocks>>,
    lock_prefix: String,
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    storpool_api: Option<StorPoolApiRef>,
    plugins: IndexMap<ConnectorKind, Arc<dyn ConnectorBuilder>>,
}

impl Default for ConnectorFactoryBuilder {
    fn default() -> Self {
        Self {
            executor: None,
            platform: HostPlatform::current(),
            locks: None,
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            storpool_api: None,
            plugins: IndexMap::new(),
        }
    }
}

impl ConnectorFactoryBuilder {
    /// Filesystem roots and lock prefix from the host configuration
    pub fn from_config(mut self, config: &AttachConfig) -> Self {
        self.sysfs_root = config.sysfs_root.clone();
        self.dev_root = config.dev_root.clone();
        self.lock_prefix = config.lock_prefix.clone();
        self
    }

    pub fn executor(mut self, executor: ExecutorRef) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn platform(mut self, platform: HostPlatform) -> Self {
        self.platform = platform;
        self
    }

    /// Override only the CPU architecture
    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.platform.arch = arch.into();
        self
    }

    pub fn locks(mut self, locks: Arc<ResourceLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub fn dev_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.dev_root = root.into();
        self
    }

    pub fn storpool_api(mut self, api: StorPoolApiRef) -> Self {
        self.storpool_api = Some(api);
        self
    }

    /// Use `builder` for `kind`, ahead of any in-tree implementation
    pub fn register(mut self, kind: ConnectorKind, builder: impl ConnectorBuilder + 'static) -> Self {
        self.plugins.insert(kind, Arc::new(builder));
        self
    }

    pub fn build(self) -> ConnectorFactory {
        let lock_prefix = self.lock_prefix;
        ConnectorFactory {
            executor: self.executor.unwrap_or_else(ProcessExecutor::shared),
            platform: self.platform,
            locks: self
                .locks
                .unwrap_or_else(|| ResourceLocks::shared(lock_prefix)),
            sysfs_root: self.sysfs_root,
            dev_root: self.dev_root,
            storpool_api: self.storpool_api,
            plugins: self.plugins,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{platform_matches, os_matches, Connector, DeviceInfo};
    use crate::domain::properties::ConnectionProperties;
    use crate::executor::RecordingExecutor;
    use assert_matches::assert_matches;

    fn factory(platform: HostPlatform) -> ConnectorFactory {
        ConnectorFactory::builder()
            .executor(Arc::new(RecordingExecutor::new()))
            .platform(platform)
            .build()
    }

    fn linux() -> ConnectorFactory {
        factory(HostPlatform::new("x86_64", "linux"))
    }

    struct StubConnector;

    impl Connector for StubConnector {
        fn name(&self) -> &'static str {
            "StubConnector"
        }
        fn connect_volume(&self, _props: &ConnectionProperties) -> Result<DeviceInfo> {
            Ok(DeviceInfo::new("block", "/dev/stub"))
        }
        fn disconnect_volume(
            &self,
            _props: &ConnectionProperties,
            _device_info: Option<&DeviceInfo>,
        ) -> Result<()> {
            Ok(())
        }
        fn get_volume_paths(&self, _props: &ConnectionProperties) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn get_search_path(&self) -> Option<String> {
            None
        }
        fn get_all_available_volumes(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn extend_volume(&self, _props: &ConnectionProperties) -> Result<Option<u64>> {
            Ok(None)
        }
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let resolution = linux().resolve("fibre_channel").unwrap();
        assert_eq!(resolution.protocol, "FIBRE_CHANNEL");
        assert_eq!(resolution.kind, ConnectorKind::FibreChannel);
        assert_eq!(resolution.table, MappingTable::Linux);
    }

    #[test]
    fn test_remote_fs_and_iser_hints() {
        let factory = linux();

        for protocol in REMOTE_FS_PROTOCOLS {
            let resolution = factory.resolve(protocol).unwrap();
            assert_eq!(resolution.kind, ConnectorKind::RemoteFs);
            assert_eq!(resolution.mount_type, Some(protocol.to_lowercase()));
        }

        let iser = factory.resolve("iser").unwrap();
        assert_eq!(iser.kind, ConnectorKind::Iscsi);
        assert_eq!(iser.transport.as_deref(), Some("iser"));
        assert_eq!(factory.resolve("ISCSI").unwrap().transport, None);
    }

    #[test]
    fn test_unknown_protocol() {
        assert_matches!(
            linux().resolve("bogus"),
            Err(Error::InvalidConnectorProtocol { ref protocol }) if protocol == "BOGUS"
        );

        // Only the Windows table serves SMBFS
        let s390 = factory(HostPlatform::new("s390x", "linux"));
        assert_matches!(s390.resolve("SMBFS"), Err(Error::InvalidConnectorProtocol { .. }));
        assert_matches!(linux().build("SMBFS", ConnectorOptions::default()), Err(_));
    }

    #[test]
    fn test_table_selection_by_platform() {
        let s390 = factory(HostPlatform::new("s390x", "linux"));
        assert_eq!(
            s390.resolve("FIBRE_CHANNEL").unwrap().kind,
            ConnectorKind::FibreChannelS390x
        );

        let windows = factory(HostPlatform::new("s390x", "windows"));
        assert_eq!(windows.table(), MappingTable::Windows);
        assert_eq!(windows.resolve("iscsi").unwrap().kind, ConnectorKind::WindowsIscsi);

        let overridden = ConnectorFactory::builder()
            .executor(Arc::new(RecordingExecutor::new()))
            .platform(HostPlatform::new("x86_64", "linux"))
            .arch("s390")
            .build();
        assert_eq!(overridden.table(), MappingTable::LinuxS390x);
    }

    #[test]
    fn test_resolved_kinds_fit_their_host() {
        let hosts = [
            HostPlatform::new("x86_64", "linux"),
            HostPlatform::new("s390x", "linux"),
            HostPlatform::new("x86_64", "windows"),
        ];
        for host in hosts {
            let factory = factory(host.clone());
            for protocol in factory.protocols() {
                let kind = factory.resolve(protocol).unwrap().kind;
                assert!(
                    platform_matches(&host.arch, kind.platform())
                        && os_matches(&host.os, kind.os_type()),
                    "{} -> {} does not fit {:?}",
                    protocol,
                    kind,
                    host
                );
            }
        }
    }

    #[test]
    fn test_build_in_tree_connectors() {
        let factory = linux();

        let fc = factory.build_connector("FIBRE_CHANNEL", "sudo", None, false, 3).unwrap();
        assert_eq!(fc.name(), "FibreChannelConnector");
        let local = factory.build("local", ConnectorOptions::default()).unwrap();
        assert_eq!(local.name(), "LocalConnector");
        let gpfs = factory.build("GPFS", ConnectorOptions::default()).unwrap();
        assert_eq!(gpfs.name(), "GPFSConnector");

        let s390 = factory_with_arch("s390x");
        assert_eq!(
            s390.build("FIBRE_CHANNEL", ConnectorOptions::default()).unwrap().name(),
            "FibreChannelConnectorS390X"
        );
    }

    fn factory_with_arch(arch: &str) -> ConnectorFactory {
        factory(HostPlatform::new(arch, "linux"))
    }

    #[test]
    fn test_unimplemented_kinds_are_unavailable() {
        let factory = linux();

        assert_matches!(
            factory.build("RBD", ConnectorOptions::default()),
            Err(Error::ConnectorUnavailable { ref connector, .. }) if connector == "RBDConnector"
        );
        assert_matches!(
            factory.build("STORPOOL", ConnectorOptions::default()),
            Err(Error::ConnectorUnavailable { ref reason, .. })
                if reason.contains("StorPool API bindings")
        );
    }

    #[test]
    fn test_registered_builder_receives_hints() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let captured = seen.clone();
        let factory = ConnectorFactory::builder()
            .executor(Arc::new(RecordingExecutor::new()))
            .platform(HostPlatform::new("x86_64", "linux"))
            .register(ConnectorKind::RemoteFs, move |context: ConnectorContext| -> Result<ConnectorRef> {
                *captured.lock() = Some(context.options.clone());
                Ok(Arc::new(StubConnector) as ConnectorRef)
            })
            .build();

        let options = ConnectorOptions::new("sudo -n").driver("cinder");
        let connector = factory.build("nfs", options).unwrap();

        assert_eq!(connector.name(), "StubConnector");
        let options = seen.lock().clone().unwrap();
        assert_eq!(options.mount_type.as_deref(), Some("nfs"));
        assert_eq!(options.driver.as_deref(), Some("cinder"));
        assert_eq!(options.root_helper, "sudo -n");
    }

    #[test]
    fn test_registered_builder_overrides_in_tree() {
        let factory = ConnectorFactory::builder()
            .executor(Arc::new(RecordingExecutor::new()))
            .platform(HostPlatform::new("x86_64", "linux"))
            .register(ConnectorKind::Local, |_context: ConnectorContext| -> Result<ConnectorRef> {
                Ok(Arc::new(StubConnector) as ConnectorRef)
            })
            .build();

        let local = factory.build("LOCAL", ConnectorOptions::default()).unwrap();
        assert_eq!(local.name(), "StubConnector");
    }

    #[test]
    fn test_build_counts_outcomes() {
        let counter = |result: &str| {
            metrics::metrics()
                .connector_builds
                .with_label_values(&["HGST", result])
                .get()
        };
        let before = counter("error");

        assert!(linux().build("hgst", ConnectorOptions::default()).is_err());
        assert_eq!(counter("error"), before + 1);
    }
}
