//! Fibre Channel Connector
//!
//! Attaches FC LUNs by watching for `/dev/disk/by-path` entries built from
//! each HBA's PCI address, the target WWPN and the LUN, rescanning the SCSI
//! hosts between polls. On S390X the zfcp dialect in
//! [`super::fibre_channel_s390x`] replaces path naming and device removal.

use super::base::{self, LinuxScsi};
use crate::domain::ports::{Connector, DeviceInfo};
use crate::domain::properties::{ConnectionProperties, PropertyMap};
use crate::error::{Error, Result};
use crate::hardware::discovery::{Hba, LinuxFibreChannel, LinuxFibreChannelS390x};
use crate::initiator::factory::ConnectorContext;
use crate::initiator::properties::ProbeContext;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info, warn};

/// Which sysfs/by-path naming scheme the host uses
#[derive(Debug, Clone)]
pub(crate) enum FcDialect {
    Pci,
    Zfcp(LinuxFibreChannelS390x),
}

/// Fibre Channel attach/detach
#[derive(Debug, Clone)]
pub struct FibreChannelConnector {
    pub(crate) context: ConnectorContext,
    pub(crate) fc: LinuxFibreChannel,
    pub(crate) scsi: LinuxScsi,
    pub(crate) dialect: FcDialect,
}

/// PCI address of an HBA: the path segment right before the first
/// `host*` or `net*` segment
pub fn pci_num(device_path: &str) -> Option<&str> {
    let segments: Vec<&str> = device_path.split('/').collect();
    segments
        .iter()
        .position(|s| s.starts_with("host") || s.starts_with("net"))
        .filter(|&index| index > 0)
        .map(|index| segments[index - 1])
}

impl FibreChannelConnector {
    pub fn new(context: ConnectorContext) -> Self {
        let fc = LinuxFibreChannel::new(context.executor.clone(), &context.options.root_helper)
            .with_sysfs_root(&context.sysfs_root)
            .with_locks(context.locks.clone());
        let scsi = LinuxScsi::new(&context);
        Self {
            context,
            fc,
            scsi,
            dialect: FcDialect::Pci,
        }
    }

    /// `wwpns`/`wwnns` of the local HBAs, when the host has FC at all
    pub fn get_connector_properties(ctx: &ProbeContext) -> Result<PropertyMap> {
        let mut props = PropertyMap::new();
        let fc = LinuxFibreChannel::new(ctx.executor.clone(), &ctx.root_helper)
            .with_sysfs_root(&ctx.sysfs_root);
        if !fc.has_fc_support() {
            debug!("No Fibre Channel support detected on system");
            return Ok(props);
        }

        let hbas = fc.discover_hbas();
        let wwpns: Vec<Value> = hbas
            .iter()
            .filter(|hba| !hba.port_name.is_empty())
            .map(|hba| Value::String(hba.port_name.clone()))
            .collect();
        let wwnns: Vec<Value> = hbas
            .iter()
            .filter(|hba| !hba.node_name.is_empty())
            .map(|hba| Value::String(hba.node_name.clone()))
            .collect();

        if !wwpns.is_empty() {
            props.insert("wwpns".to_string(), Value::Array(wwpns));
        }
        if !wwnns.is_empty() {
            props.insert("wwnns".to_string(), Value::Array(wwnns));
        }
        Ok(props)
    }

    fn by_path_dir(&self) -> std::path::PathBuf {
        self.context.dev_root.join("disk/by-path")
    }

    fn target_wwns(props: &ConnectionProperties) -> Result<Vec<String>> {
        let wwns = props.string_list("target_wwn")?;
        if wwns.is_empty() {
            return Err(Error::invalid_property("target_wwn", "no target WWNs given"));
        }
        Ok(wwns)
    }

    /// `(adapter address, 0x<target wwn>)` for every HBA/target pair
    pub(crate) fn possible_devices(&self, hbas: &[Hba], wwns: &[String]) -> Vec<(String, String)> {
        let mut devices = Vec::new();
        for hba in hbas {
            let address = match &self.dialect {
                FcDialect::Pci => pci_num(&hba.device_path),
                FcDialect::Zfcp(_) => hba.ccw_device_number(),
            };
            let Some(address) = address else {
                debug!("No adapter address in {}", hba.device_path);
                continue;
            };
            for wwn in wwns {
                devices.push((address.to_string(), format!("0x{}", wwn.to_lowercase())));
            }
        }
        devices
    }

    fn host_device(&self, address: &str, target_wwn: &str, lun: u64) -> String {
        let name = match &self.dialect {
            FcDialect::Pci => format!(
                "pci-{}-fc-{}-lun-{}",
                address,
                target_wwn,
                base::process_lun_id(lun)
            ),
            FcDialect::Zfcp(_) => {
                crate::hardware::discovery::zfcp_by_path_name(address, target_wwn, lun)
            }
        };
        self.by_path_dir().join(name).to_string_lossy().to_string()
    }

    /// Candidate by-path nodes for the volume, present or not
    pub fn possible_volume_paths(
        &self,
        props: &ConnectionProperties,
        hbas: &[Hba],
    ) -> Result<Vec<String>> {
        let wwns = Self::target_wwns(props)?;
        let lun = props.require_u64("target_lun")?;
        Ok(self
            .possible_devices(hbas, &wwns)
            .iter()
            .map(|(address, wwn)| self.host_device(address, wwn, lun))
            .collect())
    }

    fn lock_key(props: &ConnectionProperties) -> String {
        let wwns = props.string_list("target_wwn").unwrap_or_default().join(",");
        let lun = props.get_scalar("target_lun").unwrap_or_default();
        format!("fc:{}:{}", wwns, lun)
    }

    fn discover_mpath_device(
        &self,
        device_wwn: Option<&str>,
        device_name: &str,
    ) -> Option<(String, String)> {
        if let Some(wwn) = device_wwn {
            if let Some(path) = self.scsi.find_multipath_device_path(wwn) {
                return Some((path, wwn.to_string()));
            }
        }
        self.scsi
            .find_multipath_device(device_name)
            .map(|mpath| (mpath.device, mpath.id))
    }
}

impl Connector for FibreChannelConnector {
    fn name(&self) -> &'static str {
        self.context.kind.name()
    }

    fn connect_volume(&self, props: &ConnectionProperties) -> Result<DeviceInfo> {
        debug!("connect_volume {:?}", props);
        let _guard = self.context.locks.lock(&Self::lock_key(props));

        let lun = props.require_u64("target_lun")?;
        let hbas = self.fc.discover_hbas();
        let host_devices = self.possible_volume_paths(props, &hbas)?;
        if host_devices.is_empty() {
            warn!("We are unable to locate any Fibre Channel devices");
            return Err(Error::NoFibreChannelHostsFound);
        }

        if let FcDialect::Zfcp(zfcp) = &self.dialect {
            self.configure_zfcp_units(zfcp, props, &hbas)?;
        }

        let host_device = base::wait_for(
            self.context.options.device_scan_attempts,
            self.context.options.scan_interval,
            || Error::VolumeDeviceNotFound {
                device: host_devices.join(", "),
            },
            |attempt| {
                let found = host_devices.iter().find(|d| Path::new(d).exists()).cloned();
                if found.is_none() && attempt > 0 {
                    warn!("Fibre Channel volume not yet found, attempt {}", attempt);
                }
                Ok(found)
            },
            |_| self.fc.rescan_hosts(&hbas, lun),
        )?;

        let device_name = self.scsi.get_name_from_path(&host_device);
        info!("Found Fibre Channel volume {} ({})", host_device, device_name);

        let scsi_wwn = self.scsi.get_scsi_wwn(&host_device);
        let mut info = DeviceInfo::new("block", host_device.clone());
        info.scsi_wwn = scsi_wwn.clone();

        if self.context.options.use_multipath {
            if let Some((path, id)) = self.discover_mpath_device(scsi_wwn.as_deref(), &device_name)
            {
                info.path = path;
                info.multipath_id = Some(id);
            }
        }
        Ok(info)
    }

    fn disconnect_volume(
        &self,
        props: &ConnectionProperties,
        device_info: Option<&DeviceInfo>,
    ) -> Result<()> {
        debug!("disconnect_volume {:?}", props);
        let _guard = self.context.locks.lock(&Self::lock_key(props));

        let hbas = self.fc.discover_hbas();
        let volume_paths: Vec<String> = self
            .possible_volume_paths(props, &hbas)?
            .into_iter()
            .filter(|p| Path::new(p).exists())
            .collect();

        let mut wwn = device_info.and_then(|d| d.scsi_wwn.clone());
        let mut devices = Vec::new();
        for path in &volume_paths {
            if wwn.is_none() {
                wwn = self.scsi.get_scsi_wwn(path);
            }
            devices.push(self.scsi.get_name_from_path(path));
        }
        debug!("devices to remove = {:?}", devices);

        if self.context.options.use_multipath {
            let mpath = device_info
                .and_then(|d| d.multipath_id.clone())
                .or_else(|| wwn.clone());
            if let Some(id) = mpath {
                self.scsi.flush_multipath_device(&id);
            }
        }

        match &self.dialect {
            FcDialect::Pci => {
                for device in &devices {
                    self.scsi.remove_scsi_device(device)?;
                }
            }
            FcDialect::Zfcp(zfcp) => self.deconfigure_zfcp_units(zfcp, props, &hbas)?,
        }
        Ok(())
    }

    fn get_volume_paths(&self, props: &ConnectionProperties) -> Result<Vec<String>> {
        let hbas = self.fc.discover_hbas();
        Ok(self
            .possible_volume_paths(props, &hbas)?
            .into_iter()
            .filter(|p| Path::new(p).exists())
            .collect())
    }

    fn get_search_path(&self) -> Option<String> {
        Some(self.by_path_dir().to_string_lossy().to_string())
    }

    fn get_all_available_volumes(&self) -> Result<Vec<String>> {
        let pattern = format!("{}/*-fc-*", self.by_path_dir().display());
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::Internal(format!("bad glob pattern {}: {}", pattern, e)))?;
        let mut volumes: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        volumes.sort();
        Ok(volumes)
    }

    fn extend_volume(&self, props: &ConnectionProperties) -> Result<Option<u64>> {
        let _guard = self.context.locks.lock(&Self::lock_key(props));
        let volume_paths = self.get_volume_paths(props)?;
        let Some(first) = volume_paths.first() else {
            return Err(Error::VolumeDeviceNotFound {
                device: Self::lock_key(props),
            });
        };

        for path in &volume_paths {
            let device = self.scsi.get_name_from_path(path);
            self.scsi.rescan_device(&device)?;
        }

        let device = self.scsi.get_name_from_path(first);
        if self.context.options.use_multipath {
            if let Some(mpath) = self.scsi.find_multipath_device(&device) {
                self.scsi.resize_multipath_device(&mpath.name)?;
                return self.scsi.get_device_size(&mpath.device);
            }
        }
        self.scsi.get_device_size(&device)
    }
}
