//! Connector Registry
//!
//! The closed set of connector variants, their platform/OS tags, the master
//! list walked by the host property aggregator, and the three protocol
//! mapping tables consulted by the factory. All of it is static data.

use crate::domain::ports::{HostPlatform, OsTypeTag, PlatformTag};
use serde::{Deserialize, Serialize};

// =============================================================================
// Protocol Names
// =============================================================================

pub const ISCSI: &str = "ISCSI";
pub const ISER: &str = "ISER";
pub const FIBRE_CHANNEL: &str = "FIBRE_CHANNEL";
pub const AOE: &str = "AOE";
pub const DRBD: &str = "DRBD";
pub const NFS: &str = "NFS";
pub const SMBFS: &str = "SMBFS";
pub const GLUSTERFS: &str = "GLUSTERFS";
pub const LOCAL: &str = "LOCAL";
pub const HUAWEISDSHYPERVISOR: &str = "HUAWEISDSHYPERVISOR";
pub const HGST: &str = "HGST";
pub const RBD: &str = "RBD";
pub const SCALEIO: &str = "SCALEIO";
pub const SCALITY: &str = "SCALITY";
pub const QUOBYTE: &str = "QUOBYTE";
pub const DISCO: &str = "DISCO";
pub const VZSTORAGE: &str = "VZSTORAGE";
pub const SHEEPDOG: &str = "SHEEPDOG";
pub const VMDK: &str = "VMDK";
pub const GPFS: &str = "GPFS";
pub const STORPOOL: &str = "STORPOOL";

/// Protocols served by the shared remote-filesystem connector
pub const REMOTE_FS_PROTOCOLS: &[&str] = &[NFS, GLUSTERFS, SCALITY, QUOBYTE, VZSTORAGE];

// =============================================================================
// Connector Kinds
// =============================================================================

/// Every connector variant known to the framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectorKind {
    BaseLinux,
    Iscsi,
    FibreChannel,
    FibreChannelS390x,
    Aoe,
    RemoteFs,
    Rbd,
    Local,
    Gpfs,
    Drbd,
    HuaweiStorHyper,
    Hgst,
    ScaleIo,
    Disco,
    Vmdk,
    Sheepdog,
    StorPool,
    BaseWindows,
    WindowsIscsi,
    WindowsFc,
    WindowsSmbfs,
}

/// Variants probed for host properties, in merge order
pub const CONNECTOR_LIST: &[ConnectorKind] = &[
    ConnectorKind::BaseLinux,
    ConnectorKind::Iscsi,
    ConnectorKind::FibreChannel,
    ConnectorKind::FibreChannelS390x,
    ConnectorKind::Aoe,
    ConnectorKind::RemoteFs,
    ConnectorKind::Rbd,
    ConnectorKind::Local,
    ConnectorKind::Gpfs,
    ConnectorKind::Drbd,
    ConnectorKind::HuaweiStorHyper,
    ConnectorKind::Hgst,
    ConnectorKind::ScaleIo,
    ConnectorKind::Disco,
    ConnectorKind::Vmdk,
    ConnectorKind::BaseWindows,
    ConnectorKind::WindowsIscsi,
    ConnectorKind::WindowsFc,
    ConnectorKind::WindowsSmbfs,
];

impl ConnectorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectorKind::BaseLinux => "BaseLinuxConnector",
            ConnectorKind::Iscsi => "ISCSIConnector",
            ConnectorKind::FibreChannel => "FibreChannelConnector",
            ConnectorKind::FibreChannelS390x => "FibreChannelConnectorS390X",
            ConnectorKind::Aoe => "AoEConnector",
            ConnectorKind::RemoteFs => "RemoteFsConnector",
            ConnectorKind::Rbd => "RBDConnector",
            ConnectorKind::Local => "LocalConnector",
            ConnectorKind::Gpfs => "GPFSConnector",
            ConnectorKind::Drbd => "DRBDConnector",
            ConnectorKind::HuaweiStorHyper => "HuaweiStorHyperConnector",
            ConnectorKind::Hgst => "HGSTConnector",
            ConnectorKind::ScaleIo => "ScaleIOConnector",
            ConnectorKind::Disco => "DISCOConnector",
            ConnectorKind::Vmdk => "VmdkConnector",
            ConnectorKind::Sheepdog => "SheepdogConnector",
            ConnectorKind::StorPool => "StorPoolConnector",
            ConnectorKind::BaseWindows => "BaseWindowsConnector",
            ConnectorKind::WindowsIscsi => "WindowsISCSIConnector",
            ConnectorKind::WindowsFc => "WindowsFCConnector",
            ConnectorKind::WindowsSmbfs => "WindowsSMBFSConnector",
        }
    }

    pub fn platform(&self) -> PlatformTag {
        match self {
            ConnectorKind::FibreChannelS390x => PlatformTag::S390,
            _ => PlatformTag::All,
        }
    }

    pub fn os_type(&self) -> OsTypeTag {
        match self {
            ConnectorKind::Vmdk => OsTypeTag::All,
            ConnectorKind::BaseWindows
            | ConnectorKind::WindowsIscsi
            | ConnectorKind::WindowsFc
            | ConnectorKind::WindowsSmbfs => OsTypeTag::Win,
            _ => OsTypeTag::Linux,
        }
    }

    /// Do this variant's tags admit a host reporting `platform` / `os_type`?
    pub fn applies_to(&self, platform: &str, os_type: &str) -> bool {
        crate::domain::ports::platform_matches(platform, self.platform())
            && crate::domain::ports::os_matches(os_type, self.os_type())
    }
}

impl std::fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Mapping Tables
// =============================================================================

const LINUX_MAPPING: &[(&str, ConnectorKind)] = &[
    (AOE, ConnectorKind::Aoe),
    (DRBD, ConnectorKind::Drbd),
    (GLUSTERFS, ConnectorKind::RemoteFs),
    (NFS, ConnectorKind::RemoteFs),
    (SCALITY, ConnectorKind::RemoteFs),
    (QUOBYTE, ConnectorKind::RemoteFs),
    (VZSTORAGE, ConnectorKind::RemoteFs),
    (ISCSI, ConnectorKind::Iscsi),
    (ISER, ConnectorKind::Iscsi),
    (FIBRE_CHANNEL, ConnectorKind::FibreChannel),
    (LOCAL, ConnectorKind::Local),
    (HUAWEISDSHYPERVISOR, ConnectorKind::HuaweiStorHyper),
    (HGST, ConnectorKind::Hgst),
    (RBD, ConnectorKind::Rbd),
    (SCALEIO, ConnectorKind::ScaleIo),
    (DISCO, ConnectorKind::Disco),
    (SHEEPDOG, ConnectorKind::Sheepdog),
    (VMDK, ConnectorKind::Vmdk),
    (GPFS, ConnectorKind::Gpfs),
    (STORPOOL, ConnectorKind::StorPool),
];

const LINUX_S390X_MAPPING: &[(&str, ConnectorKind)] = &[
    (FIBRE_CHANNEL, ConnectorKind::FibreChannelS390x),
    (DRBD, ConnectorKind::Drbd),
    (NFS, ConnectorKind::RemoteFs),
    (ISCSI, ConnectorKind::Iscsi),
    (LOCAL, ConnectorKind::Local),
    (RBD, ConnectorKind::Rbd),
    (GPFS, ConnectorKind::Gpfs),
];

const WINDOWS_MAPPING: &[(&str, ConnectorKind)] = &[
    (ISCSI, ConnectorKind::WindowsIscsi),
    (FIBRE_CHANNEL, ConnectorKind::WindowsFc),
    (SMBFS, ConnectorKind::WindowsSmbfs),
];

/// Which protocol table a host uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingTable {
    Linux,
    LinuxS390x,
    Windows,
}

impl MappingTable {
    /// Windows hosts always get the Windows table, S390 architectures the
    /// S390X table, everything else the Linux table
    pub fn for_platform(platform: &HostPlatform) -> Self {
        if platform.is_windows() {
            MappingTable::Windows
        } else if platform.is_s390() {
            MappingTable::LinuxS390x
        } else {
            MappingTable::Linux
        }
    }

    fn entries(&self) -> &'static [(&'static str, ConnectorKind)] {
        match self {
            MappingTable::Linux => LINUX_MAPPING,
            MappingTable::LinuxS390x => LINUX_S390X_MAPPING,
            MappingTable::Windows => WINDOWS_MAPPING,
        }
    }

    /// Variant for an upper-cased protocol name
    pub fn lookup(&self, protocol: &str) -> Option<ConnectorKind> {
        self.entries()
            .iter()
            .find(|(name, _)| *name == protocol)
            .map(|(_, kind)| *kind)
    }

    /// Protocol names in table order
    pub fn protocols(&self) -> Vec<&'static str> {
        self.entries().iter().map(|(name, _)| *name).collect()
    }

    /// (protocol, variant) pairs in table order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, ConnectorKind)> {
        self.entries().iter().copied()
    }
}

impl std::fmt::Display for MappingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingTable::Linux => write!(f, "linux"),
            MappingTable::LinuxS390x => write!(f, "linux-s390x"),
            MappingTable::Windows => write!(f, "windows"),
        }
    }
}
