//! In-tree Connectors
//!
//! Shared Linux helpers, the host probes of each variant, and the
//! connectors implemented in this crate. Variants without an implementation
//! here are supplied through [`crate::initiator::factory::ConnectorBuilder`].

pub mod base;
pub mod fibre_channel;
pub mod fibre_channel_s390x;
pub mod iscsi;
pub mod local;
pub mod storpool;

pub use base::{LinuxScsi, MultipathDevice};
pub use fibre_channel::FibreChannelConnector;
pub use local::LocalConnector;
pub use storpool::{AttachRequest, StorPoolApi, StorPoolApiRef, StorPoolConnector};

use crate::domain::properties::PropertyMap;
use crate::error::Result;
use crate::initiator::properties::ProbeContext;
use crate::initiator::registry::ConnectorKind;

/// Static host probe of one connector variant
pub fn probe(kind: ConnectorKind, ctx: &ProbeContext) -> Result<PropertyMap> {
    match kind {
        ConnectorKind::BaseLinux => base::get_connector_properties(ctx),
        ConnectorKind::Iscsi => iscsi::get_connector_properties(ctx),
        ConnectorKind::FibreChannel | ConnectorKind::FibreChannelS390x => {
            FibreChannelConnector::get_connector_properties(ctx)
        }
        _ => Ok(PropertyMap::new()),
    }
}
