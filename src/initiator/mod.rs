//! Initiator Module
//!
//! Connector registry, factory, host property aggregation and the in-tree
//! connector implementations.

pub mod connectors;
pub mod factory;
pub mod properties;
pub mod registry;

pub use factory::{
    ConnectorBuilder, ConnectorContext, ConnectorFactory, ConnectorFactoryBuilder,
    ConnectorOptions, Resolution,
};
pub use properties::{collect_properties, get_connector_properties, ProbeContext};
pub use registry::{ConnectorKind, MappingTable, CONNECTOR_LIST};
