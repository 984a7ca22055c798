//! Volume Attach - Host-side Volume Attachment Layer
//!
//! Turns a storage backend's connection description into a local block
//! device and back again: connector dispatch by protocol, host property
//! reporting, Fibre Channel HBA discovery and SCSI rescans, and the choice of
//! a front-end volume encryptor.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         Caller (compute host)                        │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────┐  ┌────────────────────┐  ┌────────────────┐  │
//! │  │ Property          │  │ Connector Factory  │  │ Encryptor      │  │
//! │  │ Aggregator        │  │ (protocol → impl)  │  │ Selection      │  │
//! │  └─────────┬─────────┘  └─────────┬──────────┘  └───────┬────────┘  │
//! │            │                      │                     │           │
//! │            └──────────────┬───────┘                     │           │
//! │                           │                             │           │
//! │               ┌───────────┴───────────┐       ┌─────────┴────────┐  │
//! │               │ Connectors            │       │ cryptsetup /     │  │
//! │               │ FC · Local · StorPool │       │ LUKS             │  │
//! │               └───────────┬───────────┘       └──────────────────┘  │
//! ├───────────────────────────┼─────────────────────────────────────────┤
//! │            ┌──────────────┴──────────────┐   ┌──────────────────┐   │
//! │            │ HBA Discovery · SCSI Rescan │   │ Resource Locks   │   │
//! │            └──────────────┬──────────────┘   └──────────────────┘   │
//! ├───────────────────────────┼─────────────────────────────────────────┤
//! │                    Executor (root helper, sysfs)                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`initiator`]: Connector registry, factory, host properties and connectors
//! - [`hardware`]: HBA discovery, SCSI host rescans, zfcp units
//! - [`encryptors`]: Encryptor selection and the cryptsetup front-ends
//! - [`domain`]: Connector contract, service ports, property maps
//! - [`executor`]: Privileged command execution
//! - [`locking`]: Per-resource serialization
//! - [`error`]: Error types and handling

pub mod config;
pub mod domain;
pub mod encryptors;
pub mod error;
pub mod executor;
pub mod hardware;
pub mod initiator;
pub mod locking;
pub mod metrics;

// Re-export commonly used types
pub use config::AttachConfig;

pub use domain::ports::{
    Connector, ConnectorRef, DeviceInfo, HostPlatform, KeyManager, KeyManagerRef,
    RequestContext, VolumeApi,
};
pub use domain::properties::{
    AccessMode, ConnectionInfo, ConnectionProperties, PropertyMap,
};

pub use encryptors::{
    get_encryption_metadata, get_volume_encryptor, EncryptionMetadata, EncryptorFactory,
    EncryptorSelection, VolumeEncryptor, VolumeEncryptorRef,
};

pub use error::{Error, ErrorKind, Result};

pub use executor::{CommandOutput, ExecRequest, Executor, ExecutorRef, ProcessExecutor, RecordingExecutor};

pub use hardware::{Hba, LinuxFibreChannel, LinuxFibreChannelS390x};

pub use initiator::{
    get_connector_properties, ConnectorFactory, ConnectorKind, ConnectorOptions, ProbeContext,
};

pub use locking::ResourceLocks;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
