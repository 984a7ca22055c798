//! Volume Encryptors
//!
//! Picks the front-end encryptor for an attached volume from its encryption
//! metadata. Old class-name style provider strings keep working through a
//! fixed legacy table; anything unknown is treated as an out-of-tree
//! provider that must have been registered on the [`EncryptorFactory`].

pub mod cryptsetup;
pub mod luks;
pub mod nop;

pub use cryptsetup::CryptsetupEncryptor;
pub use luks::LuksEncryptor;
pub use nop::NoOpEncryptor;

use crate::domain::ports::{KeyManagerRef, RequestContext, VolumeApi};
use crate::domain::properties::{mask_secrets, ConnectionInfo};
use crate::error::{Error, Result};
use crate::executor::{ExecutorRef, ProcessExecutor};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

// =============================================================================
// Provider Tables
// =============================================================================

pub const LUKS: &str = "luks";
pub const LUKS2: &str = "luks2";
pub const PLAIN: &str = "plain";

/// Canonical format -> front-end encryptor
pub const FORMAT_TO_FRONTEND_ENCRYPTOR_MAP: &[(&str, &str)] = &[
    (LUKS, "LuksEncryptor"),
    (LUKS2, "Luks2Encryptor"),
    (PLAIN, "CryptsetupEncryptor"),
];

/// Deprecated provider class names -> canonical format (`None` is no-op)
pub const LEGACY_PROVIDER_CLASS_TO_FORMAT_MAP: &[(&str, Option<&str>)] = &[
    ("nova.volume.encryptors.luks.LuksEncryptor", Some(LUKS)),
    ("nova.volume.encryptors.cryptsetup.CryptsetupEncryptor", Some(PLAIN)),
    ("nova.volume.encryptors.nop.NoopEncryptor", None),
    ("os_brick.encryptors.luks.LuksEncryptor", Some(LUKS)),
    ("os_brick.encryptors.cryptsetup.CryptsetupEncryptor", Some(PLAIN)),
    ("os_brick.encryptors.nop.NoopEncryptor", None),
    ("LuksEncryptor", Some(LUKS)),
    ("CryptsetupEncryptor", Some(PLAIN)),
    ("NoOpEncryptor", None),
];

/// The front-end chosen for a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptorSelection {
    NoOp,
    Plain,
    Luks,
    Luks2,
    /// Out-of-tree provider, by the name it was requested with
    External(String),
}

impl EncryptorSelection {
    /// Front-end for a canonical format name
    pub fn for_format(format: &str) -> Option<Self> {
        match format {
            LUKS => Some(EncryptorSelection::Luks),
            LUKS2 => Some(EncryptorSelection::Luks2),
            PLAIN => Some(EncryptorSelection::Plain),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EncryptorSelection::NoOp => "NoOpEncryptor",
            EncryptorSelection::Plain => "CryptsetupEncryptor",
            EncryptorSelection::Luks => "LuksEncryptor",
            EncryptorSelection::Luks2 => "Luks2Encryptor",
            EncryptorSelection::External(name) => name,
        }
    }
}

impl std::fmt::Display for EncryptorSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Map a provider string to a front-end.
///
/// Legacy class names are translated first, then canonical formats are
/// looked up; no provider means no-op and anything else passes through as
/// an external provider.
pub fn resolve_provider(provider: Option<&str>) -> EncryptorSelection {
    let mut provider = provider;

    if let Some(requested) = provider {
        if let Some((_, format)) = LEGACY_PROVIDER_CLASS_TO_FORMAT_MAP
            .iter()
            .find(|(class, _)| *class == requested)
        {
            warn!(
                "Use of the in tree encryptor class {} by directly referencing the \
                 implementation class is deprecated",
                requested
            );
            provider = *format;
        }
    }

    match provider {
        None => EncryptorSelection::NoOp,
        Some(format) => EncryptorSelection::for_format(format).unwrap_or_else(|| {
            warn!("Use of the out of tree encryptor class {} is deprecated", format);
            EncryptorSelection::External(format.to_string())
        }),
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Encryption settings of a volume as stored by the volume service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key_id: Option<String>,
    #[serde(flatten)]
    pub extras: IndexMap<String, Value>,
}

impl EncryptionMetadata {
    pub fn from_map(map: IndexMap<String, Value>) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(map.into_iter().collect()))?)
    }

    pub fn is_empty(&self) -> bool {
        self.provider.is_none()
            && self.control_location.is_none()
            && self.cipher.is_none()
            && self.key_size.is_none()
            && self.encryption_key_id.is_none()
            && self.extras.is_empty()
    }

    /// Is encryption done by this host?
    pub fn is_front_end(&self) -> bool {
        self.control_location
            .as_deref()
            .is_some_and(|location| location.eq_ignore_ascii_case("front-end"))
    }

    pub fn masked(&self) -> Value {
        mask_secrets(&serde_json::to_value(self).unwrap_or(Value::Null))
    }
}

// =============================================================================
// Encryptor Port
// =============================================================================

/// A front-end that layers a decrypted mapping over an attached volume
pub trait VolumeEncryptor: Send + Sync {
    fn selection(&self) -> EncryptorSelection;

    /// Set up the mapping and point the volume's device path at it
    fn attach_volume(&self, context: &RequestContext, metadata: &EncryptionMetadata) -> Result<()>;

    /// Tear the mapping down; an already removed mapping is fine
    fn detach_volume(&self, metadata: &EncryptionMetadata) -> Result<()>;
}

pub type VolumeEncryptorRef = Box<dyn VolumeEncryptor>;

impl std::fmt::Debug for dyn VolumeEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeEncryptor")
            .field("selection", &self.selection())
            .finish()
    }
}

/// Everything an encryptor is constructed with
#[derive(Clone)]
pub struct EncryptorParams {
    pub root_helper: String,
    pub connection_info: ConnectionInfo,
    pub keymgr: KeyManagerRef,
    pub executor: ExecutorRef,
    pub metadata: EncryptionMetadata,
    /// Where device-mapper nodes appear
    pub dev_root: PathBuf,
}

impl std::fmt::Debug for EncryptorParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptorParams")
            .field("connection_info", &self.connection_info)
            .field("metadata", &self.metadata.masked())
            .finish()
    }
}

/// Builds an out-of-tree encryptor
pub trait EncryptorBuilder: Send + Sync {
    fn build(&self, params: EncryptorParams) -> Result<VolumeEncryptorRef>;
}

impl<F> EncryptorBuilder for F
where
    F: Fn(EncryptorParams) -> Result<VolumeEncryptorRef> + Send + Sync,
{
    fn build(&self, params: EncryptorParams) -> Result<VolumeEncryptorRef> {
        self(params)
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Resolves and constructs encryptors
#[derive(Default)]
pub struct EncryptorFactory {
    externals: IndexMap<String, Arc<dyn EncryptorBuilder>>,
    dev_root: Option<PathBuf>,
}

impl EncryptorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an out-of-tree provider constructible under `provider`
    pub fn register_external(
        mut self,
        provider: impl Into<String>,
        builder: impl EncryptorBuilder + 'static,
    ) -> Self {
        self.externals.insert(provider.into(), Arc::new(builder));
        self
    }

    pub fn dev_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.dev_root = Some(root.into());
        self
    }

    /// The encryptor for a volume.
    ///
    /// No-op unless `metadata.control_location` is `front-end`. A provider
    /// that cannot be constructed is logged and returned as an error.
    pub fn get_volume_encryptor(
        &self,
        root_helper: &str,
        connection_info: &ConnectionInfo,
        keymgr: KeyManagerRef,
        executor: Option<ExecutorRef>,
        metadata: &EncryptionMetadata,
    ) -> Result<VolumeEncryptorRef> {
        let params = EncryptorParams {
            root_helper: root_helper.to_string(),
            connection_info: connection_info.clone(),
            keymgr,
            executor: executor.unwrap_or_else(ProcessExecutor::shared),
            metadata: metadata.clone(),
            dev_root: self.dev_root.clone().unwrap_or_else(|| PathBuf::from("/dev")),
        };

        let selection = if metadata.is_front_end() {
            resolve_provider(metadata.provider.as_deref())
        } else {
            EncryptorSelection::NoOp
        };

        let encryptor = self.construct(&selection, params).map_err(|e| {
            error!("Error instantiating {}: {}", selection, e);
            match e {
                Error::EncryptorConstruction { .. } | Error::VolumeEncryptionNotSupported { .. } => e,
                other => Error::EncryptorConstruction {
                    provider: selection.name().to_string(),
                    reason: other.to_string(),
                },
            }
        })?;

        debug!(
            "Using volume encryptor '{}' for connection: {}",
            selection,
            connection_info.masked()
        );
        Ok(encryptor)
    }

    fn construct(
        &self,
        selection: &EncryptorSelection,
        params: EncryptorParams,
    ) -> Result<VolumeEncryptorRef> {
        match selection {
            EncryptorSelection::NoOp => Ok(Box::new(NoOpEncryptor::new(params))),
            EncryptorSelection::Plain => Ok(Box::new(CryptsetupEncryptor::new(params)?)),
            EncryptorSelection::Luks => Ok(Box::new(LuksEncryptor::luks1(params)?)),
            EncryptorSelection::Luks2 => Ok(Box::new(LuksEncryptor::luks2(params)?)),
            EncryptorSelection::External(name) => match self.externals.get(name) {
                Some(builder) => builder.build(params),
                None => Err(Error::EncryptorConstruction {
                    provider: name.clone(),
                    reason: "provider is not registered".to_string(),
                }),
            },
        }
    }

    /// Encryption metadata for a volume, empty unless the connection is
    /// marked encrypted
    pub fn get_encryption_metadata(
        &self,
        context: &RequestContext,
        volume_api: &dyn VolumeApi,
        volume_id: &str,
        connection_info: &ConnectionInfo,
    ) -> Result<EncryptionMetadata> {
        get_encryption_metadata(context, volume_api, volume_id, connection_info)
    }
}

impl std::fmt::Debug for EncryptorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptorFactory")
            .field("externals", &self.externals.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// [`EncryptorFactory::get_volume_encryptor`] without external providers
pub fn get_volume_encryptor(
    root_helper: &str,
    connection_info: &ConnectionInfo,
    keymgr: KeyManagerRef,
    executor: Option<ExecutorRef>,
    metadata: &EncryptionMetadata,
) -> Result<VolumeEncryptorRef> {
    EncryptorFactory::new().get_volume_encryptor(root_helper, connection_info, keymgr, executor, metadata)
}

/// Fetch encryption metadata when `connection_info.data.encrypted` is set.
///
/// An encrypted volume without metadata only produces a warning.
pub fn get_encryption_metadata(
    context: &RequestContext,
    volume_api: &dyn VolumeApi,
    volume_id: &str,
    connection_info: &ConnectionInfo,
) -> Result<EncryptionMetadata> {
    if !connection_info.is_encrypted() {
        return Ok(EncryptionMetadata::default());
    }

    let raw = volume_api
        .get_volume_encryption_metadata(context, volume_id)
        .map_err(|e| {
            error!(
                "Failed to retrieve encryption metadata for volume {}: {}",
                volume_id, e
            );
            match e {
                Error::EncryptionMetadataFetch { .. } => e,
                other => Error::EncryptionMetadataFetch {
                    volume_id: volume_id.to_string(),
                    reason: other.to_string(),
                },
            }
        })?;

    let metadata = EncryptionMetadata::from_map(raw)?;
    if metadata.is_empty() {
        warn!(
            "Volume {} should be encrypted but there is no encryption metadata.",
            volume_id
        );
    } else {
        debug!(
            "Using volume encryption metadata '{}' for connection: {}",
            metadata.masked(),
            connection_info.masked()
        );
    }
    Ok(metadata)
}
