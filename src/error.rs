//! Error types for the volume attachment layer
//!
//! Provides structured error types for connector dispatch, Fibre Channel
//! discovery, command execution, and volume encryption.

use thiserror::Error;

/// Unified error type for the attachment layer
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Connector Dispatch Errors
    // =========================================================================
    #[error("Invalid InitiatorConnector protocol specified {protocol}")]
    InvalidConnectorProtocol { protocol: String },

    #[error("Invalid connection property `{key}`: {reason}")]
    InvalidConnectionProperty { key: String, reason: String },

    #[error("Connector {connector} is unavailable: {reason}")]
    ConnectorUnavailable { connector: String, reason: String },

    #[error("{connector} does not support {operation}")]
    OperationNotSupported { connector: String, operation: String },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    #[error("Command `{command}` failed with exit code {exit_code:?}: {stderr}")]
    ProcessExecution {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("multipathd is not running: {reason}")]
    MultipathNotRunning { reason: String },

    // =========================================================================
    // Device Discovery Errors
    // =========================================================================
    #[error("We are unable to locate any Fibre Channel devices")]
    NoFibreChannelHostsFound,

    #[error("Volume device not found at {device}")]
    VolumeDeviceNotFound { device: String },

    // =========================================================================
    // Encryption Errors
    // =========================================================================
    #[error("Volume encryption is not supported for {volume_type} volume {volume_id}")]
    VolumeEncryptionNotSupported {
        volume_id: String,
        volume_type: String,
    },

    #[error("Error instantiating encryptor {provider}: {reason}")]
    EncryptorConstruction { provider: String, reason: String },

    #[error("Failed to retrieve encryption metadata for volume {volume_id}: {reason}")]
    EncryptionMetadataFetch { volume_id: String, reason: String },

    #[error("Key manager could not provide key {key_id}: {reason}")]
    KeyManager { key_id: String, reason: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable category of an error, surfaced to callers alongside the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller or configuration mistake; never retried
    Configuration,
    /// A required external binding is missing; caught at construction
    DependencyUnavailable,
    /// A backend command or service call failed
    Backend,
    /// Anything else
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::DependencyUnavailable => write!(f, "dependency-unavailable"),
            ErrorKind::Backend => write!(f, "backend"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_)
            | Error::InvalidConnectorProtocol { .. }
            | Error::InvalidConnectionProperty { .. }
            | Error::OperationNotSupported { .. }
            | Error::VolumeEncryptionNotSupported { .. }
            | Error::YamlParse(_) => ErrorKind::Configuration,

            Error::ConnectorUnavailable { .. } | Error::EncryptorConstruction { .. } => {
                ErrorKind::DependencyUnavailable
            }

            Error::ProcessExecution { .. }
            | Error::MultipathNotRunning { .. }
            | Error::NoFibreChannelHostsFound
            | Error::VolumeDeviceNotFound { .. }
            | Error::EncryptionMetadataFetch { .. }
            | Error::KeyManager { .. }
            | Error::Io(_) => ErrorKind::Backend,

            Error::Internal(_) | Error::JsonParse(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error may succeed when retried by the caller
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Configuration | ErrorKind::DependencyUnavailable
        )
    }

    /// Build an [`Error::InvalidConnectionProperty`]
    pub fn invalid_property(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidConnectionProperty {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the attachment layer
pub type Result<T> = std::result::Result<T, Error>;
