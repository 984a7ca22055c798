//! Plain dm-crypt Encryptor
//!
//! Maps the attached volume through `cryptsetup create` and repoints the
//! volume's device path at the decrypted mapping.

use super::{EncryptionMetadata, EncryptorParams, EncryptorSelection, VolumeEncryptor};
use crate::domain::ports::{KeyManagerRef, RequestContext};
use crate::error::{Error, Result};
use crate::executor::{CommandOutput, ExecRequest, ExecutorRef};
use std::path::PathBuf;
use tracing::{debug, info};

/// `cryptsetup` exit code for "no such mapping"
pub(crate) const CRYPTSETUP_NO_DEVICE: i32 = 4;

/// A device path with a dm-crypt mapping layered over it
#[derive(Clone)]
pub(crate) struct CryptDevice {
    root_helper: String,
    executor: ExecutorRef,
    keymgr: KeyManagerRef,
    /// Path handed out by the connector; replaced by a link to the mapping
    pub symlink_path: String,
    /// Resolved block device underneath
    pub dev_path: String,
    /// Mapping name, `crypt-<basename>`
    pub dev_name: String,
    dev_root: PathBuf,
}

impl CryptDevice {
    pub fn new(params: &EncryptorParams) -> Result<Self> {
        let data = &params.connection_info.data;
        let symlink_path = data
            .get_str("device_path")
            .ok_or_else(|| Error::VolumeEncryptionNotSupported {
                volume_id: data.get_scalar("volume_id").unwrap_or_default(),
                volume_type: params.connection_info.driver_volume_type.clone(),
            })?
            .to_string();

        let dev_path = std::fs::canonicalize(&symlink_path)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| symlink_path.clone());
        let dev_name = mapping_name(&symlink_path);

        Ok(Self {
            root_helper: params.root_helper.clone(),
            executor: params.executor.clone(),
            keymgr: params.keymgr.clone(),
            symlink_path,
            dev_path,
            dev_name,
            dev_root: params.dev_root.clone(),
        })
    }

    pub fn run(&self, request: ExecRequest) -> Result<CommandOutput> {
        self.executor.execute(&request.as_root(&self.root_helper))
    }

    /// Hex passphrase derived from the volume key
    pub fn passphrase(&self, context: &RequestContext, metadata: &EncryptionMetadata) -> Result<String> {
        Ok(hex_passphrase(&self.key(context, metadata)?))
    }

    /// Raw volume key from the key manager
    pub fn key(&self, context: &RequestContext, metadata: &EncryptionMetadata) -> Result<Vec<u8>> {
        let key_id = metadata
            .encryption_key_id
            .as_deref()
            .ok_or_else(|| Error::KeyManager {
                key_id: String::new(),
                reason: "no encryption_key_id in the encryption metadata".to_string(),
            })?;
        self.keymgr.get_key(context, key_id).map_err(|e| match e {
            Error::KeyManager { .. } => e,
            other => Error::KeyManager {
                key_id: key_id.to_string(),
                reason: other.to_string(),
            },
        })
    }

    pub fn mapper_path(&self) -> String {
        self.dev_root
            .join("mapper")
            .join(&self.dev_name)
            .to_string_lossy()
            .to_string()
    }

    /// Point the connector's device path at the decrypted mapping
    pub fn link_mapping(&self) -> Result<()> {
        let request = ExecRequest::new("ln").args([
            "--symbolic".to_string(),
            "--force".to_string(),
            self.mapper_path(),
            self.symlink_path.clone(),
        ]);
        self.run(request)?;
        debug!("Linked {} to {}", self.symlink_path, self.mapper_path());
        Ok(())
    }
}

/// Mapping name for a device path
pub fn mapping_name(device_path: &str) -> String {
    let base = device_path.rsplit('/').next().unwrap_or(device_path);
    format!("crypt-{}", base)
}

/// Key bytes as lower-case hex, two digits per byte
pub fn hex_passphrase(key: &[u8]) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Key bytes as hex with leading zeros dropped per byte.
///
/// Volumes formatted by older releases were keyed with this form.
pub fn mangled_passphrase(key: &[u8]) -> String {
    key.iter().map(|b| format!("{:x}", b)).collect()
}

/// `cryptsetup create` front-end
pub struct CryptsetupEncryptor {
    device: CryptDevice,
}

impl CryptsetupEncryptor {
    pub fn new(params: EncryptorParams) -> Result<Self> {
        Ok(Self {
            device: CryptDevice::new(&params)?,
        })
    }

    pub fn dev_name(&self) -> &str {
        &self.device.dev_name
    }
}

impl VolumeEncryptor for CryptsetupEncryptor {
    fn selection(&self) -> EncryptorSelection {
        EncryptorSelection::Plain
    }

    fn attach_volume(&self, context: &RequestContext, metadata: &EncryptionMetadata) -> Result<()> {
        let passphrase = self.device.passphrase(context, metadata)?;

        let mut request = ExecRequest::new("cryptsetup").args(["create", "--key-file=-"]);
        if let Some(cipher) = &metadata.cipher {
            request = request.args(["--cipher", cipher.as_str()]);
        }
        if let Some(key_size) = metadata.key_size {
            request = request.arg("--key-size").arg(key_size.to_string());
        }
        let request = request
            .args([self.device.dev_name.as_str(), self.device.dev_path.as_str()])
            .input(passphrase);

        self.device.run(request)?;
        info!("Opened dm-crypt mapping {}", self.device.dev_name);
        self.device.link_mapping()
    }

    fn detach_volume(&self, _metadata: &EncryptionMetadata) -> Result<()> {
        let request = ExecRequest::new("cryptsetup")
            .args(["remove", self.device.dev_name.as_str()])
            .accept_exit_codes(&[0, CRYPTSETUP_NO_DEVICE]);
        self.device.run(request)?;
        debug!("Closed dm-crypt mapping {}", self.device.dev_name);
        Ok(())
    }
}
