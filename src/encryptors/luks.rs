//! LUKS Encryptor
//!
//! Formats the volume on first use, then opens it with `luksOpen`.

use super::cryptsetup::{mangled_passphrase, CryptDevice, CRYPTSETUP_NO_DEVICE};
use super::{EncryptionMetadata, EncryptorParams, EncryptorSelection, VolumeEncryptor};
use crate::domain::ports::RequestContext;
use crate::error::{Error, Result};
use crate::executor::ExecRequest;
use tracing::{debug, info, warn};

/// `cryptsetup` exit code for a rejected passphrase
const CRYPTSETUP_BAD_PASSPHRASE: i32 = 2;

/// On-disk header version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuksVersion {
    Luks1,
    Luks2,
}

impl LuksVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            LuksVersion::Luks1 => "luks1",
            LuksVersion::Luks2 => "luks2",
        }
    }
}

/// `cryptsetup luksOpen` front-end
pub struct LuksEncryptor {
    device: CryptDevice,
    version: LuksVersion,
}

impl LuksEncryptor {
    pub fn luks1(params: EncryptorParams) -> Result<Self> {
        Self::new(params, LuksVersion::Luks1)
    }

    pub fn luks2(params: EncryptorParams) -> Result<Self> {
        Self::new(params, LuksVersion::Luks2)
    }

    fn new(params: EncryptorParams, version: LuksVersion) -> Result<Self> {
        Ok(Self {
            device: CryptDevice::new(&params)?,
            version,
        })
    }

    pub fn version(&self) -> LuksVersion {
        self.version
    }

    /// Does the device already carry a LUKS header?
    pub fn is_luks(&self) -> bool {
        let request = ExecRequest::new("cryptsetup").args(["isLuks", "--verbose", self.device.dev_path.as_str()]);
        match self.device.run(request) {
            Ok(_) => true,
            Err(e) => {
                warn!("isLuks exited abnormally for {}: {}", self.device.dev_path, e);
                false
            }
        }
    }

    fn format(&self, passphrase: &str, metadata: &EncryptionMetadata) -> Result<()> {
        let mut request = ExecRequest::new("cryptsetup").args([
            "--batch-mode",
            "luksFormat",
            "--type",
            self.version.as_str(),
            "--key-file=-",
        ]);
        if let Some(cipher) = &metadata.cipher {
            request = request.args(["--cipher", cipher.as_str()]);
        }
        if let Some(key_size) = metadata.key_size {
            request = request.arg("--key-size").arg(key_size.to_string());
        }
        let request = request.arg(self.device.dev_path.as_str()).input(passphrase);

        info!("Formatting {} as {}", self.device.dev_path, self.version.as_str());
        self.device.run(request)?;
        Ok(())
    }

    fn open(&self, passphrase: &str) -> Result<()> {
        let request = ExecRequest::new("cryptsetup")
            .args([
                "luksOpen",
                "--key-file=-",
                self.device.dev_path.as_str(),
                self.device.dev_name.as_str(),
            ])
            .input(passphrase);
        self.device.run(request)?;
        Ok(())
    }
}

impl VolumeEncryptor for LuksEncryptor {
    fn selection(&self) -> EncryptorSelection {
        match self.version {
            LuksVersion::Luks1 => EncryptorSelection::Luks,
            LuksVersion::Luks2 => EncryptorSelection::Luks2,
        }
    }

    fn attach_volume(&self, context: &RequestContext, metadata: &EncryptionMetadata) -> Result<()> {
        let passphrase = self.device.passphrase(context, metadata)?;

        if !self.is_luks() {
            self.format(&passphrase, metadata)?;
        }

        match self.open(&passphrase) {
            Ok(()) => {}
            Err(Error::ProcessExecution {
                exit_code: Some(CRYPTSETUP_BAD_PASSPHRASE),
                ..
            }) => {
                // Headers written by older releases use the short hex form
                let key = self.device.key(context, metadata)?;
                debug!("Retrying luksOpen of {} with the legacy passphrase", self.device.dev_path);
                self.open(&mangled_passphrase(&key))?;
            }
            Err(e) => return Err(e),
        }

        info!("Opened LUKS mapping {}", self.device.dev_name);
        self.device.link_mapping()
    }

    fn detach_volume(&self, _metadata: &EncryptionMetadata) -> Result<()> {
        let request = ExecRequest::new("cryptsetup")
            .args(["luksClose", self.device.dev_name.as_str()])
            .accept_exit_codes(&[0, CRYPTSETUP_NO_DEVICE]);
        self.device.run(request)?;
        debug!("Closed LUKS mapping {}", self.device.dev_name);
        Ok(())
    }
}
