//! Pass-through Encryptor for volumes without front-end encryption

use super::{EncryptionMetadata, EncryptorParams, EncryptorSelection, VolumeEncryptor};
use crate::domain::ports::RequestContext;
use crate::error::Result;
use tracing::debug;

pub struct NoOpEncryptor {
    volume_type: String,
}

impl NoOpEncryptor {
    pub fn new(params: EncryptorParams) -> Self {
        Self {
            volume_type: params.connection_info.driver_volume_type,
        }
    }
}

impl VolumeEncryptor for NoOpEncryptor {
    fn selection(&self) -> EncryptorSelection {
        EncryptorSelection::NoOp
    }

    fn attach_volume(&self, _context: &RequestContext, _metadata: &EncryptionMetadata) -> Result<()> {
        debug!("Nothing to unlock for {} volume", self.volume_type);
        Ok(())
    }

    fn detach_volume(&self, _metadata: &EncryptionMetadata) -> Result<()> {
        Ok(())
    }
}
