//! Fibre Channel Discovery Module
//!
//! Discovers host bus adapters, drives SCSI host rescans, and speaks the
//! zfcp dialect used on S390X hosts.

pub mod hba;
pub mod rescan;
pub mod s390x;

pub use hba::*;
pub use rescan::*;
pub use s390x::*;
