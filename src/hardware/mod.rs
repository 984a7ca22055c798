//! Hardware Module
//!
//! Host adapter discovery and SCSI bus management for the connectors.

pub mod discovery;

pub use discovery::*;
