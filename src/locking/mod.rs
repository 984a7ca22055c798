//! Locking Layer
//!
//! Serializes attach, detach, rescan and extend per resource identity.

pub mod resource_locks;

pub use resource_locks::*;
