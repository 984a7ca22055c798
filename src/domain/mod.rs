//! Domain layer - Core types and port definitions
//!
//! This module defines the connector capability contract and the external
//! service ports, plus the property maps that flow between them.

pub mod ports;
pub mod properties;

pub use ports::*;
pub use properties::*;
