//! Types shared between the cohost controller and the guest-facing layouts.

pub mod errors;
pub mod layout;

pub use errors::{CohostError, CohostResult, ErrorKind};

/// Identifier of an OS instance on a device.
pub type InstanceId = u32;

/// NUMA node identifier.
pub type NodeId = u32;
