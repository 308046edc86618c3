//! OS instance lifecycle.
//!
//! An [`OsInstance`] is a cheap handle onto one instance record on a device.
//! Handles are created by [`CohostDevice::create_instance`] and stay valid
//! until the instance is destroyed; operations on a destroyed instance's
//! handle still see its last state but can no longer claim device resources.
//!
//! [`CohostDevice::create_instance`]: crate::device::CohostDevice::create_instance

mod controller;
mod status;
mod wait;

pub use status::OsStatus;

pub(crate) use controller::InstanceRecord;

use crate::cpu::ReservedCpu;
use crate::device::DeviceInner;
use crate::host::PhysRange;
use crate::memory::{MemoryChunk, MemoryRequest};
use crate::options::CpuSelection;
use chrono::{DateTime, Utc};
use cohost_shared::InstanceId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Handle to an OS instance.
#[derive(Clone)]
pub struct OsInstance {
    record: Arc<InstanceRecord>,
    device: DeviceInner,
}

impl std::fmt::Debug for OsInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsInstance")
            .field("id", &self.record.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Cores and memory to give an instance in one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    pub cpus: Option<CpuSelection>,
    /// Each entry becomes one chunk. Sizes must be explicit.
    pub memory: Vec<MemoryRequest>,
}

/// Guest core to host core pairing for the inter-kernel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IkcPair {
    /// Logical id of a core assigned to the instance.
    pub guest_cpu: u32,
    /// Logical id of a host-owned core.
    pub host_cpu: u32,
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub status: OsStatus,
    pub created_at: DateTime<Utc>,
    pub cpus: Vec<ReservedCpu>,
    pub memory: Vec<MemoryChunk>,
    pub window: Option<PhysRange>,
    pub entry_point: Option<u64>,
    pub boot_params: Option<u64>,
    pub kernel_args: String,
    pub ikc_map: Vec<IkcPair>,
}
