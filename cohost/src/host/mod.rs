//! Host platform seams.
//!
//! The controller never touches hardware directly. Everything it needs from
//! the host kernel goes through four narrow traits:
//!
//! - [`PageSource`]: physical page runs per NUMA node, plus small contiguous
//!   page allocations for page tables
//! - [`CpuHotplug`]: enumerate online cores, take them offline and back
//! - [`InterruptController`]: INIT/STARTUP IPIs and the error status register
//! - [`PhysMemory`]: byte access to physical addresses
//!
//! [`Host`] bundles one handle of each so they can be passed around together.

mod mapped;
mod sim;
mod sysfs;

pub use mapped::MappedWindow;
pub use sim::{SimulatedHost, SimulatedHostConfig, SimulatedNode};
pub use sysfs::SysfsCpuHotplug;

use cohost_shared::errors::{CohostError, CohostResult};
use cohost_shared::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A contiguous range of physical addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysRange {
    pub start: u64,
    pub size: u64,
}

impl PhysRange {
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn contains_range(&self, other: &PhysRange) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: &PhysRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Display for PhysRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start, self.end())
    }
}

/// Supplier of physical memory owned by the host kernel.
pub trait PageSource: Send + Sync {
    /// Size of one run handed out by [`acquire_run`](Self::acquire_run).
    fn run_size(&self) -> u64;

    /// NUMA nodes that can supply memory.
    fn nodes(&self) -> Vec<NodeId>;

    /// Take one run of `run_size()` bytes from `node`. `None` once the host refuses.
    fn acquire_run(&self, node: NodeId) -> Option<PhysRange>;

    /// Give a range obtained from `acquire_run` back. The range may span
    /// several adjacent runs.
    fn release_range(&self, range: PhysRange);

    /// Allocate `count` contiguous 4 KiB pages below 4 GiB.
    fn allocate_pages(&self, count: u64) -> Option<PhysRange>;

    fn free_pages(&self, range: PhysRange);
}

/// A host core as seen by the hotplug facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostCpu {
    pub logical_id: u32,
    /// Local APIC id.
    pub hw_id: u32,
    pub node: NodeId,
}

pub trait CpuHotplug: Send + Sync {
    /// Cores currently online in the host.
    fn online_cpus(&self) -> CohostResult<Vec<HostCpu>>;

    fn set_online(&self, logical_id: u32, online: bool) -> CohostResult<()>;
}

/// Inter-processor interrupt kinds used by the boot protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipi {
    InitAssert,
    InitDeassert,
    Startup { vector: u8 },
}

pub trait InterruptController: Send + Sync {
    fn send_ipi(&self, hw_id: u32, ipi: Ipi);

    /// True while the last IPI is still being delivered.
    fn delivery_pending(&self) -> bool;

    /// Read and clear the error status register.
    fn read_error_status(&self) -> u32;

    /// Host built-in secondary wake primitive. `None` if the host has none.
    fn wake_secondary(&self, hw_id: u32, start_ip: u64) -> Option<i32>;
}

/// Byte access to physical memory.
pub trait PhysMemory: Send + Sync {
    fn read(&self, phys: u64, buf: &mut [u8]) -> CohostResult<()>;

    fn write(&self, phys: u64, data: &[u8]) -> CohostResult<()>;

    /// Atomically replace the u32 at `phys` if it equals `current`.
    fn compare_exchange_u32(&self, phys: u64, current: u32, new: u32) -> CohostResult<bool>;

    fn zero(&self, phys: u64, len: u64) -> CohostResult<()> {
        const CHUNK: u64 = 0x1000;
        let zeros = [0u8; CHUNK as usize];
        let mut offset = 0;
        while offset < len {
            let n = CHUNK.min(len - offset);
            self.write(phys + offset, &zeros[..n as usize])?;
            offset += n;
        }
        Ok(())
    }

    fn read_u64(&self, phys: u64) -> CohostResult<u64> {
        let mut buf = [0u8; 8];
        self.read(phys, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&self, phys: u64, value: u64) -> CohostResult<()> {
        self.write(phys, &value.to_le_bytes())
    }

    fn read_u32(&self, phys: u64) -> CohostResult<u32> {
        let mut buf = [0u8; 4];
        self.read(phys, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&self, phys: u64, value: u32) -> CohostResult<()> {
        self.write(phys, &value.to_le_bytes())
    }
}

/// Handles to every host facility the controller uses.
#[derive(Clone)]
pub struct Host {
    pub pages: Arc<dyn PageSource>,
    pub cpus: Arc<dyn CpuHotplug>,
    pub apic: Arc<dyn InterruptController>,
    pub memory: Arc<dyn PhysMemory>,
}

impl Host {
    pub fn new(
        pages: Arc<dyn PageSource>,
        cpus: Arc<dyn CpuHotplug>,
        apic: Arc<dyn InterruptController>,
        memory: Arc<dyn PhysMemory>,
    ) -> Self {
        Self {
            pages,
            cpus,
            apic,
            memory,
        }
    }

    /// Use a [`SimulatedHost`] for every facility.
    pub fn simulated(sim: Arc<SimulatedHost>) -> Self {
        Self {
            pages: sim.clone(),
            cpus: sim.clone(),
            apic: sim.clone(),
            memory: sim,
        }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("run_size", &self.pages.run_size())
            .field("nodes", &self.pages.nodes())
            .finish()
    }
}

pub(crate) fn out_of_bounds(phys: u64, len: usize) -> CohostError {
    CohostError::Validation(format!(
        "physical access {:#x}+{:#x} outside accessible memory",
        phys, len
    ))
}
