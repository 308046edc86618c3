#![allow(dead_code)]

use cohost::boot::ElfBuilder;
use cohost::host::{Host, PhysMemory, SimulatedHost, SimulatedHostConfig};
use cohost::options::BootTimings;
use cohost::{CohostDevice, CpuSelection, DeviceOptions, MemSize, MemoryRequest, OsInstance};
use cohost_shared::layout::boot_params;
use std::sync::Arc;

pub const LINK_BASE: u64 = 0xFFFF_FFFF_8000_0000;
pub const MIB: u64 = 1 << 20;

pub fn mem(size_mib: u64, node: u32) -> MemoryRequest {
    MemoryRequest::new(MemSize::Bytes(size_mib * MIB), node)
}

pub fn options(memory: Vec<MemoryRequest>, cpus: u32) -> DeviceOptions {
    DeviceOptions {
        memory,
        cpus: CpuSelection::Count(cpus),
        identity_map_ceiling: 8 << 30,
        boot_timings: BootTimings::immediate(),
        status_poll_interval_ms: 1,
        ..Default::default()
    }
}

pub async fn open(sim: &Arc<SimulatedHost>, options: DeviceOptions) -> CohostDevice {
    CohostDevice::open(options, Host::simulated(Arc::clone(sim)))
        .await
        .unwrap()
}

pub fn sim() -> Arc<SimulatedHost> {
    Arc::new(SimulatedHost::new(SimulatedHostConfig::default()))
}

/// A halt-loop kernel linked at the default link base.
pub fn kernel() -> Vec<u8> {
    ElfBuilder::new(LINK_BASE)
        .segment(LINK_BASE, &[0xF4, 0xEB, 0xFD], 3)
        .segment(LINK_BASE + 0x1000, &[], 0x2000)
        .build()
}

/// Write a guest-owned word in the instance's boot parameter block.
pub fn guest_write(sim: &SimulatedHost, os: &OsInstance, offset: u64, value: u64) {
    let base = os.info().boot_params.unwrap();
    sim.write_u64(base + offset, value).unwrap();
}

pub fn guest_progress(sim: &SimulatedHost, os: &OsInstance, value: u64) {
    guest_write(sim, os, boot_params::STATUS, value);
}
