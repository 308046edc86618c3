//! Software model of a host.
//!
//! Used by the test suite and for dry runs on machines where the controller
//! must not touch real hardware. Physical memory is sparse: pages are only
//! materialized when written, unwritten pages read as zero.

use super::{CpuHotplug, HostCpu, InterruptController, Ipi, PageSource, PhysMemory, PhysRange};
use cohost_shared::errors::{CohostError, CohostResult};
use cohost_shared::layout::PAGE_SIZE;
use cohost_shared::NodeId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Memory owned by one simulated NUMA node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedNode {
    pub id: NodeId,
    pub base: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct SimulatedHostConfig {
    pub nodes: Vec<SimulatedNode>,
    pub run_size: u64,
    pub cpus: Vec<HostCpu>,
    /// Pool served by `allocate_pages`.
    pub page_pool: PhysRange,
    /// Low memory that is always addressable (trampoline page lives here).
    pub low_memory: PhysRange,
    /// Whether `wake_secondary` is available.
    pub builtin_wake: bool,
}

impl Default for SimulatedHostConfig {
    fn default() -> Self {
        Self {
            nodes: vec![SimulatedNode {
                id: 0,
                base: 0x1_0000_0000,
                size: 0x4000_0000,
            }],
            run_size: 4 << 20,
            cpus: (0..8)
                .map(|i| HostCpu {
                    logical_id: i,
                    hw_id: i * 2,
                    node: 0,
                })
                .collect(),
            page_pool: PhysRange::new(0x10_0000, 0xf0_0000),
            low_memory: PhysRange::new(0, 0x100_0000),
            builtin_wake: false,
        }
    }
}

impl SimulatedHostConfig {
    /// Replace the node list with evenly spaced nodes of the given sizes.
    pub fn with_node_sizes(mut self, sizes: &[u64]) -> Self {
        let mut base = 0x1_0000_0000u64;
        self.nodes = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let node = SimulatedNode {
                    id: i as NodeId,
                    base,
                    size,
                };
                base += size.next_multiple_of(0x4000_0000).max(0x4000_0000);
                node
            })
            .collect();
        self
    }

    pub fn with_cpus(mut self, count: u32) -> Self {
        let nodes = self.nodes.len().max(1) as u32;
        self.cpus = (0..count)
            .map(|i| HostCpu {
                logical_id: i,
                hw_id: i * 2,
                node: i % nodes,
            })
            .collect();
        self
    }

    pub fn with_run_size(mut self, run_size: u64) -> Self {
        self.run_size = run_size;
        self
    }

    pub fn with_builtin_wake(mut self, enabled: bool) -> Self {
        self.builtin_wake = enabled;
        self
    }
}

struct SimState {
    free_runs: BTreeMap<NodeId, BTreeSet<u64>>,
    pool_free: BTreeMap<u64, u64>,
    online: BTreeMap<u32, HostCpu>,
    offline: BTreeMap<u32, HostCpu>,
    failing_offline: HashSet<u32>,
    failing_online: HashSet<u32>,
    pages: HashMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
    ipis: Vec<(u32, Ipi)>,
    wakes: Vec<(u32, u64)>,
    pending_errors: VecDeque<u32>,
}

pub struct SimulatedHost {
    config: SimulatedHostConfig,
    state: Mutex<SimState>,
}

impl SimulatedHost {
    pub fn new(config: SimulatedHostConfig) -> Self {
        let mut free_runs = BTreeMap::new();
        for node in &config.nodes {
            let runs: BTreeSet<u64> = (0..node.size / config.run_size)
                .map(|i| node.base + i * config.run_size)
                .collect();
            free_runs.insert(node.id, runs);
        }

        let mut pool_free = BTreeMap::new();
        pool_free.insert(config.page_pool.start, config.page_pool.size);

        let online = config.cpus.iter().map(|c| (c.logical_id, *c)).collect();

        Self {
            config,
            state: Mutex::new(SimState {
                free_runs,
                pool_free,
                online,
                offline: BTreeMap::new(),
                failing_offline: HashSet::new(),
                failing_online: HashSet::new(),
                pages: HashMap::new(),
                ipis: Vec::new(),
                wakes: Vec::new(),
                pending_errors: VecDeque::new(),
            }),
        }
    }

    pub fn config(&self) -> &SimulatedHostConfig {
        &self.config
    }

    /// Every IPI sent so far, in order.
    pub fn ipi_log(&self) -> Vec<(u32, Ipi)> {
        self.state.lock().ipis.clone()
    }

    pub fn clear_ipi_log(&self) {
        self.state.lock().ipis.clear();
    }

    /// Calls made to the built-in wake primitive.
    pub fn wake_log(&self) -> Vec<(u32, u64)> {
        self.state.lock().wakes.clone()
    }

    /// Make the next offline request for `logical_id` fail.
    pub fn fail_offline(&self, logical_id: u32) {
        self.state.lock().failing_offline.insert(logical_id);
    }

    /// Make the next online request for `logical_id` fail.
    pub fn fail_online(&self, logical_id: u32) {
        self.state.lock().failing_online.insert(logical_id);
    }

    /// Queue a value for the next error status read.
    pub fn inject_error_status(&self, value: u32) {
        self.state.lock().pending_errors.push_back(value);
    }

    pub fn is_online(&self, logical_id: u32) -> bool {
        self.state.lock().online.contains_key(&logical_id)
    }

    /// Runs currently handed out from `node`.
    pub fn outstanding_runs(&self, node: NodeId) -> u64 {
        let state = self.state.lock();
        let total = self
            .config
            .nodes
            .iter()
            .find(|n| n.id == node)
            .map(|n| n.size / self.config.run_size)
            .unwrap_or(0);
        let free = state.free_runs.get(&node).map(|s| s.len() as u64).unwrap_or(0);
        total - free
    }

    /// Bytes still free in the page-table pool.
    pub fn free_pool_bytes(&self) -> u64 {
        self.state.lock().pool_free.values().sum()
    }

    fn accessible(&self, phys: u64, len: usize) -> bool {
        let range = PhysRange::new(phys, len as u64);
        self.config.low_memory.contains_range(&range)
            || self
                .config
                .nodes
                .iter()
                .any(|n| PhysRange::new(n.base, n.size).contains_range(&range))
    }
}

impl PageSource for SimulatedHost {
    fn run_size(&self) -> u64 {
        self.config.run_size
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.config.nodes.iter().map(|n| n.id).collect()
    }

    fn acquire_run(&self, node: NodeId) -> Option<PhysRange> {
        let mut state = self.state.lock();
        let runs = state.free_runs.get_mut(&node)?;
        let start = runs.pop_first()?;
        Some(PhysRange::new(start, self.config.run_size))
    }

    fn release_range(&self, range: PhysRange) {
        let run = self.config.run_size;
        if range.start % run != 0 || range.size % run != 0 {
            tracing::warn!(%range, "ignoring unaligned release");
            return;
        }
        let mut state = self.state.lock();
        let mut start = range.start;
        while start < range.end() {
            match self.config.nodes.iter().find(|n| PhysRange::new(n.base, n.size).contains(start)) {
                Some(node) => {
                    state.free_runs.entry(node.id).or_default().insert(start);
                }
                None => tracing::warn!(start = format_args!("{:#x}", start), "release outside any node"),
            }
            start += run;
        }
    }

    fn allocate_pages(&self, count: u64) -> Option<PhysRange> {
        let bytes = count * PAGE_SIZE;
        let mut state = self.state.lock();
        let (&start, &size) = state.pool_free.iter().find(|(_, size)| **size >= bytes)?;
        state.pool_free.remove(&start);
        if size > bytes {
            state.pool_free.insert(start + bytes, size - bytes);
        }
        Some(PhysRange::new(start, bytes))
    }

    fn free_pages(&self, range: PhysRange) {
        let mut state = self.state.lock();
        let mut start = range.start;
        let mut size = range.size;
        if let Some((&prev, &prev_size)) = state.pool_free.range(..start).next_back() {
            if prev + prev_size == start {
                state.pool_free.remove(&prev);
                start = prev;
                size += prev_size;
            }
        }
        if let Some(next_size) = state.pool_free.remove(&(start + size)) {
            size += next_size;
        }
        state.pool_free.insert(start, size);
    }
}

impl CpuHotplug for SimulatedHost {
    fn online_cpus(&self) -> CohostResult<Vec<HostCpu>> {
        Ok(self.state.lock().online.values().copied().collect())
    }

    fn set_online(&self, logical_id: u32, online: bool) -> CohostResult<()> {
        let mut state = self.state.lock();
        if online {
            if state.failing_online.remove(&logical_id) {
                return Err(CohostError::Internal(format!(
                    "hot-plug of cpu {} refused",
                    logical_id
                )));
            }
            let cpu = state.offline.remove(&logical_id).ok_or_else(|| {
                CohostError::Validation(format!("cpu {} is not offline", logical_id))
            })?;
            state.online.insert(logical_id, cpu);
        } else {
            if state.failing_offline.remove(&logical_id) {
                return Err(CohostError::Internal(format!(
                    "hot-unplug of cpu {} refused",
                    logical_id
                )));
            }
            let cpu = state.online.remove(&logical_id).ok_or_else(|| {
                CohostError::Validation(format!("cpu {} is not online", logical_id))
            })?;
            state.offline.insert(logical_id, cpu);
        }
        Ok(())
    }
}

impl InterruptController for SimulatedHost {
    fn send_ipi(&self, hw_id: u32, ipi: Ipi) {
        self.state.lock().ipis.push((hw_id, ipi));
    }

    fn delivery_pending(&self) -> bool {
        false
    }

    fn read_error_status(&self) -> u32 {
        self.state.lock().pending_errors.pop_front().unwrap_or(0)
    }

    fn wake_secondary(&self, hw_id: u32, start_ip: u64) -> Option<i32> {
        if !self.config.builtin_wake {
            return None;
        }
        self.state.lock().wakes.push((hw_id, start_ip));
        Some(0)
    }
}

impl PhysMemory for SimulatedHost {
    fn read(&self, phys: u64, buf: &mut [u8]) -> CohostResult<()> {
        if !self.accessible(phys, buf.len()) {
            return Err(super::out_of_bounds(phys, buf.len()));
        }
        let state = self.state.lock();
        let mut done = 0;
        while done < buf.len() {
            let addr = phys + done as u64;
            let page = addr & !(PAGE_SIZE - 1);
            let offset = (addr - page) as usize;
            let n = (PAGE_SIZE as usize - offset).min(buf.len() - done);
            match state.pages.get(&page) {
                Some(data) => buf[done..done + n].copy_from_slice(&data[offset..offset + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write(&self, phys: u64, data: &[u8]) -> CohostResult<()> {
        if !self.accessible(phys, data.len()) {
            return Err(super::out_of_bounds(phys, data.len()));
        }
        let mut state = self.state.lock();
        let mut done = 0;
        while done < data.len() {
            let addr = phys + done as u64;
            let page = addr & !(PAGE_SIZE - 1);
            let offset = (addr - page) as usize;
            let n = (PAGE_SIZE as usize - offset).min(data.len() - done);
            let frame = state
                .pages
                .entry(page)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
            frame[offset..offset + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn compare_exchange_u32(&self, phys: u64, current: u32, new: u32) -> CohostResult<bool> {
        if !self.accessible(phys, 4) || phys % 4 != 0 {
            return Err(super::out_of_bounds(phys, 4));
        }
        let mut state = self.state.lock();
        let page = phys & !(PAGE_SIZE - 1);
        let offset = (phys - page) as usize;
        let frame = state
            .pages
            .entry(page)
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
        let mut word = [0u8; 4];
        word.copy_from_slice(&frame[offset..offset + 4]);
        if u32::from_le_bytes(word) != current {
            return Ok(false);
        }
        frame[offset..offset + 4].copy_from_slice(&new.to_le_bytes());
        Ok(true)
    }
}
