use crate::boot::IpiSequencer;
use crate::host::CpuHotplug;
use cohost_shared::errors::{CohostError, CohostResult};
use cohost_shared::{InstanceId, NodeId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A host core taken offline and held for guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ReservedCpu {
    pub logical_id: u32,
    pub hw_id: u32,
    pub node: NodeId,
}

#[derive(Default)]
struct CpuInner {
    reserved: BTreeMap<u32, ReservedCpu>,
    /// logical id -> owning instance
    owners: BTreeMap<u32, InstanceId>,
    /// Cores a `reserve` call is still taking offline.
    pending: BTreeSet<u32>,
}

/// Device-wide registry of reserved cores and their assignment to
/// instances.
///
/// Reserving takes a core away from the host (hot-unplug + INIT reset).
/// Assigning and unassigning only move it between the pool and an
/// instance; the host gets it back on [`release`](Self::release).
pub struct CpuRegistry {
    hotplug: Arc<dyn CpuHotplug>,
    ipi: IpiSequencer,
    inner: Mutex<CpuInner>,
}

impl CpuRegistry {
    pub fn new(hotplug: Arc<dyn CpuHotplug>, ipi: IpiSequencer) -> Self {
        Self {
            hotplug,
            ipi,
            inner: Mutex::new(CpuInner::default()),
        }
    }

    /// Reserve `count` online cores, highest logical ids first. CPU 0 always
    /// stays with the host.
    pub fn reserve_at_init(&self, count: u32) -> CohostResult<Vec<ReservedCpu>> {
        if count == 0 {
            return Err(CohostError::Validation("cpu count must be nonzero".into()));
        }
        let mut candidates: Vec<_> = self
            .hotplug
            .online_cpus()?
            .into_iter()
            .filter(|c| c.logical_id != 0)
            .collect();
        candidates.sort_by_key(|c| std::cmp::Reverse(c.logical_id));
        if candidates.len() < count as usize {
            return Err(CohostError::ResourceExhausted(format!(
                "{} cpus requested, {} available to reserve",
                count,
                candidates.len()
            )));
        }
        let ids: Vec<u32> = candidates[..count as usize].iter().map(|c| c.logical_id).collect();
        self.reserve(&ids)
    }

    /// Reserve exactly the cores in `ids`.
    ///
    /// All-or-nothing: if any hot-unplug fails, cores already taken offline
    /// by this call are put back online.
    pub fn reserve(&self, ids: &[u32]) -> CohostResult<Vec<ReservedCpu>> {
        if ids.is_empty() {
            return Err(CohostError::Validation("empty cpu list".into()));
        }
        if ids.contains(&0) {
            return Err(CohostError::Validation("cpu 0 cannot be reserved".into()));
        }
        let unique: BTreeSet<u32> = ids.iter().copied().collect();
        if unique.len() != ids.len() {
            return Err(CohostError::Validation(format!("duplicate ids in {:?}", ids)));
        }

        let online = self.hotplug.online_cpus()?;
        let mut picked = Vec::with_capacity(ids.len());
        {
            let mut inner = self.inner.lock();
            for id in ids {
                if inner.reserved.contains_key(id) || inner.pending.contains(id) {
                    return Err(CohostError::Validation(format!("cpu {} is already reserved", id)));
                }
                let cpu = online.iter().find(|c| c.logical_id == *id).ok_or_else(|| {
                    CohostError::Validation(format!("cpu {} is not online", id))
                })?;
                picked.push(ReservedCpu {
                    logical_id: cpu.logical_id,
                    hw_id: cpu.hw_id,
                    node: cpu.node,
                });
            }
            inner.pending.extend(unique.iter().copied());
        }

        let mut offlined: Vec<u32> = Vec::with_capacity(picked.len());
        for cpu in &picked {
            if let Err(e) = self.hotplug.set_online(cpu.logical_id, false) {
                tracing::error!(cpu = cpu.logical_id, error = %e, "hot-unplug failed, rolling back");
                for id in offlined.iter().rev() {
                    if let Err(e) = self.hotplug.set_online(*id, true) {
                        tracing::error!(cpu = id, error = %e, "failed to re-online during rollback");
                    }
                }
                let mut inner = self.inner.lock();
                for id in &unique {
                    inner.pending.remove(id);
                }
                return Err(e);
            }
            offlined.push(cpu.logical_id);
        }

        for cpu in &picked {
            self.ipi.reset(cpu.hw_id);
        }

        let mut inner = self.inner.lock();
        for cpu in &picked {
            inner.pending.remove(&cpu.logical_id);
            inner.reserved.insert(cpu.logical_id, *cpu);
        }
        tracing::info!(cpus = ?ids, "reserved cpus");
        Ok(picked)
    }

    /// Assign the first `count` unassigned cores, in ascending logical id
    /// order, to `owner`.
    pub fn assign(&self, owner: InstanceId, count: u32) -> CohostResult<Vec<ReservedCpu>> {
        if count == 0 {
            return Err(CohostError::Validation("cpu count must be nonzero".into()));
        }
        let mut inner = self.inner.lock();
        let free: Vec<ReservedCpu> = inner
            .reserved
            .values()
            .filter(|c| !inner.owners.contains_key(&c.logical_id))
            .take(count as usize)
            .copied()
            .collect();
        if free.len() < count as usize {
            return Err(CohostError::ResourceExhausted(format!(
                "{} cpus requested, {} unassigned",
                count,
                free.len()
            )));
        }
        for cpu in &free {
            inner.owners.insert(cpu.logical_id, owner);
        }
        tracing::debug!(os_id = owner, cpus = ?free.iter().map(|c| c.logical_id).collect::<Vec<_>>(), "assigned cpus");
        Ok(free)
    }

    /// Assign the named cores to `owner`. All-or-nothing.
    pub fn assign_list(&self, owner: InstanceId, ids: &[u32]) -> CohostResult<Vec<ReservedCpu>> {
        if ids.is_empty() {
            return Err(CohostError::Validation("empty cpu list".into()));
        }
        let mut inner = self.inner.lock();
        let mut picked = Vec::with_capacity(ids.len());
        for id in ids {
            let cpu = inner
                .reserved
                .get(id)
                .copied()
                .ok_or_else(|| CohostError::Validation(format!("cpu {} is not reserved", id)))?;
            if let Some(other) = inner.owners.get(id) {
                return Err(CohostError::ResourceExhausted(format!(
                    "cpu {} is assigned to os {}",
                    id, other
                )));
            }
            if picked.iter().any(|c: &ReservedCpu| c.logical_id == *id) {
                return Err(CohostError::Validation(format!("cpu {} listed twice", id)));
            }
            picked.push(cpu);
        }
        for cpu in &picked {
            inner.owners.insert(cpu.logical_id, owner);
        }
        Ok(picked)
    }

    /// Return every core of `owner` to the pool.
    pub fn unassign(&self, owner: InstanceId) -> Vec<u32> {
        let mut inner = self.inner.lock();
        let ids: Vec<u32> = inner
            .owners
            .iter()
            .filter(|(_, o)| **o == owner)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            inner.owners.remove(id);
        }
        ids
    }

    /// Return the named cores of `owner` to the pool. All-or-nothing.
    pub fn unassign_list(&self, owner: InstanceId, ids: &[u32]) -> CohostResult<()> {
        let mut inner = self.inner.lock();
        for id in ids {
            if inner.owners.get(id) != Some(&owner) {
                return Err(CohostError::Validation(format!(
                    "cpu {} is not assigned to os {}",
                    id, owner
                )));
            }
        }
        for id in ids {
            inner.owners.remove(id);
        }
        Ok(())
    }

    /// Cores of `owner`, in ascending logical id order.
    pub fn assigned(&self, owner: InstanceId) -> Vec<ReservedCpu> {
        let inner = self.inner.lock();
        inner
            .owners
            .iter()
            .filter(|(_, o)| **o == owner)
            .filter_map(|(id, _)| inner.reserved.get(id).copied())
            .collect()
    }

    pub fn reserved(&self) -> Vec<ReservedCpu> {
        self.inner.lock().reserved.values().copied().collect()
    }

    pub fn unassigned(&self) -> Vec<ReservedCpu> {
        let inner = self.inner.lock();
        inner
            .reserved
            .values()
            .filter(|c| !inner.owners.contains_key(&c.logical_id))
            .copied()
            .collect()
    }

    /// True if `logical_id` is reserved by this device.
    pub fn is_reserved(&self, logical_id: u32) -> bool {
        self.inner.lock().reserved.contains_key(&logical_id)
    }

    /// Give unassigned cores back to the host.
    pub fn release(&self, ids: &[u32]) -> CohostResult<()> {
        {
            let inner = self.inner.lock();
            for id in ids {
                if !inner.reserved.contains_key(id) {
                    return Err(CohostError::Validation(format!("cpu {} is not reserved", id)));
                }
                if let Some(owner) = inner.owners.get(id) {
                    return Err(CohostError::Busy(format!("cpu {} is assigned to os {}", id, owner)));
                }
            }
        }
        for id in ids {
            self.hotplug.set_online(*id, true)?;
            self.inner.lock().reserved.remove(id);
        }
        tracing::info!(cpus = ?ids, "released cpus to host");
        Ok(())
    }

    /// Release every reserved core. Fails if any is still assigned.
    pub fn release_all(&self) -> CohostResult<()> {
        let ids: Vec<u32> = self.inner.lock().reserved.keys().copied().collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.release(&ids)
    }
}
