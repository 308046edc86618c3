//! Instance operations.
//!
//! Every mutating operation starts by claiming the instance with an
//! [`OpGuard`]: the status moves from `Initial` to a busy status under the
//! instance lock, and a second caller gets [`CohostError::Busy`] instead of
//! waiting. The lock itself is only held for check-and-mark; the work runs
//! with the instance marked busy.

use super::status::OsStatus;
use super::{IkcPair, InstanceInfo, OsInstance, ResourceRequest};
use crate::boot::{LoadedImage, WakeStatus};
use crate::cpu::ReservedCpu;
use crate::device::DeviceInner;
use crate::host::PhysMemory;
use crate::options::CpuSelection;
use chrono::{DateTime, Utc};
use cohost_shared::errors::{CohostError, CohostResult};
use cohost_shared::layout::{boot_params, monitor, progress, BootParams};
use cohost_shared::{InstanceId, NodeId};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Last observed guest heartbeat.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Liveness {
    pub(crate) heartbeat: u64,
    pub(crate) since: Instant,
}

#[derive(Debug)]
pub(crate) struct InstanceState {
    pub(crate) status: OsStatus,
    pub(crate) image: Option<LoadedImage>,
    /// Staged here and copied into the boot parameter block at boot.
    pub(crate) kernel_args: String,
    pub(crate) ikc_map: Vec<IkcPair>,
    pub(crate) liveness: Option<Liveness>,
    /// Set while an [`OpGuard`] is alive, including the part of a boot that
    /// runs after the status is already `Booting`.
    pub(crate) op_in_flight: bool,
}

impl InstanceState {
    fn new() -> Self {
        Self {
            status: OsStatus::Initial,
            image: None,
            kernel_args: String::new(),
            ikc_map: Vec::new(),
            liveness: None,
            op_in_flight: false,
        }
    }

    /// The only place a status is written.
    pub(crate) fn transition(&mut self, id: InstanceId, next: OsStatus) -> CohostResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CohostError::Internal(format!(
                "os {}: illegal transition {} -> {}",
                id, self.status, next
            )));
        }
        tracing::debug!(os_id = id, from = %self.status, to = %next, "status change");
        self.status = next;
        Ok(())
    }

    fn reset(&mut self) {
        self.image = None;
        self.kernel_args.clear();
        self.ikc_map.clear();
        self.liveness = None;
    }
}

pub(crate) struct InstanceRecord {
    pub(crate) id: InstanceId,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) state: Mutex<InstanceState>,
}

impl InstanceRecord {
    pub(crate) fn new(id: InstanceId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(InstanceState::new()),
        }
    }
}

/// Claim on an instance for the duration of one operation.
///
/// Dropping the guard without [`commit`](Self::commit) puts the status back
/// to `Initial`. Either way the in-flight marker is cleared, and until then
/// shutdown is refused as well.
pub(crate) struct OpGuard {
    record: Arc<InstanceRecord>,
    committed: bool,
}

impl OpGuard {
    fn begin(record: &Arc<InstanceRecord>, during: OsStatus) -> CohostResult<Self> {
        let mut state = record.state.lock();
        if state.op_in_flight || state.status != OsStatus::Initial {
            return Err(CohostError::Busy(format!(
                "os {} is {}",
                record.id, state.status
            )));
        }
        state.transition(record.id, during)?;
        state.op_in_flight = true;
        Ok(Self {
            record: Arc::clone(record),
            committed: false,
        })
    }

    /// Keep the busy status; the caller moves on from it.
    fn commit(mut self) {
        self.committed = true;
        self.record.state.lock().op_in_flight = false;
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = self.record.state.lock();
        state.op_in_flight = false;
        if let Err(e) = state.transition(self.record.id, OsStatus::Initial) {
            tracing::error!(os_id = self.record.id, error = %e, "failed to restore status");
        }
    }
}

impl OsInstance {
    pub(crate) fn new(record: Arc<InstanceRecord>, device: DeviceInner) -> Self {
        Self { record, device }
    }

    fn begin(&self, during: OsStatus) -> CohostResult<OpGuard> {
        self.device.ensure_open()?;
        OpGuard::begin(&self.record, during).inspect_err(|e| {
            if matches!(e, CohostError::Busy(_)) {
                self.device.metrics.increment_busy_rejections();
            }
        })
    }

    pub fn id(&self) -> InstanceId {
        self.record.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    /// Status as last recorded, without polling the guest. See
    /// [`query_status`](Self::query_status).
    pub fn status(&self) -> OsStatus {
        self.record.state.lock().status
    }

    pub fn cpus(&self) -> Vec<ReservedCpu> {
        self.device.cpus.assigned(self.id())
    }

    pub fn info(&self) -> InstanceInfo {
        let state = self.record.state.lock();
        InstanceInfo {
            id: self.id(),
            status: state.status,
            created_at: self.record.created_at,
            cpus: self.device.cpus.assigned(self.id()),
            memory: self.device.memory.owned_by(self.id()),
            window: self.device.memory.window(self.id()),
            entry_point: state.image.as_ref().map(|i| i.entry_point),
            boot_params: state.image.as_ref().map(|i| i.boot_params_phys),
            kernel_args: state.kernel_args.clone(),
            ikc_map: state.ikc_map.clone(),
        }
    }

    /// True if the instance owns any cores or memory.
    pub fn has_resources(&self) -> bool {
        !self.device.cpus.assigned(self.id()).is_empty()
            || !self.device.memory.owned_by(self.id()).is_empty()
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Assign cores and memory in one step. On failure everything taken by
    /// this call is given back.
    pub fn allocate_resources(&self, req: &ResourceRequest) -> CohostResult<()> {
        let _guard = self.begin(OsStatus::Loading)?;
        let id = self.id();

        let cpus = match &req.cpus {
            Some(CpuSelection::Count(n)) => self.device.cpus.assign(id, *n)?,
            Some(CpuSelection::List(ids)) => self.device.cpus.assign_list(id, ids)?,
            None => Vec::new(),
        };

        let mut chunks = Vec::with_capacity(req.memory.len());
        for mem in &req.memory {
            match self.allocate_one(mem.size.bytes(), Some(mem.node)) {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => {
                    for chunk in &chunks {
                        if let Err(e) = self.device.memory.free_chunk(id, chunk.start) {
                            tracing::error!(os_id = id, error = %e, "rollback of chunk failed");
                        }
                    }
                    let ids: Vec<u32> = cpus.iter().map(|c| c.logical_id).collect();
                    if let Err(e) = self.device.cpus.unassign_list(id, &ids) {
                        tracing::error!(os_id = id, error = %e, "rollback of cpus failed");
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            os_id = id,
            cpus = cpus.len(),
            chunks = chunks.len(),
            "allocated resources"
        );
        Ok(())
    }

    fn allocate_one(&self, size: Option<u64>, node: Option<NodeId>) -> CohostResult<crate::memory::MemoryChunk> {
        let size = size.ok_or_else(|| {
            CohostError::Validation("instance memory needs an explicit size".into())
        })?;
        self.device
            .memory
            .allocate(self.id(), size, node)
            .inspect_err(|_| self.device.metrics.increment_allocation_failures())
    }

    pub fn assign_cpus(&self, count: u32) -> CohostResult<Vec<ReservedCpu>> {
        let _guard = self.begin(OsStatus::Loading)?;
        self.device.cpus.assign(self.id(), count)
    }

    pub fn assign_cpu_list(&self, ids: &[u32]) -> CohostResult<Vec<ReservedCpu>> {
        let _guard = self.begin(OsStatus::Loading)?;
        self.device.cpus.assign_list(self.id(), ids)
    }

    /// Return all cores to the device pool. The ikc map is cleared with them.
    pub fn release_cpus(&self) -> CohostResult<Vec<u32>> {
        let _guard = self.begin(OsStatus::Loading)?;
        self.record.state.lock().ikc_map.clear();
        Ok(self.device.cpus.unassign(self.id()))
    }

    pub fn release_cpu_list(&self, ids: &[u32]) -> CohostResult<()> {
        let _guard = self.begin(OsStatus::Loading)?;
        self.device.cpus.unassign_list(self.id(), ids)?;
        self.record
            .state
            .lock()
            .ikc_map
            .retain(|p| !ids.contains(&p.guest_cpu));
        Ok(())
    }

    pub fn assign_memory(&self, size: u64, node: Option<NodeId>) -> CohostResult<crate::memory::MemoryChunk> {
        let _guard = self.begin(OsStatus::Loading)?;
        self.allocate_one(Some(size), node)
    }

    /// Return all memory. A loaded image goes with it.
    pub fn release_memory(&self) -> CohostResult<u64> {
        let _guard = self.begin(OsStatus::Loading)?;
        self.record.state.lock().image = None;
        Ok(self.device.memory.free_owner(self.id()))
    }

    /// Map guest cores to host cores for the inter-kernel channel.
    ///
    /// Guest cores must be assigned to this instance; host cores must not be
    /// reserved by the device.
    pub fn set_ikc_map(&self, pairs: &[IkcPair]) -> CohostResult<()> {
        let _guard = self.begin(OsStatus::Loading)?;
        let assigned = self.device.cpus.assigned(self.id());
        for pair in pairs {
            if !assigned.iter().any(|c| c.logical_id == pair.guest_cpu) {
                return Err(CohostError::Validation(format!(
                    "cpu {} is not assigned to os {}",
                    pair.guest_cpu,
                    self.id()
                )));
            }
            if self.device.cpus.is_reserved(pair.host_cpu) {
                return Err(CohostError::Validation(format!(
                    "host cpu {} is reserved for guests",
                    pair.host_cpu
                )));
            }
        }
        self.record.state.lock().ikc_map = pairs.to_vec();
        Ok(())
    }

    // ========================================================================
    // Image & kernel arguments
    // ========================================================================

    /// Load an ELF image into the instance's memory window.
    pub fn load_image(&self, bytes: &[u8]) -> CohostResult<()> {
        let _guard = self.begin(OsStatus::Loading)?;
        let window = self.device.memory.window(self.id()).ok_or_else(|| {
            CohostError::Validation(format!("os {} has no memory assigned", self.id()))
        })?;
        let image = self.device.boot.load_image(window, bytes)?;
        tracing::info!(
            os_id = self.id(),
            %window,
            entry = format_args!("{:#x}", image.entry_point),
            "image loaded"
        );
        self.record.state.lock().image = Some(image);
        Ok(())
    }

    pub fn load_image_file(&self, path: impl AsRef<Path>) -> CohostResult<()> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            CohostError::Validation(format!("cannot read image {}: {}", path.display(), e))
        })?;
        self.load_image(&bytes)
    }

    /// Stage the kernel command line for the next boot.
    pub fn set_kernel_args(&self, args: &str) -> CohostResult<()> {
        let _guard = self.begin(OsStatus::Loading)?;
        if args.len() >= boot_params::KARGS_SIZE || args.contains('\0') {
            return Err(CohostError::Validation(format!(
                "kernel arguments must be under {} bytes without NUL",
                boot_params::KARGS_SIZE
            )));
        }
        self.record.state.lock().kernel_args = args.to_string();
        Ok(())
    }

    // ========================================================================
    // Boot & shutdown
    // ========================================================================

    /// Start the guest on the lowest assigned core.
    ///
    /// Returns once the wake sequence has been sent; the status is then
    /// `Booting` and guest progress is observed through
    /// [`query_status`](Self::query_status). A wake the interrupt controller
    /// did not accept is reported as `HardwareProtocol`, but the instance
    /// stays `Booting`.
    pub async fn boot(&self) -> CohostResult<()> {
        let guard = self.begin(OsStatus::Booting)?;
        let id = self.id();

        let cpus = self.device.cpus.assigned(id);
        let boot_core = *cpus
            .first()
            .ok_or_else(|| CohostError::Validation(format!("os {} has no cpus", id)))?;
        let chunks = self.device.memory.owned_by(id);
        let (image, kernel_args) = {
            let state = self.record.state.lock();
            let image = state
                .image
                .clone()
                .ok_or_else(|| CohostError::Validation(format!("os {} has no image loaded", id)))?;
            (image, state.kernel_args.clone())
        };

        let params = BootParams {
            mem_start: image.window.start,
            mem_end: image.window.end(),
            cpu_hw_ids: cpus.iter().map(|c| c.hw_id).collect(),
            chunks: chunks.iter().map(|c| (c.start, c.size)).collect(),
            kernel_args,
            ..Default::default()
        };
        self.device.boot.write_boot_params(&image, params)?;

        let device = Arc::clone(&self.device);
        let wake = tokio::task::spawn_blocking(move || -> CohostResult<WakeStatus> {
            let status = device.boot.boot(&image, boot_core.hw_id)?;
            guard.commit();
            Ok(status)
        })
        .await
        .map_err(|e| CohostError::Internal(format!("boot task failed: {}", e)))??;

        self.device.metrics.increment_boots_issued();
        if !wake.is_ok() {
            self.device.metrics.increment_boot_failures();
            tracing::warn!(os_id = id, hw_id = boot_core.hw_id, ?wake, "wake not accepted");
            return Err(CohostError::HardwareProtocol(format!(
                "os {}: wake of core {} returned accept={:#x} send={:#x}",
                id, boot_core.logical_id, wake.accept, wake.send
            )));
        }
        tracing::info!(os_id = id, cpu = boot_core.logical_id, "boot issued");
        Ok(())
    }

    /// Interpret guest progress and return the current status.
    ///
    /// While booting or running, reads the monitor word, the progress word
    /// and the heartbeat from the boot parameter block. Other statuses are
    /// returned as recorded.
    pub fn query_status(&self) -> CohostResult<OsStatus> {
        let mut state = self.record.state.lock();
        let current = state.status;
        if !matches!(
            current,
            OsStatus::Booting | OsStatus::Booted | OsStatus::Ready | OsStatus::Running
        ) {
            return Ok(current);
        }
        let Some(base) = state.image.as_ref().map(|i| i.boot_params_phys) else {
            return Ok(current);
        };
        let mem = self.device.host.memory.as_ref();

        if mem.read_u64(base + boot_params::MONITOR_STATUS)? == monitor::PANIC {
            tracing::warn!(os_id = self.id(), "guest reported panic");
            state.transition(self.id(), OsStatus::Failed)?;
            return Ok(OsStatus::Failed);
        }

        let reported = match mem.read_u64(base + boot_params::STATUS)? {
            progress::BOOTED => Some(OsStatus::Booted),
            progress::READY => Some(OsStatus::Ready),
            progress::RUNNING => Some(OsStatus::Running),
            _ => None,
        };
        if let Some(next) = reported.filter(|n| !current.has_reached(*n)) {
            state.transition(self.id(), next)?;
        }

        if state.status == OsStatus::Running {
            if let Some(timeout) = self.device.options.liveness_timeout() {
                let heartbeat = mem.read_u64(base + boot_params::HEARTBEAT)?;
                let now = Instant::now();
                match state.liveness {
                    Some(l) if l.heartbeat == heartbeat => {
                        if now.duration_since(l.since) > timeout {
                            tracing::warn!(os_id = self.id(), heartbeat, "guest heartbeat stalled");
                            state.transition(self.id(), OsStatus::Hungup)?;
                        }
                    }
                    _ => state.liveness = Some(Liveness { heartbeat, since: now }),
                }
            }
        }
        Ok(state.status)
    }

    /// Stop the guest and give everything it owns back to the device.
    ///
    /// A booted instance goes Shutdown, every owned core gets an INIT reset,
    /// then Stopped and finally Initial once memory and cores are returned.
    /// An instance that never booted only returns its resources. Cores that
    /// did not accept the reset are reported as `HardwareProtocol` after
    /// cleanup completes. A boot whose wake sequence is still being sent
    /// makes shutdown fail with `Busy`.
    pub async fn shutdown(&self) -> CohostResult<()> {
        self.device.ensure_open()?;
        let id = self.id();

        let booted = {
            let mut state = self.record.state.lock();
            if state.op_in_flight {
                self.device.metrics.increment_busy_rejections();
                return Err(CohostError::Busy(format!(
                    "os {} has an operation in flight ({})",
                    id, state.status
                )));
            }
            if state.status.is_booted() {
                state.transition(id, OsStatus::Shutdown)?;
                true
            } else {
                false
            }
        };
        if !booted {
            let guard = self.begin(OsStatus::Loading)?;
            self.release_all_resources();
            self.record.state.lock().reset();
            drop(guard);
            return Ok(());
        }

        let cpus = self.device.cpus.assigned(id);
        let device = Arc::clone(&self.device);
        let rejected = tokio::task::spawn_blocking(move || {
            cpus.iter()
                .filter(|c| !device.boot.reset_core(c.hw_id).is_ok())
                .map(|c| c.logical_id)
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| CohostError::Internal(format!("reset task failed: {}", e)));

        {
            let mut state = self.record.state.lock();
            state.transition(id, OsStatus::Stopped)?;
            self.release_all_resources();
            state.reset();
            state.transition(id, OsStatus::Initial)?;
        }
        self.device.metrics.increment_shutdowns();

        let rejected = rejected?;
        if !rejected.is_empty() {
            return Err(CohostError::HardwareProtocol(format!(
                "os {}: cores {:?} did not accept reset",
                id, rejected
            )));
        }
        tracing::info!(os_id = id, "shut down");
        Ok(())
    }

    fn release_all_resources(&self) {
        let freed = self.device.memory.free_owner(self.id());
        let cpus = self.device.cpus.unassign(self.id());
        tracing::debug!(os_id = self.id(), bytes = freed, cpus = ?cpus, "released resources");
    }

    pub(crate) fn memory(&self) -> &Arc<dyn PhysMemory> {
        &self.device.host.memory
    }

    /// Boot parameter block address, once an image is loaded.
    pub(crate) fn boot_params_phys(&self) -> Option<u64> {
        self.record.state.lock().image.as_ref().map(|i| i.boot_params_phys)
    }
}
