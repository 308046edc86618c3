//! The device: one partition of the host shared by every OS instance.
//!
//! [`CohostDevice::open`] reserves memory and cores and builds the identity
//! map; [`CohostDevice::teardown`] gives all of it back. In between, the
//! device hands out [`OsInstance`] handles and exposes the device-wide
//! resource operations.

mod init;

use crate::boot::{BootSequenceBuilder, IdentityMap, IpiSequencer, Trampoline};
use crate::cpu::{CpuRegistry, ReservedCpu};
use crate::host::Host;
use crate::instance::{InstanceInfo, InstanceRecord, OsInstance, OsStatus};
use crate::memory::{MemoryChunk, MemoryRegistry, MemoryRequest, MemoryStats, UsedChunk};
use crate::metrics::{DeviceMetrics, DeviceMetricsStorage};
use crate::options::DeviceOptions;
use crate::pipeline::PipelineMetrics;
use cohost_shared::InstanceId;
use cohost_shared::errors::{CohostError, CohostResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Shared device state. Every [`OsInstance`] handle holds one.
pub type DeviceInner = Arc<DeviceInnerImpl>;

/// Device internals.
///
/// Registries and the instance table lock internally; nothing here needs an
/// outer lock. Options, host handles and the boot builder are immutable
/// after open.
pub struct DeviceInnerImpl {
    pub(crate) options: DeviceOptions,
    pub(crate) host: Host,
    pub(crate) memory: Arc<MemoryRegistry>,
    pub(crate) cpus: Arc<CpuRegistry>,
    pub(crate) boot: BootSequenceBuilder,
    pub(crate) metrics: DeviceMetricsStorage,
    identity_map: Mutex<Option<IdentityMap>>,
    instances: Mutex<BTreeMap<InstanceId, Arc<InstanceRecord>>>,
    next_id: AtomicU32,
    init_metrics: PipelineMetrics,
    open: AtomicBool,
}

impl DeviceInnerImpl {
    pub(crate) fn ensure_open(&self) -> CohostResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CohostError::Validation("device has been torn down".into()))
        }
    }
}

/// Handle to an open device.
#[derive(Clone)]
pub struct CohostDevice {
    inner: DeviceInner,
}

impl std::fmt::Debug for CohostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CohostDevice")
            .field("memory", &self.inner.memory.stats())
            .field("cpus", &self.inner.cpus.reserved().len())
            .field("instances", &self.inner.instances.lock().len())
            .finish()
    }
}

impl CohostDevice {
    /// Validate `options`, reserve resources from `host` and build the
    /// identity map.
    ///
    /// Fails with `Config` for bad options and `FatalInit` if bring-up
    /// fails; in the latter case nothing stays reserved.
    pub async fn open(options: DeviceOptions, host: Host) -> CohostResult<Self> {
        options.validate()?;
        let trampoline = Trampoline::new(options.trampoline_phys)?;

        let ipi = IpiSequencer::new(Arc::clone(&host.apic), options.boot_timings);
        let memory = Arc::new(MemoryRegistry::new(
            Arc::clone(&host.pages),
            options.max_free_chunks,
            options.split_chunks,
        ));
        let cpus = Arc::new(CpuRegistry::new(Arc::clone(&host.cpus), ipi.clone()));

        let ctx = Arc::new(init::InitContext {
            options: options.clone(),
            host: host.clone(),
            memory: Arc::clone(&memory),
            cpus: Arc::clone(&cpus),
            identity_map: Mutex::new(None),
        });
        let (identity_map, init_metrics) = init::run(ctx).await?;

        let boot = BootSequenceBuilder::new(
            Arc::clone(&host.memory),
            ipi,
            trampoline,
            identity_map.root(),
            options.guest_link_base,
            options.notification_irq,
        );

        let stats = memory.stats();
        tracing::info!(
            reserved_bytes = stats.reserved_bytes,
            free_chunks = stats.free_chunks,
            cpus = cpus.reserved().len(),
            duration_ms = init_metrics.total_duration_ms,
            "device open"
        );

        Ok(Self {
            inner: Arc::new(DeviceInnerImpl {
                options,
                host,
                memory,
                cpus,
                boot,
                metrics: DeviceMetricsStorage::new(),
                identity_map: Mutex::new(Some(identity_map)),
                instances: Mutex::new(BTreeMap::new()),
                next_id: AtomicU32::new(0),
                init_metrics,
                open: AtomicBool::new(true),
            }),
        })
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.inner.options
    }

    /// Root of the identity map every boot starts on.
    pub fn identity_root(&self) -> u64 {
        self.inner.boot.identity_root()
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Create an instance in `Initial` with nothing assigned.
    pub fn create_instance(&self) -> CohostResult<OsInstance> {
        self.inner.ensure_open()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(InstanceRecord::new(id));
        self.inner.instances.lock().insert(id, Arc::clone(&record));
        self.inner.metrics.increment_instances_created();
        tracing::debug!(os_id = id, "created instance");
        Ok(OsInstance::new(record, Arc::clone(&self.inner)))
    }

    pub fn instance(&self, id: InstanceId) -> CohostResult<OsInstance> {
        let record = self
            .inner
            .instances
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| CohostError::NotFound(format!("os {}", id)))?;
        Ok(OsInstance::new(record, Arc::clone(&self.inner)))
    }

    /// Every instance, ordered by id.
    pub fn instances(&self) -> Vec<InstanceInfo> {
        let records: Vec<_> = self.inner.instances.lock().values().cloned().collect();
        records
            .into_iter()
            .map(|r| OsInstance::new(r, Arc::clone(&self.inner)).info())
            .collect()
    }

    /// Remove an instance. It must be `Initial` and own nothing.
    pub fn destroy_instance(&self, id: InstanceId) -> CohostResult<()> {
        let mut instances = self.inner.instances.lock();
        let record = instances
            .get(&id)
            .ok_or_else(|| CohostError::NotFound(format!("os {}", id)))?;
        let handle = OsInstance::new(Arc::clone(record), Arc::clone(&self.inner));
        // Taking the record lock keeps the status from moving while checked.
        let state = record.state.lock();
        if state.status != OsStatus::Initial || handle.has_resources() {
            return Err(CohostError::Busy(format!(
                "os {} is {} and still owns resources or is in use",
                id, state.status
            )));
        }
        drop(state);
        instances.remove(&id);
        self.inner.metrics.increment_instances_destroyed();
        tracing::debug!(os_id = id, "destroyed instance");
        Ok(())
    }

    // ========================================================================
    // Device-wide resources
    // ========================================================================

    /// Reserve more memory from the host after open.
    pub fn reserve_memory(&self, req: MemoryRequest) -> CohostResult<u64> {
        self.inner.ensure_open()?;
        self.inner.memory.reserve(req)
    }

    /// Give free memory back to the host: one chunk by start address, or all.
    pub fn release_memory(&self, start: Option<u64>) -> CohostResult<u64> {
        self.inner.memory.release_to_host(start)
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.inner.memory.stats()
    }

    pub fn free_chunks(&self) -> Vec<MemoryChunk> {
        self.inner.memory.free_chunks()
    }

    pub fn used_chunks(&self) -> Vec<UsedChunk> {
        self.inner.memory.used_chunks()
    }

    /// Reserve additional host cores by logical id.
    pub async fn reserve_cpus(&self, ids: &[u32]) -> CohostResult<Vec<ReservedCpu>> {
        self.inner.ensure_open()?;
        let cpus = Arc::clone(&self.inner.cpus);
        let ids = ids.to_vec();
        tokio::task::spawn_blocking(move || cpus.reserve(&ids))
            .await
            .map_err(|e| CohostError::Internal(format!("cpu reservation task failed: {}", e)))?
    }

    /// Return unassigned cores to the host.
    pub fn release_cpus(&self, ids: &[u32]) -> CohostResult<()> {
        self.inner.cpus.release(ids)
    }

    pub fn reserved_cpus(&self) -> Vec<ReservedCpu> {
        self.inner.cpus.reserved()
    }

    pub fn unassigned_cpus(&self) -> Vec<ReservedCpu> {
        self.inner.cpus.unassigned()
    }

    pub fn metrics(&self) -> DeviceMetrics {
        self.inner.metrics.snapshot()
    }

    /// Stage timings of the bring-up pipeline.
    pub fn init_metrics(&self) -> &PipelineMetrics {
        &self.inner.init_metrics
    }

    /// Give every core, every byte and the identity map back to the host.
    ///
    /// Fails with `Busy` while any instance is past `Initial` or owns
    /// resources; shut those down first. Instances left in `Initial` are
    /// dropped. Calling it again after success is a no-op; after a failure
    /// it retries whatever is still held.
    pub fn teardown(&self) -> CohostResult<()> {
        let mut instances = self.inner.instances.lock();
        if !self.inner.open.load(Ordering::Acquire) {
            return Ok(());
        }
        for (id, record) in instances.iter() {
            let status = record.state.lock().status;
            let handle = OsInstance::new(Arc::clone(record), Arc::clone(&self.inner));
            if status != OsStatus::Initial || handle.has_resources() {
                return Err(CohostError::Busy(format!(
                    "os {} is {}; shut it down before teardown",
                    id, status
                )));
            }
        }
        // Both releases are attempted. The device closes only once both
        // went through.
        let cpus = self.inner.cpus.release_all();
        let memory = self.inner.memory.release_all();
        let released = match (cpus, memory) {
            (Ok(()), Ok(released)) => released,
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "teardown incomplete");
                return Err(e);
            }
        };
        if let Some(map) = self.inner.identity_map.lock().take() {
            map.release(self.inner.host.pages.as_ref());
        }
        instances.clear();
        self.inner.open.store(false, Ordering::Release);
        tracing::info!(bytes = released, "device torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{SimulatedHost, SimulatedHostConfig};
    use crate::memory::MemSize;
    use crate::options::{BootTimings, CpuSelection};
    use cohost_shared::ErrorKind;

    fn options() -> DeviceOptions {
        DeviceOptions {
            memory: vec![MemoryRequest::new(MemSize::Bytes(64 << 20), 0)],
            cpus: CpuSelection::Count(2),
            identity_map_ceiling: 8 << 30,
            boot_timings: BootTimings::immediate(),
            ..Default::default()
        }
    }

    async fn open(sim: &Arc<SimulatedHost>) -> CohostDevice {
        CohostDevice::open(options(), Host::simulated(Arc::clone(sim)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_reserves_resources() {
        let sim = Arc::new(SimulatedHost::new(SimulatedHostConfig::default()));
        let device = open(&sim).await;

        assert_eq!(device.memory_stats().reserved_bytes, 64 << 20);
        let cpus: Vec<u32> = device.reserved_cpus().iter().map(|c| c.logical_id).collect();
        assert_eq!(cpus, vec![6, 7]);
        assert!(!sim.is_online(7));
        assert!(device.identity_root() != 0);
        assert!(device.init_metrics().task_duration_ms("identity_map").is_some());
    }

    #[tokio::test]
    async fn test_open_failure_rolls_back() {
        let sim = Arc::new(SimulatedHost::new(SimulatedHostConfig::default()));
        sim.fail_offline(6);
        let err = CohostDevice::open(options(), Host::simulated(Arc::clone(&sim)))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::FatalInit);
        assert!(sim.is_online(7));
        assert_eq!(sim.outstanding_runs(0), 0);
    }

    #[tokio::test]
    async fn test_bad_options_are_config_errors() {
        let sim = Arc::new(SimulatedHost::new(SimulatedHostConfig::default()));
        let mut opts = options();
        opts.max_free_chunks = 0;
        let err = CohostDevice::open(opts, Host::simulated(sim)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_destroy_requires_idle_instance() {
        let sim = Arc::new(SimulatedHost::new(SimulatedHostConfig::default()));
        let device = open(&sim).await;
        let os = device.create_instance().unwrap();
        os.assign_cpus(1).unwrap();

        let err = device.destroy_instance(os.id()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        os.release_cpus().unwrap();
        device.destroy_instance(os.id()).unwrap();
        assert!(matches!(device.instance(os.id()), Err(CohostError::NotFound(_))));
        assert_eq!(device.metrics().live_instances(), 0);
    }

    #[tokio::test]
    async fn test_teardown_returns_everything() {
        let sim = Arc::new(SimulatedHost::new(SimulatedHostConfig::default()));
        let free_before = sim.free_pool_bytes();
        let device = open(&sim).await;
        let os = device.create_instance().unwrap();
        os.assign_memory(8 << 20, Some(0)).unwrap();

        assert_eq!(device.teardown().unwrap_err().kind(), ErrorKind::Busy);
        os.release_memory().unwrap();
        device.teardown().unwrap();
        device.teardown().unwrap();

        assert_eq!(sim.outstanding_runs(0), 0);
        assert!(sim.is_online(6) && sim.is_online(7));
        assert_eq!(sim.free_pool_bytes(), free_before);
        assert!(device.create_instance().is_err());
    }

    #[tokio::test]
    async fn test_failed_teardown_can_be_retried() {
        let sim = Arc::new(SimulatedHost::new(SimulatedHostConfig::default()));
        let free_before = sim.free_pool_bytes();
        let device = open(&sim).await;

        // Cores are released in ascending order: 6 goes back, 7 refuses.
        sim.fail_online(7);
        assert_eq!(device.teardown().unwrap_err().kind(), ErrorKind::Internal);
        assert!(sim.is_online(6));
        assert!(!sim.is_online(7));
        assert_eq!(device.memory_stats().reserved_bytes, 0);
        assert_eq!(sim.outstanding_runs(0), 0);
        assert_ne!(sim.free_pool_bytes(), free_before);

        device.teardown().unwrap();
        assert!(sim.is_online(7));
        assert_eq!(sim.free_pool_bytes(), free_before);
        assert!(device.create_instance().is_err());
    }
}
