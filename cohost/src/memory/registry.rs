use super::chunk::{ChunkOrigin, MemoryChunk, MemoryRequest, UsedChunk};
use super::numa;
use crate::host::{PageSource, PhysRange};
use cohost_shared::errors::{CohostError, CohostResult};
use cohost_shared::layout::PAGE_SIZE;
use cohost_shared::{InstanceId, NodeId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Snapshot of registry totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub reserved_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub free_chunks: usize,
    pub used_chunks: usize,
}

#[derive(Default)]
struct RegistryInner {
    /// Keyed by chunk start. Adjacent chunks that may join never coexist.
    free: BTreeMap<u64, MemoryChunk>,
    used: BTreeMap<u64, UsedChunk>,
    reserved_bytes: u64,
}

/// Device-wide physical memory registry.
///
/// Memory enters through [`reserve`](Self::reserve),
/// [`reserve_balanced`](Self::reserve_balanced) or
/// [`add_static`](Self::add_static), is handed to instances by
/// [`allocate`](Self::allocate) and comes back through
/// [`free_owner`](Self::free_owner). `free + used == reserved` holds after
/// every call.
pub struct MemoryRegistry {
    pages: Arc<dyn PageSource>,
    max_free_chunks: usize,
    split_chunks: bool,
    inner: Mutex<RegistryInner>,
}

impl MemoryRegistry {
    pub fn new(pages: Arc<dyn PageSource>, max_free_chunks: usize, split_chunks: bool) -> Self {
        Self {
            pages,
            max_free_chunks,
            split_chunks,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Allocation granularity. Every chunk stays a whole number of host runs.
    pub fn granule(&self) -> u64 {
        self.pages.run_size()
    }

    fn check_node(&self, node: NodeId) -> CohostResult<()> {
        if self.pages.nodes().contains(&node) {
            Ok(())
        } else {
            Err(CohostError::Validation(format!("unknown NUMA node {}", node)))
        }
    }

    fn acquire(&self, req: &MemoryRequest) -> Vec<PhysRange> {
        let target = req.size.bytes();
        let mut runs = Vec::new();
        let mut got = 0u64;
        while target.is_none_or(|t| got < t) {
            match self.pages.acquire_run(req.node) {
                Some(run) => {
                    got += run.size;
                    runs.push(run);
                }
                None => break,
            }
        }
        runs
    }

    /// Acquire runs from the host until `req` is met or the host refuses.
    ///
    /// Returns the number of bytes acquired. Fails if the host supplied
    /// nothing.
    pub fn reserve(&self, req: MemoryRequest) -> CohostResult<u64> {
        self.check_node(req.node)?;
        let runs = self.acquire(&req);
        let got: u64 = runs.iter().map(|r| r.size).sum();
        if got == 0 {
            return Err(CohostError::ResourceExhausted(format!(
                "host supplied no memory on node {}",
                req.node
            )));
        }
        if let Some(target) = req.size.bytes() {
            if got < target {
                tracing::warn!(node = req.node, target, got, "host refused part of reservation");
            }
        }

        let mut inner = self.inner.lock();
        for run in runs {
            inner.insert_host_run(run, req.node);
        }
        self.enforce_ceiling(&mut inner);

        tracing::info!(
            node = req.node,
            bytes = got,
            free_chunks = inner.free.len(),
            "reserved memory"
        );
        Ok(got)
    }

    /// Reserve on several nodes so per-node totals stay within `variance`
    /// of their mean. All-or-nothing: on failure every run acquired by this
    /// call goes back to the host.
    ///
    /// Returns the bytes kept per request, in request order.
    pub fn reserve_balanced(&self, requests: &[MemoryRequest], variance: f64) -> CohostResult<Vec<u64>> {
        let mut seen = HashSet::new();
        for req in requests {
            self.check_node(req.node)?;
            if !seen.insert(req.node) {
                return Err(CohostError::Validation(format!(
                    "node {} requested twice in balanced reservation",
                    req.node
                )));
            }
        }

        let mut per_node: Vec<Vec<PhysRange>> = requests.iter().map(|r| self.acquire(r)).collect();
        let totals: Vec<u64> = per_node.iter().map(|runs| runs.iter().map(|r| r.size).sum()).collect();

        let plan = match numa::plan_balanced(&totals, self.granule(), variance) {
            Ok(plan) => plan,
            Err(e) => {
                for run in per_node.into_iter().flatten() {
                    self.pages.release_range(run);
                }
                tracing::warn!(?totals, variance, error = %e, "balanced reservation failed");
                return Err(e);
            }
        };

        let mut inner = self.inner.lock();
        for ((req, runs), target) in requests.iter().zip(per_node.iter_mut()).zip(&plan) {
            runs.sort_by_key(|r| r.start);
            let mut kept = 0;
            for run in runs.drain(..) {
                if kept + run.size <= *target {
                    kept += run.size;
                    inner.insert_host_run(run, req.node);
                } else {
                    self.pages.release_range(run);
                }
            }
        }
        self.enforce_ceiling(&mut inner);

        tracing::info!(?totals, ?plan, variance, "balanced reservation");
        Ok(plan)
    }

    /// Register a static physical window. It is never returned to the host.
    pub fn add_static(&self, range: PhysRange, node: NodeId) -> CohostResult<()> {
        if range.size == 0 || range.start % PAGE_SIZE != 0 || range.size % PAGE_SIZE != 0 {
            return Err(CohostError::Validation(format!(
                "static window {} must be nonempty and page aligned",
                range
            )));
        }
        let mut inner = self.inner.lock();
        let overlaps = inner.free.values().map(|c| c.range())
            .chain(inner.used.values().map(|u| u.chunk.range()))
            .any(|r| r.overlaps(&range));
        if overlaps {
            return Err(CohostError::Validation(format!(
                "static window {} overlaps reserved memory",
                range
            )));
        }
        inner.insert_free(MemoryChunk {
            start: range.start,
            size: range.size,
            node,
            origin: ChunkOrigin::Static,
        });
        inner.reserved_bytes += range.size;
        tracing::info!(%range, node, "added static window");
        Ok(())
    }

    fn enforce_ceiling(&self, inner: &mut RegistryInner) {
        if self.max_free_chunks == 0 {
            return;
        }
        while inner.free.len() > self.max_free_chunks {
            let smallest = inner
                .free
                .values()
                .filter(|c| c.origin == ChunkOrigin::Host)
                .min_by_key(|c| (c.size, c.start))
                .copied();
            let Some(chunk) = smallest else {
                break;
            };
            inner.free.remove(&chunk.start);
            inner.reserved_bytes -= chunk.size;
            self.pages.release_range(chunk.range());
            tracing::debug!(range = %chunk.range(), "released chunk above free-list ceiling");
        }
    }

    /// Hand `size` bytes to `owner` from the first free chunk that fits.
    ///
    /// `size` is rounded up to the granule. With splitting disabled the
    /// whole chunk is handed over.
    pub fn allocate(&self, owner: InstanceId, size: u64, node: Option<NodeId>) -> CohostResult<MemoryChunk> {
        if size == 0 {
            return Err(CohostError::Validation("allocation size must be nonzero".into()));
        }
        let size = size.next_multiple_of(self.granule());

        let mut inner = self.inner.lock();
        let found = inner
            .free
            .values()
            .find(|c| c.size >= size && node.is_none_or(|n| c.node == n))
            .copied();
        let Some(chunk) = found else {
            return Err(CohostError::ResourceExhausted(format!(
                "no free chunk fits {} bytes{}",
                size,
                node.map(|n| format!(" on node {}", n)).unwrap_or_default()
            )));
        };

        inner.free.remove(&chunk.start);
        let taken = if self.split_chunks && chunk.size > size {
            let head = MemoryChunk { size, ..chunk };
            inner.free.insert(
                chunk.start + size,
                MemoryChunk {
                    start: chunk.start + size,
                    size: chunk.size - size,
                    ..chunk
                },
            );
            head
        } else {
            chunk
        };
        inner.used.insert(taken.start, UsedChunk { chunk: taken, owner });

        tracing::debug!(os_id = owner, range = %taken.range(), node = taken.node, "allocated chunk");
        Ok(taken)
    }

    /// Return every chunk `owner` holds. Returns the bytes freed.
    pub fn free_owner(&self, owner: InstanceId) -> u64 {
        let mut inner = self.inner.lock();
        let starts: Vec<u64> = inner
            .used
            .values()
            .filter(|u| u.owner == owner)
            .map(|u| u.chunk.start)
            .collect();
        let mut freed = 0;
        for start in starts {
            if let Some(used) = inner.used.remove(&start) {
                freed += used.chunk.size;
                inner.insert_free(used.chunk);
            }
        }
        if freed > 0 {
            tracing::debug!(os_id = owner, bytes = freed, "freed owner memory");
        }
        freed
    }

    /// Return one chunk held by `owner`.
    pub fn free_chunk(&self, owner: InstanceId, start: u64) -> CohostResult<()> {
        let mut inner = self.inner.lock();
        match inner.used.get(&start) {
            Some(used) if used.owner == owner => {}
            Some(_) => {
                return Err(CohostError::Validation(format!(
                    "chunk {:#x} is not owned by os {}",
                    start, owner
                )));
            }
            None => return Err(CohostError::NotFound(format!("used chunk {:#x}", start))),
        }
        if let Some(used) = inner.used.remove(&start) {
            inner.insert_free(used.chunk);
        }
        Ok(())
    }

    /// Give free host-origin memory back to the host: the chunk starting at
    /// `start`, or every such chunk. Returns the bytes released.
    pub fn release_to_host(&self, start: Option<u64>) -> CohostResult<u64> {
        let mut inner = self.inner.lock();
        let chunks: Vec<MemoryChunk> = match start {
            Some(start) => {
                let chunk = inner
                    .free
                    .get(&start)
                    .copied()
                    .ok_or_else(|| CohostError::NotFound(format!("free chunk {:#x}", start)))?;
                if chunk.origin == ChunkOrigin::Static {
                    return Err(CohostError::Validation(format!(
                        "chunk {:#x} belongs to the static window",
                        start
                    )));
                }
                vec![chunk]
            }
            None => inner
                .free
                .values()
                .filter(|c| c.origin == ChunkOrigin::Host)
                .copied()
                .collect(),
        };

        let mut released = 0;
        for chunk in chunks {
            inner.free.remove(&chunk.start);
            inner.reserved_bytes -= chunk.size;
            released += chunk.size;
            self.pages.release_range(chunk.range());
        }
        tracing::info!(bytes = released, "released memory to host");
        Ok(released)
    }

    /// Drop everything at teardown. Fails if any chunk is still in use.
    pub fn release_all(&self) -> CohostResult<u64> {
        {
            let inner = self.inner.lock();
            if let Some(used) = inner.used.values().next() {
                return Err(CohostError::Busy(format!(
                    "chunk {} still owned by os {}",
                    used.chunk.range(),
                    used.owner
                )));
            }
        }
        let released = self.release_to_host(None)?;
        let mut inner = self.inner.lock();
        inner.free.clear();
        inner.reserved_bytes = 0;
        Ok(released)
    }

    pub fn free_chunks(&self) -> Vec<MemoryChunk> {
        self.inner.lock().free.values().copied().collect()
    }

    pub fn used_chunks(&self) -> Vec<UsedChunk> {
        self.inner.lock().used.values().copied().collect()
    }

    /// Chunks held by `owner`, in address order.
    pub fn owned_by(&self, owner: InstanceId) -> Vec<MemoryChunk> {
        self.inner
            .lock()
            .used
            .values()
            .filter(|u| u.owner == owner)
            .map(|u| u.chunk)
            .collect()
    }

    /// The contiguous run of `owner`'s chunks starting at its lowest chunk.
    ///
    /// This is the window an image is loaded into.
    pub fn window(&self, owner: InstanceId) -> Option<PhysRange> {
        let owned = self.owned_by(owner);
        let first = owned.first()?;
        let mut window = first.range();
        for chunk in &owned[1..] {
            if chunk.start != window.end() {
                break;
            }
            window.size += chunk.size;
        }
        Some(window)
    }

    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.lock();
        MemoryStats {
            reserved_bytes: inner.reserved_bytes,
            free_bytes: inner.free.values().map(|c| c.size).sum(),
            used_bytes: inner.used.values().map(|u| u.chunk.size).sum(),
            free_chunks: inner.free.len(),
            used_chunks: inner.used.len(),
        }
    }
}

impl RegistryInner {
    fn insert_host_run(&mut self, run: PhysRange, node: NodeId) {
        self.insert_free(MemoryChunk {
            start: run.start,
            size: run.size,
            node,
            origin: ChunkOrigin::Host,
        });
        self.reserved_bytes += run.size;
    }

    fn insert_free(&mut self, mut chunk: MemoryChunk) {
        let prev = self.free.range(..chunk.start).next_back().map(|(_, c)| *c);
        if let Some(prev) = prev.filter(|p| p.joins(&chunk)) {
            self.free.remove(&prev.start);
            chunk.start = prev.start;
            chunk.size += prev.size;
        }
        let next = self.free.get(&chunk.end()).copied();
        if let Some(next) = next.filter(|n| chunk.joins(n)) {
            self.free.remove(&next.start);
            chunk.size += next.size;
        }
        self.free.insert(chunk.start, chunk);
    }
}
