//! Device bring-up.
//!
//! ```text
//! 1. MemoryReserve ─┬─  (static window, host runs)
//!    CpuReserve    ─┘   (hot-unplug, INIT quiesce)
//! 2. IdentityMap        (device-wide flat page table)
//! ```
//!
//! Any failure unwinds everything the pipeline took and surfaces as
//! `FatalInit`.

use crate::boot::IdentityMap;
use crate::cpu::CpuRegistry;
use crate::host::Host;
use crate::memory::MemoryRegistry;
use crate::options::{CpuSelection, DeviceOptions};
use crate::pipeline::{BoxedTask, Pipeline, PipelineMetrics, PipelineTask, Stage};
use async_trait::async_trait;
use cohost_shared::errors::{CohostError, CohostResult};
use parking_lot::Mutex;
use std::sync::Arc;

pub(super) struct InitContext {
    pub(super) options: DeviceOptions,
    pub(super) host: Host,
    pub(super) memory: Arc<MemoryRegistry>,
    pub(super) cpus: Arc<CpuRegistry>,
    pub(super) identity_map: Mutex<Option<IdentityMap>>,
}

type InitCtx = Arc<InitContext>;

struct MemoryReserveTask;

#[async_trait]
impl PipelineTask<InitCtx> for MemoryReserveTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> CohostResult<()> {
        let options = &ctx.options;
        if let Some(window) = &options.static_window {
            let range = window.range().ok_or_else(|| {
                CohostError::Config("static_window needs an explicit size".into())
            })?;
            ctx.memory.add_static(range, window.node)?;
        }

        if let Some(balance) = &options.balance {
            ctx.memory
                .reserve_balanced(&options.memory, balance.variance_limit)?;
        } else {
            for req in &options.memory {
                if let Err(e) = ctx.memory.reserve(*req) {
                    tracing::warn!(node = req.node, size = %req.size, error = %e, "reservation failed");
                }
            }
        }

        let stats = ctx.memory.stats();
        if stats.reserved_bytes == 0 {
            return Err(CohostError::ResourceExhausted(
                "no memory reserved and no static window configured".into(),
            ));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory_reserve"
    }
}

struct CpuReserveTask;

#[async_trait]
impl PipelineTask<InitCtx> for CpuReserveTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> CohostResult<()> {
        // Quiescing sleeps between IPIs.
        tokio::task::spawn_blocking(move || match &ctx.options.cpus {
            CpuSelection::Count(n) => ctx.cpus.reserve_at_init(*n),
            CpuSelection::List(ids) => ctx.cpus.reserve(ids),
        })
        .await
        .map_err(|e| CohostError::Internal(format!("cpu reservation task failed: {}", e)))??;
        Ok(())
    }

    fn name(&self) -> &str {
        "cpu_reserve"
    }
}

struct IdentityMapTask;

#[async_trait]
impl PipelineTask<InitCtx> for IdentityMapTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> CohostResult<()> {
        let map = IdentityMap::build(
            ctx.host.memory.as_ref(),
            ctx.host.pages.as_ref(),
            ctx.options.identity_map_ceiling,
        )?;
        tracing::debug!(
            root = format_args!("{:#x}", map.root()),
            pages = %map.pages(),
            "identity map built"
        );
        *ctx.identity_map.lock() = Some(map);
        Ok(())
    }

    fn name(&self) -> &str {
        "identity_map"
    }
}

/// Run the bring-up pipeline. On failure everything already taken is
/// returned to the host before the error is reported.
pub(super) async fn run(ctx: InitCtx) -> CohostResult<(IdentityMap, PipelineMetrics)> {
    let pipeline = Pipeline::new(vec![
        Stage::parallel(vec![
            Box::new(MemoryReserveTask) as BoxedTask<InitCtx>,
            Box::new(CpuReserveTask),
        ]),
        Stage::sequential(vec![Box::new(IdentityMapTask) as BoxedTask<InitCtx>]),
    ]);

    let result = pipeline.run(Arc::clone(&ctx)).await;
    let identity_map = ctx.identity_map.lock().take();
    match (result, identity_map) {
        (Ok(metrics), Some(map)) => Ok((map, metrics)),
        (result, map) => {
            let cause = match result {
                Err(e) => e.to_string(),
                Ok(_) => "identity map missing after init".to_string(),
            };
            rollback(&ctx, map);
            Err(CohostError::FatalInit(cause))
        }
    }
}

fn rollback(ctx: &InitContext, map: Option<IdentityMap>) {
    if let Some(map) = map {
        map.release(ctx.host.pages.as_ref());
    }
    if let Err(e) = ctx.cpus.release_all() {
        tracing::error!(error = %e, "failed to release cpus during init rollback");
    }
    if let Err(e) = ctx.memory.release_all() {
        tracing::error!(error = %e, "failed to release memory during init rollback");
    }
}
