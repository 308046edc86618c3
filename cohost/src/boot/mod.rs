//! Boot sequencing.
//!
//! [`BootSequenceBuilder`] owns everything needed to start a guest on a
//! reserved core: the device-wide identity map root, the low trampoline page
//! and the IPI sequencer. Per boot it loads the image, writes the boot
//! parameter block, installs the trampoline and wakes the boot core.

mod image;
mod ipi;
mod page_table;
mod trampoline;

pub use image::{
    ElfBuilder, ImageError, LoadConfig, LoadedImage, LoadedSegment, check_link_base, load_image,
};
pub use ipi::{IpiSequencer, WakeStatus};
pub use page_table::{IdentityMap, translate};
pub use trampoline::{Trampoline, TrampolineHeader};

use crate::host::{PhysMemory, PhysRange};
use cohost_shared::errors::{CohostError, CohostResult};
use cohost_shared::layout::{BootParams, boot_params};
use parking_lot::Mutex;
use std::sync::Arc;
use zerocopy::IntoBytes;

pub struct BootSequenceBuilder {
    memory: Arc<dyn PhysMemory>,
    ipi: IpiSequencer,
    trampoline: Trampoline,
    identity_root: u64,
    load: LoadConfig,
    /// The trampoline page is shared by every instance. Held from install
    /// until the wake sequence has been sent.
    trampoline_lock: Mutex<()>,
}

impl BootSequenceBuilder {
    pub fn new(
        memory: Arc<dyn PhysMemory>,
        ipi: IpiSequencer,
        trampoline: Trampoline,
        identity_root: u64,
        link_base: u64,
        notification_irq: u32,
    ) -> Self {
        let load = LoadConfig {
            link_base,
            notification_irq,
            trampoline_phys: trampoline.phys(),
        };
        Self {
            memory,
            ipi,
            trampoline,
            identity_root,
            load,
            trampoline_lock: Mutex::new(()),
        }
    }

    pub fn identity_root(&self) -> u64 {
        self.identity_root
    }

    pub fn memory(&self) -> &Arc<dyn PhysMemory> {
        &self.memory
    }

    pub fn load_image(&self, window: PhysRange, bytes: &[u8]) -> CohostResult<LoadedImage> {
        load_image(self.memory.as_ref(), window, bytes, &self.load)
    }

    /// Write the boot parameter block for `image`.
    ///
    /// Fills in the identity root and notification IRQ; everything else
    /// comes from `params`.
    pub fn write_boot_params(&self, image: &LoadedImage, mut params: BootParams) -> CohostResult<()> {
        params.identity_root = self.identity_root;
        params.notification_irq = self.load.notification_irq;
        let block = params.encode().ok_or_else(|| {
            CohostError::Validation(format!(
                "boot parameters overflow: {} cpus, {} chunks, {} bytes of kernel args",
                params.cpu_hw_ids.len(),
                params.chunks.len(),
                params.kernel_args.len()
            ))
        })?;
        self.memory.write(image.boot_params_phys, block.as_bytes())
    }

    /// Install the trampoline for `image` and wake `boot_hw_id`.
    ///
    /// Blocks for the duration of the wake sequence.
    pub fn boot(&self, image: &LoadedImage, boot_hw_id: u32) -> CohostResult<WakeStatus> {
        let _guard = self.trampoline_lock.lock();

        let header = TrampolineHeader {
            page_table_root: self.identity_root,
            target_ip: image.stub_phys,
            target_sp: image.stack_top,
            notify_addr: image.boot_params_phys + boot_params::TRAMPOLINE_ACK,
        };
        self.trampoline.install(self.memory.as_ref(), &header)?;

        tracing::info!(
            hw_id = boot_hw_id,
            stub = format_args!("{:#x}", image.stub_phys),
            "waking boot core"
        );
        self.ipi.wake(boot_hw_id, self.trampoline.phys())
    }

    /// Put a core back into wait-for-SIPI.
    pub fn reset_core(&self, hw_id: u32) -> WakeStatus {
        self.ipi.reset(hw_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Ipi, SimulatedHost, SimulatedHostConfig};
    use crate::options::BootTimings;
    use cohost_shared::layout::trampoline_header;

    const LINK: u64 = 0xFFFF_FFFF_8000_0000;

    fn builder(host: &Arc<SimulatedHost>) -> BootSequenceBuilder {
        BootSequenceBuilder::new(
            host.clone(),
            IpiSequencer::new(host.clone(), BootTimings::immediate()),
            Trampoline::new(0x8000).unwrap(),
            0x20_0000,
            LINK,
            0xF2,
        )
    }

    #[test]
    fn test_boot_installs_trampoline_and_wakes() {
        let host = Arc::new(SimulatedHost::new(SimulatedHostConfig::default()));
        let boot = builder(&host);
        let window = PhysRange::new(host.config().nodes[0].base, 8 << 20);
        let image = boot
            .load_image(window, &ElfBuilder::new(LINK).segment(LINK, &[0xF4], 1).build())
            .unwrap();

        boot.write_boot_params(
            &image,
            BootParams {
                mem_start: window.start,
                mem_end: window.end(),
                cpu_hw_ids: vec![14],
                chunks: vec![(window.start, window.size)],
                kernel_args: "console=kmsg".into(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            host.read_u64(image.boot_params_phys + boot_params::IDENTITY_ROOT).unwrap(),
            0x20_0000
        );

        let status = boot.boot(&image, 14).unwrap();
        assert!(status.is_ok());
        assert_eq!(
            host.read_u64(0x8000 + trampoline_header::TARGET_IP).unwrap(),
            image.stub_phys
        );
        assert_eq!(
            host.read_u64(0x8000 + trampoline_header::NOTIFY_ADDR).unwrap(),
            image.boot_params_phys + boot_params::TRAMPOLINE_ACK
        );
        assert!(host.ipi_log().contains(&(14, Ipi::Startup { vector: 8 })));
    }

    #[test]
    fn test_oversized_params_rejected() {
        let host = Arc::new(SimulatedHost::new(SimulatedHostConfig::default()));
        let boot = builder(&host);
        let window = PhysRange::new(host.config().nodes[0].base, 8 << 20);
        let image = boot
            .load_image(window, &ElfBuilder::new(LINK).segment(LINK, &[0xF4], 1).build())
            .unwrap();
        let params = BootParams {
            kernel_args: "x".repeat(boot_params::KARGS_SIZE),
            ..Default::default()
        };
        assert!(boot.write_boot_params(&image, params).is_err());
    }

    #[test]
    fn test_reset_core_sends_init_only() {
        let host = Arc::new(SimulatedHost::new(SimulatedHostConfig::default()));
        let boot = builder(&host);
        assert!(boot.reset_core(6).is_ok());
        assert_eq!(host.ipi_log(), vec![(6, Ipi::InitAssert), (6, Ipi::InitDeassert)]);
    }
}
