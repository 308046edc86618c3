//! Guest-visible memory layouts.
//!
//! Everything in this module is shared with the guest kernel and must stay
//! byte-for-byte stable. Blocks are `#[repr(C)]` structs in the byte order
//! of the x86-64 host the guest shares; the offset constants are derived
//! from them.

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

pub const PAGE_SIZE: u64 = 0x1000;
pub const LARGE_PAGE_SIZE: u64 = 0x20_0000;
pub const HUGE_PAGE_SIZE: u64 = 0x4000_0000;

/// Loader tail: the last bytes of an instance's memory window.
///
/// Offsets are relative to `window.end - SIZE`.
pub mod tail {
    pub const SIZE: u64 = 0x1_0000;
    /// Startup stub machine code.
    pub const STUB: u64 = 0x0000;
    /// Stub parameter block, see [`super::stub_params`].
    pub const STUB_PARAMS: u64 = 0x1000;
    /// Second-stage page table: PML4, PDPT, PD.
    pub const PAGE_TABLE: u64 = 0x2000;
    pub const PAGE_TABLE_PAGES: u64 = 3;
    /// Boot parameter block, see [`super::boot_params`].
    pub const BOOT_PARAMS: u64 = 0x5000;
    pub const BOOT_PARAMS_SPAN: u64 = 0x3000;
    /// Initial stack grows down from here.
    pub const STACK_TOP: u64 = 0x1_0000;
}

/// Parameter block read by the startup stub.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct StubParams {
    pub page_table_root: u64,
    pub notification_irq: u64,
    pub trampoline_phys: u64,
    pub entry_point: u64,
    pub boot_params: u64,
}

/// Offsets into [`StubParams`].
pub mod stub_params {
    use super::StubParams;
    use core::mem::{offset_of, size_of};

    pub const PAGE_TABLE_ROOT: u64 = offset_of!(StubParams, page_table_root) as u64;
    pub const NOTIFICATION_IRQ: u64 = offset_of!(StubParams, notification_irq) as u64;
    pub const TRAMPOLINE_PHYS: u64 = offset_of!(StubParams, trampoline_phys) as u64;
    pub const ENTRY_POINT: u64 = offset_of!(StubParams, entry_point) as u64;
    pub const BOOT_PARAMS: u64 = offset_of!(StubParams, boot_params) as u64;
    pub const SIZE: u64 = size_of::<StubParams>() as u64;
}

/// Words patched into the trampoline before every boot. They sit right
/// after the short jump that opens the trampoline.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct TrampolineHeader {
    /// Must be below 4 GiB.
    pub page_table_root: u64,
    pub target_ip: u64,
    pub target_sp: u64,
    pub notify_addr: u64,
}

/// Offsets into the trampoline page.
pub mod trampoline_header {
    use super::TrampolineHeader;
    use core::mem::{offset_of, size_of};

    /// Start of the [`TrampolineHeader`].
    pub const WORDS: u64 = 0x08;
    pub const PAGE_TABLE_ROOT: u64 = WORDS + offset_of!(TrampolineHeader, page_table_root) as u64;
    pub const TARGET_IP: u64 = WORDS + offset_of!(TrampolineHeader, target_ip) as u64;
    pub const TARGET_SP: u64 = WORDS + offset_of!(TrampolineHeader, target_sp) as u64;
    pub const NOTIFY_ADDR: u64 = WORDS + offset_of!(TrampolineHeader, notify_addr) as u64;
    /// First instruction after the header.
    pub const CODE: u64 = WORDS + size_of::<TrampolineHeader>() as u64;
}

/// Values the guest writes into [`boot_params::STATUS`].
pub mod progress {
    pub const NONE: u64 = 0;
    pub const BOOTED: u64 = 1;
    pub const READY: u64 = 2;
    pub const RUNNING: u64 = 3;
}

/// Values the guest writes into [`boot_params::MONITOR_STATUS`].
pub mod monitor {
    pub const OK: u64 = 0;
    pub const PANIC: u64 = 1;
}

/// Kernel message ring header. The guest publishes its address in
/// [`boot_params::MSG_BUFFER`]; the data area follows the header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct KmsgHeader {
    pub head: u32,
    pub tail: u32,
    pub len: u32,
    /// 0 = free, 1 = held. Taken by compare-and-swap.
    pub lock: u32,
}

pub mod kmsg {
    use super::KmsgHeader;
    use core::mem::{offset_of, size_of};

    pub const HEAD: u64 = offset_of!(KmsgHeader, head) as u64;
    pub const TAIL: u64 = offset_of!(KmsgHeader, tail) as u64;
    pub const LEN: u64 = offset_of!(KmsgHeader, len) as u64;
    pub const LOCK: u64 = offset_of!(KmsgHeader, lock) as u64;
    pub const DATA: u64 = size_of::<KmsgHeader>() as u64;
    /// Upper bound on a ring's data area.
    pub const MAX_LEN: u32 = 0x10_0000;
}

/// One entry of the chunk table in [`BootParamBlock`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ChunkEntry {
    pub start: u64,
    pub size: u64,
}

/// Boot parameter block as the guest sees it.
///
/// Guest-filled words (message buffer, IKC queues, progress, monitor,
/// heartbeat, trampoline ack) are zero when the host writes the block.
#[repr(C)]
#[derive(Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct BootParamBlock {
    pub magic: u64,
    pub version: u32,
    pub cpu_count: u32,
    pub mem_start: u64,
    pub mem_end: u64,
    pub identity_root: u64,
    pub msg_buffer: u64,
    pub ikc_queue_recv: u64,
    pub ikc_queue_send: u64,
    pub status: u64,
    pub monitor_status: u64,
    pub heartbeat: u64,
    pub trampoline_ack: u64,
    pub notification_irq: u32,
    pub chunk_count: u32,
    pub reserved: [u8; 0x98],
    /// NUL-terminated.
    pub kargs: [u8; boot_params::KARGS_SIZE],
    pub cpu_hw_ids: [u32; boot_params::MAX_CPUS],
    pub chunks: [ChunkEntry; boot_params::MAX_CHUNKS],
}

/// Offsets into [`BootParamBlock`].
pub mod boot_params {
    use super::BootParamBlock;
    use core::mem::{offset_of, size_of};

    /// "CHBOOTPB"
    pub const MAGIC_VALUE: u64 = 0x4250_544f_4f42_4843;
    pub const VERSION_VALUE: u32 = 1;

    pub const KARGS_SIZE: usize = 1024;
    pub const MAX_CPUS: usize = 256;
    pub const MAX_CHUNKS: usize = 64;

    pub const MAGIC: u64 = offset_of!(BootParamBlock, magic) as u64;
    pub const VERSION: u64 = offset_of!(BootParamBlock, version) as u64;
    pub const CPU_COUNT: u64 = offset_of!(BootParamBlock, cpu_count) as u64;
    pub const MEM_START: u64 = offset_of!(BootParamBlock, mem_start) as u64;
    pub const MEM_END: u64 = offset_of!(BootParamBlock, mem_end) as u64;
    pub const IDENTITY_ROOT: u64 = offset_of!(BootParamBlock, identity_root) as u64;
    /// Guest-filled.
    pub const MSG_BUFFER: u64 = offset_of!(BootParamBlock, msg_buffer) as u64;
    /// Guest-filled.
    pub const IKC_QUEUE_RECV: u64 = offset_of!(BootParamBlock, ikc_queue_recv) as u64;
    /// Guest-filled.
    pub const IKC_QUEUE_SEND: u64 = offset_of!(BootParamBlock, ikc_queue_send) as u64;
    /// Guest-written progress word.
    pub const STATUS: u64 = offset_of!(BootParamBlock, status) as u64;
    pub const MONITOR_STATUS: u64 = offset_of!(BootParamBlock, monitor_status) as u64;
    /// Guest liveness counter, incremented periodically once running.
    pub const HEARTBEAT: u64 = offset_of!(BootParamBlock, heartbeat) as u64;
    /// Written by the trampoline once the boot core reaches long mode.
    pub const TRAMPOLINE_ACK: u64 = offset_of!(BootParamBlock, trampoline_ack) as u64;
    pub const NOTIFICATION_IRQ: u64 = offset_of!(BootParamBlock, notification_irq) as u64;
    pub const CHUNK_COUNT: u64 = offset_of!(BootParamBlock, chunk_count) as u64;
    pub const KARGS: u64 = offset_of!(BootParamBlock, kargs) as u64;
    pub const CPU_HW_IDS: u64 = offset_of!(BootParamBlock, cpu_hw_ids) as u64;
    pub const CHUNKS: u64 = offset_of!(BootParamBlock, chunks) as u64;
    pub const SIZE: u64 = size_of::<BootParamBlock>() as u64;
}

/// Host-side description of a boot parameter block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootParams {
    pub mem_start: u64,
    pub mem_end: u64,
    pub identity_root: u64,
    pub notification_irq: u32,
    /// Hardware ids of the assigned cores, boot core first.
    pub cpu_hw_ids: Vec<u32>,
    /// `(start, size)` of every owned chunk.
    pub chunks: Vec<(u64, u64)>,
    pub kernel_args: String,
}

impl BootParams {
    /// Lay out the guest block. Returns `None` if a bounded field
    /// overflows.
    pub fn encode(&self) -> Option<BootParamBlock> {
        use boot_params::*;

        if self.cpu_hw_ids.len() > MAX_CPUS
            || self.chunks.len() > MAX_CHUNKS
            || self.kernel_args.len() >= KARGS_SIZE
        {
            return None;
        }

        let mut block = BootParamBlock::new_zeroed();
        block.magic = MAGIC_VALUE;
        block.version = VERSION_VALUE;
        block.cpu_count = self.cpu_hw_ids.len() as u32;
        block.mem_start = self.mem_start;
        block.mem_end = self.mem_end;
        block.identity_root = self.identity_root;
        block.notification_irq = self.notification_irq;
        block.chunk_count = self.chunks.len() as u32;
        block.kargs[..self.kernel_args.len()].copy_from_slice(self.kernel_args.as_bytes());
        block.cpu_hw_ids[..self.cpu_hw_ids.len()].copy_from_slice(&self.cpu_hw_ids);
        for (entry, &(start, size)) in block.chunks.iter_mut().zip(&self.chunks) {
            *entry = ChunkEntry { start, size };
        }
        Some(block)
    }
}
