//! Guest image loading.
//!
//! A guest image is an x86-64 ELF64 executable linked at a fixed high
//! virtual base. Loading copies its `PT_LOAD` segments into the instance's
//! memory window and prepares the loader tail (the last 64 KiB of the
//! window) with:
//!
//! - a startup stub that switches to the image's page table and jumps to
//!   the entry point
//! - the stub parameter block
//! - a three page second-stage page table mapping the link base onto the
//!   window, plus a 1 GiB identity map of low memory
//! - room for the boot parameter block and the initial stack

use super::page_table::{table_index, TablePage};
use crate::host::{PhysMemory, PhysRange};
use cohost_shared::errors::{CohostError, CohostResult};
use cohost_shared::layout::{
    stub_params, tail, StubParams, HUGE_PAGE_SIZE, LARGE_PAGE_SIZE, PAGE_SIZE,
};
use serde::Serialize;
use thiserror::Error;
use zerocopy::IntoBytes;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_LE: u8 = 1;
const EM_X86_64: u16 = 0x3e;
const ELF_HEADER_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const PT_LOAD: u32 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("image is {0} bytes, smaller than an ELF header")]
    TooSmall(usize),
    #[error("bad ELF magic")]
    BadMagic,
    #[error("not a 64-bit ELF")]
    NotElf64,
    #[error("not a little-endian ELF")]
    NotLittleEndian,
    #[error("not an x86-64 ELF (machine={0:#x})")]
    WrongMachine(u16),
    #[error("program headers: {0}")]
    ProgramHeaders(String),
    #[error("no loadable segments")]
    NoLoadableSegments,
    #[error("segment at {vaddr:#x} ({memsz:#x} bytes) does not fit the window")]
    SegmentOverflow { vaddr: u64, memsz: u64 },
    #[error("segment at {vaddr:#x} has file data outside the image")]
    SegmentTruncated { vaddr: u64 },
    #[error("entry point {0:#x} is outside the loaded image")]
    EntryOutOfRange(u64),
    #[error("link base {0:#x} must be a canonical 1 GiB aligned address outside the first 512 GiB")]
    LinkBase(u64),
    #[error("memory window {0}: {1}")]
    Window(PhysRange, &'static str),
}

impl From<ImageError> for CohostError {
    fn from(e: ImageError) -> Self {
        CohostError::InvalidImage(e.to_string())
    }
}

/// Check that `link_base` can be mapped by the second-stage page table.
pub fn check_link_base(link_base: u64) -> Result<(), ImageError> {
    let canonical = link_base >= 0xFFFF_8000_0000_0000 || link_base < 0x0000_8000_0000_0000;
    if !canonical || link_base % HUGE_PAGE_SIZE != 0 || table_index(link_base, 4) == 0 {
        return Err(ImageError::LinkBase(link_base));
    }
    Ok(())
}

/// One `PT_LOAD` program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProgramSegment {
    offset: u64,
    vaddr: u64,
    file_size: u64,
    mem_size: u64,
}

/// Parsed ELF64 header and loadable segments.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ElfImage {
    entry: u64,
    segments: Vec<ProgramSegment>,
}

fn u16_at(b: &[u8], o: usize) -> u16 {
    u16::from_le_bytes([b[o], b[o + 1]])
}

fn u32_at(b: &[u8], o: usize) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&b[o..o + 4]);
    u32::from_le_bytes(w)
}

fn u64_at(b: &[u8], o: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&b[o..o + 8]);
    u64::from_le_bytes(w)
}

impl ElfImage {
    fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < ELF_HEADER_SIZE {
            return Err(ImageError::TooSmall(bytes.len()));
        }
        if bytes[..4] != ELF_MAGIC {
            return Err(ImageError::BadMagic);
        }
        if bytes[4] != ELF_CLASS_64 {
            return Err(ImageError::NotElf64);
        }
        if bytes[5] != ELF_DATA_LE {
            return Err(ImageError::NotLittleEndian);
        }
        let machine = u16_at(bytes, 0x12);
        if machine != EM_X86_64 {
            return Err(ImageError::WrongMachine(machine));
        }

        let entry = u64_at(bytes, 0x18);
        let phoff = u64_at(bytes, 0x20);
        let phentsize = u16_at(bytes, 0x36) as usize;
        let phnum = u16_at(bytes, 0x38) as usize;

        if phnum == 0 {
            return Err(ImageError::NoLoadableSegments);
        }
        if phentsize != PHDR_SIZE {
            return Err(ImageError::ProgramHeaders(format!("entry size {}", phentsize)));
        }
        let table_end = phoff
            .checked_add((phnum * phentsize) as u64)
            .ok_or_else(|| ImageError::ProgramHeaders("offset overflow".into()))?;
        if table_end > PAGE_SIZE || table_end > bytes.len() as u64 {
            return Err(ImageError::ProgramHeaders(format!(
                "table {:#x}..{:#x} exceeds the first page or the image",
                phoff, table_end
            )));
        }

        let segments = (0..phnum)
            .map(|i| phoff as usize + i * PHDR_SIZE)
            .filter(|&ph| u32_at(bytes, ph) == PT_LOAD)
            .map(|ph| ProgramSegment {
                offset: u64_at(bytes, ph + 0x08),
                vaddr: u64_at(bytes, ph + 0x10),
                file_size: u64_at(bytes, ph + 0x20),
                mem_size: u64_at(bytes, ph + 0x28),
            })
            .filter(|s| s.mem_size > 0)
            .collect::<Vec<_>>();
        if segments.is_empty() {
            return Err(ImageError::NoLoadableSegments);
        }

        Ok(Self { entry, segments })
    }
}

/// A segment as placed in physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadedSegment {
    pub vaddr: u64,
    pub phys: u64,
    pub file_size: u64,
    pub mem_size: u64,
}

/// Result of loading an image into a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedImage {
    pub window: PhysRange,
    /// Virtual entry point of the guest kernel.
    pub entry_point: u64,
    /// Physical address of the startup stub. The trampoline jumps here.
    pub stub_phys: u64,
    pub stub_params_phys: u64,
    pub page_table_root: u64,
    pub boot_params_phys: u64,
    pub stack_top: u64,
    pub segments: Vec<LoadedSegment>,
}

/// Values baked into the loader tail.
#[derive(Debug, Clone, Copy)]
pub struct LoadConfig {
    pub link_base: u64,
    pub notification_irq: u32,
    pub trampoline_phys: u64,
}

/// Load `bytes` into `window` and prepare its loader tail.
pub fn load_image(
    memory: &dyn PhysMemory,
    window: PhysRange,
    bytes: &[u8],
    config: &LoadConfig,
) -> CohostResult<LoadedImage> {
    check_link_base(config.link_base)?;
    if window.start % LARGE_PAGE_SIZE != 0 {
        return Err(ImageError::Window(window, "start is not 2 MiB aligned").into());
    }
    if window.size < LARGE_PAGE_SIZE {
        return Err(ImageError::Window(window, "smaller than 2 MiB").into());
    }
    let link_slot = PhysRange::new(table_index(config.link_base, 3) as u64 * HUGE_PAGE_SIZE, HUGE_PAGE_SIZE);
    if window.overlaps(&link_slot) || window.end() > 512 * HUGE_PAGE_SIZE {
        return Err(ImageError::Window(window, "not covered by the guest identity slots").into());
    }

    let elf = ElfImage::parse(bytes)?;
    let mapped = (window.size / LARGE_PAGE_SIZE).min(512) * LARGE_PAGE_SIZE;
    let usable = mapped.min(window.size - tail::SIZE);

    let mut segments = Vec::with_capacity(elf.segments.len());
    for seg in &elf.segments {
        let offset = seg
            .vaddr
            .checked_sub(config.link_base)
            .filter(|o| o.checked_add(seg.mem_size).is_some_and(|end| end <= usable))
            .ok_or(ImageError::SegmentOverflow {
                vaddr: seg.vaddr,
                memsz: seg.mem_size,
            })?;
        let file_end = seg.offset.checked_add(seg.file_size);
        if seg.file_size > seg.mem_size || file_end.is_none_or(|end| end > bytes.len() as u64) {
            return Err(ImageError::SegmentTruncated { vaddr: seg.vaddr }.into());
        }

        let phys = window.start + offset;
        let data = &bytes[seg.offset as usize..(seg.offset + seg.file_size) as usize];
        memory.write(phys, data)?;
        memory.zero(phys + seg.file_size, seg.mem_size - seg.file_size)?;

        segments.push(LoadedSegment {
            vaddr: seg.vaddr,
            phys,
            file_size: seg.file_size,
            mem_size: seg.mem_size,
        });
    }

    let in_image = elf.entry >= config.link_base && elf.entry - config.link_base < usable;
    if !in_image {
        return Err(ImageError::EntryOutOfRange(elf.entry).into());
    }

    let tail_base = window.end() - tail::SIZE;
    memory.zero(tail_base, tail::SIZE)?;

    let page_table_root = tail_base + tail::PAGE_TABLE;
    write_guest_page_table(memory, page_table_root, window, mapped, config.link_base)?;

    let stub_phys = tail_base + tail::STUB;
    let stub_params_phys = tail_base + tail::STUB_PARAMS;
    let boot_params_phys = tail_base + tail::BOOT_PARAMS;
    memory.write(stub_phys, &startup_stub(stub_params_phys))?;

    let params_block = StubParams {
        page_table_root,
        notification_irq: config.notification_irq as u64,
        trampoline_phys: config.trampoline_phys,
        entry_point: elf.entry,
        boot_params: boot_params_phys,
    };
    memory.write(stub_params_phys, params_block.as_bytes())?;

    tracing::debug!(
        %window,
        entry = format_args!("{:#x}", elf.entry),
        segments = segments.len(),
        "loaded guest image"
    );

    Ok(LoadedImage {
        window,
        entry_point: elf.entry,
        stub_phys,
        stub_params_phys,
        page_table_root,
        boot_params_phys,
        stack_top: tail_base + tail::STACK_TOP,
        segments,
    })
}

/// PML4 and PDPT shared by the identity slot and the link base slot; PDPT
/// entries are 1 GiB identity leaves except the link base's, which points to
/// a PD mapping the window in 2 MiB pages.
fn write_guest_page_table(
    memory: &dyn PhysMemory,
    root: u64,
    window: PhysRange,
    mapped: u64,
    link_base: u64,
) -> CohostResult<()> {
    let pdpt_phys = root + PAGE_SIZE;
    let pd_phys = root + 2 * PAGE_SIZE;

    let mut pml4 = TablePage::new();
    pml4.link(0, pdpt_phys);
    pml4.link(table_index(link_base, 4), pdpt_phys);
    pml4.write_to(memory, root)?;

    let link_slot = table_index(link_base, 3);
    let mut pdpt = TablePage::new();
    for gig in 0..512 {
        if gig == link_slot {
            pdpt.link(gig, pd_phys);
        } else {
            pdpt.leaf(gig, gig as u64 * HUGE_PAGE_SIZE);
        }
    }
    pdpt.write_to(memory, pdpt_phys)?;

    let mut pd = TablePage::new();
    for i in 0..(mapped / LARGE_PAGE_SIZE) as usize {
        pd.leaf(i, window.start + i as u64 * LARGE_PAGE_SIZE);
    }
    pd.write_to(memory, pd_phys)
}

/// Machine code entered in long mode on the identity map.
///
/// Loads the stub parameters, switches CR3 and jumps to the entry point
/// with `rdi` = boot params, `rsi` = notification IRQ, `rdx` = trampoline.
fn startup_stub(params: u64) -> Vec<u8> {
    let mut code = vec![0x48, 0xBB];
    code.extend_from_slice(&params.to_le_bytes()); // mov rbx, params
    code.extend_from_slice(&[
        0x48, 0x8B, 0x03, // mov rax, [rbx]
        0x0F, 0x22, 0xD8, // mov cr3, rax
        0x48, 0x8B, 0x7B, stub_params::BOOT_PARAMS as u8, // mov rdi, [rbx+0x20]
        0x48, 0x8B, 0x73, stub_params::NOTIFICATION_IRQ as u8, // mov rsi, [rbx+0x08]
        0x48, 0x8B, 0x53, stub_params::TRAMPOLINE_PHYS as u8, // mov rdx, [rbx+0x10]
        0x48, 0x8B, 0x43, stub_params::ENTRY_POINT as u8, // mov rax, [rbx+0x18]
        0xFF, 0xE0, // jmp rax
    ]);
    code
}

/// Builds minimal ELF64 x86-64 executables.
///
/// Useful for dry runs against a simulated host, where the guest never
/// actually executes.
#[derive(Debug, Clone, Default)]
pub struct ElfBuilder {
    entry: u64,
    segments: Vec<(u64, Vec<u8>, u64)>,
}

impl ElfBuilder {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    /// Add a `PT_LOAD` segment at `vaddr` with `data`, padded with zeros
    /// to `mem_size` bytes.
    pub fn segment(mut self, vaddr: u64, data: &[u8], mem_size: u64) -> Self {
        self.segments.push((vaddr, data.to_vec(), mem_size));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let phoff = ELF_HEADER_SIZE;
        let data_start = (phoff + PHDR_SIZE * self.segments.len()).next_multiple_of(16);
        let mut out = vec![0u8; data_start];

        out[..4].copy_from_slice(&ELF_MAGIC);
        out[4] = ELF_CLASS_64;
        out[5] = ELF_DATA_LE;
        out[6] = 1;
        out[0x10..0x12].copy_from_slice(&2u16.to_le_bytes());
        out[0x12..0x14].copy_from_slice(&EM_X86_64.to_le_bytes());
        out[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
        out[0x18..0x20].copy_from_slice(&self.entry.to_le_bytes());
        out[0x20..0x28].copy_from_slice(&(phoff as u64).to_le_bytes());
        out[0x34..0x36].copy_from_slice(&(ELF_HEADER_SIZE as u16).to_le_bytes());
        out[0x36..0x38].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out[0x38..0x3a].copy_from_slice(&(self.segments.len() as u16).to_le_bytes());

        let mut offset = data_start as u64;
        for (i, (vaddr, data, mem_size)) in self.segments.iter().enumerate() {
            let ph = phoff + i * PHDR_SIZE;
            out[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
            out[ph + 4..ph + 8].copy_from_slice(&7u32.to_le_bytes());
            out[ph + 0x08..ph + 0x10].copy_from_slice(&offset.to_le_bytes());
            out[ph + 0x10..ph + 0x18].copy_from_slice(&vaddr.to_le_bytes());
            out[ph + 0x18..ph + 0x20].copy_from_slice(&vaddr.to_le_bytes());
            out[ph + 0x20..ph + 0x28].copy_from_slice(&(data.len() as u64).to_le_bytes());
            out[ph + 0x28..ph + 0x30].copy_from_slice(&mem_size.to_le_bytes());
            out[ph + 0x30..ph + 0x38].copy_from_slice(&PAGE_SIZE.to_le_bytes());
            offset += data.len() as u64;
        }
        for (_, data, _) in &self.segments {
            out.extend_from_slice(data);
        }
        out
    }
}
