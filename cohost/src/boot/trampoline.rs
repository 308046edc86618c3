//! Real-mode to long-mode trampoline.
//!
//! A woken core starts in real mode at `vector << 12`. The trampoline takes
//! it through protected mode into long mode on the identity map, writes the
//! notification word and jumps to the image's startup stub. The
//! [`TrampolineHeader`] words right after the opening jump are patched
//! before every boot.

use crate::host::PhysMemory;
use cohost_shared::errors::{CohostError, CohostResult};
use cohost_shared::layout::{trampoline_header, PAGE_SIZE};
use zerocopy::IntoBytes;

pub use cohost_shared::layout::TrampolineHeader;

const CODE16: usize = trampoline_header::CODE as usize;
const CODE32: usize = 0x60;
const CODE64: usize = 0xB0;
const GDT_PTR: usize = 0x100;
const GDT: usize = 0x110;
const BLOB_SIZE: usize = 0x130;

const SEL_CODE32: u16 = 0x08;
const SEL_DATA: u16 = 0x10;
const SEL_CODE64: u16 = 0x18;

const GDT_ENTRIES: [u64; 4] = [
    0,
    0x00CF_9A00_0000_FFFF,
    0x00CF_9200_0000_FFFF,
    0x00AF_9A00_0000_FFFF,
];

/// Trampoline code generated for a fixed low physical page.
#[derive(Debug, Clone)]
pub struct Trampoline {
    phys: u64,
    blob: Vec<u8>,
}

struct Emitter {
    code: Vec<u8>,
}

impl Emitter {
    fn at(&mut self, offset: usize) {
        debug_assert!(self.code.len() <= offset);
        self.code.resize(offset, 0x90);
    }

    fn bytes(&mut self, b: &[u8]) {
        self.code.extend_from_slice(b);
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }
}

impl Trampoline {
    /// Generate the trampoline for the page at `phys`.
    pub fn new(phys: u64) -> CohostResult<Self> {
        if phys == 0 || phys % PAGE_SIZE != 0 || phys >= 0x10_0000 {
            return Err(CohostError::Validation(format!(
                "trampoline address {:#x} must be a nonzero page below 1 MiB",
                phys
            )));
        }
        Ok(Self {
            phys,
            blob: generate(phys as u32),
        })
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// STARTUP vector that starts a core at this trampoline.
    pub fn vector(&self) -> u8 {
        (self.phys >> 12) as u8
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Copy the trampoline to its page and patch the header.
    pub fn install(&self, memory: &dyn PhysMemory, header: &TrampolineHeader) -> CohostResult<()> {
        if header.page_table_root >= 0x1_0000_0000 {
            return Err(CohostError::Validation(format!(
                "page table root {:#x} is not addressable from protected mode",
                header.page_table_root
            )));
        }
        memory.write(self.phys, &self.blob)?;
        memory.write(self.phys + trampoline_header::WORDS, header.as_bytes())
    }
}

fn generate(base: u32) -> Vec<u8> {
    let mut e = Emitter { code: Vec::with_capacity(BLOB_SIZE) };

    // jmp short over the header
    e.bytes(&[0xEB, (CODE16 - 2) as u8]);
    e.code.resize(CODE16, 0);

    // 16-bit real mode, CS base == trampoline base
    e.bytes(&[0xFA, 0xFC]); // cli; cld
    e.bytes(&[0x8C, 0xC8]); // mov ax, cs
    e.bytes(&[0x8E, 0xD8]); // mov ds, ax
    e.bytes(&[0x0F, 0x01, 0x16]); // lgdt [GDT_PTR]
    e.u16(GDT_PTR as u16);
    e.bytes(&[0x0F, 0x20, 0xC0]); // mov eax, cr0
    e.bytes(&[0x66, 0x83, 0xC8, 0x01]); // or eax, 1
    e.bytes(&[0x0F, 0x22, 0xC0]); // mov cr0, eax
    e.bytes(&[0x66, 0xEA]); // jmp far SEL_CODE32:CODE32
    e.u32(base + CODE32 as u32);
    e.u16(SEL_CODE32);

    // 32-bit protected mode
    e.at(CODE32);
    e.bytes(&[0x66, 0xB8]); // mov ax, SEL_DATA
    e.u16(SEL_DATA);
    e.bytes(&[0x8E, 0xD8, 0x8E, 0xC0, 0x8E, 0xD0]); // mov ds/es/ss, ax
    e.bytes(&[0x0F, 0x20, 0xE0]); // mov eax, cr4
    e.bytes(&[0x83, 0xC8, 0x20]); // or eax, PAE
    e.bytes(&[0x0F, 0x22, 0xE0]); // mov cr4, eax
    e.bytes(&[0xA1]); // mov eax, [page table root]
    e.u32(base + trampoline_header::PAGE_TABLE_ROOT as u32);
    e.bytes(&[0x0F, 0x22, 0xD8]); // mov cr3, eax
    e.bytes(&[0xB9]); // mov ecx, IA32_EFER
    e.u32(0xC000_0080);
    e.bytes(&[0x0F, 0x32]); // rdmsr
    e.bytes(&[0x0D]); // or eax, LME
    e.u32(0x100);
    e.bytes(&[0x0F, 0x30]); // wrmsr
    e.bytes(&[0x0F, 0x20, 0xC0]); // mov eax, cr0
    e.bytes(&[0x0D]); // or eax, PG
    e.u32(0x8000_0000);
    e.bytes(&[0x0F, 0x22, 0xC0]); // mov cr0, eax
    e.bytes(&[0xEA]); // jmp far SEL_CODE64:CODE64
    e.u32(base + CODE64 as u32);
    e.u16(SEL_CODE64);

    // 64-bit long mode on the identity map
    e.at(CODE64);
    e.bytes(&[0x48, 0xBB]); // mov rbx, base
    e.u64(base as u64);
    e.bytes(&[0x48, 0x8B, 0x43, trampoline_header::NOTIFY_ADDR as u8]); // mov rax, [rbx+notify]
    e.bytes(&[0x48, 0xC7, 0x00, 0x01, 0x00, 0x00, 0x00]); // mov qword [rax], 1
    e.bytes(&[0x48, 0x8B, 0x63, trampoline_header::TARGET_SP as u8]); // mov rsp, [rbx+sp]
    e.bytes(&[0x48, 0x8B, 0x43, trampoline_header::TARGET_IP as u8]); // mov rax, [rbx+ip]
    e.bytes(&[0xFF, 0xE0]); // jmp rax

    e.at(GDT_PTR);
    e.u16((GDT_ENTRIES.len() * 8 - 1) as u16);
    e.u32(base + GDT as u32);

    e.code.resize(GDT, 0);
    for entry in GDT_ENTRIES {
        e.u64(entry);
    }
    debug_assert_eq!(e.code.len(), BLOB_SIZE);
    e.code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{SimulatedHost, SimulatedHostConfig};

    #[test]
    fn test_blob_layout() {
        let t = Trampoline::new(0x8000).unwrap();
        let blob = t.blob();
        assert!(blob.len() <= PAGE_SIZE as usize);
        assert_eq!(&blob[..2], &[0xEB, 0x26]);
        assert_eq!(&blob[CODE16..CODE16 + 2], &[0xFA, 0xFC]);
        assert_eq!(t.vector(), 0x08);

        let far32 = u32::from_le_bytes(blob[CODE16 + 0x17..CODE16 + 0x1b].try_into().unwrap());
        assert_eq!(far32, 0x8000 + CODE32 as u32);

        let gdt_base = u32::from_le_bytes(blob[GDT_PTR + 2..GDT_PTR + 6].try_into().unwrap());
        assert_eq!(gdt_base, 0x8000 + GDT as u32);
        let code64 = u64::from_le_bytes(blob[GDT + 24..GDT + 32].try_into().unwrap());
        assert_eq!(code64, 0x00AF_9A00_0000_FFFF);
    }

    #[test]
    fn test_install_patches_header() {
        let host = SimulatedHost::new(SimulatedHostConfig::default());
        let t = Trampoline::new(0x9000).unwrap();
        let header = TrampolineHeader {
            page_table_root: 0x10_0000,
            target_ip: 0x1_0fff_0000,
            target_sp: 0x1_1000_0000,
            notify_addr: 0x1_0fff_5058,
        };
        t.install(&host, &header).unwrap();

        assert_eq!(host.read_u64(0x9000 + trampoline_header::PAGE_TABLE_ROOT).unwrap(), 0x10_0000);
        assert_eq!(host.read_u64(0x9000 + trampoline_header::TARGET_IP).unwrap(), 0x1_0fff_0000);
        assert_eq!(host.read_u64(0x9000 + trampoline_header::TARGET_SP).unwrap(), 0x1_1000_0000);
        assert_eq!(host.read_u64(0x9000 + trampoline_header::NOTIFY_ADDR).unwrap(), 0x1_0fff_5058);

        let mut code = [0u8; 2];
        host.read(0x9000 + CODE64 as u64, &mut code).unwrap();
        assert_eq!(code, [0x48, 0xBB]);
    }

    #[test]
    fn test_rejects_bad_placement() {
        assert!(Trampoline::new(0).is_err());
        assert!(Trampoline::new(0x8800).is_err());
        assert!(Trampoline::new(0x10_0000).is_err());

        let host = SimulatedHost::new(SimulatedHostConfig::default());
        let t = Trampoline::new(0x8000).unwrap();
        let header = TrampolineHeader {
            page_table_root: 0x1_0000_0000,
            target_ip: 0,
            target_sp: 0,
            notify_addr: 0,
        };
        assert!(t.install(&host, &header).is_err());
    }
}
