//! x86-64 page table construction.

use crate::host::{PageSource, PhysMemory, PhysRange};
use cohost_shared::errors::{CohostError, CohostResult};
use cohost_shared::layout::{HUGE_PAGE_SIZE, LARGE_PAGE_SIZE, PAGE_SIZE};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

pub(crate) const PTE_PRESENT: u64 = 1;
pub(crate) const PTE_READ_WRITE: u64 = 1 << 1;
pub(crate) const PTE_LARGE_PAGE: u64 = 1 << 7;

const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
const ENTRY_COUNT: usize = 512;

const _: () = assert!(ENTRY_COUNT * size_of::<u64>() == PAGE_SIZE as usize);

/// A page-table page under construction.
#[repr(transparent)]
#[derive(Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct TablePage([u64; ENTRY_COUNT]);

impl TablePage {
    pub(crate) fn new() -> Self {
        Self::new_zeroed()
    }

    /// Point entry `index` at the next-level table at `phys`.
    pub(crate) fn link(&mut self, index: usize, phys: u64) {
        self.0[index] = (phys & PTE_ADDR_MASK) | PTE_PRESENT | PTE_READ_WRITE;
    }

    /// Make entry `index` a large leaf mapping `phys`.
    pub(crate) fn leaf(&mut self, index: usize, phys: u64) {
        self.0[index] = (phys & PTE_ADDR_MASK) | PTE_PRESENT | PTE_READ_WRITE | PTE_LARGE_PAGE;
    }

    pub(crate) fn write_to(&self, memory: &dyn PhysMemory, phys: u64) -> CohostResult<()> {
        memory.write(phys, self.as_bytes())
    }
}

/// Table index of `vaddr` at `level` (4 = PML4 ... 1 = PT).
pub(crate) fn table_index(vaddr: u64, level: u32) -> usize {
    ((vaddr >> (12 + 9 * (level - 1))) & 0x1ff) as usize
}

/// Flat 1:1 map of physical memory below a ceiling, in 2 MiB pages.
///
/// Built once per device and shared by every boot: the woken core runs on
/// it until the guest startup stub switches to the image's own tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityMap {
    pages: PhysRange,
    ceiling: u64,
}

impl IdentityMap {
    /// Build the map over `0..ceiling` in pages taken from `pages`.
    ///
    /// Layout: one PML4, one PDPT, one PD per GiB.
    pub fn build(memory: &dyn PhysMemory, pages: &dyn PageSource, ceiling: u64) -> CohostResult<Self> {
        if ceiling == 0 || ceiling % HUGE_PAGE_SIZE != 0 || ceiling > 512 * HUGE_PAGE_SIZE {
            return Err(CohostError::Validation(format!(
                "identity map ceiling {:#x} must be a nonzero multiple of 1 GiB up to 512 GiB",
                ceiling
            )));
        }
        let gigs = ceiling / HUGE_PAGE_SIZE;
        let range = pages.allocate_pages(2 + gigs).ok_or_else(|| {
            CohostError::ResourceExhausted(format!("no room for {} identity map pages", 2 + gigs))
        })?;

        if let Err(e) = Self::write_tables(memory, range, gigs) {
            pages.free_pages(range);
            return Err(e);
        }

        tracing::info!(root = format_args!("{:#x}", range.start), ceiling, "built identity map");
        Ok(Self { pages: range, ceiling })
    }

    fn write_tables(memory: &dyn PhysMemory, range: PhysRange, gigs: u64) -> CohostResult<()> {
        let pml4_phys = range.start;
        let pdpt_phys = pml4_phys + PAGE_SIZE;

        let mut pml4 = TablePage::new();
        pml4.link(0, pdpt_phys);
        pml4.write_to(memory, pml4_phys)?;

        let mut pdpt = TablePage::new();
        for gig in 0..gigs {
            let pd_phys = pdpt_phys + PAGE_SIZE * (1 + gig);
            pdpt.link(gig as usize, pd_phys);

            let mut pd = TablePage::new();
            for i in 0..ENTRY_COUNT {
                pd.leaf(i, gig * HUGE_PAGE_SIZE + i as u64 * LARGE_PAGE_SIZE);
            }
            pd.write_to(memory, pd_phys)?;
        }
        pdpt.write_to(memory, pdpt_phys)
    }

    /// Physical address of the PML4.
    pub fn root(&self) -> u64 {
        self.pages.start
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Pages backing the tables.
    pub fn pages(&self) -> PhysRange {
        self.pages
    }

    pub fn release(self, pages: &dyn PageSource) {
        pages.free_pages(self.pages);
    }
}

/// Walk the 4-level table rooted at `root`. `None` if `vaddr` is unmapped.
pub fn translate(memory: &dyn PhysMemory, root: u64, vaddr: u64) -> CohostResult<Option<u64>> {
    let mut table = root;
    for level in (1..=4).rev() {
        let entry = memory.read_u64(table + 8 * table_index(vaddr, level) as u64)?;
        if entry & PTE_PRESENT == 0 {
            return Ok(None);
        }
        let addr = entry & PTE_ADDR_MASK;
        let leaf = level == 1 || ((level == 2 || level == 3) && entry & PTE_LARGE_PAGE != 0);
        if leaf {
            let span = 1u64 << (12 + 9 * (level - 1));
            return Ok(Some((addr & !(span - 1)) | (vaddr & (span - 1))));
        }
        table = addr;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{SimulatedHost, SimulatedHostConfig};

    #[test]
    fn test_identity_map_translates_flat() {
        let host = SimulatedHost::new(SimulatedHostConfig::default());
        let map = IdentityMap::build(&host, &host, 8 * HUGE_PAGE_SIZE).unwrap();
        assert_eq!(map.pages().size, 10 * PAGE_SIZE);
        assert!(map.root() < 0x1_0000_0000);

        for addr in [0, 0x8000, 0x1_2345_6789, 8 * HUGE_PAGE_SIZE - 1] {
            assert_eq!(translate(&host, map.root(), addr).unwrap(), Some(addr));
        }
        assert_eq!(translate(&host, map.root(), 8 * HUGE_PAGE_SIZE).unwrap(), None);
    }

    #[test]
    fn test_leaf_bits() {
        let host = SimulatedHost::new(SimulatedHostConfig::default());
        let map = IdentityMap::build(&host, &host, HUGE_PAGE_SIZE).unwrap();
        let pd = map.root() + 2 * PAGE_SIZE;
        assert_eq!(host.read_u64(pd + 8).unwrap(), 0x20_0000 | 0x83);
        let pml4e = host.read_u64(map.root()).unwrap();
        assert_eq!(pml4e, (map.root() + PAGE_SIZE) | 0x3);
    }

    #[test]
    fn test_bad_ceiling_and_release() {
        let host = SimulatedHost::new(SimulatedHostConfig::default());
        assert!(IdentityMap::build(&host, &host, HUGE_PAGE_SIZE / 2).is_err());
        assert!(IdentityMap::build(&host, &host, 513 * HUGE_PAGE_SIZE).is_err());

        let before = host.free_pool_bytes();
        let map = IdentityMap::build(&host, &host, 2 * HUGE_PAGE_SIZE).unwrap();
        map.release(&host);
        assert_eq!(host.free_pool_bytes(), before);
    }

    #[test]
    fn test_table_index() {
        let va = 0xFFFF_FFFF_8020_1000;
        assert_eq!(table_index(va, 4), 511);
        assert_eq!(table_index(va, 3), 510);
        assert_eq!(table_index(va, 2), 1);
        assert_eq!(table_index(va, 1), 1);
    }
}
