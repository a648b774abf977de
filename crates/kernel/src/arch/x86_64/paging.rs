//! # x86_64 paging layer
//!
//! 4-level table management (PML4 → PDPT → PD → PT, 512 entries each)
//! over the kernel's identity-mapped physical range: a table's physical
//! address doubles as its kernel-virtual address, so walks are plain
//! pointer chasing.
//!
//! ```text
//! 63    48 47      39 38      30 29      21 20      12 11       0
//! +--------+---------+---------+---------+---------+------------+
//! | sign   | PML4    | PDPT    | PD      | PT      | offset     |
//! +--------+---------+---------+---------+---------+------------+
//! ```
//!
//! Supported leaves are 4 KiB PT entries and 2 MiB PD entries (SIZE
//! bit). The rules the tests pin down:
//!
//! * a PD entry with the SIZE bit maps a 2 MiB-aligned region and has no
//!   PT child;
//! * mapping a 4 KiB page inside a live 2 MiB region is a policy
//!   violation (`InvalidArg`), not a silent split;
//! * interior tables are lazily allocated from the PMM (arriving zeroed
//!   by its contract) with `PRESENT | WRITABLE`;
//! * `unmap` clears the leaf only; interior tables are retained, so an
//!   unmap+map cycle allocates nothing;
//! * every successful kernel-level map/unmap invalidates the affected
//!   page's TLB entry; full CR3 reloads are a bring-up-only tool.
//!
//! MMIO pages are mapped identity, `PRESENT | WRITABLE | PCD` (uncached);
//! the LAPIC and IO-APIC pages go through [`kmap_mmio`].
//!
//! The `AddressSpace` methods mutate tables and report which address
//! changed; the TLB invalidation is issued by the module-level kernel
//! wrappers. That split keeps the walk logic exercisable on synthetic
//! tables.

use spin::{Mutex, Once};
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{
    FrameAllocator, PageTable, PageTableFlags, PageTableIndex, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::error::{KernelError, KernelResult};
use crate::mm;

/// 4 KiB leaf granularity
const PAGE_MASK: u64 = 0xFFF;

/// 2 MiB leaf granularity
const LARGE_PAGE_MASK: u64 = 0x1F_FFFF;

#[inline]
fn pml4_index(va: u64) -> PageTableIndex {
    PageTableIndex::new((va >> 39) as u16 & 0x1FF)
}

#[inline]
fn pdpt_index(va: u64) -> PageTableIndex {
    PageTableIndex::new((va >> 30) as u16 & 0x1FF)
}

#[inline]
fn pd_index(va: u64) -> PageTableIndex {
    PageTableIndex::new((va >> 21) as u16 & 0x1FF)
}

#[inline]
fn pt_index(va: u64) -> PageTableIndex {
    PageTableIndex::new((va >> 12) as u16 & 0x1FF)
}

/// Identity mapping: a table's physical address is its pointer.
unsafe fn table_mut(phys: PhysAddr) -> &'static mut PageTable {
    &mut *(phys.as_u64() as *mut PageTable)
}

unsafe fn table_ref(phys: PhysAddr) -> &'static PageTable {
    &*(phys.as_u64() as *const PageTable)
}

/// One 4-level table tree, named by its PML4 frame.
pub struct AddressSpace {
    pml4: PhysAddr,
}

impl AddressSpace {
    /// Adopt the live tree from CR3.
    ///
    /// # Safety
    ///
    /// Paging must be enabled and the boot tables identity-mapped.
    pub unsafe fn from_current() -> Self {
        let (frame, _flags) = Cr3::read();
        Self {
            pml4: frame.start_address(),
        }
    }

    /// Build an empty tree from a fresh PMM frame.
    ///
    /// # Safety
    ///
    /// The frame source must hand out identity-mapped zeroed frames.
    pub unsafe fn new(frames: &mut impl FrameAllocator<Size4KiB>) -> KernelResult<Self> {
        let frame = frames.allocate_frame().ok_or(KernelError::OutOfMemory)?;
        Ok(Self {
            pml4: frame.start_address(),
        })
    }

    /// Physical address of the root table.
    pub fn root(&self) -> PhysAddr {
        self.pml4
    }

    /// Walk one level down, creating the child table if the entry is
    /// empty. Interior entries are `PRESENT | WRITABLE`.
    unsafe fn child_or_create(
        entry_table: &mut PageTable,
        index: PageTableIndex,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> KernelResult<&'static mut PageTable> {
        let entry = &mut entry_table[index];
        if entry.flags().contains(PageTableFlags::PRESENT) {
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(KernelError::InvalidArg);
            }
            return Ok(table_mut(entry.addr()));
        }

        let frame = frames.allocate_frame().ok_or(KernelError::OutOfMemory)?;
        // Zeroed by the PMM contract, so all 512 entries start non-present.
        entry.set_addr(
            frame.start_address(),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );
        Ok(table_mut(frame.start_address()))
    }

    unsafe fn child(table: &PageTable, index: PageTableIndex) -> Option<&'static PageTable> {
        let entry = &table[index];
        if !entry.flags().contains(PageTableFlags::PRESENT)
            || entry.flags().contains(PageTableFlags::HUGE_PAGE)
        {
            return None;
        }
        Some(table_ref(entry.addr()))
    }

    /// Install a 4 KiB leaf. Both addresses must be page-aligned; the
    /// caller's flags are or-ed with `PRESENT`.
    ///
    /// # Safety
    ///
    /// `pa` must be memory the caller may expose at `va`.
    pub unsafe fn map_4k(
        &mut self,
        va: u64,
        pa: u64,
        flags: PageTableFlags,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> KernelResult {
        if va & PAGE_MASK != 0 || pa & PAGE_MASK != 0 {
            return Err(KernelError::InvalidArg);
        }

        let pml4 = table_mut(self.pml4);
        let pdpt = Self::child_or_create(pml4, pml4_index(va), frames)?;
        let pd = Self::child_or_create(pdpt, pdpt_index(va), frames)?;
        // A SIZE-bit PD entry owns this whole 2 MiB region; carving a
        // 4 KiB page out of it is a policy violation.
        let pt = Self::child_or_create(pd, pd_index(va), frames)?;

        let leaf = &mut pt[pt_index(va)];
        if leaf.flags().contains(PageTableFlags::PRESENT) {
            return Err(KernelError::InvalidArg);
        }
        leaf.set_addr(PhysAddr::new(pa), flags | PageTableFlags::PRESENT);
        Ok(())
    }

    /// Install a 2 MiB leaf. Both addresses must be 2 MiB-aligned.
    ///
    /// # Safety
    ///
    /// `pa` must be memory the caller may expose at `va`.
    pub unsafe fn map_2m(
        &mut self,
        va: u64,
        pa: u64,
        flags: PageTableFlags,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> KernelResult {
        if va & LARGE_PAGE_MASK != 0 || pa & LARGE_PAGE_MASK != 0 {
            return Err(KernelError::InvalidArg);
        }

        let pml4 = table_mut(self.pml4);
        let pdpt = Self::child_or_create(pml4, pml4_index(va), frames)?;
        let pd = Self::child_or_create(pdpt, pdpt_index(va), frames)?;

        let entry = &mut pd[pd_index(va)];
        if entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(KernelError::InvalidArg);
        }
        entry.set_addr(
            PhysAddr::new(pa),
            flags | PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE,
        );
        Ok(())
    }

    /// Clear the leaf mapping `va` and return the physical address it
    /// carried. Interior tables are retained.
    pub fn unmap(&mut self, va: u64) -> KernelResult<u64> {
        unsafe {
            let pml4 = table_mut(self.pml4);
            let pdpt_entry = &pml4[pml4_index(va)];
            if !pdpt_entry.flags().contains(PageTableFlags::PRESENT) {
                return Err(KernelError::NotPresent);
            }
            let pdpt = table_mut(pdpt_entry.addr());
            let pd_entry = &pdpt[pdpt_index(va)];
            if !pd_entry.flags().contains(PageTableFlags::PRESENT) {
                return Err(KernelError::NotPresent);
            }
            let pd = table_mut(pd_entry.addr());

            let entry = &mut pd[pd_index(va)];
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                return Err(KernelError::NotPresent);
            }
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                let pa = entry.addr().as_u64() & !LARGE_PAGE_MASK;
                entry.set_unused();
                return Ok(pa);
            }

            let pt = table_mut(entry.addr());
            let leaf = &mut pt[pt_index(va)];
            if !leaf.flags().contains(PageTableFlags::PRESENT) {
                return Err(KernelError::NotPresent);
            }
            let pa = leaf.addr().as_u64();
            leaf.set_unused();
            Ok(pa)
        }
    }

    /// Resolve a virtual address through the tree.
    pub fn translate(&self, va: u64) -> Option<u64> {
        unsafe {
            let pml4 = table_ref(self.pml4);
            let pdpt = Self::child(pml4, pml4_index(va))?;
            let pd = Self::child(pdpt, pdpt_index(va))?;

            let pd_entry = &pd[pd_index(va)];
            if !pd_entry.flags().contains(PageTableFlags::PRESENT) {
                return None;
            }
            if pd_entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                let base = pd_entry.addr().as_u64() & !LARGE_PAGE_MASK;
                return Some(base | (va & LARGE_PAGE_MASK));
            }

            let pt = table_ref(pd_entry.addr());
            let leaf = &pt[pt_index(va)];
            if !leaf.flags().contains(PageTableFlags::PRESENT) {
                return None;
            }
            Some((leaf.addr().as_u64() & !PAGE_MASK) | (va & PAGE_MASK))
        }
    }
}

/// Invalidate one page's TLB entry.
#[inline]
pub fn flush_tlb_page(va: u64) {
    x86_64::instructions::tlb::flush(VirtAddr::new(va));
}

/// Reload CR3, dropping every non-global TLB entry. Bring-up only.
pub fn flush_tlb_all() {
    x86_64::instructions::tlb::flush_all();
}

static KERNEL_SPACE: Once<Mutex<AddressSpace>> = Once::new();

/// Adopt the boot tables as the kernel address space.
///
/// # Safety
///
/// Must run once during boot, after the PMM is up, with the boot
/// identity mappings live.
pub unsafe fn init() {
    let space = AddressSpace::from_current();
    crate::kinfo!("[VMM] adopted boot PML4 at {:#x}", space.root().as_u64());
    KERNEL_SPACE.call_once(|| Mutex::new(space));
}

fn kernel_space() -> KernelResult<&'static Mutex<AddressSpace>> {
    KERNEL_SPACE.get().ok_or(KernelError::NotPresent)
}

/// Map a 4 KiB page into the kernel space and invalidate its TLB entry.
///
/// # Safety
///
/// As [`AddressSpace::map_4k`].
pub unsafe fn kmap_4k(va: u64, pa: u64, flags: PageTableFlags) -> KernelResult {
    let space = kernel_space()?;
    mm::with_allocator(|frames| space.lock().map_4k(va, pa, flags, frames))
        .ok_or(KernelError::NotPresent)??;
    flush_tlb_page(va);
    Ok(())
}

/// Map a 2 MiB page into the kernel space and invalidate its TLB entry.
///
/// # Safety
///
/// As [`AddressSpace::map_2m`].
pub unsafe fn kmap_2m(va: u64, pa: u64, flags: PageTableFlags) -> KernelResult {
    let space = kernel_space()?;
    mm::with_allocator(|frames| space.lock().map_2m(va, pa, flags, frames))
        .ok_or(KernelError::NotPresent)??;
    flush_tlb_page(va);
    Ok(())
}

/// Unmap a kernel page and invalidate its TLB entry.
pub fn kunmap(va: u64) -> KernelResult<u64> {
    let pa = kernel_space()?.lock().unmap(va)?;
    flush_tlb_page(va);
    Ok(pa)
}

/// Resolve a kernel virtual address.
pub fn ktranslate(va: u64) -> Option<u64> {
    KERNEL_SPACE.get()?.lock().translate(va)
}

/// Identity-map one MMIO page uncached (`PRESENT | WRITABLE | PCD`).
///
/// Pages the boot tables already reach are left alone.
///
/// # Safety
///
/// `phys` must be a device page, not RAM handed out by the PMM.
pub unsafe fn kmap_mmio(phys: u64) -> KernelResult {
    let page = phys & !PAGE_MASK;
    if ktranslate(page).is_some() {
        return Ok(());
    }
    kmap_4k(
        page,
        page,
        PageTableFlags::WRITABLE | PageTableFlags::NO_CACHE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pmm::test_support::pmm_over;

    #[test]
    fn test_map_translate_unmap_round_trip() {
        let mut pmm = pmm_over(64);
        let mut space = unsafe { AddressSpace::new(&mut pmm).unwrap() };

        unsafe {
            space
                .map_4k(0x0000_1000_0000, 0x1000, PageTableFlags::WRITABLE, &mut pmm)
                .unwrap();
        }
        assert_eq!(space.translate(0x0000_1000_0000), Some(0x1000));
        assert_eq!(space.translate(0x0000_1000_0123), Some(0x1123));

        assert_eq!(space.unmap(0x0000_1000_0000), Ok(0x1000));
        assert_eq!(space.translate(0x0000_1000_0000), None);
    }

    #[test]
    fn test_unmapped_address_translates_to_none() {
        let mut pmm = pmm_over(16);
        let space = unsafe { AddressSpace::new(&mut pmm).unwrap() };
        assert_eq!(space.translate(0xDEAD_B000), None);
    }

    #[test]
    fn test_unmap_of_missing_mapping_is_not_present() {
        let mut pmm = pmm_over(16);
        let mut space = unsafe { AddressSpace::new(&mut pmm).unwrap() };
        assert_eq!(space.unmap(0x4000_0000), Err(KernelError::NotPresent));
    }

    #[test]
    fn test_large_page_covers_whole_region() {
        let mut pmm = pmm_over(16);
        let mut space = unsafe { AddressSpace::new(&mut pmm).unwrap() };

        let va = 0x4000_0000u64;
        let pa = 0x0060_0000u64;
        unsafe {
            space
                .map_2m(va, pa, PageTableFlags::WRITABLE, &mut pmm)
                .unwrap();
        }

        for k in [0u64, 0x123, 0x1000, 0x10_5678, 0x1F_FFFF] {
            assert_eq!(space.translate(va + k), Some(pa + k));
        }

        assert_eq!(space.unmap(va), Ok(pa));
        assert_eq!(space.translate(va), None);
    }

    #[test]
    fn test_4k_inside_live_2m_region_is_policy_violation() {
        let mut pmm = pmm_over(16);
        let mut space = unsafe { AddressSpace::new(&mut pmm).unwrap() };

        let va = 0x4000_0000u64;
        unsafe {
            space
                .map_2m(va, 0x0020_0000, PageTableFlags::empty(), &mut pmm)
                .unwrap();
            assert_eq!(
                space.map_4k(va + 0x3000, 0x5000, PageTableFlags::empty(), &mut pmm),
                Err(KernelError::InvalidArg)
            );
        }
    }

    #[test]
    fn test_alignment_is_validated() {
        let mut pmm = pmm_over(16);
        let mut space = unsafe { AddressSpace::new(&mut pmm).unwrap() };

        unsafe {
            assert_eq!(
                space.map_4k(0x1001, 0x2000, PageTableFlags::empty(), &mut pmm),
                Err(KernelError::InvalidArg)
            );
            assert_eq!(
                space.map_4k(0x1000, 0x2001, PageTableFlags::empty(), &mut pmm),
                Err(KernelError::InvalidArg)
            );
            assert_eq!(
                space.map_2m(0x10_0000, 0x20_0000, PageTableFlags::empty(), &mut pmm),
                Err(KernelError::InvalidArg)
            );
            assert_eq!(
                space.map_2m(0x20_0000, 0x10_0000, PageTableFlags::empty(), &mut pmm),
                Err(KernelError::InvalidArg)
            );
        }
    }

    #[test]
    fn test_double_map_is_rejected() {
        let mut pmm = pmm_over(16);
        let mut space = unsafe { AddressSpace::new(&mut pmm).unwrap() };

        unsafe {
            space
                .map_4k(0x7000_0000, 0x3000, PageTableFlags::empty(), &mut pmm)
                .unwrap();
            assert_eq!(
                space.map_4k(0x7000_0000, 0x4000, PageTableFlags::empty(), &mut pmm),
                Err(KernelError::InvalidArg)
            );
        }
    }

    #[test]
    fn test_interior_tables_are_retained_across_unmap() {
        let mut pmm = pmm_over(64);
        let mut space = unsafe { AddressSpace::new(&mut pmm).unwrap() };

        let va = 0x0000_2000_0000u64;
        unsafe {
            space
                .map_4k(va, 0x8000, PageTableFlags::empty(), &mut pmm)
                .unwrap();
        }
        let frames_after_first_map = pmm.free_count();

        // unmap + map of the same page walks the retained tables and
        // allocates nothing new.
        space.unmap(va).unwrap();
        unsafe {
            space
                .map_4k(va, 0x8000, PageTableFlags::empty(), &mut pmm)
                .unwrap();
        }
        assert_eq!(pmm.free_count(), frames_after_first_map);
        assert_eq!(space.translate(va), Some(0x8000));
    }

    #[test]
    fn test_sibling_mappings_share_interior_tables() {
        let mut pmm = pmm_over(64);
        let mut space = unsafe { AddressSpace::new(&mut pmm).unwrap() };

        unsafe {
            space
                .map_4k(0x9000_0000, 0x1000, PageTableFlags::empty(), &mut pmm)
                .unwrap();
        }
        let after_first = pmm.free_count();
        unsafe {
            space
                .map_4k(0x9000_1000, 0x2000, PageTableFlags::empty(), &mut pmm)
                .unwrap();
        }
        // Same PT: the second map consumed no frames.
        assert_eq!(pmm.free_count(), after_first);
    }

    #[test]
    fn test_leaf_flags_include_caller_bits() {
        let mut pmm = pmm_over(16);
        let mut space = unsafe { AddressSpace::new(&mut pmm).unwrap() };

        let va = 0xA000_0000u64;
        unsafe {
            space
                .map_4k(
                    va,
                    0x6000,
                    PageTableFlags::WRITABLE | PageTableFlags::NO_CACHE,
                    &mut pmm,
                )
                .unwrap();

            let pml4 = table_ref(space.root());
            let pdpt = AddressSpace::child(pml4, pml4_index(va)).unwrap();
            let pd = AddressSpace::child(pdpt, pdpt_index(va)).unwrap();
            let pt = AddressSpace::child(pd, pd_index(va)).unwrap();
            let flags = pt[pt_index(va)].flags();
            assert!(flags.contains(PageTableFlags::PRESENT));
            assert!(flags.contains(PageTableFlags::WRITABLE));
            assert!(flags.contains(PageTableFlags::NO_CACHE));
        }
    }
}
