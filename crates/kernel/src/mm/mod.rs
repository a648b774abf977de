//! Memory management subsystem
//!
//! One bitmap allocator instance manages the kernel's physical range.
//! The global is behind a spinlock for interior mutability; contention
//! does not exist in this single-CPU design because allocation paths run
//! at `Device` IRQL or above.

pub mod page;
pub mod pmm;

pub use self::page::{
    pa_to_pfn, page_align_down, page_align_up, pfn_to_pa, PhysAddr, LARGE_PAGE_SIZE, PAGE_SHIFT,
    PAGE_SIZE,
};
pub use self::pmm::BitmapFrameAllocator;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Allocator statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub used_pages: usize,
}

static PHYS: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

/// Bring up the physical memory manager over `[mem_start, mem_end)`.
///
/// # Safety
///
/// The range must be page-aligned, identity-mapped, writable RAM not
/// used for anything else.
pub unsafe fn init(mem_start: u64, mem_end: u64) -> KernelResult {
    let pmm = BitmapFrameAllocator::embed(mem_start, mem_end)?;
    crate::kinfo!(
        "[PMM] managing {:#x}..{:#x}: {} pages, {} free",
        mem_start,
        mem_end,
        pmm.total_pages(),
        pmm.free_count()
    );
    *PHYS.lock() = Some(pmm);
    Ok(())
}

/// Allocate one zeroed frame.
pub fn alloc_page() -> Option<PhysAddr> {
    PHYS.lock().as_mut()?.alloc_page()
}

/// Release one frame.
pub fn free_page(pa: PhysAddr) -> KernelResult {
    PHYS.lock()
        .as_mut()
        .ok_or(KernelError::NotPresent)?
        .free_page(pa)
}

/// Allocate a zeroed contiguous run of frames.
pub fn alloc_pages(count: usize) -> Option<PhysAddr> {
    PHYS.lock().as_mut()?.alloc_pages(count)
}

/// Release a contiguous run of frames.
pub fn free_pages(pa: PhysAddr, count: usize) -> KernelResult {
    PHYS.lock()
        .as_mut()
        .ok_or(KernelError::NotPresent)?
        .free_pages(pa, count)
}

/// Current allocator statistics.
pub fn stats() -> Option<MemStats> {
    let guard = PHYS.lock();
    let pmm = guard.as_ref()?;
    Some(MemStats {
        total_pages: pmm.total_pages(),
        free_pages: pmm.free_count(),
        used_pages: pmm.used_count(),
    })
}

/// Run `f` with the global allocator, for callers that need a frame
/// source across several operations (the paging layer's table walks).
pub fn with_allocator<R>(f: impl FnOnce(&mut BitmapFrameAllocator) -> R) -> Option<R> {
    let mut guard = PHYS.lock();
    guard.as_mut().map(f)
}
