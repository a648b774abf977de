//! # Physical memory manager
//!
//! A bitmap allocator over one contiguous managed range
//! `[mem_start, mem_end)`. Page `i` of the range is one bit: 0 free,
//! 1 used. The bitmap itself lives in the first page(s) of the range and
//! those pages are marked used from the start.
//!
//! Invariants the tests lean on:
//!
//! * `free + used == total` at every quiescent point;
//! * a freshly allocated frame is zeroed (through the identity mapping)
//!   before it is handed out;
//! * `alloc_page` followed by `free_page` of the same frame restores the
//!   bitmap bit-exactly;
//! * a failed `alloc_pages(n)` leaves the bitmap untouched;
//! * freeing an already-free frame is a silent no-op.
//!
//! The allocator takes no inner lock: single CPU, and callers hold the
//! IRQL at `Device` or above (the module façade in `mm` wraps the global
//! instance in a spinlock that is never contended in this design).

use crate::error::{KernelError, KernelResult};

use super::page::{is_page_aligned, page_align_up, PhysAddr, PAGE_SIZE};

/// Bitmap allocator over a contiguous physical range.
pub struct BitmapFrameAllocator {
    mem_start: u64,
    mem_end: u64,
    bitmap: &'static mut [u8],
    total_pages: usize,
    free_pages: usize,
}

impl BitmapFrameAllocator {
    /// Build the allocator with its bitmap embedded at `mem_start`.
    ///
    /// The bitmap needs `ceil(total_pages / 8)` bytes rounded up to a
    /// whole page; those leading pages are marked used.
    ///
    /// # Safety
    ///
    /// `[mem_start, mem_end)` must be page-aligned, identity-mapped,
    /// writable RAM owned exclusively by this allocator.
    pub unsafe fn embed(mem_start: u64, mem_end: u64) -> KernelResult<Self> {
        if !is_page_aligned(mem_start) || !is_page_aligned(mem_end) || mem_start >= mem_end {
            return Err(KernelError::InvalidArg);
        }

        let total_pages = ((mem_end - mem_start) as usize) / PAGE_SIZE;
        let bitmap_bytes = (total_pages + 7) / 8;
        let bitmap_pages = (page_align_up(bitmap_bytes as u64) as usize) / PAGE_SIZE;
        if bitmap_pages >= total_pages {
            return Err(KernelError::InvalidArg);
        }

        let bitmap = core::slice::from_raw_parts_mut(mem_start as *mut u8, bitmap_bytes);
        bitmap.fill(0);

        let mut pmm = Self {
            mem_start,
            mem_end,
            bitmap,
            total_pages,
            free_pages: total_pages,
        };

        // The bitmap's own pages are permanently used.
        for page in 0..bitmap_pages {
            pmm.set_bit(page);
            pmm.free_pages -= 1;
        }

        Ok(pmm)
    }

    #[inline]
    fn bit(&self, page: usize) -> bool {
        self.bitmap[page / 8] & (1 << (page % 8)) != 0
    }

    #[inline]
    fn set_bit(&mut self, page: usize) {
        self.bitmap[page / 8] |= 1 << (page % 8);
    }

    #[inline]
    fn clear_bit(&mut self, page: usize) {
        self.bitmap[page / 8] &= !(1 << (page % 8));
    }

    #[inline]
    fn page_to_pa(&self, page: usize) -> PhysAddr {
        self.mem_start + (page * PAGE_SIZE) as u64
    }

    /// Map an address into a page index; `None` when outside the range
    /// or misaligned.
    fn pa_to_page(&self, pa: PhysAddr) -> Option<usize> {
        if !is_page_aligned(pa) || pa < self.mem_start || pa >= self.mem_end {
            return None;
        }
        Some(((pa - self.mem_start) as usize) / PAGE_SIZE)
    }

    /// First-fit single-frame allocation; the frame is zeroed.
    pub fn alloc_page(&mut self) -> Option<PhysAddr> {
        if self.free_pages == 0 {
            return None;
        }
        for page in 0..self.total_pages {
            if !self.bit(page) {
                self.set_bit(page);
                self.free_pages -= 1;
                let pa = self.page_to_pa(page);
                unsafe { zero_frame(pa) };
                return Some(pa);
            }
        }
        None
    }

    /// Release one frame. Misaligned or out-of-range addresses are
    /// rejected; releasing an already-free frame is a silent no-op.
    pub fn free_page(&mut self, pa: PhysAddr) -> KernelResult {
        let page = self.pa_to_page(pa).ok_or(KernelError::InvalidArg)?;
        if self.bit(page) {
            self.clear_bit(page);
            self.free_pages += 1;
        }
        Ok(())
    }

    /// Best-effort contiguous first-fit run of `count` frames, all
    /// zeroed. On failure the bitmap is unchanged.
    pub fn alloc_pages(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 || count > self.free_pages {
            return None;
        }

        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for page in 0..self.total_pages {
            if self.bit(page) {
                run_len = 0;
                run_start = page + 1;
                continue;
            }
            run_len += 1;
            if run_len == count {
                for p in run_start..run_start + count {
                    self.set_bit(p);
                }
                self.free_pages -= count;
                let pa = self.page_to_pa(run_start);
                for p in 0..count {
                    unsafe { zero_frame(pa + (p * PAGE_SIZE) as u64) };
                }
                return Some(pa);
            }
        }
        None
    }

    /// Release `count` frames starting at `pa`.
    pub fn free_pages(&mut self, pa: PhysAddr, count: usize) -> KernelResult {
        for p in 0..count {
            self.free_page(pa + (p * PAGE_SIZE) as u64)?;
        }
        Ok(())
    }

    /// Whether a frame is currently allocated; `None` outside the range.
    pub fn is_allocated(&self, pa: PhysAddr) -> Option<bool> {
        self.pa_to_page(pa).map(|page| self.bit(page))
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn free_count(&self) -> usize {
        self.free_pages
    }

    pub fn used_count(&self) -> usize {
        self.total_pages - self.free_pages
    }

    pub fn range(&self) -> (u64, u64) {
        (self.mem_start, self.mem_end)
    }
}

/// Zero a frame through its kernel-virtual identity mapping.
unsafe fn zero_frame(pa: PhysAddr) {
    core::ptr::write_bytes(pa as *mut u8, 0, PAGE_SIZE);
}

#[cfg(target_arch = "x86_64")]
unsafe impl x86_64::structures::paging::FrameAllocator<x86_64::structures::paging::Size4KiB>
    for BitmapFrameAllocator
{
    fn allocate_frame(
        &mut self,
    ) -> Option<x86_64::structures::paging::PhysFrame<x86_64::structures::paging::Size4KiB>> {
        self.alloc_page().map(|pa| {
            x86_64::structures::paging::PhysFrame::containing_address(x86_64::PhysAddr::new(pa))
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Leak a page-aligned host buffer and return it as a synthetic
    /// physical range for allocator and paging tests.
    pub fn synthetic_region(pages: usize) -> (u64, u64) {
        let bytes = pages * PAGE_SIZE;
        let layout = std::alloc::Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        let start = base as u64;
        (start, start + bytes as u64)
    }

    pub fn pmm_over(pages: usize) -> BitmapFrameAllocator {
        let (start, end) = synthetic_region(pages);
        unsafe { BitmapFrameAllocator::embed(start, end).unwrap() }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::pmm_over;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_embed_reserves_bitmap_pages() {
        let pmm = pmm_over(256);
        assert_eq!(pmm.total_pages(), 256);
        // 256 bits fit in one page, which the bitmap itself occupies.
        assert_eq!(pmm.free_count(), 255);
        assert_eq!(pmm.used_count(), 1);
        assert_eq!(pmm.is_allocated(pmm.range().0), Some(true));
    }

    #[test]
    fn test_counts_balance_across_alloc_free() {
        let mut pmm = pmm_over(64);
        let total = pmm.total_pages();

        let a = pmm.alloc_page().unwrap();
        let b = pmm.alloc_page().unwrap();
        assert_eq!(pmm.free_count() + pmm.used_count(), total);

        pmm.free_page(a).unwrap();
        assert_eq!(pmm.free_count() + pmm.used_count(), total);
        pmm.free_page(b).unwrap();
        assert_eq!(pmm.free_count() + pmm.used_count(), total);
    }

    #[test]
    fn test_alloc_free_round_trip_restores_bitmap() {
        let mut pmm = pmm_over(64);
        let before: Vec<u8> = pmm.bitmap.to_vec();
        let free_before = pmm.free_count();

        let pa = pmm.alloc_page().unwrap();
        assert_ne!(pmm.bitmap.to_vec(), before);
        pmm.free_page(pa).unwrap();

        assert_eq!(pmm.bitmap.to_vec(), before);
        assert_eq!(pmm.free_count(), free_before);
    }

    #[test]
    fn test_allocated_frame_is_zeroed() {
        let mut pmm = pmm_over(16);
        let pa = pmm.alloc_page().unwrap();
        unsafe { core::ptr::write_bytes(pa as *mut u8, 0xAB, PAGE_SIZE) };
        pmm.free_page(pa).unwrap();

        let again = pmm.alloc_page().unwrap();
        assert_eq!(again, pa); // first fit returns the same slot
        let contents = unsafe { core::slice::from_raw_parts(again as *const u8, PAGE_SIZE) };
        assert!(contents.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_middle_slot_is_reused() {
        // 1 MiB region: 256 pages, one of which holds the bitmap.
        let mut pmm = pmm_over(256);

        let mut run = [0u64; 5];
        for slot in run.iter_mut() {
            *slot = pmm.alloc_page().unwrap();
        }
        let middle = run[2];

        pmm.free_page(middle).unwrap();
        assert_eq!(pmm.alloc_page(), Some(middle));
    }

    #[test]
    fn test_double_free_is_silent_noop() {
        let mut pmm = pmm_over(16);
        let pa = pmm.alloc_page().unwrap();
        pmm.free_page(pa).unwrap();
        let free_after_first = pmm.free_count();

        assert_eq!(pmm.free_page(pa), Ok(()));
        assert_eq!(pmm.free_count(), free_after_first);
    }

    #[test]
    fn test_free_validates_alignment_and_range() {
        let mut pmm = pmm_over(16);
        let (start, end) = pmm.range();

        assert_eq!(pmm.free_page(start + 1), Err(KernelError::InvalidArg));
        assert_eq!(pmm.free_page(end), Err(KernelError::InvalidArg));
        assert_eq!(
            pmm.free_page(start.wrapping_sub(PAGE_SIZE as u64)),
            Err(KernelError::InvalidArg)
        );
    }

    #[test]
    fn test_contiguous_run_is_inside_range_and_aligned() {
        let mut pmm = pmm_over(64);
        let (start, end) = pmm.range();

        let pa = pmm.alloc_pages(8).unwrap();
        assert!(is_page_aligned(pa));
        assert!(pa >= start);
        assert!(pa + (8 * PAGE_SIZE) as u64 <= end);
        for p in 0..8 {
            assert_eq!(pmm.is_allocated(pa + (p * PAGE_SIZE) as u64), Some(true));
        }
    }

    #[test]
    fn test_failed_contiguous_alloc_leaves_bitmap_unchanged() {
        let mut pmm = pmm_over(16);
        // Fragment: allocate everything, free every other page.
        let mut held = Vec::new();
        while let Some(pa) = pmm.alloc_page() {
            held.push(pa);
        }
        for pa in held.iter().step_by(2) {
            pmm.free_page(*pa).unwrap();
        }

        let before: Vec<u8> = pmm.bitmap.to_vec();
        let free_before = pmm.free_count();
        assert!(free_before >= 2);

        assert_eq!(pmm.alloc_pages(2), None);
        assert_eq!(pmm.bitmap.to_vec(), before);
        assert_eq!(pmm.free_count(), free_before);
    }

    #[test]
    fn test_free_pages_releases_whole_run() {
        let mut pmm = pmm_over(64);
        let free_before = pmm.free_count();
        let pa = pmm.alloc_pages(4).unwrap();
        assert_eq!(pmm.free_count(), free_before - 4);
        pmm.free_pages(pa, 4).unwrap();
        assert_eq!(pmm.free_count(), free_before);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut pmm = pmm_over(8);
        let mut got = 0;
        while pmm.alloc_page().is_some() {
            got += 1;
        }
        assert_eq!(got, 7); // one page is the bitmap
        assert_eq!(pmm.alloc_page(), None);
        assert_eq!(pmm.alloc_pages(1), None);
    }

    proptest! {
        #[test]
        fn prop_counts_always_balance(ops in proptest::collection::vec(0u8..3, 1..64)) {
            let mut pmm = pmm_over(32);
            let total = pmm.total_pages();
            let mut held: Vec<u64> = Vec::new();

            for op in ops {
                match op {
                    0 => {
                        if let Some(pa) = pmm.alloc_page() {
                            held.push(pa);
                        }
                    }
                    1 => {
                        if let Some(pa) = held.pop() {
                            pmm.free_page(pa).unwrap();
                        }
                    }
                    _ => {
                        if let Some(pa) = pmm.alloc_pages(3) {
                            for p in 0..3 {
                                held.push(pa + (p * PAGE_SIZE) as u64);
                            }
                        }
                    }
                }
                prop_assert_eq!(pmm.free_count() + pmm.used_count(), total);
            }

            for pa in held {
                pmm.free_page(pa).unwrap();
            }
            prop_assert_eq!(pmm.free_count() + pmm.used_count(), total);
        }
    }
}
