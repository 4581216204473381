//! Physical page-frame allocator
//!
//! A bitmap over the RAM window hands out 4 KiB frames. Runs of up to 64
//! frames are found with a ctz scan inside a single bitmap word; a run is
//! never allowed to straddle a word boundary, so callers seeing a failure
//! for a small run can retry with a smaller one. Runs above 64 frames use
//! whole-word scans. A rolling start cursor keeps steady-state allocation
//! O(1) amortized.
//!
//! Frames requested as "partial" carry a sub-page header in their first
//! bytes: allocations below page size bump-allocate inside the page with a
//! free list for returned blocks, chaining to a fresh page when full.

#![allow(dead_code)]

use spinning_top::Spinlock;

use crate::irq::with_irqs_disabled;
use crate::mmu;

pub const PAGE_SIZE: usize = 4096;

pub const ALIGN_16B: usize = 0x10;
pub const ALIGN_64B: usize = 0x40;
pub const ALIGN_4KB: usize = 0x1000;

/// Memory attribute bits carried by allocations and mappings
pub mod attrs {
    pub const RO: u8 = 0;
    pub const RW: u8 = 1 << 0;
    pub const EXEC: u8 = 1 << 1;
    pub const NORM: u8 = 0;
    pub const DEV: u8 = 1 << 2;
}

/// Ownership level of a frame or mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemLevel {
    User = 0,
    Kernel = 1,
    Shared = 2,
}

/// Number of pages needed to hold `size` bytes
pub const fn count_pages(size: u64) -> usize {
    (size as usize).div_ceil(PAGE_SIZE)
}

// ============================================================================
// Frame bitmap
// ============================================================================

/// Bit set = frame used. Pure data structure so the allocation logic can be
/// exercised without touching page tables.
pub struct FrameBitmap {
    words: alloc::vec::Vec<u64>,
    base: usize,
    total_pages: usize,
    free_pages: usize,
    /// Rolling scan cursor, in page index units
    start: usize,
}

impl FrameBitmap {
    pub const fn new() -> Self {
        Self {
            words: alloc::vec::Vec::new(),
            base: 0,
            total_pages: 0,
            free_pages: 0,
            start: 0,
        }
    }

    pub fn init(&mut self, base: usize, size: usize) {
        self.base = base & !(PAGE_SIZE - 1);
        self.total_pages = size / PAGE_SIZE;
        self.words = alloc::vec![0u64; self.total_pages.div_ceil(64)];
        self.free_pages = self.total_pages;
        self.start = 0;
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    fn index_of(&self, addr: usize) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let idx = (addr - self.base) / PAGE_SIZE;
        (idx < self.total_pages).then_some(idx)
    }

    pub fn is_used(&self, addr: usize) -> bool {
        match self.index_of(addr) {
            Some(idx) => self.words[idx / 64] & (1u64 << (idx % 64)) != 0,
            None => false,
        }
    }

    fn set_used(&mut self, idx: usize) {
        let w = &mut self.words[idx / 64];
        let bit = 1u64 << (idx % 64);
        if *w & bit == 0 {
            *w |= bit;
            self.free_pages -= 1;
        }
    }

    fn set_free(&mut self, idx: usize) {
        let w = &mut self.words[idx / 64];
        let bit = 1u64 << (idx % 64);
        if *w & bit != 0 {
            *w &= !bit;
            self.free_pages += 1;
        }
    }

    /// Reserve `pages` frames starting at `addr` without handing them out
    /// (firmware and DMA carve-outs).
    pub fn mark_used(&mut self, addr: usize, pages: usize) {
        if addr & (PAGE_SIZE - 1) != 0 || pages == 0 {
            return;
        }
        let Some(first) = self.index_of(addr) else {
            return;
        };
        for idx in first..(first + pages).min(self.total_pages) {
            self.set_used(idx);
        }
    }

    pub fn free_run(&mut self, addr: usize, pages: usize) {
        let Some(first) = self.index_of(addr) else {
            return;
        };
        for idx in first..(first + pages).min(self.total_pages) {
            self.set_free(idx);
        }
        if first < self.start {
            self.start = first;
        }
    }

    /// Find and claim a run of `pages` free frames. Returns the base address.
    pub fn alloc_run(&mut self, pages: usize) -> Option<usize> {
        if pages == 0 || pages > self.total_pages {
            return None;
        }
        if pages > 64 {
            return self.alloc_large(pages);
        }

        let word_count = self.words.len();
        let mut skipped = false;
        for i in self.start / 64..word_count {
            let word = self.words[i];
            if word == u64::MAX {
                if !skipped {
                    self.start = (i + 1) * 64;
                }
                continue;
            }
            match Self::find_zero_run(word, pages) {
                Some(bit) => {
                    let first = i * 64 + bit;
                    if first + pages > self.total_pages {
                        return None;
                    }
                    for idx in first..first + pages {
                        self.set_used(idx);
                    }
                    return Some(self.base + first * PAGE_SIZE);
                }
                None => skipped = true,
            }
        }
        None
    }

    /// First position of `n` consecutive zero bits fully inside the word.
    fn find_zero_run(word: u64, n: usize) -> Option<usize> {
        let mut bit = (!word).trailing_zeros() as usize;
        while bit + n <= 64 {
            let mask = if n == 64 {
                u64::MAX
            } else {
                ((1u64 << n) - 1) << bit
            };
            if word & mask == 0 {
                return Some(bit);
            }
            // Jump past the blocking used bit
            let blocked = (word & mask) >> bit;
            bit += 64 - blocked.leading_zeros() as usize;
            while bit < 64 && word & (1u64 << bit) != 0 {
                bit += 1;
            }
        }
        None
    }

    /// Word-aligned scan for runs larger than 64 frames.
    fn alloc_large(&mut self, pages: usize) -> Option<usize> {
        let full_words = pages / 64;
        let frac = pages % 64;
        let needed_words = full_words + (frac > 0) as usize;
        let word_count = self.words.len();

        let mut i = self.start / 64;
        'outer: while i + needed_words <= word_count {
            for j in 0..needed_words {
                let want = if frac > 0 && j == needed_words - 1 {
                    // Only the low fractional bits of the last word matter
                    self.words[i + j] & ((1u64 << frac) - 1)
                } else {
                    self.words[i + j]
                };
                if want != 0 {
                    i += 1;
                    continue 'outer;
                }
            }
            let first = i * 64;
            if first + pages > self.total_pages {
                return None;
            }
            for idx in first..first + pages {
                self.set_used(idx);
            }
            self.start = first + pages;
            return Some(self.base + first * PAGE_SIZE);
        }
        None
    }
}

// ============================================================================
// Sub-page allocator
// ============================================================================

/// Header living in the first bytes of a partial page
#[repr(C)]
struct PageHeader {
    /// Next chained partial page (virtual address, 0 = none)
    next: usize,
    /// Head of the returned-block free list (0 = empty)
    free_list: usize,
    /// Bump pointer for fresh allocations
    bump: usize,
    attrs: u8,
    level: u8,
    _pad: [u8; 6],
    /// Bytes currently live in this page
    live: usize,
}

#[repr(C)]
struct FreeBlock {
    next: usize,
    size: usize,
}

fn header(page: usize) -> *mut PageHeader {
    page as *mut PageHeader
}

fn init_partial_page(page: usize, attrs: u8, level: MemLevel) {
    // SAFETY: `page` is a freshly claimed frame owned by the caller
    unsafe {
        header(page).write(PageHeader {
            next: 0,
            free_list: 0,
            bump: page + core::mem::size_of::<PageHeader>(),
            attrs,
            level: level as u8,
            _pad: [0; 6],
            live: 0,
        });
    }
}

// ============================================================================
// Global allocator state
// ============================================================================

static FRAMES: Spinlock<FrameBitmap> = Spinlock::new(FrameBitmap::new());

/// Initialize the frame allocator over the user RAM window.
pub fn init() {
    let map = crate::hw::get();
    let base = map.user_ram_start();
    let size = map.ram_end().saturating_sub(base);
    with_irqs_disabled(|| FRAMES.lock().init(base, size));
    crate::kprintf!(
        "Frame allocator: {:#x}..{:#x} ({} pages)",
        base,
        base + size,
        size / PAGE_SIZE
    );
}

/// Allocate `size` bytes of page frames and map them.
///
/// Device attribute + kernel level maps as Device-nGnRnE; everything else is
/// Normal memory with the requested attributes. When `full` is false, the
/// first frame gets a sub-page header for later `kalloc` calls. Returns 0
/// when no run satisfies the request.
pub fn palloc(size: u64, level: MemLevel, attr: u8, full: bool) -> usize {
    let pages = count_pages(size);
    if pages == 0 {
        return 0;
    }
    with_irqs_disabled(|| {
        let base = match FRAMES.lock().alloc_run(pages) {
            Some(base) => base,
            None => {
                crate::console::print("[page_alloc] could not allocate\n");
                return 0;
            }
        };
        if crate::config::MM_DEBUG {
            crate::safe_print!(64, "[page_alloc] {} pages at {:#x}\n", pages, base);
        }
        for p in 0..pages {
            let addr = base + p * PAGE_SIZE;
            if attr & attrs::DEV != 0 && level == MemLevel::Kernel {
                mmu::register_device_memory(addr, addr);
            } else {
                mmu::register_proc_memory(addr, addr, attr, level);
            }
            if !full {
                init_partial_page(addr, attr, level);
            }
        }
        base
    })
}

/// Allocate zeroed whole frames.
pub fn palloc_zeroed(size: u64, level: MemLevel, attr: u8) -> usize {
    let base = palloc(size, level, attr, true);
    if base != 0 {
        // SAFETY: the run starting at base was just claimed and mapped
        unsafe {
            core::ptr::write_bytes(base as *mut u8, 0, count_pages(size) * PAGE_SIZE);
        }
    }
    base
}

/// Return frames to the bitmap. The mapping is left in place.
pub fn pfree(ptr: usize, size: u64) {
    let pages = count_pages(size.max(1));
    with_irqs_disabled(|| FRAMES.lock().free_run(ptr, pages));
}

/// Reserve frames for firmware/DMA regions so they are never handed out.
pub fn mark_used(addr: usize, pages: usize) {
    with_irqs_disabled(|| FRAMES.lock().mark_used(addr, pages));
}

pub fn page_used(addr: usize) -> bool {
    with_irqs_disabled(|| FRAMES.lock().is_used(addr))
}

/// (total, free) page counts
pub fn stats() -> (usize, usize) {
    with_irqs_disabled(|| {
        let frames = FRAMES.lock();
        (frames.total_pages, frames.free_pages())
    })
}

/// Allocate `size` bytes inside a partial page.
///
/// Requests of a page or more bypass the header and claim whole frames.
/// Returned blocks are zeroed.
pub fn kalloc(page: usize, size: usize, align: usize, level: MemLevel) -> usize {
    if page == 0 || size == 0 {
        return 0;
    }
    let size = (size + align - 1) & !(align - 1);
    with_irqs_disabled(|| kalloc_inner(page, size, align, level))
}

fn kalloc_inner(page: usize, size: usize, align: usize, level: MemLevel) -> usize {
    // SAFETY: `page` was produced by palloc(full = false) and carries a header
    let info = unsafe { &mut *header(page) };

    if size >= PAGE_SIZE {
        let ptr = palloc(size as u64, level, info.attrs, true);
        if ptr != 0 {
            // SAFETY: fresh whole-frame allocation
            unsafe { core::ptr::write_bytes(ptr as *mut u8, 0, size) };
        }
        return ptr;
    }

    // First fit from the free list
    let mut curr = &mut info.free_list as *mut usize;
    // SAFETY: free-list nodes were written by kfree into memory this page owns
    unsafe {
        while *curr != 0 {
            let block = *curr as *mut FreeBlock;
            if (*block).size >= size {
                *curr = (*block).next;
                let result = block as usize;
                core::ptr::write_bytes(result as *mut u8, 0, size);
                info.live += size;
                return result;
            }
            curr = &mut (*block).next as *mut usize;
        }
    }

    info.bump = (info.bump + align - 1) & !(align - 1);

    if info.bump + size > page + PAGE_SIZE {
        if info.next == 0 {
            info.next = palloc(PAGE_SIZE as u64, level, info.attrs, false);
            if info.next == 0 {
                return 0;
            }
        }
        return kalloc_inner(info.next, size, align, level);
    }

    let result = info.bump;
    info.bump += size;
    info.live += size;
    // SAFETY: the bump region lies inside this page
    unsafe { core::ptr::write_bytes(result as *mut u8, 0, size) };
    result
}

/// Return a sub-page block to its page's free list.
pub fn kfree(ptr: usize, size: usize) {
    if ptr == 0 || size == 0 {
        return;
    }
    // A free-list node needs room for its own header
    let size = size.max(core::mem::size_of::<FreeBlock>());
    with_irqs_disabled(|| {
        let page = ptr & !(PAGE_SIZE - 1);
        // SAFETY: `ptr` came from kalloc, so its page carries a header and
        // the block lies inside that page
        unsafe {
            core::ptr::write_bytes(ptr as *mut u8, 0, size);
            let block = ptr as *mut FreeBlock;
            let info = &mut *header(page);
            (*block).size = size;
            (*block).next = info.free_list;
            info.free_list = ptr;
            info.live = info.live.saturating_sub(size);
        }
    });
}

/// Free a sized allocation produced by kalloc.
pub fn free_sized(ptr: usize, size: usize) {
    if size >= PAGE_SIZE {
        pfree(ptr, size as u64);
    } else {
        kfree(ptr, size);
    }
}
