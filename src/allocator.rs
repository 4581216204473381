//! Kernel heap allocator
//!
//! talc over a fixed window between the kernel image and the frame
//! allocator's RAM. Collections, boxes and page-table nodes all come from
//! here; process and DMA memory comes from the frame allocator instead.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use spinning_top::Spinlock;
use talc::{ErrOnOom, Span, Talc};

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

static TALC: Spinlock<Talc<ErrOnOom>> = Spinlock::new(Talc::new(ErrOnOom));

static HEAP_SIZE: AtomicUsize = AtomicUsize::new(0);
static ALLOCATED_BYTES: AtomicUsize = AtomicUsize::new(0);
static ALLOCATION_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Memory statistics
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub heap_size: usize,
    pub allocated: usize,
    pub allocation_count: usize,
}

pub fn stats() -> MemoryStats {
    MemoryStats {
        heap_size: HEAP_SIZE.load(Ordering::Relaxed),
        allocated: ALLOCATED_BYTES.load(Ordering::Relaxed),
        allocation_count: ALLOCATION_COUNT.load(Ordering::Relaxed),
    }
}

pub fn init(heap_start: usize, heap_size: usize) -> Result<(), &'static str> {
    if heap_start == 0 || heap_size == 0 {
        return Err("invalid heap window");
    }
    let span = Span::from_base_size(heap_start as *mut u8, heap_size);
    // SAFETY: the window is reserved for the heap by the memory layout and
    // is mapped by the boot page tables
    unsafe {
        TALC.lock().claim(span).map_err(|_| "heap claim failed")?;
    }
    HEAP_SIZE.store(heap_size, Ordering::Relaxed);
    Ok(())
}

struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        crate::irq::with_irqs_disabled(|| match unsafe { TALC.lock().malloc(layout) } {
            Ok(nn) => {
                ALLOCATED_BYTES.fetch_add(layout.size(), Ordering::Relaxed);
                ALLOCATION_COUNT.fetch_add(1, Ordering::Relaxed);
                nn.as_ptr()
            }
            Err(_) => ptr::null_mut(),
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        crate::irq::with_irqs_disabled(|| {
            // SAFETY: ptr came from this allocator with this layout
            unsafe {
                TALC.lock().free(ptr::NonNull::new_unchecked(ptr), layout);
            }
            ALLOCATED_BYTES.fetch_sub(layout.size(), Ordering::Relaxed);
        })
    }
}
