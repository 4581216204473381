//! MMU (Memory Management Unit) for AArch64
//!
//! 4KB granule, 4-level page tables (L0-L3), 48-bit VA on both halves.
//!
//! Memory layout:
//! - TTBR0_EL1: identity map of RAM + devices (shared kernel slots) plus the
//!   per-process user window at `USER_VA_BASE`
//! - TTBR1_EL1: kernel high-half alias (`HIGH_VA | phys`)
//!
//! MAIR index 0 is Device-nGnRnE, index 1 is Normal Non-Cacheable. Every
//! modifying operation on live tables is followed by the full barrier
//! sequence (DSB-ISHST, TLBI VMALLE1IS, DSB-ISH, ISB) and an instruction
//! cache invalidate for code mappings.

#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::pmm::{self, MemLevel, PAGE_SIZE, attrs};

pub const ENTRIES_PER_TABLE: usize = 512;

pub const GRANULE_4KB: usize = 0x1000;
pub const GRANULE_2MB: usize = 0x20_0000;

/// Split point between the process half and the kernel alias half
pub const HIGH_VA: usize = 0xFFFF_0000_0000_0000;

/// Base of the per-process user mapping window (L0 slot 1, so user tables
/// never share intermediate tables with the kernel identity map in slot 0)
pub const USER_VA_BASE: usize = 0x0000_0080_0000_0000;

/// Memory attribute indices (configured in MAIR_EL1)
pub const MAIR_IDX_DEVICE: u64 = 0;
pub const MAIR_IDX_NORMAL: u64 = 1;

const MAIR_DEVICE_NGNRNE: u64 = 0x00;
const MAIR_NORMAL_NC: u64 = 0x44;

/// Page table entry flags
pub mod flags {
    /// Entry is valid
    pub const VALID: u64 = 1 << 0;
    /// Table descriptor at L0-L2, page descriptor at L3
    pub const TABLE: u64 = 1 << 1;
    /// Block descriptor at L1/L2
    pub const BLOCK: u64 = 0 << 1;
    /// Access flag (must be set or every access faults)
    pub const AF: u64 = 1 << 10;
    pub const SH_INNER: u64 = 3 << 8;
    pub const SH_OUTER: u64 = 2 << 8;
    /// AP[2:1]
    pub const AP_RW_EL1: u64 = 0 << 6;
    pub const AP_RW_ALL: u64 = 1 << 6;
    pub const AP_RO_EL1: u64 = 2 << 6;
    pub const AP_RO_ALL: u64 = 3 << 6;
    pub const PXN: u64 = 1 << 53;
    pub const UXN: u64 = 1 << 54;
}

const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// Memory attribute index field in an entry (bits 4:2)
#[inline]
pub const fn attr_index(idx: u64) -> u64 {
    (idx & 0x7) << 2
}

/// Kernel alias of a physical address. Null stays null.
#[inline]
pub const fn to_virt(pa: usize) -> usize {
    if pa == 0 { 0 } else { pa | HIGH_VA }
}

/// Physical address behind a kernel alias. Null stays null.
#[inline]
pub const fn to_phys(va: usize) -> usize {
    if va == 0 { 0 } else { va & !HIGH_VA }
}

#[repr(C, align(4096))]
pub struct PageTable {
    entries: [u64; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [0; ENTRIES_PER_TABLE],
        }
    }
}

fn alloc_table() -> *mut PageTable {
    Box::into_raw(Box::new(PageTable::new()))
}

/// Kernel root tables, allocated once at init
static KERNEL_LO: AtomicUsize = AtomicUsize::new(0);
static KERNEL_HI: AtomicUsize = AtomicUsize::new(0);

pub fn kernel_lo() -> *mut PageTable {
    KERNEL_LO.load(Ordering::Acquire) as *mut PageTable
}

pub fn kernel_hi() -> *mut PageTable {
    KERNEL_HI.load(Ordering::Acquire) as *mut PageTable
}

/// TTBR0 value for the shared kernel identity map
pub fn kernel_ttbr0() -> u64 {
    KERNEL_LO.load(Ordering::Acquire) as u64
}

// ============================================================================
// Barriers
// ============================================================================

pub fn flush_all() {
    unsafe {
        core::arch::asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb");
    }
}

pub fn flush_icache() {
    unsafe {
        core::arch::asm!("ic iallu", "isb");
    }
}

pub fn flush_page(va: usize) {
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1, {}",
            "dsb ish",
            "isb",
            in(reg) (va >> 12) as u64
        );
    }
}

// ============================================================================
// Table walking
// ============================================================================

#[inline]
const fn indices(va: usize) -> (usize, usize, usize, usize) {
    (
        (va >> 39) & 0x1FF,
        (va >> 30) & 0x1FF,
        (va >> 21) & 0x1FF,
        (va >> 12) & 0x1FF,
    )
}

/// Get or create the next-level table behind `entry`.
///
/// # Safety
/// `entry` must point into a live page table.
unsafe fn descend(entry: *mut u64) -> *mut PageTable {
    // SAFETY: caller guarantees entry points into a live table
    unsafe {
        let val = entry.read_volatile();
        if val & flags::VALID != 0 {
            (val & ADDR_MASK) as *mut PageTable
        } else {
            let next = alloc_table();
            entry.write_volatile(next as u64 & ADDR_MASK | flags::VALID | flags::TABLE);
            next
        }
    }
}

/// AP/UXN/PXN encoding for an ownership level and attribute set.
///
/// Kernel mappings are never executable from EL0; user and shared code pages
/// are read-only and EL0-executable; user data is non-executable.
fn permission_bits(level: MemLevel, attr: u8) -> u64 {
    match level {
        MemLevel::Kernel => {
            let ap = if attr & attrs::RW != 0 {
                flags::AP_RW_EL1
            } else {
                flags::AP_RO_EL1
            };
            ap | flags::UXN
        }
        MemLevel::User | MemLevel::Shared => {
            if attr & attrs::EXEC != 0 {
                flags::AP_RO_ALL | flags::PXN
            } else {
                flags::AP_RW_ALL | flags::UXN | flags::PXN
            }
        }
    }
}

/// Install a 4KB leaf mapping, creating intermediate tables as needed.
///
/// Refuses to overwrite a 2MB block with a finer mapping (error, no change)
/// and refuses to re-map an already-mapped leaf (warning, no change).
pub fn map_4kb(table: *mut PageTable, va: usize, pa: usize, mair_idx: u64, attr: u8, level: MemLevel) {
    let (l0, l1, l2, l3) = indices(va);
    // SAFETY: table walks stay inside tables this module allocated; entries
    // are read and written volatile
    unsafe {
        let t0 = &mut (*table).entries;
        let l1t = descend(&mut t0[l0]);
        let l2t = descend(&mut (*l1t).entries[l1]);

        let l2_val = (*l2t).entries[l2];
        if l2_val & flags::VALID != 0 && l2_val & flags::TABLE == 0 {
            crate::kprintf!(
                "[mmu error] {:#x} already mapped at 2MB granularity [{}][{}][{}][{}]",
                va, l0, l1, l2, l3
            );
            return;
        }
        let l3t = descend(&mut (*l2t).entries[l2]);

        if (*l3t).entries[l3] & flags::VALID != 0 {
            crate::kprintf!("[mmu warning] section already mapped {:#x}", va);
            return;
        }

        let sh = if mair_idx == MAIR_IDX_DEVICE {
            flags::SH_OUTER
        } else {
            flags::SH_INNER
        };
        let entry = (pa as u64 & ADDR_MASK)
            | flags::VALID
            | flags::TABLE
            | flags::AF
            | sh
            | attr_index(mair_idx)
            | permission_bits(level, attr);
        core::ptr::write_volatile(&mut (*l3t).entries[l3], entry);
    }
}

/// Install a 2MB block mapping at L2, used for the big kernel windows.
pub fn map_2mb(table: *mut PageTable, va: usize, pa: usize, mair_idx: u64) {
    let (l0, l1, l2, _) = indices(va);
    // SAFETY: as in map_4kb
    unsafe {
        let t0 = &mut (*table).entries;
        let l1t = descend(&mut t0[l0]);
        let l2t = descend(&mut (*l1t).entries[l1]);

        let sh = if mair_idx == MAIR_IDX_DEVICE {
            flags::SH_OUTER
        } else {
            flags::SH_INNER
        };
        let entry = (pa as u64 & ADDR_MASK)
            | flags::VALID
            | flags::BLOCK
            | flags::AF
            | sh
            | attr_index(mair_idx)
            | flags::UXN;
        core::ptr::write_volatile(&mut (*l2t).entries[l2], entry);
    }
}

/// Zero the leaf entry for `va` in the kernel identity map and invalidate.
pub fn unmap(va: usize) {
    let table = kernel_lo();
    if table.is_null() {
        return;
    }
    let (l0, l1, l2, l3) = indices(va);
    // SAFETY: walking the kernel's own tables read-only except the leaf
    unsafe {
        let t0 = (*table).entries[l0];
        if t0 & flags::VALID == 0 {
            return;
        }
        let l1t = (t0 & ADDR_MASK) as *mut PageTable;
        let t1 = (*l1t).entries[l1];
        if t1 & flags::VALID == 0 {
            return;
        }
        let l2t = (t1 & ADDR_MASK) as *mut PageTable;
        let t2 = (*l2t).entries[l2];
        if t2 & flags::VALID == 0 {
            return;
        }
        if t2 & flags::TABLE == 0 {
            // Block mapping: drop the whole 2MB entry
            core::ptr::write_volatile(&mut (*l2t).entries[l2], 0);
        } else {
            let l3t = (t2 & ADDR_MASK) as *mut PageTable;
            core::ptr::write_volatile(&mut (*l3t).entries[l3], 0);
        }
    }
    flush_page(va);
    flush_all();
    flush_icache();
}

/// Map one device page (Device-nGnRnE, kernel RW) at identity plus the
/// high-half alias.
pub fn register_device_memory(va: usize, pa: usize) {
    map_4kb(kernel_lo(), va, pa, MAIR_IDX_DEVICE, attrs::RW, MemLevel::Kernel);
    map_4kb(kernel_hi(), to_virt(va), pa, MAIR_IDX_DEVICE, attrs::RW, MemLevel::Kernel);
    flush_all();
    flush_icache();
}

/// Map a 2MB device block at identity plus the high-half alias.
pub fn register_device_memory_2mb(va: usize, pa: usize) {
    map_2mb(kernel_lo(), va, pa, MAIR_IDX_DEVICE);
    map_2mb(kernel_hi(), to_virt(va), pa, MAIR_IDX_DEVICE);
    flush_all();
    flush_icache();
}

/// Map one page of normal memory with the chosen attributes and level.
pub fn register_proc_memory(va: usize, pa: usize, attr: u8, level: MemLevel) {
    map_4kb(kernel_lo(), va, pa, MAIR_IDX_NORMAL, attr, level);
    map_4kb(kernel_hi(), to_virt(va), pa, MAIR_IDX_NORMAL, attr, level);
    flush_all();
    if attr & attrs::EXEC != 0 {
        flush_icache();
    }
}

// ============================================================================
// Kernel init
// ============================================================================

/// Allocate the kernel root tables. Must run before the first palloc, which
/// maps through them.
pub fn init_tables() {
    KERNEL_LO.store(alloc_table() as usize, Ordering::Release);
    KERNEL_HI.store(alloc_table() as usize, Ordering::Release);
}

/// Build the full kernel map and switch the translation registers to it.
pub fn init() {
    let map = crate::hw::get();
    let lo = kernel_lo();
    let hi = kernel_hi();

    // Kernel image, stack and heap as 2MB blocks, both halves. The frame
    // allocator's window above it is mapped page-by-page as frames are
    // handed out.
    let mut addr = map.ram_start;
    while addr < map.user_ram_start() {
        map_2mb(lo, addr, addr, MAIR_IDX_NORMAL);
        map_2mb(hi, to_virt(addr), addr, MAIR_IDX_NORMAL);
        addr += GRANULE_2MB;
    }

    // UART and GIC as single device pages
    for base in [map.uart0_base, map.gicd_base, map.gicc_base] {
        if base != 0 {
            register_device_memory(base, base);
        }
    }
    if map.gicc_base != 0 {
        register_device_memory(map.gicc_base + PAGE_SIZE, map.gicc_base + PAGE_SIZE);
    }
    if map.xhci_base != 0 {
        register_device_memory(map.xhci_base, map.xhci_base);
    }

    // PCI ECAM window as device blocks
    if map.pci_base != 0 {
        let mut addr = map.pci_base;
        while addr < map.pci_base + map.pci_size {
            register_device_memory_2mb(addr, addr);
            addr += GRANULE_2MB;
        }
    }

    // DTB blob stays readable, read-only. Skipped when the loader dropped it
    // inside the already-mapped kernel window.
    if let Some((dtb_start, dtb_size)) = map.dtb
        && !(map.ram_start..map.user_ram_start()).contains(&dtb_start)
    {
        let mut addr = dtb_start & !(PAGE_SIZE - 1);
        while addr <= dtb_start + dtb_size {
            map_4kb(lo, addr, addr, MAIR_IDX_NORMAL, attrs::RO, MemLevel::Kernel);
            map_4kb(hi, to_virt(addr), addr, MAIR_IDX_NORMAL, attrs::RO, MemLevel::Kernel);
            addr += PAGE_SIZE;
        }
    }

    start(lo, hi);
    crate::kprintf!("Finished MMU init");
}

/// Point the translation registers at the kernel tables. The boot tables and
/// these agree on the identity window, so the switch is safe mid-flight.
fn start(lo: *mut PageTable, hi: *mut PageTable) {
    let mair: u64 = MAIR_DEVICE_NGNRNE << (MAIR_IDX_DEVICE * 8) | MAIR_NORMAL_NC << (MAIR_IDX_NORMAL * 8);
    // T0SZ/T1SZ = 16 (48-bit), 4KB granule both halves, inner shareable WB
    let tcr: u64 = 16
        | (16 << 16)
        | (0b00 << 14)
        | (0b10 << 30)
        | (0b101 << 32)
        | (0b11 << 12)
        | (0b11 << 28)
        | (0b01 << 10)
        | (0b01 << 8)
        | (0b01 << 26)
        | (0b01 << 24);
    unsafe {
        core::arch::asm!(
            "msr mair_el1, {mair}",
            "msr tcr_el1, {tcr}",
            "msr ttbr0_el1, {lo}",
            "msr ttbr1_el1, {hi}",
            "dsb ish",
            "tlbi vmalle1",
            "dsb ish",
            "isb",
            mair = in(reg) mair,
            tcr = in(reg) tcr,
            lo = in(reg) lo as u64,
            hi = in(reg) hi as u64,
        );
    }
}

// ============================================================================
// Per-process address spaces
// ============================================================================

/// A process-owned TTBR0 tree. The kernel's top-level slots are copied in so
/// exception entry keeps working while the process runs; user mappings live
/// under `USER_VA_BASE` in tables this struct owns. Dropping the struct
/// releases the whole tree.
pub struct UserAddressSpace {
    root: *mut PageTable,
    /// Intermediate tables owned by this tree, for cleanup
    tables: Vec<*mut PageTable>,
}

// One scheduler core; the tree is only touched with IRQs off.
unsafe impl Send for UserAddressSpace {}

impl UserAddressSpace {
    pub fn new() -> Self {
        let root = alloc_table();
        // SAFETY: both roots are live tables; copying top-level entries
        // shares the kernel's lower-level tables read-only
        unsafe {
            let kernel = kernel_lo();
            if !kernel.is_null() {
                (*root).entries = (*kernel).entries;
                // The user window slot must belong to this tree alone
                (*root).entries[(USER_VA_BASE >> 39) & 0x1FF] = 0;
            }
        }
        Self {
            root,
            tables: Vec::new(),
        }
    }

    pub fn ttbr0(&self) -> u64 {
        self.root as u64
    }

    fn own_descend(&mut self, entry: *mut u64) -> *mut PageTable {
        // SAFETY: entry points into a table this tree owns
        unsafe {
            let val = entry.read_volatile();
            if val & flags::VALID != 0 {
                (val & ADDR_MASK) as *mut PageTable
            } else {
                let next = alloc_table();
                self.tables.push(next);
                entry.write_volatile(next as u64 & ADDR_MASK | flags::VALID | flags::TABLE);
                next
            }
        }
    }

    /// Map a page into the user window. Fails outside `USER_VA_BASE..HIGH_VA`
    /// so user mappings can never alias into the shared kernel tables.
    pub fn map_page(&mut self, va: usize, pa: usize, attr: u8, level: MemLevel) -> Result<(), &'static str> {
        if va & (PAGE_SIZE - 1) != 0 || pa & (PAGE_SIZE - 1) != 0 {
            return Err("addresses must be page-aligned");
        }
        if !(USER_VA_BASE..HIGH_VA).contains(&va) {
            return Err("va outside the user window");
        }
        let (l0, l1, l2, l3) = indices(va);
        // SAFETY: all tables reached from the user slot are owned by this tree
        unsafe {
            let l1t = self.own_descend(&mut (*self.root).entries[l0]);
            let l2t = self.own_descend(&mut (*l1t).entries[l1]);
            let l3t = self.own_descend(&mut (*l2t).entries[l2]);
            let entry = (pa as u64 & ADDR_MASK)
                | flags::VALID
                | flags::TABLE
                | flags::AF
                | flags::SH_INNER
                | attr_index(MAIR_IDX_NORMAL)
                | permission_bits(level, attr);
            core::ptr::write_volatile(&mut (*l3t).entries[l3], entry);
        }
        flush_all();
        if attr & attrs::EXEC != 0 {
            flush_icache();
        }
        Ok(())
    }

    pub fn unmap_page(&mut self, va: usize) {
        if !(USER_VA_BASE..HIGH_VA).contains(&va) {
            return;
        }
        let (l0, l1, l2, l3) = indices(va);
        // SAFETY: read-only walk of owned tables, volatile leaf write
        unsafe {
            let t0 = (*self.root).entries[l0];
            if t0 & flags::VALID == 0 {
                return;
            }
            let l1t = (t0 & ADDR_MASK) as *mut PageTable;
            let t1 = (*l1t).entries[l1];
            if t1 & flags::VALID == 0 {
                return;
            }
            let l2t = (t1 & ADDR_MASK) as *mut PageTable;
            let t2 = (*l2t).entries[l2];
            if t2 & flags::VALID == 0 {
                return;
            }
            let l3t = (t2 & ADDR_MASK) as *mut PageTable;
            core::ptr::write_volatile(&mut (*l3t).entries[l3], 0);
        }
        flush_page(va);
    }
}

impl Drop for UserAddressSpace {
    fn drop(&mut self) {
        // SAFETY: every pointer was produced by Box::into_raw in this module
        unsafe {
            for table in self.tables.drain(..) {
                drop(Box::from_raw(table));
            }
            drop(Box::from_raw(self.root));
        }
        flush_all();
    }
}
