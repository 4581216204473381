//! Process table and lifecycle
//!
//! Fixed table of process slots. PIDs are 16-bit, monotonically assigned;
//! once every slot has been handed out, stopped slots are reclaimed (the
//! slot keeps the exit code until then). The first 31 fields of the record
//! are the saved register file; the context-switch assembly addresses them
//! by offset, so the layout at the top of `Process` is load-bearing.

#![allow(dead_code)]

use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use crate::config::{
    EVENT_BUFFER_CAPACITY, INPUT_BUFFER_CAPACITY, KPROC_STACK_SIZE, MAX_PROCS,
    MAX_PROC_NAME_LENGTH, PACKET_BUFFER_CAPACITY, PROC_OUT_BUF,
};
use crate::irq::with_irqs_disabled;
use crate::mmu::UserAddressSpace;
use crate::pmm::{self, MemLevel, attrs};
use crate::spsc::{KbdEvent, Keypress, SizedPtr, SpscRing};

/// SPSR for a kernel-mode process: EL1 with SP_EL0, IRQs unmasked
pub const SPSR_KERNEL: u64 = 0x4;
/// SPSR for a user process: EL0, IRQs unmasked
pub const SPSR_USER: u64 = 0x0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Stopped = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
}

/// One process slot. The context-switch assembly reads and writes
/// `regs`/`sp`/`pc`/`spsr` through raw offsets (0..272).
#[repr(C)]
pub struct Process {
    pub regs: [u64; 31], // x0-x30
    pub sp: u64,
    pub pc: u64,
    pub spsr: u64,

    // Not touched by the context assembly
    pub id: u16,
    pub state: ProcessState,
    pub priority: u8,
    pub win_id: u16,
    pub exit_code: u32,
    pub stack_base: usize,
    pub stack_size: usize,
    /// Physical base behind the stack; equals stack_base while the kernel
    /// identity map is the only mapping
    pub stack_phys: usize,
    /// EL0 stack range, populated by the loader for user processes
    pub user_stack_base: usize,
    pub user_stack_size: usize,
    /// Partial page backing this process's kalloc requests
    pub heap_page: usize,
    /// Whole-page stdout backing store, read through /proc/<pid>/out
    pub output: usize,
    pub output_size: usize,
    pub ttbr0: u64,
    pub address_space: Option<UserAddressSpace>,
    pub input_buffer: SpscRing<Keypress, INPUT_BUFFER_CAPACITY>,
    pub event_buffer: SpscRing<KbdEvent, EVENT_BUFFER_CAPACITY>,
    pub packet_buffer: SpscRing<SizedPtr, PACKET_BUFFER_CAPACITY>,
    pub name: [u8; MAX_PROC_NAME_LENGTH],
    pub name_len: usize,
    /// Debug-info spans handed over by the loader; format is external
    pub debug_lines: SizedPtr,
    pub debug_line_str: SizedPtr,
    pub focused: bool,
}

impl Process {
    pub const fn new() -> Self {
        Self {
            regs: [0; 31],
            sp: 0,
            pc: 0,
            spsr: 0,
            id: 0,
            state: ProcessState::Stopped,
            priority: 0,
            win_id: 0,
            exit_code: 0,
            stack_base: 0,
            stack_size: 0,
            stack_phys: 0,
            user_stack_base: 0,
            user_stack_size: 0,
            heap_page: 0,
            output: 0,
            output_size: 0,
            ttbr0: 0,
            address_space: None,
            input_buffer: SpscRing::new(),
            event_buffer: SpscRing::new(),
            packet_buffer: SpscRing::new(),
            name: [0; MAX_PROC_NAME_LENGTH],
            name_len: 0,
            debug_lines: SizedPtr { ptr: 0, size: 0 },
            debug_line_str: SizedPtr { ptr: 0, size: 0 },
            focused: false,
        }
    }

    pub fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("?")
    }

    pub fn set_name(&mut self, name: &str) {
        let n = name.len().min(MAX_PROC_NAME_LENGTH);
        self.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        self.name_len = n;
    }

    /// Running at a privileged level?
    pub fn is_privileged(&self) -> bool {
        self.spsr & 0xF != 0
    }
}

static mut PROCESSES: [Process; MAX_PROCS] = [const { Process::new() }; MAX_PROCS];

static CURRENT: AtomicUsize = AtomicUsize::new(0);
static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);
static NEXT_PID: AtomicU16 = AtomicU16::new(1);
static PROC_COUNT: AtomicU16 = AtomicU16::new(0);

/// Kernel partial page for small long-lived allocations tied to processes
static PROC_PAGE: AtomicUsize = AtomicUsize::new(0);

/// The whole table. Only touch with IRQs disabled.
pub fn table() -> &'static mut [Process; MAX_PROCS] {
    // SAFETY: single core, all callers run with IRQs masked per module
    // contract
    unsafe { &mut *addr_of_mut!(PROCESSES) }
}

pub fn current_slot() -> usize {
    CURRENT.load(Ordering::Relaxed)
}

pub fn set_current_slot(slot: usize) {
    CURRENT.store(slot, Ordering::Relaxed);
}

pub fn current_process() -> &'static mut Process {
    &mut table()[current_slot()]
}

pub fn current_pid() -> u16 {
    table()[current_slot()].id
}

pub fn process_count() -> u16 {
    PROC_COUNT.load(Ordering::Relaxed)
}

pub fn get_by_pid(pid: u16) -> Option<&'static mut Process> {
    table().iter_mut().find(|p| p.id == pid)
}

/// Kernel scratch page shared by process bookkeeping
pub fn proc_page() -> usize {
    PROC_PAGE.load(Ordering::Relaxed)
}

fn next_pid() -> u16 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Return a slot to its pristine state, releasing everything it owned.
fn reset_process(proc: &mut Process) {
    if proc.stack_base != 0 {
        pmm::pfree(proc.stack_base, proc.stack_size as u64);
    }
    if proc.user_stack_base != 0 {
        pmm::pfree(proc.user_stack_base, proc.user_stack_size as u64);
    }
    if proc.output != 0 {
        pmm::pfree(proc.output, proc.output_size as u64);
    }
    if proc.heap_page != 0 {
        pmm::pfree(proc.heap_page, pmm::PAGE_SIZE as u64);
    }
    proc.stack_base = 0;
    proc.stack_size = 0;
    proc.stack_phys = 0;
    proc.user_stack_base = 0;
    proc.user_stack_size = 0;
    proc.output = 0;
    proc.output_size = 0;
    proc.heap_page = 0;
    proc.sp = 0;
    proc.pc = 0;
    proc.spsr = 0;
    proc.exit_code = 0;
    proc.priority = 0;
    proc.win_id = 0;
    proc.focused = false;
    proc.regs = [0; 31];
    proc.name = [0; MAX_PROC_NAME_LENGTH];
    proc.name_len = 0;
    proc.input_buffer.clear_with(|_| {});
    proc.event_buffer.clear_with(|_| {});
    proc.packet_buffer
        .clear_with(|p| pmm::free_sized(p.ptr, p.size));
    proc.debug_lines = SizedPtr { ptr: 0, size: 0 };
    proc.debug_line_str = SizedPtr { ptr: 0, size: 0 };
    // Dropping the tree releases every table frame it owned
    proc.address_space = None;
    proc.ttbr0 = 0;
}

/// Slot 0 adopts the boot context: BLOCKED so the scheduler never resumes
/// it, but its heap and output pages serve early kernel allocations.
pub fn init_main_process() {
    with_irqs_disabled(|| {
        PROC_PAGE.store(
            pmm::palloc(0x1000, MemLevel::Kernel, attrs::RW, false),
            Ordering::Relaxed,
        );
        NEXT_SLOT.store(1, Ordering::Relaxed);
        let proc = &mut table()[0];
        proc.id = next_pid();
        proc.state = ProcessState::Blocked;
        proc.heap_page = pmm::palloc(0x1000, MemLevel::Kernel, attrs::RW, false);
        proc.output = pmm::palloc(PROC_OUT_BUF as u64, MemLevel::Kernel, attrs::RW, true);
        proc.output_size = PROC_OUT_BUF;
        proc.ttbr0 = crate::mmu::kernel_ttbr0();
        proc.set_name("kernel");
        CURRENT.store(0, Ordering::Relaxed);
        PROC_COUNT.fetch_add(1, Ordering::Relaxed);
    });
}

/// Claim a fresh slot (or reclaim a stopped one) as READY with a new PID.
pub fn init_process() -> Option<&'static mut Process> {
    with_irqs_disabled(|| {
        let slot = NEXT_SLOT.load(Ordering::Relaxed);
        let slot = if slot < MAX_PROCS {
            NEXT_SLOT.store(slot + 1, Ordering::Relaxed);
            slot
        } else {
            table()
                .iter()
                .position(|p| p.state == ProcessState::Stopped)?
        };
        let proc = &mut table()[slot];
        reset_process(proc);
        proc.id = next_pid();
        proc.state = ProcessState::Ready;
        PROC_COUNT.fetch_add(1, Ordering::Relaxed);
        Some(proc)
    })
}

/// Build a READY kernel-mode process around an entry function.
pub fn spawn_kernel_process(name: &str, entry: extern "C" fn() -> !) -> Option<u16> {
    let proc = init_process()?;
    proc.stack_size = KPROC_STACK_SIZE;
    proc.stack_base = pmm::palloc_zeroed(KPROC_STACK_SIZE as u64, MemLevel::Kernel, attrs::RW);
    proc.stack_phys = proc.stack_base;
    if proc.stack_base == 0 {
        proc.state = ProcessState::Stopped;
        PROC_COUNT.fetch_sub(1, Ordering::Relaxed);
        return None;
    }
    proc.heap_page = pmm::palloc(0x1000, MemLevel::Kernel, attrs::RW, false);
    proc.output = pmm::palloc(PROC_OUT_BUF as u64, MemLevel::Kernel, attrs::RW, true);
    proc.output_size = PROC_OUT_BUF;
    proc.sp = (proc.stack_base + proc.stack_size) as u64 & !0xF;
    proc.pc = entry as usize as u64;
    proc.spsr = SPSR_KERNEL;
    proc.ttbr0 = crate::mmu::kernel_ttbr0();
    proc.set_name(name);
    Some(proc.id)
}

/// Stop a process and release what it held. Stopping the current process
/// never returns; stopping another one does.
pub fn stop_process(pid: u16, exit_code: u32) {
    crate::irq::disable_irqs();
    let was_current = {
        let Some(proc) = get_by_pid(pid) else {
            return;
        };
        if proc.state == ProcessState::Stopped {
            return;
        }
        proc.state = ProcessState::Stopped;
        proc.exit_code = exit_code;
        crate::files::close_files_for_process(pid);
        let was_current = current_pid() == pid;
        reset_process(proc);
        // Slot keeps the id and exit code for a later wait/read
        proc.exit_code = exit_code;
        PROC_COUNT.fetch_sub(1, Ordering::Relaxed);
        was_current
    };
    if was_current {
        crate::scheduler::switch_proc();
    }
}

pub fn stop_current_process(exit_code: u32) -> ! {
    stop_process(current_pid(), exit_code);
    unreachable!("stopping the current process never returns");
}

// ============================================================================
// IRQ-producer entry points
// ============================================================================

/// Queue a decoded keypress for a process. Called by the input driver from
/// IRQ context; a full ring drops the key.
pub fn push_key(pid: u16, key: Keypress) -> bool {
    match get_by_pid(pid) {
        Some(proc) if proc.state != ProcessState::Stopped => proc.input_buffer.push(key),
        _ => false,
    }
}

/// Queue a raw keyboard event for a process.
pub fn push_event(pid: u16, event: KbdEvent) -> bool {
    match get_by_pid(pid) {
        Some(proc) if proc.state != ProcessState::Stopped => proc.event_buffer.push(event),
        _ => false,
    }
}

/// Hand a received packet buffer to a process. Ownership of the buffer moves
/// with it; a full ring means the caller keeps (and frees) the buffer.
pub fn push_packet(pid: u16, packet: SizedPtr) -> bool {
    match get_by_pid(pid) {
        Some(proc) if proc.state != ProcessState::Stopped => proc.packet_buffer.push(packet),
        _ => false,
    }
}

// ============================================================================
// Output ring
// ============================================================================

/// Append to a process's stdout backing store, wrapping at capacity the way
/// the /proc read side expects.
pub fn write_output(proc: &mut Process, cursor: &mut u64, buf: &[u8]) -> usize {
    if proc.output == 0 || buf.len() >= proc.output_size {
        return 0;
    }
    if *cursor as usize + buf.len() >= proc.output_size {
        *cursor = 0;
        // SAFETY: output is a live whole-page allocation of output_size bytes
        unsafe { core::ptr::write_bytes(proc.output as *mut u8, 0, proc.output_size) };
    }
    // SAFETY: bounded by the wrap above
    unsafe {
        core::ptr::copy_nonoverlapping(
            buf.as_ptr(),
            (proc.output + *cursor as usize) as *mut u8,
            buf.len(),
        );
    }
    *cursor += buf.len() as u64;
    buf.len()
}

/// Copy out of a process's stdout backing store.
pub fn read_output(proc: &Process, cursor: u64, buf: &mut [u8]) -> usize {
    if proc.output == 0 || cursor as usize >= proc.output_size {
        return 0;
    }
    let n = buf.len().min(proc.output_size - cursor as usize);
    // SAFETY: bounded by output_size
    unsafe {
        core::ptr::copy_nonoverlapping(
            (proc.output + cursor as usize) as *const u8,
            buf.as_mut_ptr(),
            n,
        );
    }
    n
}
