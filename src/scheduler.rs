//! Preemptive round-robin scheduler
//!
//! Selection walks the table from the slot after the current one and takes
//! the first READY process; a process's priority grants it that many extra
//! consecutive ticks before the walk advances. The register file was already
//! saved into the process record at trap entry, so switching is: pick next,
//! swap TTBR0 if it differs, restore the full register file, ERET.

use core::arch::global_asm;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use spinning_top::Spinlock;

use crate::config::{MAX_PROCS, TICK_MSEC};
use crate::process::{self, Process, ProcessState};
use crate::timer;

global_asm!(
    r#"
.section .text
.global restore_context

// restore_context(x0 = &Process) -> !
// Process layout: regs[31] at 0..248, sp at 248, pc at 256, spsr at 264
restore_context:
    // Abandoned trap frames are never popped; start the handler stack fresh
    // so the next trap gets the full window
    ldr x10, =0x41000000
    mov sp, x10

    ldr x9, [x0, #264]
    msr spsr_el1, x9
    ldr x9, [x0, #256]
    msr elr_el1, x9
    ldr x9, [x0, #248]
    msr sp_el0, x9

    ldp x2, x3, [x0, #16]
    ldp x4, x5, [x0, #32]
    ldp x6, x7, [x0, #48]
    ldp x8, x9, [x0, #64]
    ldp x10, x11, [x0, #80]
    ldp x12, x13, [x0, #96]
    ldp x14, x15, [x0, #112]
    ldp x16, x17, [x0, #128]
    ldp x18, x19, [x0, #144]
    ldp x20, x21, [x0, #160]
    ldp x22, x23, [x0, #176]
    ldp x24, x25, [x0, #192]
    ldp x26, x27, [x0, #208]
    ldp x28, x29, [x0, #224]
    ldr x30, [x0, #240]
    ldp x0, x1, [x0, #0]
    eret
"#
);

unsafe extern "C" {
    fn restore_context(proc: *const Process) -> !;
}

static SCHEDULER_STARTED: AtomicBool = AtomicBool::new(false);

/// Remaining bonus ticks granted by the current process's priority
static TURNS_LEFT: AtomicU8 = AtomicU8::new(0);

pub fn started() -> bool {
    SCHEDULER_STARTED.load(Ordering::Acquire)
}

/// Pick the next READY process and run it. Panics when nothing is runnable;
/// the kernel idle process exists precisely so this never fires in a healthy
/// system.
pub fn switch_proc() -> ! {
    crate::irq::disable_irqs();
    if process::process_count() == 0 {
        panic!("no processes active");
    }

    let table = process::table();
    let current = process::current_slot();

    // A higher-priority process keeps the CPU for extra ticks
    let turns = TURNS_LEFT.load(Ordering::Relaxed);
    if turns > 0 && table[current].state == ProcessState::Running {
        TURNS_LEFT.store(turns - 1, Ordering::Relaxed);
        timer::reset(TICK_MSEC);
        process_restore();
    }

    if table[current].state == ProcessState::Running {
        table[current].state = ProcessState::Ready;
    }

    let mut next = (current + 1) % MAX_PROCS;
    let mut scanned = 0;
    while table[next].state != ProcessState::Ready {
        next = (next + 1) % MAX_PROCS;
        scanned += 1;
        if scanned > MAX_PROCS {
            panic!("no processes active");
        }
    }

    table[next].state = ProcessState::Running;
    TURNS_LEFT.store(table[next].priority, Ordering::Relaxed);
    process::set_current_slot(next);
    timer::reset(TICK_MSEC);
    process_restore();
}

/// Restore the current process record and ERET into it, switching the
/// address space first when it differs.
pub fn process_restore() -> ! {
    let proc = process::current_process();

    let active: u64;
    // SAFETY: reading/writing TTBR0 at EL1; the new table maps the kernel
    unsafe {
        core::arch::asm!("mrs {}, ttbr0_el1", out(reg) active);
        if proc.ttbr0 != 0 && proc.ttbr0 != active {
            core::arch::asm!(
                "msr ttbr0_el1, {}",
                "tlbi vmalle1",
                "dsb ish",
                "isb",
                in(reg) proc.ttbr0
            );
        }
        restore_context(proc as *const Process)
    }
}

/// Store a syscall result where the restore path will hand it back in x0.
pub fn save_syscall_return(value: u64) {
    process::current_process().regs[0] = value;
}

// ============================================================================
// Sleep queue
// ============================================================================

#[derive(Clone, Copy)]
struct SleepEntry {
    pid: u16,
    wake_ms: u64,
}

static SLEEPING: Spinlock<([Option<SleepEntry>; MAX_PROCS], usize)> =
    Spinlock::new(([None; MAX_PROCS], 0));

/// Block the current process for `msec` milliseconds and yield. The virtual
/// timer compare is pulled forward when this deadline is the nearest one.
pub fn sleep_process(msec: u64) -> ! {
    crate::irq::disable_irqs();
    {
        let proc = process::current_process();
        proc.state = ProcessState::Blocked;
        let mut sleeping = SLEEPING.lock();
        let (entries, count) = &mut *sleeping;
        if *count < MAX_PROCS {
            entries[*count] = Some(SleepEntry {
                pid: proc.id,
                wake_ms: timer::now_msec() + msec,
            });
            *count += 1;
        }
    }
    let remaining = timer::virtual_timer_remaining_msec();
    if remaining == 0 || remaining > msec {
        timer::virtual_timer_reset(msec);
        timer::virtual_timer_enable();
    }
    switch_proc();
}

/// Virtual-timer IRQ: wake every elapsed sleeper, then re-arm for the next
/// deadline if any remain.
pub fn wake_processes() {
    let now = timer::now_msec();
    let mut next_wake = u64::MAX;

    let mut sleeping = SLEEPING.lock();
    let (entries, count) = &mut *sleeping;
    let mut kept = 0;
    for i in 0..*count {
        let Some(entry) = entries[i] else { continue };
        if entry.wake_ms <= now {
            if let Some(proc) = process::get_by_pid(entry.pid) {
                proc.state = ProcessState::Ready;
            }
        } else {
            next_wake = next_wake.min(entry.wake_ms);
            entries[kept] = Some(entry);
            kept += 1;
        }
    }
    for slot in entries.iter_mut().skip(kept).take(*count - kept) {
        *slot = None;
    }
    *count = kept;
    drop(sleeping);

    if next_wake != u64::MAX {
        timer::virtual_timer_reset(next_wake - now);
        timer::virtual_timer_enable();
    } else {
        timer::virtual_timer_disable();
    }
}

/// Hand the CPU over and start preempting. Never returns; the boot context
/// is abandoned once the first process runs.
pub fn start() -> ! {
    crate::console::print("Starting scheduler\n");
    crate::irq::disable_irqs();
    timer::init(TICK_MSEC);
    crate::gic::enable_irq(timer::IRQ_PHYS_TIMER);
    crate::irq::register_irq_handler(timer::IRQ_VIRT_TIMER, |_| wake_processes());
    SCHEDULER_STARTED.store(true, Ordering::Release);
    switch_proc();
}
