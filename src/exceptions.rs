//! Exception vectors and the synchronous trap path
//!
//! Sixteen vector slots, four per source. Traps from processes (EL0, or
//! kernel-mode processes on EL1/SP0) save the full register file onto the
//! handler stack, copy it into the current process record and dispatch:
//! SVCs go to the syscall table, faults stop the offending process. Faults
//! taken while on the handler stack (EL1/SPx) are kernel bugs and panic.

use core::arch::global_asm;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::process::{self, ProcessState};
use crate::scheduler;

global_asm!(
    r#"
.section .text.exceptions
.balign 0x800

.global exception_vector_table
exception_vector_table:
    // Current EL with SP0 (kernel-mode processes)
    .balign 0x80
    b trap_sync
    .balign 0x80
    b trap_irq
    .balign 0x80
    b trap_unhandled
    .balign 0x80
    b trap_unhandled

    // Current EL with SPx (handler / boot context)
    .balign 0x80
    b trap_sync_el1h
    .balign 0x80
    b trap_irq
    .balign 0x80
    b trap_unhandled
    .balign 0x80
    b trap_unhandled

    // Lower EL, AArch64 (user processes)
    .balign 0x80
    b trap_sync
    .balign 0x80
    b trap_irq
    .balign 0x80
    b trap_unhandled
    .balign 0x80
    b trap_unhandled

    // Lower EL, AArch32 (unsupported)
    .balign 0x80
    b trap_unhandled
    .balign 0x80
    b trap_unhandled
    .balign 0x80
    b trap_unhandled
    .balign 0x80
    b trap_unhandled

// Save the full register file into a 272-byte stack frame:
// x0-x30 at 0..248, SP_EL0 at 248, ELR at 256, SPSR at 264
.macro save_frame
    sub sp, sp, #272
    stp x0, x1, [sp, #0]
    stp x2, x3, [sp, #16]
    stp x4, x5, [sp, #32]
    stp x6, x7, [sp, #48]
    stp x8, x9, [sp, #64]
    stp x10, x11, [sp, #80]
    stp x12, x13, [sp, #96]
    stp x14, x15, [sp, #112]
    stp x16, x17, [sp, #128]
    stp x18, x19, [sp, #144]
    stp x20, x21, [sp, #160]
    stp x22, x23, [sp, #176]
    stp x24, x25, [sp, #192]
    stp x26, x27, [sp, #208]
    stp x28, x29, [sp, #224]
    str x30, [sp, #240]
    mrs x9, sp_el0
    str x9, [sp, #248]
    mrs x9, elr_el1
    str x9, [sp, #256]
    mrs x9, spsr_el1
    str x9, [sp, #264]
.endm

.macro load_frame
    ldr x9, [sp, #264]
    msr spsr_el1, x9
    ldr x9, [sp, #256]
    msr elr_el1, x9
    ldr x9, [sp, #248]
    msr sp_el0, x9
    ldp x2, x3, [sp, #16]
    ldp x4, x5, [sp, #32]
    ldp x6, x7, [sp, #48]
    ldp x8, x9, [sp, #64]
    ldp x10, x11, [sp, #80]
    ldp x12, x13, [sp, #96]
    ldp x14, x15, [sp, #112]
    ldp x16, x17, [sp, #128]
    ldp x18, x19, [sp, #144]
    ldp x20, x21, [sp, #160]
    ldp x22, x23, [sp, #176]
    ldp x24, x25, [sp, #192]
    ldp x26, x27, [sp, #208]
    ldp x28, x29, [sp, #224]
    ldr x30, [sp, #240]
    ldp x0, x1, [sp, #0]
    add sp, sp, #272
.endm

// Synchronous trap from a process. The Rust side never returns: it either
// restores the current record or the one it switched to.
trap_sync:
    save_frame
    mov x0, sp
    bl rust_sync_handler
1:  wfi
    b 1b

// IRQ. The Rust side returns for plain device interrupts and diverges when
// the tick forces a context switch.
trap_irq:
    save_frame
    mov x0, sp
    bl rust_irq_handler
    load_frame
    eret

// Synchronous exception while on the handler stack: kernel bug.
trap_sync_el1h:
    bl rust_sync_el1h_handler
1:  wfi
    b 1b

trap_unhandled:
    bl rust_unhandled_vector
1:  wfi
    b 1b
"#
);

/// Register file as saved by `save_frame`
#[repr(C)]
pub struct TrapFrame {
    pub x: [u64; 31],
    pub sp_el0: u64,
    pub elr: u64,
    pub spsr: u64,
}

unsafe extern "C" {
    static exception_vector_table: u8;
}

/// Install the vector table and unmask IRQs.
pub fn init() {
    // SAFETY: writing VBAR_EL1 with the address of our vector table
    unsafe {
        let vbar = &exception_vector_table as *const _ as u64;
        core::arch::asm!("msr vbar_el1, {}", "isb", in(reg) vbar);
        core::arch::asm!("msr daifclr, #2");
    }
}

/// ESR_EL1 exception class values
mod esr {
    /// SVC instruction from AArch64
    pub const EC_SVC64: u64 = 0b010101;
    /// Instruction abort from a lower EL
    pub const EC_INST_ABORT_LOWER: u64 = 0b100000;
    /// Data abort from a lower EL
    pub const EC_DATA_ABORT_LOWER: u64 = 0b100100;
}

#[inline]
fn read_esr() -> u64 {
    let v: u64;
    unsafe { core::arch::asm!("mrs {}, esr_el1", out(reg) v) };
    v
}

#[inline]
fn read_far() -> u64 {
    let v: u64;
    unsafe { core::arch::asm!("mrs {}, far_el1", out(reg) v) };
    v
}

/// Nested trap entries. Blocking syscalls re-enter the scheduler below the
/// dispatcher, so the dispatcher checks this before touching "current"
/// state it captured earlier.
static SYSCALL_DEPTH: AtomicI32 = AtomicI32::new(0);

pub fn syscall_depth() -> i32 {
    SYSCALL_DEPTH.load(Ordering::Relaxed)
}

pub fn syscall_depth_dec() {
    SYSCALL_DEPTH.fetch_sub(1, Ordering::Relaxed);
}

fn save_frame_to_current(frame: &TrapFrame) {
    let proc = process::current_process();
    proc.regs.copy_from_slice(&frame.x);
    proc.sp = frame.sp_el0;
    proc.pc = frame.elr;
    proc.spsr = frame.spsr;
}

/// Synchronous trap from a process context. Never returns.
#[unsafe(no_mangle)]
extern "C" fn rust_sync_handler(frame: *mut TrapFrame) -> ! {
    // SAFETY: the assembly hands us the frame it just wrote on this stack
    let frame = unsafe { &*frame };
    save_frame_to_current(frame);

    let esr = read_esr();
    let ec = (esr >> 26) & 0x3F;
    let iss = esr & 0x1FF_FFFF;

    if ec == esr::EC_SVC64 {
        SYSCALL_DEPTH.fetch_add(1, Ordering::Relaxed);
        let proc = process::current_process();
        let result = match crate::syscall::dispatch(iss as u16, proc) {
            Some(v) => v,
            None => panic!("unknown syscall {}", iss),
        };
        SYSCALL_DEPTH.fetch_sub(1, Ordering::Relaxed);
        scheduler::save_syscall_return(result);
        scheduler::process_restore();
    }

    // Fault path
    let far = read_far();
    let elr = frame.elr;
    let from_el0 = frame.spsr & 0xF == 0;

    if !from_el0 {
        panic!(
            "kernel fault: ESR={:#x} ELR={:#x} FAR={:#x} [{}]",
            esr,
            elr,
            far,
            decode_instruction(read_insn(elr))
        );
    }

    crate::kprintf!(
        "Process {} crashed. ESR: {:#x} ELR: {:#x} FAR: {:#x}",
        process::current_pid(),
        esr,
        elr,
        far
    );
    if far == 0 && matches!(ec, esr::EC_INST_ABORT_LOWER | esr::EC_DATA_ABORT_LOWER) {
        crate::kprintf!("Null pointer accessed at {:#x}", elr);
    } else {
        crate::kprintf!("Faulting instruction: {}", decode_instruction(read_insn(elr)));
    }
    process::stop_current_process(ec as u32)
}

/// IRQ from any context. Returns for device interrupts; diverges when the
/// preemption tick switches processes.
#[unsafe(no_mangle)]
extern "C" fn rust_irq_handler(frame: *mut TrapFrame) {
    let Some(irq) = crate::gic::acknowledge_irq() else {
        return;
    };

    if irq == crate::timer::IRQ_PHYS_TIMER {
        crate::gic::end_of_interrupt(irq);
        if scheduler::started() {
            // SAFETY: frame points at the stack frame written on entry
            let frame = unsafe { &*frame };
            // Only preempt a process context; ticks that land while the
            // boot/handler stack is live just re-arm
            if frame.spsr & 0xF == 0 || frame.spsr & 0xF == 0x4 {
                save_frame_to_current(frame);
                let proc = process::current_process();
                if proc.state == ProcessState::Running || proc.state == ProcessState::Ready {
                    scheduler::switch_proc();
                }
            }
        }
        crate::timer::reset(crate::config::TICK_MSEC);
        return;
    }

    crate::irq::dispatch_irq(irq);
    crate::gic::end_of_interrupt(irq);
}

/// Fault while already on the handler stack: unrecoverable.
#[unsafe(no_mangle)]
extern "C" fn rust_sync_el1h_handler() -> ! {
    let esr = read_esr();
    let elr: u64;
    unsafe { core::arch::asm!("mrs {}, elr_el1", out(reg) elr) };
    panic!(
        "sync exception at EL1h: ESR={:#x} ELR={:#x} FAR={:#x}",
        esr,
        elr,
        read_far()
    );
}

#[unsafe(no_mangle)]
extern "C" fn rust_unhandled_vector() -> ! {
    panic!("unhandled exception vector, ESR={:#x}", read_esr());
}

// ============================================================================
// Crash diagnostics
// ============================================================================

fn read_insn(addr: u64) -> u32 {
    if addr == 0 || addr % 4 != 0 {
        return 0;
    }
    // SAFETY: best effort; ELR pointed here when the fault was taken. An
    // unmapped ELR would re-fault into the EL1h panic path, which is where
    // we are headed anyway.
    unsafe { (addr as *const u32).read_volatile() }
}

/// Rough A64 mnemonic classifier for fault logs.
fn decode_instruction(insn: u32) -> &'static str {
    const OPS: &[(u32, u32, &str)] = &[
        (0xFFE0_001F, 0xD400_0001, "svc"),
        (0xFFC0_0000, 0xA940_0000, "ldp"),
        (0xFFC0_0000, 0xA900_0000, "stp"),
        (0xFFC0_0000, 0xA980_0000, "stp (pre)"),
        (0xFFC0_0000, 0x5280_0000, "mov (imm)"),
        (0xFFC0_0000, 0xD280_0000, "movz"),
        (0x9F00_0000, 0x9000_0000, "adrp"),
        (0x7F00_0000, 0x1100_0000, "add"),
        (0xFFF0_0000, 0xF940_0000, "ldr"),
        (0xFFF0_0000, 0xF900_0000, "str"),
        (0xFFC0_0000, 0xB940_0000, "ldr (32)"),
        (0xFFC0_0000, 0xB900_0000, "str (32)"),
        (0xFC00_0000, 0x9400_0000, "bl"),
        (0xFC00_0000, 0x1400_0000, "b"),
        (0xFF00_0010, 0x5400_0000, "b.cond"),
        (0xFFFF_FC1F, 0xEB00_001F, "cmp"),
        (0xFFE0_0000, 0xAA00_0000, "mov (reg)"),
    ];
    for &(mask, pattern, mnemonic) in OPS {
        if insn & mask == pattern {
            return mnemonic;
        }
    }
    "unknown"
}

// ============================================================================
// Panic path
// ============================================================================

/// Final stop: preemption off, registers dumped, WFI forever. Reentrant so
/// a fault inside the dump cannot recurse into a second full dump.
pub fn panic_halt(msg: &str) -> ! {
    use core::sync::atomic::AtomicBool;
    static PANICKED: AtomicBool = AtomicBool::new(false);

    crate::irq::disable_irqs();
    crate::timer::permanent_disable();

    let first = !PANICKED.swap(true, Ordering::SeqCst);
    crate::console::raw_print("*** KERNEL PANIC ***\n");
    crate::console::raw_print(msg);
    crate::console::raw_print("\n");
    if first {
        let elr: u64;
        unsafe { core::arch::asm!("mrs {}, elr_el1", out(reg) elr) };
        crate::safe_print!(
            96,
            "ESR: {:#x} ELR: {:#x} FAR: {:#x}\n",
            read_esr(),
            elr,
            read_far()
        );
        // Tell a mounted display to show the panic color. Skipped when the
        // registry lock is held by whatever just blew up.
        if let Some((module, consumed)) = crate::modules::try_get_module("/dev/graph/panic") {
            module.swrite(&"/dev/graph/panic"[consumed..], b"1");
        }
    }
    crate::console::raw_print("System halted\n");
    loop {
        unsafe { core::arch::asm!("wfi") };
    }
}
