// IRQ masking and handler dispatch

#![allow(dead_code)]

use alloc::vec::Vec;
use spinning_top::Spinlock;

// ============================================================================
// IRQ Guard - RAII guard for disabling interrupts
// ============================================================================

/// RAII guard that disables IRQs when created and restores them when dropped.
/// This ensures IRQs are properly restored even if the guarded code panics.
pub struct IrqGuard {
    saved_daif: u64,
}

impl IrqGuard {
    /// Create a new IRQ guard, disabling IRQs.
    /// The previous IRQ state will be restored when this guard is dropped.
    #[inline]
    pub fn new() -> Self {
        let daif: u64;
        // SAFETY: Reading and modifying DAIF only affects interrupt masking
        // for the current CPU
        unsafe {
            core::arch::asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack));
            core::arch::asm!("msr daifset, #2", options(nomem, nostack));
            core::arch::asm!("isb", options(nomem, nostack));
        }
        Self { saved_daif: daif }
    }
}

impl Drop for IrqGuard {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: Restoring DAIF to its previous state is safe
        unsafe {
            core::arch::asm!("msr daif, {}", in(reg) self.saved_daif, options(nomem, nostack));
        }
    }
}

/// Run a closure with IRQs disabled.
#[inline]
pub fn with_irqs_disabled<T, F: FnOnce() -> T>(f: F) -> T {
    let _guard = IrqGuard::new();
    f()
}

/// Disable IRQs. Caller is responsible for re-enabling with enable_irqs().
/// Use with_irqs_disabled() when possible for automatic cleanup.
#[inline]
pub fn disable_irqs() {
    unsafe {
        core::arch::asm!("msr daifset, #2", options(nomem, nostack));
        core::arch::asm!("isb", options(nomem, nostack));
    }
}

/// Enable IRQs. Only call after disable_irqs().
#[inline]
pub fn enable_irqs() {
    unsafe {
        core::arch::asm!("msr daifclr, #2", options(nomem, nostack));
    }
}

// ============================================================================
// IRQ Handler Registration
// ============================================================================

type IrqHandler = fn(u32);

struct IrqHandlers {
    handlers: Vec<Option<IrqHandler>>,
}

static IRQ_HANDLERS: Spinlock<IrqHandlers> = Spinlock::new(IrqHandlers {
    handlers: Vec::new(),
});

/// Register a handler for an IRQ number and unmask it at the GIC.
pub fn register_irq_handler(irq: u32, handler: IrqHandler) {
    with_irqs_disabled(|| {
        let mut table = IRQ_HANDLERS.lock();
        let idx = irq as usize;
        if table.handlers.len() <= idx {
            table.handlers.resize(idx + 1, None);
        }
        table.handlers[idx] = Some(handler);
    });
    crate::gic::enable_irq(irq);
}

/// Dispatch an acknowledged IRQ to its registered handler.
/// Unhandled IRQs are logged once per occurrence and otherwise ignored.
pub fn dispatch_irq(irq: u32) {
    let handler = {
        let table = IRQ_HANDLERS.lock();
        table.handlers.get(irq as usize).copied().flatten()
    };
    match handler {
        Some(h) => h(irq),
        None => crate::safe_print!(48, "[irq] unhandled irq {}\n", irq),
    }
}
