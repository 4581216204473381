//! Kernel configuration constants
//!
//! This module contains tunable parameters for the kernel.
//! Modify these values to adjust kernel behavior.

#![allow(dead_code)]

/// Boot/kernel stack size (1MB)
///
/// Used by the boot thread and exception handlers.
/// Placed at a fixed offset from the load address in boot.rs.
pub const KERNEL_STACK_SIZE: usize = 1024 * 1024;

/// Kernel heap base
///
/// Link-time constant because the heap must exist before hardware detection
/// can publish the RAM map. Sits 16MB past the load address, right above the
/// boot stack.
pub const KERNEL_HEAP_BASE: usize = if cfg!(feature = "raspi") {
    0x1100_0000
} else {
    0x4100_0000
};

/// Kernel heap size (16MB)
///
/// Backs the global allocator. Sits between the kernel image and the
/// frame-allocator window.
pub const KERNEL_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Stack size for kernel-mode processes (64KB)
pub const KPROC_STACK_SIZE: usize = 64 * 1024;

/// Stack size for user processes (64KB)
///
/// WARNING: May overflow with deep recursion in user code.
pub const USER_STACK_SIZE: usize = 64 * 1024;

/// Maximum process slots
///
/// Slot 0 is reserved for the boot process. PIDs are 16-bit and keep
/// incrementing past this; stopped slots are reused.
pub const MAX_PROCS: usize = 64;

/// Preemption tick in milliseconds (physical timer)
pub const TICK_MSEC: u64 = 10;

/// Capacity of the per-process keypress ring
pub const INPUT_BUFFER_CAPACITY: usize = 64;

/// Capacity of the per-process keyboard event ring
pub const EVENT_BUFFER_CAPACITY: usize = 64;

/// Capacity of the per-process packet ring
pub const PACKET_BUFFER_CAPACITY: usize = 128;

/// Per-process output ring size in bytes
pub const PROC_OUT_BUF: usize = 0x1000;

/// Console scrollback ring size in bytes
pub const CONSOLE_BUF_SIZE: usize = 0x3000;

/// Maximum length of a process name
pub const MAX_PROC_NAME_LENGTH: usize = 64;

/// Enable extra logging from the page allocator and MMU
pub const MM_DEBUG: bool = false;
