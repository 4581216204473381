//! Kernel console
//!
//! Line output goes to the PL011 UART and into a bounded scrollback ring.
//! The ring is exposed to the rest of the system as the `/dev/console`
//! module, so the boot log can be read back like a file.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spinning_top::Spinlock;

use crate::config::CONSOLE_BUF_SIZE;
use crate::files::FileDescriptor;
use crate::modules::{FsResult, Module, version_num};

// PL011 register offsets
const UART_DR: usize = 0x00;
const UART_FR: usize = 0x18;
const UART_IBRD: usize = 0x24;
const UART_FBRD: usize = 0x28;
const UART_LCRH: usize = 0x2C;
const UART_CR: usize = 0x30;

const FR_RXFE: u32 = 1 << 4; // Receive FIFO empty
const FR_TXFF: u32 = 1 << 5; // Transmit FIFO full

const LCRH_FIFO: u32 = 1 << 4;
const LCRH_WLEN_8B: u32 = 0b11 << 5;

const CR_EN: u32 = 1 << 0;
const CR_TXE: u32 = 1 << 8;
const CR_RXE: u32 = 1 << 9;

const UART_BAUD: u32 = 115_200;

/// UART base, replaced once hardware detection has run. The default is the
/// QEMU virt machine PL011 so prints work from the first instruction of
/// rust_start.
static UART_BASE: AtomicUsize = AtomicUsize::new(0x0900_0000);

pub fn set_uart_base(base: usize) {
    UART_BASE.store(base, Ordering::Release);
}

#[inline]
fn reg(offset: usize) -> *mut u32 {
    (UART_BASE.load(Ordering::Acquire) + offset) as *mut u32
}

unsafe fn putchar(c: u8) {
    // SAFETY: UART MMIO registers are mapped device memory
    unsafe {
        while reg(UART_FR).read_volatile() & FR_TXFF != 0 {
            core::hint::spin_loop();
        }
        (reg(UART_DR) as *mut u8).write_volatile(c);
    }
}

/// Program the PL011 and enable it: disable while reconfiguring, set the
/// baud divisors, 8-bit words with FIFOs, then enable TX and RX.
///
/// The divisor defaults fit the 48MHz reference clock; boards whose
/// firmware owns the UART clock (Pi 4 and up) are asked for the real rate
/// through the mailbox and the divisors recomputed. QEMU's PL011 comes up
/// preconfigured, so early boot prints work before this runs.
pub fn enable() {
    let map = crate::hw::get();
    set_uart_base(map.uart0_base);
    crate::mmu::register_device_memory(map.uart0_base, map.uart0_base);

    // SAFETY: PL011 MMIO registers on the detected board
    unsafe { reg(UART_CR).write_volatile(0) };

    let mut ibrd: u32 = 1;
    let mut fbrd: u32 = 40;

    if matches!(map.board, crate::hw::Board::Raspi4 | crate::hw::Board::Raspi5)
        && let Some(clk) = crate::mailbox::get_clock_rate(crate::mailbox::CLOCK_UART)
    {
        ibrd = clk / (16 * UART_BAUD);
        let rem = clk % (16 * UART_BAUD);
        fbrd = (rem * 64 + UART_BAUD / 2) / UART_BAUD;
    }

    // SAFETY: PL011 MMIO registers on the detected board
    unsafe {
        reg(UART_IBRD).write_volatile(ibrd);
        reg(UART_FBRD).write_volatile(fbrd);
        reg(UART_LCRH).write_volatile(LCRH_FIFO | LCRH_WLEN_8B);
        reg(UART_CR).write_volatile(CR_EN | CR_TXE | CR_RXE);
    }
}

/// Blocking raw write, bypassing the scrollback ring. Used by the panic path.
pub fn raw_print(s: &str) {
    for c in s.bytes() {
        if c == b'\n' {
            unsafe { putchar(b'\r') };
        }
        unsafe { putchar(c) };
    }
}

pub fn has_char() -> bool {
    unsafe { reg(UART_FR).read_volatile() & FR_RXFE == 0 }
}

/// Blocking read of one byte from the UART.
pub fn getchar() -> u8 {
    unsafe {
        while !has_char() {
            core::hint::spin_loop();
        }
        (reg(UART_DR) as *const u8).read_volatile()
    }
}

// ============================================================================
// Scrollback ring
// ============================================================================

struct ConsoleRing {
    buf: [u8; CONSOLE_BUF_SIZE],
    head: usize,
    len: usize,
}

impl ConsoleRing {
    const fn new() -> Self {
        Self {
            buf: [0; CONSOLE_BUF_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, c: u8) {
        self.buf[self.head] = c;
        self.head = (self.head + 1) % CONSOLE_BUF_SIZE;
        if self.len < CONSOLE_BUF_SIZE {
            self.len += 1;
        }
    }

    /// Copy out bytes starting `offset` from the oldest retained byte.
    fn read_at(&self, offset: usize, out: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let avail = self.len - offset;
        let n = out.len().min(avail);
        let start = (self.head + CONSOLE_BUF_SIZE - self.len + offset) % CONSOLE_BUF_SIZE;
        for (i, slot) in out.iter_mut().enumerate().take(n) {
            *slot = self.buf[(start + i) % CONSOLE_BUF_SIZE];
        }
        n
    }
}

static RING: Spinlock<ConsoleRing> = Spinlock::new(ConsoleRing::new());

/// Bytes dropped because a writer could not take the ring lock (IRQ paths).
static DROP_COUNT: AtomicU64 = AtomicU64::new(0);

/// Print a string to the UART and the scrollback ring.
pub fn print(s: &str) {
    raw_print(s);
    match RING.try_lock() {
        Some(mut ring) => {
            for c in s.bytes() {
                ring.push(c);
            }
        }
        None => {
            DROP_COUNT.fetch_add(s.len() as u64, Ordering::Relaxed);
        }
    }
}

pub fn dropped_bytes() -> u64 {
    DROP_COUNT.load(Ordering::Relaxed)
}

// ============================================================================
// Print macros
// ============================================================================

/// Print a line through the kernel heap formatter.
#[macro_export]
macro_rules! kprintf {
    ($($arg:tt)*) => {{
        $crate::console::print(&alloc::format!($($arg)*));
        $crate::console::print("\n");
    }};
}

/// Print a line without touching the heap. The first argument is the stack
/// buffer size; keep it small. Output is silently truncated at that size.
#[macro_export]
macro_rules! safe_print {
    ($cap:expr, $($arg:tt)*) => {{
        let mut buf = [0u8; $cap];
        if let Ok(s) = format_no_std::show(&mut buf, core::format_args!($($arg)*)) {
            $crate::console::raw_print(s);
        }
    }};
}

// ============================================================================
// /dev/console module
// ============================================================================

/// Exposes the scrollback ring under `/dev/console`. Reads walk the retained
/// log from the descriptor cursor; writes append to the log.
pub struct ConsoleModule;

impl Module for ConsoleModule {
    fn name(&self) -> &'static str {
        "console"
    }

    fn mount(&self) -> &'static str {
        "/dev/console"
    }

    fn version(&self) -> u64 {
        version_num(0, 1, 0, 1)
    }

    fn init(&self) -> bool {
        enable();
        print("UART initialized\n");
        true
    }

    fn open(&self, _path: &str, fd: &mut FileDescriptor) -> FsResult {
        fd.id = crate::files::reserve_fd_id();
        fd.size = CONSOLE_BUF_SIZE as u64;
        FsResult::Success
    }

    fn read(&self, fd: &mut FileDescriptor, buf: &mut [u8], offset: u64) -> usize {
        let base = if offset != 0 { offset } else { fd.cursor };
        RING.lock().read_at(base as usize, buf)
    }

    fn write(&self, _fd: &mut FileDescriptor, buf: &[u8], _offset: u64) -> usize {
        if let Ok(s) = core::str::from_utf8(buf) {
            print(s);
            buf.len()
        } else {
            0
        }
    }
}
