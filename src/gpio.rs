//! Raspberry Pi GPIO pin setup for the PL011 UART

use crate::hw::HwMap;

const GPPUD: usize = 0x94;
const GPPUDCLK0: usize = 0x98;

#[inline]
fn write32(addr: usize, value: u32) {
    // SAFETY: GPIO MMIO register on the detected board
    unsafe { (addr as *mut u32).write_volatile(value) }
}

#[inline]
fn read32(addr: usize) -> u32 {
    // SAFETY: GPIO MMIO register on the detected board
    unsafe { (addr as *const u32).read_volatile() }
}

/// The pull-up/down sequence wants a settle delay of at least 150 cycles
/// between writes.
fn settle() {
    for _ in 0..150 {
        core::hint::spin_loop();
    }
}

fn enable_pin(map: &HwMap, pin: u8) {
    let clk = map.gpio_base + map.gpio_pin_base + GPPUDCLK0;
    let v = read32(clk);
    write32(clk, v | (1 << pin));
}

/// Route pins 14/15 to the UART: GPPUD reset, settle, clock the pins.
pub fn setup_uart_pins(map: &HwMap) {
    if map.gpio_base == 0 {
        return;
    }
    write32(map.gpio_base + map.gpio_pin_base + GPPUD, 0);
    settle();
    enable_pin(map, 14);
    enable_pin(map, 15);
    settle();
}
