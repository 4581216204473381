#![no_std]
#![no_main]

extern crate alloc;

mod allocator;
mod boot;
mod config;
mod console;
mod exceptions;
mod files;
mod gic;
mod gpio;
mod hw;
mod irq;
mod mailbox;
mod mmu;
mod modules;
mod pci;
mod pmm;
mod process;
mod procfs;
mod rng;
mod scheduler;
mod spsc;
mod syscall;
#[cfg(feature = "boot_tests")]
mod tests;
mod timer;
#[cfg(feature = "boot_tests")]
mod timer_tests;
mod virtio;

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut buf = [0u8; 256];
    let msg = format_no_std::show(&mut buf, core::format_args!("{}", info.message()))
        .unwrap_or("panic (message unavailable)");
    exceptions::panic_halt(msg)
}

/// The scheduler's fallback when nothing else is runnable.
extern "C" fn idle_entry() -> ! {
    loop {
        unsafe { core::arch::asm!("wfi") };
    }
}

/// Entered from boot.rs with the MMU on coarse tables and x0 = DTB pointer.
#[unsafe(no_mangle)]
pub extern "C" fn rust_start(dtb_ptr: usize) -> ! {
    // The heap window is a link-time constant so it can come up before
    // hardware detection, which allocates.
    if let Err(e) = allocator::init(config::KERNEL_HEAP_BASE, config::KERNEL_HEAP_SIZE) {
        console::raw_print(e);
        loop {
            unsafe { core::arch::asm!("wfi") };
        }
    }

    hw::detect(dtb_ptr);
    console::print("\nkitsune booting\n");

    kernel_main();
}

fn kernel_main() -> ! {
    mmu::init_tables();
    pmm::init();

    exceptions::init();

    process::init_main_process();

    // The console's Pi bring-up asks the firmware for the UART clock, so
    // the mailbox has to be reachable before the module loads
    let map = hw::get();
    if map.mailbox_base != 0 {
        mmu::register_device_memory(map.mailbox_base, map.mailbox_base);
    }

    modules::load_module(alloc::boxed::Box::new(console::ConsoleModule));

    hw::print_hardware();

    modules::load_module(alloc::boxed::Box::new(rng::RngModule));

    gic::init();
    crate::kprintf!("Interrupts initialized");

    mmu::init();

    #[cfg(feature = "boot_tests")]
    {
        let ok = tests::run_all() & timer_tests::run_all();
        crate::kprintf!("Boot tests {}", if ok { "PASSED" } else { "FAILED" });
    }

    if timer::init_wall_from_rtc() {
        crate::kprintf!("Wall clock synced from RTC");
    }

    crate::kprintf!("Kernel initialization finished");

    modules::load_module(alloc::boxed::Box::new(procfs::ProcModule));

    process::spawn_kernel_process("idle", idle_entry);

    scheduler::start();
}
