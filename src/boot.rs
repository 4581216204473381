//! Boot code for AArch64
//!
//! Early boot sequence:
//! 1. Enable the FPU and set up a boot stack
//! 2. Build coarse identity page tables (1GB blocks)
//! 3. Enable the MMU and caches
//! 4. Continue into `rust_start` with the DTB pointer preserved
//!
//! The fine-grained kernel map is built later by `mmu::init`; these tables
//! only need to cover early console output and the allocators.

use core::arch::global_asm;

global_asm!(
    r#"
.section .text._boot
.global _boot

.equ KERNEL_PHYS_BASE,  0x40000000
.equ BOOT_STACK_TOP,    0x41000000

.equ PAGE_SIZE,         4096

// Page table flags
.equ PT_VALID,          (1 << 0)
.equ PT_TABLE,          (1 << 1)
.equ PT_BLOCK,          (0 << 1)
.equ PT_AF,             (1 << 10)
.equ PT_SH_INNER,       (3 << 8)
.equ PT_SH_OUTER,       (2 << 8)
.equ PT_ATTR_DEVICE,    (0 << 2)        // MAIR index 0 = device
.equ PT_ATTR_NORMAL,    (1 << 2)        // MAIR index 1 = normal

.equ DEVICE_BLOCK, (PT_VALID | PT_BLOCK | PT_AF | PT_SH_OUTER | PT_ATTR_DEVICE)
.equ NORMAL_BLOCK, (PT_VALID | PT_BLOCK | PT_AF | PT_SH_INNER | PT_ATTR_NORMAL)

_boot:
    // Save DTB pointer
    mov     x19, x0

    // Enable FPU/SIMD
    mov     x0, #(3 << 20)
    msr     cpacr_el1, x0
    isb

    // Boot stack, grows down toward the kernel image
    ldr     x0, =BOOT_STACK_TOP
    mov     sp, x0

    bl      setup_boot_page_tables
    bl      configure_mmu_regs

    // Enable MMU and caches
    mrs     x0, sctlr_el1
    orr     x0, x0, #1              // M
    orr     x0, x0, #(1 << 2)       // C
    orr     x0, x0, #(1 << 12)      // I
    msr     sctlr_el1, x0
    isb

    mov     x0, x19                 // DTB pointer
    bl      rust_start

hang:
    wfe
    b       hang

// Coarse identity tables: 1GB device block for the low MMIO hole, 1GB RAM
// blocks above it. Physical addressing throughout, MMU is still off.
.section .text.boot
setup_boot_page_tables:
    adrp    x10, boot_page_tables
    add     x10, x10, :lo12:boot_page_tables

    // x10 = L0, x11 = L1
    add     x11, x10, #PAGE_SIZE

    // Clear both pages
    mov     x0, x10
    mov     x1, #(PAGE_SIZE * 2)
3:  str     xzr, [x0], #8
    subs    x1, x1, #8
    b.ne    3b

    // L0[0] -> L1
    mov     x0, x11
    orr     x0, x0, #(PT_VALID | PT_TABLE)
    str     x0, [x10, #0]

    // L1[0] = 0x00000000 device (GIC, UART)
    ldr     x0, =DEVICE_BLOCK
    str     x0, [x11, #0]

    // L1[1..4] = RAM at 0x40000000, 3GB worth
    ldr     x0, =0x40000000
    ldr     x1, =NORMAL_BLOCK
    orr     x0, x0, x1
    str     x0, [x11, #8]

    ldr     x0, =0x80000000
    orr     x0, x0, x1
    str     x0, [x11, #16]

    ldr     x0, =0xC0000000
    orr     x0, x0, x1
    str     x0, [x11, #24]

    ret

configure_mmu_regs:
    // MAIR_EL1: Attr0 = Device-nGnRnE, Attr1 = Normal Non-cacheable
    mov     x0, #0x4400
    msr     mair_el1, x0

    // TCR_EL1: T0SZ/T1SZ = 16 (48-bit), 4KB granules, IPS = 48-bit
    mov     x0, #0x3510
    movk    x0, #0xB510, lsl #16
    movk    x0, #0x5, lsl #32
    msr     tcr_el1, x0

    adrp    x0, boot_page_tables
    add     x0, x0, :lo12:boot_page_tables
    msr     ttbr0_el1, x0
    msr     ttbr1_el1, x0

    tlbi    vmalle1
    dsb     sy
    isb

    ret

// Two pages of boot tables (L0 + L1), 4KB aligned
.section .bss.boot
.balign 4096
.global boot_page_tables
boot_page_tables:
    .space  4096 * 2
"#
);
