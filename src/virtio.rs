//! VirtIO modern (1.x) PCI transport
//!
//! Probes the capability list for the config structures, negotiates features
//! against a caller-set mask, sets up every virtqueue the device exposes and
//! offers a synchronous submit primitive the block/net/gpu/audio drivers
//! build on. Any missing capability or a failed FEATURES_OK handshake is
//! fatal for the device: init returns false and the driver's module is not
//! registered.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

use crate::pci;
use crate::pmm::{self, MemLevel, PAGE_SIZE, attrs};

pub const VIRTIO_VENDOR: u16 = 0x1AF4;

pub const VIRTIO_F_VERSION_1: u64 = 32;
pub const VIRTIO_F_NOTIFICATION_DATA: u64 = 38;

const STATUS_ACKNOWLEDGE: u8 = 0x1;
const STATUS_DRIVER: u8 = 0x2;
const STATUS_DRIVER_OK: u8 = 0x4;
const STATUS_FEATURES_OK: u8 = 0x8;

const CAP_COMMON_CFG: u8 = 1;
const CAP_NOTIFY_CFG: u8 = 2;
const CAP_ISR_CFG: u8 = 3;
const CAP_DEVICE_CFG: u8 = 4;
const CAP_PCI_CFG: u8 = 5;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// Common configuration structure of a modern VirtIO PCI device. Field
/// offsets are natural; every access goes through read/write_volatile.
#[repr(C)]
pub struct CommonCfg {
    pub device_feature_select: u32,
    pub device_feature: u32,
    pub driver_feature_select: u32,
    pub driver_feature: u32,
    pub msix_config: u16,
    pub num_queues: u16,
    pub device_status: u8,
    pub config_generation: u8,
    pub queue_select: u16,
    pub queue_size: u16,
    pub queue_msix_vector: u16,
    pub queue_enable: u16,
    pub queue_notify_off: u16,
    pub queue_desc: u64,
    pub queue_driver: u64,
    pub queue_device: u64,
    pub queue_notify_data: u16,
    pub queue_reset: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// A buffer handed to `send_nd`
#[derive(Clone, Copy)]
pub struct VirtioBuf {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
}

/// One probed device
pub struct VirtioDevice {
    pub common_cfg: *mut CommonCfg,
    pub notify_cfg: *mut u8,
    pub device_cfg: *mut u8,
    pub isr_cfg: *mut u8,
    pub notify_off_multiplier: u32,
    /// Partial page for driver-side DMA scratch allocations
    pub memory_page: usize,
    pub negotiated_features: u64,
}

impl VirtioDevice {
    pub const fn new() -> Self {
        Self {
            common_cfg: core::ptr::null_mut(),
            notify_cfg: core::ptr::null_mut(),
            device_cfg: core::ptr::null_mut(),
            isr_cfg: core::ptr::null_mut(),
            notify_off_multiplier: 0,
            memory_page: 0,
            negotiated_features: 0,
        }
    }
}

macro_rules! cfg_read {
    ($dev:expr, $field:ident) => {
        // SAFETY: common_cfg points at the mapped common config structure
        unsafe { core::ptr::addr_of!((*$dev.common_cfg).$field).read_volatile() }
    };
}

macro_rules! cfg_write {
    ($dev:expr, $field:ident, $val:expr) => {
        // SAFETY: common_cfg points at the mapped common config structure
        unsafe { core::ptr::addr_of_mut!((*$dev.common_cfg).$field).write_volatile($val) }
    };
}

/// Feature mask the next `init_device` negotiates against. Drivers set this
/// before probing their device.
static FEATURE_MASK: AtomicU64 = AtomicU64::new(0);

pub fn set_feature_mask(mask: u64) {
    FEATURE_MASK.store(mask, Ordering::Release);
}

/// Walk the PCI capability list and record the config structure pointers.
/// BARs the firmware never assigned are sized and placed here.
pub fn get_capabilities(dev: &mut VirtioDevice, pci_addr: usize) {
    pci::for_each_capability(pci_addr, |cap_addr, vendor| {
        // Vendor-specific capability, the only kind VirtIO uses
        if vendor != 0x9 {
            return;
        }
        let cfg_type = pci::read8(cap_addr + 3);
        let bar = pci::read8(cap_addr + 4);
        let offset = pci::read32(cap_addr + 8) as usize;
        let length = pci::read32(cap_addr + 12) as usize;

        let mut bar_base = pci::bar_address(pci_addr, bar);
        if bar_base == 0 && cfg_type < CAP_PCI_CFG {
            // Firmware left the BAR unassigned; size and place it ourselves
            bar_base = pci::setup_bar(pci_addr, bar);
        } else if bar_base != 0 && cfg_type < CAP_PCI_CFG {
            // Firmware-assigned region still needs a device mapping
            let mut page = (bar_base as usize + offset) & !(PAGE_SIZE - 1);
            let end = bar_base as usize + offset + length.max(1);
            while page < end {
                crate::mmu::register_device_memory(page, page);
                page += PAGE_SIZE;
            }
        }
        if bar_base == 0 {
            return;
        }
        let target = bar_base as usize + offset;

        match cfg_type {
            CAP_COMMON_CFG => dev.common_cfg = target as *mut CommonCfg,
            CAP_NOTIFY_CFG => {
                dev.notify_cfg = target as *mut u8;
                dev.notify_off_multiplier = pci::read32(cap_addr + 16);
            }
            CAP_DEVICE_CFG => dev.device_cfg = target as *mut u8,
            CAP_ISR_CFG => dev.isr_cfg = target as *mut u8,
            _ => {}
        }
    });
}

/// Select a queue and read back its size (0 = queue does not exist).
pub fn select_queue(dev: &VirtioDevice, index: u16) -> u16 {
    cfg_write!(dev, queue_select, index);
    unsafe { core::arch::asm!("dsb sy") };
    cfg_read!(dev, queue_size)
}

fn alloc_ring(bytes: u64) -> usize {
    let rounded = (bytes as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    pmm::palloc_zeroed(rounded as u64, MemLevel::Kernel, attrs::DEV | attrs::RW)
}

/// Bring a probed device up: reset, ACKNOWLEDGE, DRIVER, feature handshake,
/// virtqueue setup, DRIVER_OK.
pub fn init_device(dev: &mut VirtioDevice) -> bool {
    if dev.common_cfg.is_null() || dev.notify_cfg.is_null() {
        return false;
    }

    // Reset and wait for the device to report it
    cfg_write!(dev, device_status, 0u8);
    let deadline = crate::timer::now_msec() + 2000;
    while cfg_read!(dev, device_status) != 0 {
        if crate::timer::now_msec() > deadline {
            return false;
        }
        core::hint::spin_loop();
    }

    cfg_write!(dev, device_status, cfg_read!(dev, device_status) | STATUS_ACKNOWLEDGE);
    cfg_write!(dev, device_status, cfg_read!(dev, device_status) | STATUS_DRIVER);

    cfg_write!(dev, device_feature_select, 0u32);
    let f_lo = cfg_read!(dev, device_feature) as u64;
    cfg_write!(dev, device_feature_select, 1u32);
    let f_hi = cfg_read!(dev, device_feature) as u64;
    let features = f_hi << 32 | f_lo;

    let negotiated = features & FEATURE_MASK.load(Ordering::Acquire);

    cfg_write!(dev, driver_feature_select, 0u32);
    cfg_write!(dev, driver_feature, negotiated as u32);
    cfg_write!(dev, driver_feature_select, 1u32);
    cfg_write!(dev, driver_feature, (negotiated >> 32) as u32);

    dev.negotiated_features = negotiated;

    cfg_write!(dev, device_status, cfg_read!(dev, device_status) | STATUS_FEATURES_OK);
    if cfg_read!(dev, device_status) & STATUS_FEATURES_OK == 0 {
        crate::kprintf!(
            "Failed to negotiate features. Supported features {:#x}",
            features
        );
        return false;
    }

    dev.memory_page = pmm::palloc(0x10000, MemLevel::Kernel, attrs::DEV | attrs::RW, false);
    if dev.memory_page == 0 {
        return false;
    }

    // One desc/avail/used triple per queue the device exposes
    let mut queue_index = 0u16;
    loop {
        let size = select_queue(dev, queue_index);
        if size == 0 {
            break;
        }
        let desc = alloc_ring(16 * size as u64);
        let avail = alloc_ring(6 + 2 * size as u64);
        let used = alloc_ring(6 + 8 * size as u64);
        if desc == 0 || avail == 0 || used == 0 {
            return false;
        }

        cfg_write!(dev, queue_desc, desc as u64);
        cfg_write!(dev, queue_driver, avail as u64);
        cfg_write!(dev, queue_device, used as u64);
        cfg_write!(dev, queue_enable, 1u16);
        queue_index += 1;
    }

    select_queue(dev, 0);

    cfg_write!(dev, device_status, cfg_read!(dev, device_status) | STATUS_DRIVER_OK);
    true
}

// Ring accessors. The avail and used rings are flexible arrays; offsets are
// computed by hand.

#[inline]
unsafe fn avail_write_ring(avail: usize, qsz: u16, idx: u16, value: u16) {
    // SAFETY: ring memory was allocated for qsz entries
    unsafe { ((avail + 4 + 2 * (idx % qsz) as usize) as *mut u16).write_volatile(value) }
}

#[inline]
unsafe fn avail_idx(avail: usize) -> u16 {
    // SAFETY: live ring memory
    unsafe { ((avail + 2) as *const u16).read_volatile() }
}

#[inline]
unsafe fn avail_set_idx(avail: usize, value: u16) {
    // SAFETY: live ring memory
    unsafe { ((avail + 2) as *mut u16).write_volatile(value) }
}

#[inline]
unsafe fn used_idx(used: usize) -> u16 {
    // SAFETY: live ring memory
    unsafe { ((used + 2) as *const u16).read_volatile() }
}

#[inline]
fn dmb_ishst() {
    unsafe { core::arch::asm!("dmb ishst", options(nomem, nostack)) };
}

#[inline]
fn dmb_ishld() {
    unsafe { core::arch::asm!("dmb ishld", options(nomem, nostack)) };
}

/// Ring the doorbell for the selected queue. The value written depends on
/// the NOTIFICATION_DATA feature bit.
pub fn notify(dev: &VirtioDevice) {
    if dev.common_cfg.is_null() || dev.notify_cfg.is_null() {
        return;
    }
    let off = cfg_read!(dev, queue_notify_off) as u64;
    let mul = dev.notify_off_multiplier.max(1) as u64;
    let value = if dev.negotiated_features & (1 << VIRTIO_F_NOTIFICATION_DATA) != 0 {
        cfg_read!(dev, queue_notify_data)
    } else {
        cfg_read!(dev, queue_select)
    };
    // SAFETY: the notify region was recorded from the capability walk
    unsafe {
        (dev.notify_cfg.add((off * mul) as usize) as *mut u16).write_volatile(value);
    }
}

/// Submit a chain of buffers on the selected queue and spin until the device
/// consumes it. Descriptors are linked with NEXT; each buffer keeps its own
/// WRITE flag.
pub fn send_nd(dev: &VirtioDevice, bufs: &[VirtioBuf]) -> bool {
    let n = bufs.len();
    if n == 0 {
        return false;
    }
    let qsz = cfg_read!(dev, queue_size);
    if qsz == 0 || n > qsz as usize {
        return false;
    }

    let desc = cfg_read!(dev, queue_desc) as usize as *mut VirtqDesc;
    let avail = cfg_read!(dev, queue_driver) as usize;
    let used = cfg_read!(dev, queue_device) as usize;
    // SAFETY: ring addresses were published by init_device from live
    // allocations
    unsafe {
        let last_used = used_idx(used);

        for (i, buf) in bufs.iter().enumerate() {
            if buf.addr == 0 || buf.len == 0 {
                return false;
            }
            let mut flags = buf.flags;
            let next = if i + 1 < n {
                flags |= VIRTQ_DESC_F_NEXT;
                (i + 1) as u16
            } else {
                0
            };
            desc.add(i).write_volatile(VirtqDesc {
                addr: buf.addr,
                len: buf.len,
                flags,
                next,
            });
        }

        dmb_ishst();
        let idx = avail_idx(avail);
        avail_write_ring(avail, qsz, idx, 0);
        dmb_ishst();
        avail_set_idx(avail, idx.wrapping_add(1));
        dmb_ishst();
        notify(dev);

        // Interrupt-driven completion is the receive path's business; the
        // submit path is synchronous by contract
        while used_idx(used) == last_used {
            core::hint::spin_loop();
        }
        dmb_ishld();
    }
    true
}

/// Post a single long-lived descriptor (receive rings), without waiting.
pub fn add_buffer(dev: &VirtioDevice, index: u16, buf: u64, len: u32, host_to_dev: bool) {
    let qsz = cfg_read!(dev, queue_size);
    if qsz == 0 {
        return;
    }
    let desc = cfg_read!(dev, queue_desc) as usize as *mut VirtqDesc;
    let avail = cfg_read!(dev, queue_driver) as usize;
    // SAFETY: as in send_nd
    unsafe {
        desc.add(index as usize).write_volatile(VirtqDesc {
            addr: buf,
            len,
            flags: if host_to_dev { 0 } else { VIRTQ_DESC_F_WRITE },
            next: 0,
        });
        dmb_ishst();
        let idx = avail_idx(avail);
        avail_write_ring(avail, qsz, idx, index);
        dmb_ishst();
        avail_set_idx(avail, idx.wrapping_add(1));
        dmb_ishst();
        notify(dev);
    }
}

/// Current used-ring index of the selected queue, for receive-path polling
/// from the interrupt handler.
pub fn used_index(dev: &VirtioDevice) -> u16 {
    let used = cfg_read!(dev, queue_device) as usize;
    dmb_ishld();
    // SAFETY: live ring memory published at init
    unsafe { used_idx(used) }
}

/// Probe + init in one step: find the PCI function, enable it, walk the
/// capabilities and bring the device up.
pub fn probe(device_id: u16, dev: &mut VirtioDevice) -> bool {
    let Some(addr) = pci::find_device(VIRTIO_VENDOR, device_id) else {
        return false;
    };
    pci::enable_device(addr);
    get_capabilities(dev, addr);
    init_device(dev)
}
