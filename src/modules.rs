//! Module registry and path namespace
//!
//! Kernel subsystems register under a path prefix and receive the file
//! operations routed at them. A module advertises its capabilities by
//! overriding trait methods; the defaults refuse politely, so the registry
//! never has to inspect module internals.

#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::vec::Vec;
use spinning_top::Spinlock;

use crate::files::FileDescriptor;
use crate::irq::with_irqs_disabled;

/// Result codes surfaced by the filesystem layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum FsResult {
    Success = 0,
    NotFound = -1,
    DriverError = -2,
    NoResources = -3,
}

/// Pack a version tuple the way module version fields are compared
pub const fn version_num(major: u16, minor: u16, patch: u16, build: u16) -> u64 {
    (major as u64) << 48 | (minor as u64) << 32 | (patch as u64) << 16 | build as u64
}

/// A mountable kernel subsystem.
///
/// `read`/`write` receive the descriptor produced by `open`; they must leave
/// `fd.cursor` alone unless they advance it. The bufferless `sread`/`swrite`
/// pair serves callers that have no descriptor (one-shot command paths).
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;
    /// Mount prefix, e.g. `/dev/console`. Must be unique across modules.
    fn mount(&self) -> &'static str;
    fn version(&self) -> u64 {
        version_num(0, 1, 0, 0)
    }

    /// Called at registration. Returning false aborts the registration.
    fn init(&self) -> bool {
        true
    }
    /// Called at unload.
    fn fini(&self) -> bool {
        false
    }

    fn open(&self, _path: &str, _fd: &mut FileDescriptor) -> FsResult {
        FsResult::NotFound
    }
    fn read(&self, _fd: &mut FileDescriptor, _buf: &mut [u8], _offset: u64) -> usize {
        0
    }
    fn write(&self, _fd: &mut FileDescriptor, _buf: &[u8], _offset: u64) -> usize {
        0
    }
    fn seek(&self, _fd: &mut FileDescriptor, _offset: u64) -> u64 {
        0
    }
    fn close(&self, _fd: &mut FileDescriptor) {}

    /// Fill `buf` with `[u32 count][name\0]{count}`; returns bytes written.
    fn readdir(&self, _path: &str, _buf: &mut [u8]) -> usize {
        0
    }

    /// Bufferless one-shot read by path.
    fn sread(&self, _path: &str, _buf: &mut [u8]) -> usize {
        0
    }
    /// Bufferless one-shot write by path.
    fn swrite(&self, _path: &str, _buf: &[u8]) -> usize {
        0
    }
}

/// Registered modules in registration order. Entries are leaked boxes so a
/// stable index can stand in for the raw pointer the C version kept;
/// unloading leaves a tombstone so later indices never shift under the
/// open-file table.
static MODULES: Spinlock<Vec<Option<&'static dyn Module>>> = Spinlock::new(Vec::new());

/// Run a module's init and publish it in the namespace. Fails when the init
/// fails or the mount prefix is already taken.
pub fn load_module(module: Box<dyn Module>) -> bool {
    let module: &'static dyn Module = Box::leak(module);
    let taken = with_irqs_disabled(|| {
        MODULES
            .lock()
            .iter()
            .flatten()
            .any(|m| m.mount().eq_ignore_ascii_case(module.mount()))
    });
    if taken {
        crate::kprintf!("[modules] mount {} already taken", module.mount());
        return false;
    }
    if !module.init() {
        crate::kprintf!("[modules] init failed for {}", module.name());
        return false;
    }
    with_irqs_disabled(|| MODULES.lock().push(Some(module)));
    true
}

/// Run fini and remove the module from the namespace.
pub fn unload_module(mount: &str) -> bool {
    let removed = with_irqs_disabled(|| {
        let mut modules = MODULES.lock();
        let idx = modules
            .iter()
            .position(|m| m.is_some_and(|m| m.mount().eq_ignore_ascii_case(mount)))?;
        modules[idx].take()
    });
    match removed {
        Some(module) => {
            module.fini();
            true
        }
        None => false,
    }
}

/// Module behind a stable registry index (what the open-file table stores).
pub fn by_index(index: usize) -> Option<&'static dyn Module> {
    with_irqs_disabled(|| MODULES.lock().get(index).copied().flatten())
}

/// Resolve a path to its module.
///
/// Prefix matching is case-insensitive and the longest mount wins, so
/// `/dev/console/foo` resolves to the console module with sub-path `/foo`
/// rather than to a `/dev` module. Returns the registry index, the module
/// and the byte count the caller should advance the path by.
pub fn get_module(path: &str) -> Option<(usize, &'static dyn Module, usize)> {
    with_irqs_disabled(|| {
        let modules = MODULES.lock();
        let mut best: Option<(usize, &'static dyn Module, usize)> = None;
        for (idx, slot) in modules.iter().enumerate() {
            let Some(module) = slot else { continue };
            let mount = module.mount();
            if path.len() < mount.len() {
                continue;
            }
            if !path[..mount.len()].eq_ignore_ascii_case(mount) {
                continue;
            }
            // The match must end on a component boundary
            if path.len() > mount.len() && !path[mount.len()..].starts_with('/') {
                continue;
            }
            if best.map(|(_, _, len)| mount.len() > len).unwrap_or(true) {
                best = Some((idx, *module, mount.len()));
            }
        }
        best
    })
}

/// Number of registered modules.
pub fn count() -> usize {
    with_irqs_disabled(|| MODULES.lock().iter().flatten().count())
}

/// Lock-shy variant of `get_module` for the panic path: gives up instead of
/// spinning when the registry lock is already held.
pub fn try_get_module(path: &str) -> Option<(&'static dyn Module, usize)> {
    let modules = MODULES.try_lock()?;
    let mut best: Option<(&'static dyn Module, usize)> = None;
    for module in modules.iter().flatten() {
        let mount = module.mount();
        if path.len() >= mount.len()
            && path[..mount.len()].eq_ignore_ascii_case(mount)
            && (path.len() == mount.len() || path[mount.len()..].starts_with('/'))
            && best.map(|(_, len)| mount.len() > len).unwrap_or(true)
        {
            best = Some((*module, mount.len()));
        }
    }
    best
}
