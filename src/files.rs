//! File descriptors and the dispatch layer over mounted modules
//!
//! A descriptor is `{id, size, cursor}`; the binding from id to the module
//! that opened it lives in a process-wide table keyed by id, holding the
//! module's registry index rather than a pointer.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spinning_top::Spinlock;

use crate::irq::with_irqs_disabled;
use crate::modules::{self, FsResult};

/// The handle handed to drivers and userspace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct FileDescriptor {
    pub id: u64,
    pub size: u64,
    pub cursor: u64,
}

/// Descriptor ids below 257 are reserved (the first byte's worth plus the
/// zero id).
static NEXT_FD_ID: AtomicU64 = AtomicU64::new(256);

/// Claim a fresh descriptor id. Drivers call this from their `open`.
pub fn reserve_fd_id() -> u64 {
    NEXT_FD_ID.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Clone, Copy)]
struct OpenFile {
    module_index: usize,
    size: u64,
    owner_pid: u16,
}

static OPEN_FILES: Spinlock<Option<HashMap<u64, OpenFile>>> = Spinlock::new(None);

fn with_open_files<T>(f: impl FnOnce(&mut HashMap<u64, OpenFile>) -> T) -> T {
    with_irqs_disabled(|| {
        let mut guard = OPEN_FILES.lock();
        f(guard.get_or_insert_with(HashMap::new))
    })
}

/// Resolve the path, let the module populate the descriptor, and record the
/// binding. The descriptor is zeroed before the driver sees it and the
/// cursor is forced back to 0 afterwards.
pub fn open_file(path: &str, fd: &mut FileDescriptor) -> FsResult {
    let Some((index, module, consumed)) = modules::get_module(path) else {
        return FsResult::NotFound;
    };
    *fd = FileDescriptor::default();

    let result = module.open(&path[consumed..], fd);
    if result != FsResult::Success {
        return result;
    }
    fd.cursor = 0;

    let pid = crate::process::current_pid();
    with_open_files(|files| {
        files.insert(
            fd.id,
            OpenFile {
                module_index: index,
                size: fd.size,
                owner_pid: pid,
            },
        )
    });
    FsResult::Success
}

/// Read through the descriptor's module, clamped to `size - cursor`.
/// Returns 0 once the descriptor has been closed.
pub fn read_file(fd: &mut FileDescriptor, buf: &mut [u8]) -> usize {
    let Some(entry) = with_open_files(|files| files.get(&fd.id).copied()) else {
        return 0;
    };
    let Some(module) = modules::by_index(entry.module_index) else {
        return 0;
    };

    // A driver bug may leave a wild cursor behind; reading restarts instead
    if fd.cursor > entry.size {
        fd.cursor = 0;
    }
    let available = entry.size - fd.cursor;
    let want = (buf.len() as u64).min(available) as usize;
    if want == 0 {
        return 0;
    }
    module.read(fd, &mut buf[..want], 0)
}

/// Hook a pipe-style layer can install to hear about appended data.
static APPEND_HOOK: AtomicU64 = AtomicU64::new(0);

pub fn set_append_hook(hook: fn(u64, usize)) {
    APPEND_HOOK.store(hook as usize as u64, Ordering::Release);
}

fn notify_append(fd_id: u64, written: usize) {
    let raw = APPEND_HOOK.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: the only writer stores a fn(u64, usize) pointer
        let hook: fn(u64, usize) = unsafe { core::mem::transmute(raw as usize) };
        hook(fd_id, written);
    }
}

/// Write through the descriptor's module. Anyone listening for appends
/// (pipes) hears about the bytes afterwards.
pub fn write_file(fd: &mut FileDescriptor, buf: &[u8]) -> usize {
    let Some(entry) = with_open_files(|files| files.get(&fd.id).copied()) else {
        return 0;
    };
    let Some(module) = modules::by_index(entry.module_index) else {
        return 0;
    };
    let written = module.write(fd, buf, 0);
    if written > 0 {
        notify_append(fd.id, written);
    }
    written
}

/// Move the cursor. Modules that track their own positions get their seek
/// hook; for everyone else the cursor simply moves, clamped to the size.
pub fn seek_file(fd: &mut FileDescriptor, offset: u64) -> u64 {
    let Some(entry) = with_open_files(|files| files.get(&fd.id).copied()) else {
        return 0;
    };
    if let Some(module) = modules::by_index(entry.module_index) {
        let moved = module.seek(fd, offset);
        if moved != 0 {
            return moved;
        }
    }
    fd.cursor = offset.min(entry.size);
    fd.cursor
}

/// Drop the binding and give the module its close hook.
pub fn close_file(fd: &mut FileDescriptor) {
    let entry = with_open_files(|files| files.remove(&fd.id));
    if let Some(entry) = entry
        && let Some(module) = modules::by_index(entry.module_index)
    {
        module.close(fd);
    }
}

/// Close everything a dying process still had open.
pub fn close_files_for_process(pid: u16) {
    let ids: alloc::vec::Vec<u64> = with_open_files(|files| {
        files
            .iter()
            .filter(|(_, f)| f.owner_pid == pid)
            .map(|(id, _)| *id)
            .collect()
    });
    for id in ids {
        let mut fd = FileDescriptor {
            id,
            ..Default::default()
        };
        close_file(&mut fd);
    }
}

/// List a directory through its module. The buffer comes back as
/// `[u32 count][name\0]{count}`; returns the byte count, 0 on no match.
pub fn list_directory_contents(path: &str, buf: &mut [u8]) -> usize {
    let Some((_, module, consumed)) = modules::get_module(path) else {
        return 0;
    };
    module.readdir(&path[consumed..], buf)
}

/// One-shot read by path with no descriptor.
pub fn simple_read(path: &str, buf: &mut [u8]) -> usize {
    let Some((_, module, consumed)) = modules::get_module(path) else {
        return 0;
    };
    module.sread(&path[consumed..], buf)
}

/// One-shot write by path with no descriptor.
pub fn simple_write(path: &str, buf: &[u8]) -> usize {
    let Some((_, module, consumed)) = modules::get_module(path) else {
        return 0;
    };
    module.swrite(&path[consumed..], buf)
}
