//! The `/proc` namespace
//!
//! `readdir /proc` lists live process names; `/proc/<pid>/out` is the
//! process's stdout ring and `/proc/<pid>/state` reads the state name.
//! Descriptor ids are mapped to their target behind a small table so read
//! and write can find the process again without trusting the caller.

use hashbrown::HashMap;
use spinning_top::Spinlock;

use crate::config::{MAX_PROCS, PROC_OUT_BUF};
use crate::files::{FileDescriptor, reserve_fd_id};
use crate::irq::with_irqs_disabled;
use crate::modules::{FsResult, Module, version_num};
use crate::process::{self, ProcessState};

#[derive(Clone, Copy)]
enum Target {
    Out(u16),
    State(u16),
}

static OPEN: Spinlock<Option<HashMap<u64, Target>>> = Spinlock::new(None);

fn with_open<T>(f: impl FnOnce(&mut HashMap<u64, Target>) -> T) -> T {
    let mut guard = OPEN.lock();
    f(guard.get_or_insert_with(HashMap::new))
}

/// Split `/1234/out` into the pid and the leaf name.
fn parse(path: &str) -> Option<(u16, &str)> {
    let mut parts = path.trim_start_matches('/').splitn(2, '/');
    let pid = parts.next()?.parse::<u16>().ok()?;
    let leaf = parts.next().unwrap_or("");
    Some((pid, leaf))
}

pub struct ProcModule;

impl Module for ProcModule {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn mount(&self) -> &'static str {
        "/proc"
    }

    fn version(&self) -> u64 {
        version_num(0, 1, 0, 1)
    }

    fn open(&self, path: &str, fd: &mut FileDescriptor) -> FsResult {
        let Some((pid, leaf)) = parse(path) else {
            return FsResult::NotFound;
        };
        let target = match leaf {
            "out" => Target::Out(pid),
            "state" => Target::State(pid),
            _ => return FsResult::NotFound,
        };
        if with_irqs_disabled(|| process::get_by_pid(pid).is_none()) {
            return FsResult::NotFound;
        }
        fd.id = reserve_fd_id();
        fd.size = match target {
            Target::Out(_) => PROC_OUT_BUF as u64,
            Target::State(_) => 16,
        };
        with_open(|open| open.insert(fd.id, target));
        FsResult::Success
    }

    fn read(&self, fd: &mut FileDescriptor, buf: &mut [u8], _offset: u64) -> usize {
        let Some(target) = with_open(|open| open.get(&fd.id).copied()) else {
            return 0;
        };
        with_irqs_disabled(|| match target {
            Target::Out(pid) => match process::get_by_pid(pid) {
                Some(proc) => process::read_output(proc, fd.cursor, buf),
                None => 0,
            },
            Target::State(pid) => {
                let name: &[u8] = match process::get_by_pid(pid).map(|p| p.state) {
                    Some(ProcessState::Ready) => b"ready",
                    Some(ProcessState::Running) => b"running",
                    Some(ProcessState::Blocked) => b"blocked",
                    Some(ProcessState::Stopped) => b"stopped",
                    None => return 0,
                };
                let start = fd.cursor as usize;
                if start >= name.len() {
                    return 0;
                }
                let n = buf.len().min(name.len() - start);
                buf[..n].copy_from_slice(&name[start..start + n]);
                n
            }
        })
    }

    fn write(&self, fd: &mut FileDescriptor, buf: &[u8], _offset: u64) -> usize {
        let Some(Target::Out(pid)) = with_open(|open| open.get(&fd.id).copied()) else {
            return 0;
        };
        with_irqs_disabled(|| {
            let Some(proc) = process::get_by_pid(pid) else {
                return 0;
            };
            let mut cursor = fd.cursor;
            let n = process::write_output(proc, &mut cursor, buf);
            fd.cursor = cursor;
            n
        })
    }

    fn close(&self, fd: &mut FileDescriptor) {
        with_open(|open| open.remove(&fd.id));
    }

    /// `[u32 count][name\0]{count}` of live processes.
    fn readdir(&self, path: &str, buf: &mut [u8]) -> usize {
        if !path.is_empty() && path != "/" {
            return 0;
        }
        if buf.len() < 4 {
            return 0;
        }
        with_irqs_disabled(|| {
            let mut count: u32 = 0;
            let mut at = 4;
            let table = process::table();
            for slot in 0..MAX_PROCS {
                let proc = &table[slot];
                if proc.id == 0 || proc.state == ProcessState::Stopped {
                    continue;
                }
                let name = &proc.name[..proc.name_len];
                if at + name.len() + 1 > buf.len() {
                    break;
                }
                buf[at..at + name.len()].copy_from_slice(name);
                buf[at + name.len()] = 0;
                at += name.len() + 1;
                count += 1;
            }
            buf[..4].copy_from_slice(&count.to_le_bytes());
            at
        })
    }
}
