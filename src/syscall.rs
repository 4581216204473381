//! System call table
//!
//! SVC #imm from a process lands here with the immediate as the call number
//! and arguments in x0..x4; the result goes back in x0. The table is a flat
//! match with no default pass-through: an unknown number is a kernel
//! invariant violation and the dispatcher panics.

use crate::exceptions;
use crate::files::{self, FileDescriptor};
use crate::pmm::{self, ALIGN_16B, MemLevel};
use crate::process::{self, Process};
use crate::scheduler;
use crate::spsc::{KbdEvent, Keypress};

/// Stable syscall numbers. The gaps belong to subsystems mounted as modules
/// (drawing primitives, shortcuts) whose handlers live with those drivers.
pub mod nr {
    pub const MALLOC: u16 = 0;
    pub const FREE: u16 = 1;
    pub const PRINTL: u16 = 3;
    pub const READ_KEY: u16 = 5;
    pub const READ_EVENT: u16 = 8;
    pub const REQUEST_DRAW_CTX: u16 = 20;
    pub const GPU_FLUSH: u16 = 21;
    pub const SLEEP: u16 = 30;
    pub const YIELD: u16 = 31;
    pub const HALT: u16 = 33;
    pub const GET_TIME: u16 = 40;
    pub const SOCKET_CREATE: u16 = 50;
    pub const SOCKET_BIND: u16 = 51;
    pub const SOCKET_CONNECT: u16 = 52;
    pub const SOCKET_LISTEN: u16 = 53;
    pub const SOCKET_ACCEPT: u16 = 54;
    pub const SOCKET_SEND: u16 = 55;
    pub const SOCKET_RECEIVE: u16 = 56;
    pub const SOCKET_CLOSE: u16 = 57;
    pub const FILE_OPEN: u16 = 60;
    pub const FILE_READ: u16 = 61;
    pub const FILE_WRITE: u16 = 62;
    pub const FILE_CLOSE: u16 = 63;
    pub const DIR_LIST: u16 = 64;
}

const ERR: u64 = (-1i64) as u64;

/// Dispatch a syscall. `None` means the number is not in the table.
pub fn dispatch(num: u16, proc: &mut Process) -> Option<u64> {
    let result = match num {
        nr::MALLOC => sys_malloc(proc),
        nr::FREE => sys_free(proc),
        nr::PRINTL => sys_printl(proc),
        nr::READ_KEY => sys_read_key(proc),
        nr::READ_EVENT => sys_read_event(proc),
        nr::REQUEST_DRAW_CTX => sys_request_draw_ctx(proc),
        nr::GPU_FLUSH => sys_gpu_flush(),
        nr::SLEEP => sys_sleep(proc),
        nr::YIELD => sys_yield(),
        nr::HALT => sys_halt(proc),
        nr::GET_TIME => crate::timer::now_msec(),
        nr::SOCKET_CREATE..=nr::SOCKET_CLOSE => sys_socket(num, proc),
        nr::FILE_OPEN => sys_fopen(proc),
        nr::FILE_READ => sys_fread(proc),
        nr::FILE_WRITE => sys_fwrite(proc),
        nr::FILE_CLOSE => sys_fclose(proc),
        nr::DIR_LIST => sys_dir_list(proc),
        _ => return None,
    };
    Some(result)
}

/// Borrow a NUL-terminated string out of the caller's memory, bounded.
///
/// # Safety
/// The pointer came from the trapping process; the byte scan stays within
/// `max` bytes.
unsafe fn user_cstr<'a>(ptr: u64, max: usize) -> Option<&'a str> {
    if ptr == 0 {
        return None;
    }
    // SAFETY: bounded scan, caller contract above
    unsafe {
        let base = ptr as *const u8;
        let mut len = 0;
        while len < max && base.add(len).read() != 0 {
            len += 1;
        }
        core::str::from_utf8(core::slice::from_raw_parts(base, len)).ok()
    }
}

/// Allocate from the calling process's heap page. Re-entered syscalls fall
/// back to the kernel process heap so a nested allocation cannot land in a
/// heap that is mid-teardown.
fn sys_malloc(proc: &mut Process) -> u64 {
    let page = if exceptions::syscall_depth() > 1 {
        process::get_by_pid(1).map(|p| p.heap_page).unwrap_or(0)
    } else {
        proc.heap_page
    };
    if page == 0 {
        return 0;
    }
    let level = if proc.is_privileged() {
        MemLevel::Kernel
    } else {
        MemLevel::User
    };
    pmm::kalloc(page, proc.regs[0] as usize, ALIGN_16B, level) as u64
}

fn sys_free(proc: &mut Process) -> u64 {
    pmm::kfree(proc.regs[0] as usize, proc.regs[1] as usize);
    0
}

fn sys_printl(proc: &mut Process) -> u64 {
    // SAFETY: bounded read of the caller's string
    match unsafe { user_cstr(proc.regs[0], 4096) } {
        Some(s) => {
            crate::console::print(s);
            crate::console::print("\n");
            0
        }
        None => ERR,
    }
}

fn sys_read_key(proc: &mut Process) -> u64 {
    let out = proc.regs[0] as *mut Keypress;
    if out.is_null() {
        return ERR;
    }
    match proc.input_buffer.pop() {
        Some(kp) => {
            // SAFETY: caller-supplied out pointer, Keypress is POD
            unsafe { out.write(kp) };
            1
        }
        None => 0,
    }
}

fn sys_read_event(proc: &mut Process) -> u64 {
    let out = proc.regs[0] as *mut KbdEvent;
    if out.is_null() {
        return ERR;
    }
    match proc.event_buffer.pop() {
        Some(ev) => {
            // SAFETY: caller-supplied out pointer, KbdEvent is POD
            unsafe { out.write(ev) };
            1
        }
        None => 0,
    }
}

/// Ask the mounted display driver for a draw context. Without one the call
/// reports failure rather than faulting.
fn sys_request_draw_ctx(proc: &mut Process) -> u64 {
    let ptr = proc.regs[0] as *mut u8;
    if ptr.is_null() {
        return ERR;
    }
    // SAFETY: caller owns the draw-ctx struct the driver fills in
    let buf = unsafe { core::slice::from_raw_parts_mut(ptr, 32) };
    if files::simple_read("/dev/graph/ctx", buf) > 0 {
        0
    } else {
        ERR
    }
}

fn sys_gpu_flush() -> u64 {
    if files::simple_write("/dev/graph/flush", b"1") > 0 {
        0
    } else {
        ERR
    }
}

fn sys_sleep(proc: &mut Process) -> u64 {
    let msec = proc.regs[0];
    // The dispatcher never stores a result for us; write the success code
    // into the record the wakeup will restore
    proc.regs[0] = 0;
    exceptions::syscall_depth_dec();
    scheduler::sleep_process(msec)
}

fn sys_yield() -> u64 {
    exceptions::syscall_depth_dec();
    scheduler::switch_proc()
}

fn sys_halt(proc: &mut Process) -> u64 {
    let code = proc.regs[0] as u32;
    crate::kprintf!("Process has ended with code {}", code);
    exceptions::syscall_depth_dec();
    process::stop_current_process(code)
}

/// Size of the handle block shared with the network driver
const SOCKET_HANDLE_BYTES: usize = 64;

/// Socket calls are owned by the network stack, which mounts at `/dev/net`.
/// Each call forwards the caller's handle block (x0, layout owned by the
/// driver and its userspace shim, scalar arguments included) through the
/// bufferless namespace ops; calls that hand data back go through `sread`.
/// With no stack mounted every socket call reports failure.
fn sys_socket(num: u16, proc: &mut Process) -> u64 {
    let leaf = match num {
        nr::SOCKET_CREATE => "/dev/net/create",
        nr::SOCKET_BIND => "/dev/net/bind",
        nr::SOCKET_CONNECT => "/dev/net/connect",
        nr::SOCKET_LISTEN => "/dev/net/listen",
        nr::SOCKET_ACCEPT => "/dev/net/accept",
        nr::SOCKET_SEND => "/dev/net/send",
        nr::SOCKET_RECEIVE => "/dev/net/receive",
        _ => "/dev/net/close",
    };
    let ptr = proc.regs[0] as *mut u8;
    if ptr.is_null() {
        return ERR;
    }
    let handled = match num {
        nr::SOCKET_CREATE | nr::SOCKET_ACCEPT | nr::SOCKET_RECEIVE => {
            // SAFETY: caller-owned handle block the driver fills in
            let buf = unsafe { core::slice::from_raw_parts_mut(ptr, SOCKET_HANDLE_BYTES) };
            files::simple_read(leaf, buf)
        }
        _ => {
            // SAFETY: caller-owned handle block the driver consumes
            let buf = unsafe { core::slice::from_raw_parts(ptr, SOCKET_HANDLE_BYTES) };
            files::simple_write(leaf, buf)
        }
    };
    if handled > 0 { 0 } else { ERR }
}

fn sys_fopen(proc: &mut Process) -> u64 {
    // SAFETY: bounded read of the caller's path
    let Some(path) = (unsafe { user_cstr(proc.regs[0], 255) }) else {
        return crate::modules::FsResult::NotFound as i64 as u64;
    };
    let fd = proc.regs[1] as *mut FileDescriptor;
    if fd.is_null() {
        return crate::modules::FsResult::DriverError as i64 as u64;
    }
    // SAFETY: caller-supplied descriptor slot
    files::open_file(path, unsafe { &mut *fd }) as i64 as u64
}

fn sys_fread(proc: &mut Process) -> u64 {
    let fd = proc.regs[0] as *mut FileDescriptor;
    let buf = proc.regs[1] as *mut u8;
    let size = proc.regs[2] as usize;
    if fd.is_null() || buf.is_null() || size == 0 {
        return 0;
    }
    // SAFETY: caller-supplied descriptor and buffer
    unsafe { files::read_file(&mut *fd, core::slice::from_raw_parts_mut(buf, size)) as u64 }
}

fn sys_fwrite(proc: &mut Process) -> u64 {
    let fd = proc.regs[0] as *mut FileDescriptor;
    let buf = proc.regs[1] as *const u8;
    let size = proc.regs[2] as usize;
    if fd.is_null() || buf.is_null() || size == 0 {
        return 0;
    }
    // SAFETY: caller-supplied descriptor and buffer
    unsafe { files::write_file(&mut *fd, core::slice::from_raw_parts(buf, size)) as u64 }
}

fn sys_fclose(proc: &mut Process) -> u64 {
    let fd = proc.regs[0] as *mut FileDescriptor;
    if !fd.is_null() {
        // SAFETY: caller-supplied descriptor
        files::close_file(unsafe { &mut *fd });
    }
    0
}

fn sys_dir_list(proc: &mut Process) -> u64 {
    // SAFETY: bounded read of the caller's path
    let Some(path) = (unsafe { user_cstr(proc.regs[0], 255) }) else {
        return 0;
    };
    let buf = proc.regs[1] as *mut u8;
    let size = proc.regs[2] as usize;
    if buf.is_null() || size < 4 {
        return 0;
    }
    // SAFETY: caller-supplied listing buffer
    unsafe {
        files::list_directory_contents(path, core::slice::from_raw_parts_mut(buf, size)) as u64
    }
}
