//! Kernel RNG and the `/random` module
//!
//! xorshift64 seeded from the cycle counter. Not cryptographic; userspace
//! wanting real entropy should stir in its own sources.

#![allow(dead_code)]

use spinning_top::Spinlock;

use crate::files::FileDescriptor;
use crate::modules::{FsResult, Module};

pub struct Rng {
    state: u64,
}

impl Rng {
    const fn new() -> Self {
        Self { state: 0 }
    }

    pub fn seed(&mut self, seed: u64) {
        self.state = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    pub fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let v = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&v[..chunk.len()]);
        }
    }
}

static GLOBAL_RNG: Spinlock<Rng> = Spinlock::new(Rng::new());

pub fn fill(buf: &mut [u8]) {
    GLOBAL_RNG.lock().fill(buf);
}

pub fn next_u64() -> u64 {
    GLOBAL_RNG.lock().next_u64()
}

pub struct RngModule;

impl Module for RngModule {
    fn name(&self) -> &'static str {
        "random"
    }

    fn mount(&self) -> &'static str {
        "/random"
    }

    fn init(&self) -> bool {
        GLOBAL_RNG.lock().seed(crate::timer::now_ticks());
        true
    }

    fn open(&self, _path: &str, fd: &mut FileDescriptor) -> FsResult {
        fd.id = crate::files::reserve_fd_id();
        // An endless stream; size only bounds a single clamped read
        fd.size = u64::MAX;
        FsResult::Success
    }

    fn read(&self, _fd: &mut FileDescriptor, buf: &mut [u8], _offset: u64) -> usize {
        fill(buf);
        buf.len()
    }

    fn sread(&self, _path: &str, buf: &mut [u8]) -> usize {
        fill(buf);
        buf.len()
    }
}
