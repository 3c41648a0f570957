//! Test fixtures for kernels running on the host simulator
//!
//! Thread entries are plain `fn`s, so they receive kernels and primitives
//! as addresses of leaked values, exactly like a C entry receives opaque
//! arguments.

use std::boxed::Box;
use std::sync::Mutex;
use std::vec;
use std::vec::Vec;

use crate::arch::sim::SimArch;
use crate::config::KernelConfig;
use crate::kernel::Kernel;

const STACK_SIZE: usize = 1024;

pub type SimKernel = Kernel<SimArch>;

pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

pub fn kernel() -> &'static SimKernel {
    kernel_with(KernelConfig::default())
}

pub fn kernel_with(config: KernelConfig) -> &'static SimKernel {
    leak(Kernel::new(SimArch::new(), config))
}

pub fn stack() -> &'static mut [u8] {
    buffer(STACK_SIZE)
}

pub fn buffer(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

pub fn addr<T>(value: &'static T) -> usize {
    value as *const T as usize
}

pub fn at<T: 'static>(addr: usize) -> &'static T {
    // SAFETY: only ever called on addresses produced by `addr` on leaked values.
    unsafe { &*(addr as *const T) }
}

pub fn kernel_at(addr: usize) -> &'static SimKernel {
    at(addr)
}

/// Event log shared between simulated threads
#[derive(Default)]
pub struct Recorder(Mutex<Vec<u32>>);

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: u32) {
        self.0.lock().unwrap().push(value);
    }

    pub fn take(&self) -> Vec<u32> {
        core::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }
}
