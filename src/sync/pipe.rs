//! Pipe: byte-stream IPC
//!
//! `read` and `write` never block; they move as many bytes as the ring
//! allows and report the count. Threads that want to wait for data or
//! space use [`Pipe::wait_readable`] / [`Pipe::wait_writable`] and loop.
//!
//! Closing is one-way: writes fail immediately, reads drain what is left
//! and then fail with `Closed`.

use super::ring::ByteRing;
use crate::arch::{Arch, IrqGuard, IrqLock};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::sched::WaitQueueId;
use crate::thread::{WaitSlot, Wake};
use crate::time::Timeout;

struct PipeState<'a> {
    ring: ByteRing<'a>,
    closed: bool,
}

/// Pipe over a borrowed buffer
pub struct Pipe<'a> {
    readers: WaitQueueId,
    writers: WaitQueueId,
    state: IrqLock<PipeState<'a>>,
}

impl<'a> Pipe<'a> {
    /// Open pipe whose capacity is `buffer.len()`
    pub fn new<A: Arch>(k: &Kernel<A>, buffer: &'a mut [u8]) -> Result<Self> {
        if buffer.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            readers: k.create_wait_queue()?,
            writers: k.create_wait_queue()?,
            state: IrqLock::new(PipeState {
                ring: ByteRing::new(buffer),
                closed: false,
            }),
        })
    }

    /// Copy as much of `data` as fits
    pub fn write<A: Arch>(&self, k: &Kernel<A>, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock(k.arch());
        if state.closed {
            return Err(KernelError::Closed);
        }
        let n = state.ring.push(data);
        let woken = if n > 0 {
            k.wake_all(self.readers, Wake::Ready(WaitSlot::Empty))
        } else {
            0
        };
        drop(state);
        if woken > 0 {
            k.reschedule();
        }
        Ok(n)
    }

    /// Copy up to `out.len()` unread bytes
    ///
    /// Returns `Closed` once the pipe is closed and drained.
    pub fn read<A: Arch>(&self, k: &Kernel<A>, out: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock(k.arch());
        if state.closed && state.ring.is_empty() {
            return Err(KernelError::Closed);
        }
        let n = state.ring.pop(out);
        let woken = if n > 0 {
            k.wake_all(self.writers, Wake::Ready(WaitSlot::Empty))
        } else {
            0
        };
        drop(state);
        if woken > 0 {
            k.reschedule();
        }
        Ok(n)
    }

    /// Discard unread bytes; the closed flag is kept
    ///
    /// Only valid while no transfer is in progress.
    pub fn reset<A: Arch>(&self, k: &Kernel<A>) {
        let mut state = self.state.lock(k.arch());
        state.ring.clear();
        let woken = if state.closed {
            0
        } else {
            k.wake_all(self.writers, Wake::Ready(WaitSlot::Empty))
        };
        drop(state);
        if woken > 0 {
            k.reschedule();
        }
    }

    /// Close the pipe and release every waiter
    pub fn close<A: Arch>(&self, k: &Kernel<A>) {
        let mut state = self.state.lock(k.arch());
        state.closed = true;
        let woken = k.wake_all(self.readers, Wake::Cancelled)
            + k.wake_all(self.writers, Wake::Cancelled);
        drop(state);
        if woken > 0 {
            k.reschedule();
        }
    }

    /// Wait until at least one byte can be read
    ///
    /// Fails with `Closed` on a closed, drained pipe (including when it is
    /// closed during the wait).
    pub fn wait_readable<A: Arch>(&self, k: &Kernel<A>, timeout: Timeout) -> Result<()> {
        let state = self.state.lock(k.arch());
        if !state.ring.is_empty() {
            return Ok(());
        }
        if state.closed {
            return Err(KernelError::Closed);
        }
        self.wait(k, state, self.readers, timeout)
    }

    /// Wait until at least one byte can be written
    pub fn wait_writable<A: Arch>(&self, k: &Kernel<A>, timeout: Timeout) -> Result<()> {
        let state = self.state.lock(k.arch());
        if state.closed {
            return Err(KernelError::Closed);
        }
        if !state.ring.is_full() {
            return Ok(());
        }
        self.wait(k, state, self.writers, timeout)
    }

    fn wait<A: Arch>(
        &self,
        k: &Kernel<A>,
        state: IrqGuard<'_, A, PipeState<'a>>,
        wq: WaitQueueId,
        timeout: Timeout,
    ) -> Result<()> {
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        k.pend_current(Some(wq), timeout, WaitSlot::Empty);
        let key = state.into_key();
        match k.swap(key).into_result() {
            Ok(_) => Ok(()),
            Err(KernelError::Cancelled) => Err(KernelError::Closed),
            Err(e) => Err(e),
        }
    }

    /// Unread bytes
    pub fn read_avail<A: Arch>(&self, k: &Kernel<A>) -> usize {
        self.state.lock(k.arch()).ring.len()
    }

    /// Free bytes
    pub fn write_avail<A: Arch>(&self, k: &Kernel<A>) -> usize {
        self.state.lock(k.arch()).ring.free()
    }

    pub fn capacity<A: Arch>(&self, k: &Kernel<A>) -> usize {
        self.state.lock(k.arch()).ring.capacity()
    }

    pub fn is_closed<A: Arch>(&self, k: &Kernel<A>) -> bool {
        self.state.lock(k.arch()).closed
    }

    /// Give both wait queues back to the kernel
    pub fn cleanup<A: Arch>(self, k: &Kernel<A>) {
        debug_assert_eq!(k.waiters(self.readers) + k.waiters(self.writers), 0);
        k.release_wait_queue(self.readers);
        k.release_wait_queue(self.writers);
    }
}
