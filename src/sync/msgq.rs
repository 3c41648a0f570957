//! Message queue
//!
//! Fixed-size messages in a caller-supplied ring. Blocked putters and
//! getters share one wait queue: a getter only waits while the queue is
//! empty and a putter only while it is full, so the two never wait at the
//! same time.
//!
//! Both directions hand data straight to a blocked peer through its
//! [`WaitSlot`]: a put delivers into a waiting getter, and a get moves the
//! longest-blocked putter's message into the slot it just freed. Delivery
//! order is FIFO across both paths.

use alloc::vec::Vec;

use super::ring::ByteRing;
use crate::arch::{Arch, IrqLock};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::sched::WaitQueueId;
use crate::thread::{WaitSlot, Wake};
use crate::time::Timeout;

/// Queue geometry and fill level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAttrs {
    /// Bytes per message
    pub msg_size: usize,
    /// Capacity in messages
    pub max_msgs: u32,
    /// Messages currently buffered
    pub used_msgs: u32,
}

/// Message queue over a borrowed buffer
pub struct MessageQueue<'a> {
    wq: WaitQueueId,
    msg_size: usize,
    max_msgs: u32,
    ring: IrqLock<ByteRing<'a>>,
}

impl<'a> MessageQueue<'a> {
    /// Queue of `max_msgs` messages of `msg_size` bytes in `buffer`
    pub fn new<A: Arch>(
        k: &Kernel<A>,
        buffer: &'a mut [u8],
        msg_size: usize,
        max_msgs: u32,
    ) -> Result<Self> {
        let bytes = msg_size
            .checked_mul(max_msgs as usize)
            .ok_or(KernelError::InvalidArgument)?;
        if msg_size == 0 || max_msgs == 0 || buffer.len() < bytes {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            wq: k.create_wait_queue()?,
            msg_size,
            max_msgs,
            ring: IrqLock::new(ByteRing::new(&mut buffer[..bytes])),
        })
    }

    fn used(&self, ring: &ByteRing<'_>) -> u32 {
        (ring.len() / self.msg_size) as u32
    }

    /// Append `msg`, waiting up to `timeout` for room
    ///
    /// `msg` must be exactly `msg_size` bytes. A full queue with no wait
    /// fails with `Exhausted`.
    pub fn put<A: Arch>(&self, k: &Kernel<A>, msg: &[u8], timeout: Timeout) -> Result<()> {
        if msg.len() != self.msg_size {
            return Err(KernelError::InvalidArgument);
        }
        let mut ring = self.ring.lock(k.arch());
        if self.used(&ring) < self.max_msgs {
            match k.unpend_first(self.wq) {
                Some(getter) => {
                    k.ready_thread(getter, Wake::Ready(WaitSlot::Delivered(msg.to_vec())));
                    drop(ring);
                    k.reschedule();
                }
                None => {
                    ring.push(msg);
                }
            }
            return Ok(());
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Exhausted);
        }
        k.pend_current(Some(self.wq), timeout, WaitSlot::Outgoing(msg.to_vec()));
        let key = ring.into_key();
        k.swap(key).into_result().map(|_| ())
    }

    /// Remove the oldest message into `out`, waiting up to `timeout`
    ///
    /// `out` must hold at least `msg_size` bytes. An empty queue with no
    /// wait fails with `WouldBlock`.
    pub fn get<A: Arch>(&self, k: &Kernel<A>, out: &mut [u8], timeout: Timeout) -> Result<()> {
        if out.len() < self.msg_size {
            return Err(KernelError::InvalidArgument);
        }
        let out = &mut out[..self.msg_size];
        let mut ring = self.ring.lock(k.arch());
        if !ring.is_empty() {
            ring.pop(out);
            if let Some(putter) = k.unpend_first(self.wq) {
                if let WaitSlot::Outgoing(msg) = k.take_slot(putter) {
                    ring.push(&msg);
                }
                k.ready_thread(putter, Wake::Ready(WaitSlot::Empty));
                drop(ring);
                k.reschedule();
            }
            return Ok(());
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        k.pend_current(Some(self.wq), timeout, WaitSlot::Incoming);
        let key = ring.into_key();
        match k.swap(key).into_result()? {
            WaitSlot::Delivered(msg) => {
                out.copy_from_slice(&msg);
                Ok(())
            }
            // A getter is only woken with a delivery or a failure.
            _ => Err(KernelError::Cancelled),
        }
    }

    /// Copy the oldest message without removing it
    pub fn peek<A: Arch>(&self, k: &Kernel<A>, out: &mut [u8]) -> Result<()> {
        self.peek_at(k, 0, out)
    }

    /// Copy the `index`-th oldest message without removing it
    pub fn peek_at<A: Arch>(&self, k: &Kernel<A>, index: u32, out: &mut [u8]) -> Result<()> {
        if out.len() < self.msg_size {
            return Err(KernelError::InvalidArgument);
        }
        let ring = self.ring.lock(k.arch());
        if index >= self.used(&ring) {
            return Err(KernelError::WouldBlock);
        }
        ring.peek_at(index as usize * self.msg_size, &mut out[..self.msg_size]);
        Ok(())
    }

    /// Drop every buffered message and fail every blocked putter
    pub fn purge<A: Arch>(&self, k: &Kernel<A>) {
        let mut ring = self.ring.lock(k.arch());
        ring.clear();
        let woken = k.wake_all(self.wq, Wake::Cancelled);
        drop(ring);
        if woken > 0 {
            k.reschedule();
        }
    }

    /// Messages buffered
    pub fn num_used<A: Arch>(&self, k: &Kernel<A>) -> u32 {
        self.used(&self.ring.lock(k.arch()))
    }

    /// Free message slots
    pub fn num_free<A: Arch>(&self, k: &Kernel<A>) -> u32 {
        self.max_msgs - self.num_used(k)
    }

    pub fn attrs<A: Arch>(&self, k: &Kernel<A>) -> QueueAttrs {
        QueueAttrs {
            msg_size: self.msg_size,
            max_msgs: self.max_msgs,
            used_msgs: self.num_used(k),
        }
    }

    /// Threads blocked in `put` or `get`
    pub fn waiters<A: Arch>(&self, k: &Kernel<A>) -> usize {
        k.waiters(self.wq)
    }

    /// Buffered messages, oldest first
    pub fn snapshot<A: Arch>(&self, k: &Kernel<A>) -> Vec<Vec<u8>> {
        let ring = self.ring.lock(k.arch());
        (0..self.used(&ring))
            .map(|i| {
                let mut msg = alloc::vec![0u8; self.msg_size];
                ring.peek_at(i as usize * self.msg_size, &mut msg);
                msg
            })
            .collect()
    }

    /// Give the wait queue back to the kernel
    pub fn cleanup<A: Arch>(self, k: &Kernel<A>) {
        debug_assert_eq!(k.waiters(self.wq), 0);
        k.release_wait_queue(self.wq);
    }
}
