//! Counting semaphore
//!
//! `give` hands its unit straight to the longest waiter when there is one,
//! so a woken taker never has to re-check the count.

use crate::arch::{Arch, IrqLock};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::sched::WaitQueueId;
use crate::thread::{WaitSlot, Wake};
use crate::time::Timeout;

struct Count {
    value: u32,
    limit: u32,
}

/// Counting semaphore bound to one kernel
pub struct Semaphore {
    wq: WaitQueueId,
    count: IrqLock<Count>,
}

impl Semaphore {
    /// Semaphore holding `initial` units out of at most `limit`
    pub fn new<A: Arch>(k: &Kernel<A>, initial: u32, limit: u32) -> Result<Self> {
        if limit == 0 || initial > limit {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            wq: k.create_wait_queue()?,
            count: IrqLock::new(Count {
                value: initial,
                limit,
            }),
        })
    }

    /// Take one unit, waiting up to `timeout`
    ///
    /// Fails with `Busy` when no unit is available and the caller won't
    /// wait.
    pub fn take<A: Arch>(&self, k: &Kernel<A>, timeout: Timeout) -> Result<()> {
        let mut count = self.count.lock(k.arch());
        if count.value > 0 {
            count.value -= 1;
            return Ok(());
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Busy);
        }
        k.pend_current(Some(self.wq), timeout, WaitSlot::Empty);
        let key = count.into_key();
        k.swap(key).into_result().map(|_| ())
    }

    /// Release one unit
    ///
    /// A give beyond `limit` is dropped.
    pub fn give<A: Arch>(&self, k: &Kernel<A>) {
        let mut count = self.count.lock(k.arch());
        match k.unpend_first(self.wq) {
            Some(waiter) => {
                k.ready_thread(waiter, Wake::Ready(WaitSlot::Empty));
                drop(count);
                k.reschedule();
            }
            None => {
                if count.value < count.limit {
                    count.value += 1;
                }
            }
        }
    }

    /// Drop every unit and cancel every waiter
    pub fn reset<A: Arch>(&self, k: &Kernel<A>) {
        let mut count = self.count.lock(k.arch());
        count.value = 0;
        let woken = k.wake_all(self.wq, Wake::Cancelled);
        drop(count);
        if woken > 0 {
            k.reschedule();
        }
    }

    /// Units currently available
    pub fn count<A: Arch>(&self, k: &Kernel<A>) -> u32 {
        self.count.lock(k.arch()).value
    }

    /// Maximum units
    pub fn limit<A: Arch>(&self, k: &Kernel<A>) -> u32 {
        self.count.lock(k.arch()).limit
    }

    /// Threads blocked in `take`
    pub fn waiters<A: Arch>(&self, k: &Kernel<A>) -> usize {
        k.waiters(self.wq)
    }

    /// Give the wait queue back to the kernel
    ///
    /// Nobody can be waiting: every waiter borrows the semaphore.
    pub fn cleanup<A: Arch>(self, k: &Kernel<A>) {
        debug_assert_eq!(k.waiters(self.wq), 0);
        k.release_wait_queue(self.wq);
    }
}
