//! Reader/writer lock built from three semaphores
//!
//! - `write_excl` (1 unit): held by a writer for its whole critical
//!   section, and briefly by each reader while it is admitted.
//! - `reader_active` (1 unit): held while at least one reader is inside.
//!   The first reader in takes it, the last one out gives it back.
//! - `read_slots` (`max_readers` units): one per reader inside.
//!
//! A writer holding `write_excl` stops new readers at the door, then waits
//! on `reader_active` for the ones already inside to leave.

use log::warn;

use super::sem::Semaphore;
use crate::arch::{Arch, IrqLock};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::thread::ThreadId;
use crate::time::Timeout;

struct Owner {
    writer: Option<ThreadId>,
    destroyed: bool,
}

/// Reader/writer lock
pub struct RwLock {
    write_excl: Semaphore,
    reader_active: Semaphore,
    read_slots: Semaphore,
    max_readers: u32,
    owner: IrqLock<Owner>,
}

impl RwLock {
    /// Lock admitting up to `config.rwlock_max_readers` readers
    pub fn new<A: Arch>(k: &Kernel<A>) -> Result<Self> {
        Self::with_max_readers(k, k.config().rwlock_max_readers)
    }

    /// Lock admitting up to `max_readers` concurrent readers
    pub fn with_max_readers<A: Arch>(k: &Kernel<A>, max_readers: u32) -> Result<Self> {
        if max_readers == 0 || max_readers == u32::MAX {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            write_excl: Semaphore::new(k, 1, 1)?,
            reader_active: Semaphore::new(k, 1, 1)?,
            read_slots: Semaphore::new(k, max_readers, max_readers + 1)?,
            max_readers,
            owner: IrqLock::new(Owner {
                writer: None,
                destroyed: false,
            }),
        })
    }

    fn check<A: Arch>(&self, k: &Kernel<A>) -> Result<()> {
        if self.owner.lock(k.arch()).destroyed {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    /// Acquire read access, waiting up to `timeout` for a writer to finish
    pub fn rdlock_timeout<A: Arch>(&self, k: &Kernel<A>, timeout: Timeout) -> Result<()> {
        self.check(k)?;
        self.write_excl.take(k, timeout)?;

        let first = match self.reader_active.take(k, Timeout::NoWait) {
            Ok(()) => true,
            Err(KernelError::Busy) => false,
            Err(e) => {
                self.write_excl.give(k);
                return Err(e);
            }
        };
        if self.read_slots.take(k, Timeout::NoWait).is_err() {
            if first {
                self.reader_active.give(k);
            }
            self.write_excl.give(k);
            return Err(KernelError::Busy);
        }

        self.write_excl.give(k);
        Ok(())
    }

    /// Acquire write access, waiting up to `timeout` for the lock to drain
    pub fn wrlock_timeout<A: Arch>(&self, k: &Kernel<A>, timeout: Timeout) -> Result<()> {
        self.check(k)?;
        self.write_excl.take(k, timeout)?;
        if let Err(e) = self.reader_active.take(k, timeout) {
            self.write_excl.give(k);
            return Err(e);
        }
        let me = k.current();
        self.owner.lock(k.arch()).writer = Some(me);
        Ok(())
    }

    pub fn rdlock<A: Arch>(&self, k: &Kernel<A>) -> Result<()> {
        self.rdlock_timeout(k, Timeout::Forever)
    }

    pub fn tryrdlock<A: Arch>(&self, k: &Kernel<A>) -> Result<()> {
        self.rdlock_timeout(k, Timeout::NoWait)
    }

    pub fn timedrdlock<A: Arch>(&self, k: &Kernel<A>, ticks: u32) -> Result<()> {
        self.rdlock_timeout(k, Timeout::Ticks(ticks))
    }

    pub fn wrlock<A: Arch>(&self, k: &Kernel<A>) -> Result<()> {
        self.wrlock_timeout(k, Timeout::Forever)
    }

    pub fn trywrlock<A: Arch>(&self, k: &Kernel<A>) -> Result<()> {
        self.wrlock_timeout(k, Timeout::NoWait)
    }

    pub fn timedwrlock<A: Arch>(&self, k: &Kernel<A>, ticks: u32) -> Result<()> {
        self.wrlock_timeout(k, Timeout::Ticks(ticks))
    }

    /// Release whatever access the caller holds
    pub fn unlock<A: Arch>(&self, k: &Kernel<A>) -> Result<()> {
        let me = k.current();
        let mut owner = self.owner.lock(k.arch());
        if owner.destroyed {
            return Err(KernelError::InvalidArgument);
        }
        if owner.writer.is_some() && owner.writer == Some(me) {
            owner.writer = None;
            drop(owner);
            self.reader_active.give(k);
            self.write_excl.give(k);
            return Ok(());
        }
        drop(owner);

        if self.read_slots.count(k) < self.max_readers {
            self.read_slots.give(k);
            if self.read_slots.count(k) == self.max_readers {
                self.reader_active.give(k);
            }
            Ok(())
        } else {
            warn!("unlock of rwlock not held by {}", me);
            Err(KernelError::InvalidArgument)
        }
    }

    /// Retire the lock; every later call fails with `InvalidArgument`
    ///
    /// Fails with `Busy` while a writer holds it.
    pub fn destroy<A: Arch>(&self, k: &Kernel<A>) -> Result<()> {
        let mut owner = self.owner.lock(k.arch());
        if owner.destroyed {
            return Err(KernelError::InvalidArgument);
        }
        if owner.writer.is_some() {
            return Err(KernelError::Busy);
        }
        owner.destroyed = true;
        Ok(())
    }

    /// Thread holding write access
    pub fn writer<A: Arch>(&self, k: &Kernel<A>) -> Option<ThreadId> {
        self.owner.lock(k.arch()).writer
    }

    /// Readers currently inside
    pub fn readers<A: Arch>(&self, k: &Kernel<A>) -> u32 {
        self.max_readers.saturating_sub(self.read_slots.count(k))
    }

    /// Give the semaphores' wait queues back to the kernel
    pub fn cleanup<A: Arch>(self, k: &Kernel<A>) {
        self.write_excl.cleanup(k);
        self.reader_active.cleanup(k);
        self.read_slots.cleanup(k);
    }
}
