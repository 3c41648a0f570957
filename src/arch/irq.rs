//! Spin lock held with interrupts masked
//!
//! Every kernel lock an interrupt handler can reach is an [`IrqLock`]: the
//! holder masks interrupts before spinning, so on a single core a handler
//! never spins on a lock whose holder cannot run again.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use super::{Arch, IrqKey};

/// Spin lock that masks interrupts for as long as it is held
pub struct IrqLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Exclusive access without locking; the borrow proves nobody else holds it
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Mask interrupts through `arch`, then take the lock
    pub fn lock<'a, A: Arch>(&'a self, arch: &'a A) -> IrqGuard<'a, A, T> {
        let key = arch.irq_lock();
        IrqGuard {
            arch,
            key,
            guard: ManuallyDrop::new(self.inner.lock()),
        }
    }
}

impl<T: Default> Default for IrqLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// A held [`IrqLock`]
///
/// Dropping it releases the lock first and restores interrupts second.
pub struct IrqGuard<'a, A: Arch, T> {
    arch: &'a A,
    key: IrqKey,
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
}

impl<A: Arch, T> IrqGuard<'_, A, T> {
    /// Release the lock but leave interrupts masked
    ///
    /// The key goes to `Kernel::swap`, which restores it once the thread
    /// runs again.
    pub fn into_key(self) -> IrqKey {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the guard is released once.
        unsafe { ManuallyDrop::drop(&mut this.guard) };
        this.key
    }
}

impl<A: Arch, T> Deref for IrqGuard<'_, A, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<A: Arch, T> DerefMut for IrqGuard<'_, A, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<A: Arch, T> Drop for IrqGuard<'_, A, T> {
    fn drop(&mut self) {
        // SAFETY: `into_key` forgets `self`, so this is the only release.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.arch.irq_unlock(self.key);
    }
}
