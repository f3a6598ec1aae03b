//! # Interrupt-Safe Locking
//!
//! State shared between the submission path and the DMA completion interrupt
//! must be locked with local interrupts masked, otherwise the interrupt
//! handler can spin forever on a lock held by the code it interrupted.
//!
//! On bare-metal ARM targets the guard saves and masks the IRQ bit; on hosted
//! targets (tests, simulation) it is a no-op.

use core::fmt;
use core::ops::{Deref, DerefMut};

// =============================================================================
// ARCH HOOKS
// =============================================================================

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod arch {
    use core::arch::asm;

    #[inline]
    pub fn save_and_disable() -> usize {
        let daif: u64;
        unsafe {
            asm!("mrs {}, DAIF", out(reg) daif, options(nomem, nostack, preserves_flags));
            asm!("msr daifset, #2", options(nomem, nostack, preserves_flags));
        }
        daif as usize
    }

    #[inline]
    pub fn restore(saved: usize) {
        unsafe {
            asm!("msr DAIF, {}", in(reg) saved as u64, options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod arch {
    use core::arch::asm;

    #[inline]
    pub fn save_and_disable() -> usize {
        let cpsr: u32;
        unsafe {
            asm!("mrs {}, cpsr", out(reg) cpsr, options(nomem, nostack, preserves_flags));
            asm!("cpsid i", options(nomem, nostack, preserves_flags));
        }
        cpsr as usize
    }

    #[inline]
    pub fn restore(saved: usize) {
        unsafe {
            asm!("msr cpsr_c, {}", in(reg) saved as u32, options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(not(all(any(target_arch = "aarch64", target_arch = "arm"), target_os = "none")))]
mod arch {
    #[inline]
    pub fn save_and_disable() -> usize {
        0
    }

    #[inline]
    pub fn restore(_saved: usize) {}
}

// =============================================================================
// INTERRUPT GUARD
// =============================================================================

/// Masks local interrupts until dropped, then restores the previous state
pub struct InterruptGuard {
    saved: usize,
}

impl InterruptGuard {
    /// Create a new interrupt guard (disables interrupts)
    pub fn new() -> Self {
        Self {
            saved: arch::save_and_disable(),
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        arch::restore(self.saved);
    }
}

impl fmt::Debug for InterruptGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptGuard").finish_non_exhaustive()
    }
}

// =============================================================================
// IRQ MUTEX
// =============================================================================

/// Spin lock that masks local interrupts while held
pub struct IrqMutex<T> {
    inner: spin::Mutex<T>,
}

/// Guard returned by [`IrqMutex::lock`]
///
/// Field order matters: the lock is released before interrupts are restored.
pub struct IrqMutexGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _irq: InterruptGuard,
}

impl<T> IrqMutex<T> {
    /// Create a new lock
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Mask interrupts and acquire the lock
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irq = InterruptGuard::new();
        IrqMutexGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }

    /// Try to acquire the lock without spinning
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let irq = InterruptGuard::new();
        self.inner.try_lock().map(|guard| IrqMutexGuard { guard, _irq: irq })
    }

    /// Consume the lock, returning the value
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    /// Mutable access without locking (exclusive borrow proves no contention)
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for IrqMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for IrqMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqMutex")
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}

impl<T: fmt::Debug> fmt::Debug for IrqMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqMutexGuard")
            .field("value", &*self.guard)
            .finish()
    }
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_and_mutate() {
        let lock = IrqMutex::new(1u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn test_try_lock_contended() {
        let lock = IrqMutex::new(());
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(held);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_guard_debug_shows_value() {
        let lock = IrqMutex::new(5u32);
        let guard = lock.lock();
        assert_eq!(format!("{:?}", guard), "IrqMutexGuard { value: 5 }");
    }
}
