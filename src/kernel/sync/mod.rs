// Copyright 2025 The Trek Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel synchronization primitives
//!
//! Blocking locks are `spin` mutexes; the scheduler integration a real port
//! would add lives behind the same guard-based API, so callers are agnostic.
//! [`IrqSpinlock`] marks critical sections that must also be entered with
//! interrupts masked (the arch layer masks around `lock()` on real
//! hardware); it is the only lock in the VM core that may be taken from
//! interrupt context.

use core::ops::{Deref, DerefMut};

pub use spin::{Mutex, MutexGuard};

/// Spinlock for data shared with interrupt-disabled contexts.
///
/// Holders must not block. Only IRQ-safe read paths (the physical-to-kernel
/// address table) use this.
pub struct IrqSpinlock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::Mutex::new(data),
        }
    }

    /// Acquire the lock, spinning until it becomes available.
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        IrqSpinlockGuard {
            guard: self.inner.lock(),
        }
    }
}

/// RAII guard for an [`IrqSpinlock`]
pub struct IrqSpinlockGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
}

impl<'a, T> Deref for IrqSpinlockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for IrqSpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_spinlock() {
        let lock = IrqSpinlock::new(5usize);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }
}
