//! Spinlocks coupled to IRQL.
//!
//! A [`Spinlock`] raises the current CPU's IRQL to `DISPATCH_LEVEL` before
//! spinning and restores the prior level on release, so a DPC running on
//! the same CPU can never re-enter and deadlock against itself. The
//! underlying word is a simple ticket lock, grounded on the teacher's
//! `synch::spinlock::Spinlock` (`crossbeam_utils::Backoff`/`CachePadded`).
//!
//! [`RawSpinlock`] is the IRQL-agnostic primitive used internally by code
//! that is already guaranteed to run at `DISPATCH_LEVEL` (the DPC queue
//! itself), to avoid raising IRQL a caller has already raised.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::irql::{self, Irql};

pub struct RawSpinlock {
	queue: CachePadded<AtomicUsize>,
	dequeue: CachePadded<AtomicUsize>,
}

impl RawSpinlock {
	pub const fn new() -> Self {
		RawSpinlock {
			queue: CachePadded::new(AtomicUsize::new(0)),
			dequeue: CachePadded::new(AtomicUsize::new(0)),
		}
	}

	#[inline]
	pub fn raw_acquire(&self) {
		let ticket = self.queue.fetch_add(1, Ordering::Relaxed);
		let backoff = Backoff::new();
		while self.dequeue.load(Ordering::Acquire) != ticket {
			backoff.snooze();
		}
	}

	#[inline]
	pub fn raw_release(&self) {
		self.dequeue.fetch_add(1, Ordering::Release);
	}

	#[inline]
	pub fn try_raw_acquire(&self) -> bool {
		let current = self.dequeue.load(Ordering::Relaxed);
		self.queue
			.compare_exchange(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
	}
}

impl Default for RawSpinlock {
	fn default() -> Self {
		Self::new()
	}
}

/// A mutual-exclusion lock that also owns the protected value, matching
/// `std::sync::Mutex`'s ergonomics but backed by [`RawSpinlock`] and IRQL
/// raise/lower instead of a blocking futex.
pub struct Spinlock<T> {
	raw: RawSpinlock,
	data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

pub struct SpinlockGuard<'a, T> {
	lock: &'a Spinlock<T>,
	old_irql: Irql,
}

impl<T> Spinlock<T> {
	pub const fn new(data: T) -> Self {
		Spinlock {
			raw: RawSpinlock::new(),
			data: UnsafeCell::new(data),
		}
	}

	/// Acquires the lock, raising IRQL to `DISPATCH_LEVEL` for the duration
	/// of the critical section. Bugchecks (via `irql::raise`) if the caller
	/// was already above `DISPATCH_LEVEL`... actually raising to a level
	/// below current is what bugchecks; raising to DISPATCH from HIGH would.
	/// Callers that already hold a spinlock at DISPATCH should use the
	/// `_at_dispatch` variants below instead of nesting full acquires.
	pub fn lock(&self) -> SpinlockGuard<'_, T> {
		let old_irql = irql::raise(irql::DISPATCH_LEVEL);
		self.raw.raw_acquire();
		SpinlockGuard {
			lock: self,
			old_irql,
		}
	}

	/// Acquires the lock without touching IRQL. Caller must already be at
	/// `DISPATCH_LEVEL` (e.g. inside a DPC routine).
	pub fn lock_at_dispatch(&self) -> RawSpinlockGuard<'_, T> {
		self.raw.raw_acquire();
		RawSpinlockGuard { lock: self }
	}
}

impl<'a, T> Deref for SpinlockGuard<'a, T> {
	type Target = T;
	fn deref(&self) -> &T {
		unsafe { &*self.lock.data.get() }
	}
}

impl<'a, T> DerefMut for SpinlockGuard<'a, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.lock.data.get() }
	}
}

impl<'a, T> Drop for SpinlockGuard<'a, T> {
	fn drop(&mut self) {
		self.lock.raw.raw_release();
		irql::lower(self.old_irql);
	}
}

pub struct RawSpinlockGuard<'a, T> {
	lock: &'a Spinlock<T>,
}

impl<'a, T> Deref for RawSpinlockGuard<'a, T> {
	type Target = T;
	fn deref(&self) -> &T {
		unsafe { &*self.lock.data.get() }
	}
}

impl<'a, T> DerefMut for RawSpinlockGuard<'a, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.lock.data.get() }
	}
}

impl<'a, T> Drop for RawSpinlockGuard<'a, T> {
	fn drop(&mut self) {
		self.lock.raw.raw_release();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn raw_ticket_lock_serializes() {
		let lock = RawSpinlock::new();
		lock.raw_acquire();
		assert!(!lock.try_raw_acquire());
		lock.raw_release();
		assert!(lock.try_raw_acquire());
		lock.raw_release();
	}
}
