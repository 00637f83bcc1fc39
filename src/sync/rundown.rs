//! Rundown protection: lets a resource be used from many concurrent call
//! sites while still supporting a clean, waitable teardown.
//!
//! Grounded on `original_source/kernel/core/ms/rundown.c`.

use core::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::Backoff;

const TEARDOWN_BIT: u64 = 1 << 63;
const COUNT_MASK: u64 = TEARDOWN_BIT - 1;

pub struct RundownRef {
	word: AtomicU64,
}

impl RundownRef {
	pub const fn new() -> Self {
		RundownRef {
			word: AtomicU64::new(0),
		}
	}

	/// Acquires a reference. Fails once teardown has begun.
	pub fn acquire(&self) -> bool {
		loop {
			let cur = self.word.load(Ordering::Relaxed);
			if cur & TEARDOWN_BIT != 0 {
				return false;
			}
			if self
				.word
				.compare_exchange(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
			{
				return true;
			}
		}
	}

	pub fn release(&self) {
		let prev = self.word.fetch_sub(1, Ordering::Release);
		debug_assert!(prev & COUNT_MASK != 0, "rundown reference underflow");
	}

	/// Marks teardown as started (idempotent: subsequent calls are no-ops
	/// for the teardown bit itself) and spins until every outstanding
	/// reference has been released.
	pub fn wait_for_release(&self) {
		self.word.fetch_or(TEARDOWN_BIT, Ordering::AcqRel);
		let backoff = Backoff::new();
		while self.word.load(Ordering::Acquire) & COUNT_MASK != 0 {
			backoff.snooze();
		}
	}

	pub fn is_tearing_down(&self) -> bool {
		self.word.load(Ordering::Relaxed) & TEARDOWN_BIT != 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn acquire_fails_after_teardown_started() {
		let r = RundownRef::new();
		assert!(r.acquire());
		r.release();
		r.wait_for_release();
		assert!(!r.acquire());
	}

	#[test]
	fn wait_for_release_blocks_until_zero() {
		let r = RundownRef::new();
		assert!(r.acquire());
		assert!(r.acquire());
		r.release();
		r.release();
		r.wait_for_release();
		assert!(r.is_tearing_down());
	}
}
