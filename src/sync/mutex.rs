//! Non-recursive mutex built on a [`Spinlock`]-protected owner field plus a
//! `Synchronization` event.
//!
//! Grounded on `original_source/kernel/core/ms/mutex.c`.

use crate::status::Status;
use crate::sync::event::{Event, EventKind};
use crate::sync::spinlock::Spinlock;

pub struct Mutex {
	owner_tid: Spinlock<u32>,
	event: Event,
}

const NO_OWNER: u32 = 0;

impl Mutex {
	pub const fn new() -> Self {
		Mutex {
			owner_tid: Spinlock::new(NO_OWNER),
			event: Event::new(EventKind::Synchronization),
		}
	}

	/// Blocks, if necessary, until the mutex is owned by the caller.
	pub fn acquire(&self, tid: u32) {
		loop {
			{
				let mut owner = self.owner_tid.lock();
				if *owner == NO_OWNER {
					*owner = tid;
					return;
				}
			}
			self.event.wait();
		}
	}

	/// Releases the mutex. Returns [`Status::MutexNotOwned`] if the caller
	/// did not hold it.
	pub fn release(&self, tid: u32) -> Result<(), Status> {
		{
			let mut owner = self.owner_tid.lock();
			if *owner != tid {
				return Err(Status::MutexNotOwned);
			}
			*owner = NO_OWNER;
		}
		self.event.set();
		Ok(())
	}

	pub fn owner(&self) -> Option<u32> {
		let owner = *self.owner_tid.lock();
		(owner != NO_OWNER).then_some(owner)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn single_thread_acquire_release_roundtrips() {
		let m = Mutex::new();
		m.acquire(1);
		assert_eq!(m.owner(), Some(1));
		assert!(m.release(1).is_ok());
		assert_eq!(m.owner(), None);
	}

	#[test]
	fn release_by_non_owner_fails() {
		let m = Mutex::new();
		m.acquire(1);
		assert_eq!(m.release(2), Err(Status::MutexNotOwned));
	}
}
