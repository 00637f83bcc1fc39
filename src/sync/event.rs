//! Notification and synchronization events.
//!
//! Grounded on `original_source/kernel/core/ms/events.c`. A `Synchronization`
//! event wakes exactly one waiter per `set`; a `Notification` event wakes
//! every currently-queued waiter and stays signaled until `reset`.

use alloc::collections::VecDeque;

use crate::irql;
use crate::sched::thread::ThreadRef;
use crate::sync::spinlock::Spinlock;

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum EventKind {
	Notification,
	Synchronization,
}

struct Inner {
	signaled: bool,
	waiters: VecDeque<ThreadRef>,
}

pub struct Event {
	kind: EventKind,
	inner: Spinlock<Inner>,
}

impl Event {
	pub const fn new(kind: EventKind) -> Self {
		Event {
			kind,
			inner: Spinlock::new(Inner {
				signaled: false,
				waiters: VecDeque::new(),
			}),
		}
	}

	/// Signals the event. `Synchronization` events wake exactly one waiter
	/// (or latch `signaled` if none are queued); `Notification` events wake
	/// every waiter queued at the moment of the call.
	pub fn set(&self) {
		let mut to_wake: VecDeque<ThreadRef> = VecDeque::new();
		{
			let mut inner = self.inner.lock();
			match self.kind {
				EventKind::Synchronization => {
					if let Some(waiter) = inner.waiters.pop_front() {
						to_wake.push_back(waiter);
					} else {
						inner.signaled = true;
					}
				}
				EventKind::Notification => {
					inner.signaled = true;
					core::mem::swap(&mut inner.waiters, &mut to_wake);
				}
			}
		}
		for waiter in to_wake {
			crate::sched::wake_thread(waiter);
		}
	}

	/// Clears `signaled`. No-op for a `Synchronization` event that is
	/// currently unsignaled.
	pub fn reset(&self) {
		self.inner.lock().signaled = false;
	}

	/// Blocks the calling thread until the event is signaled. Must be
	/// called at IRQL below `DISPATCH_LEVEL`.
	pub fn wait(&self) {
		irql::assert_suspendable();
		let this_thread = crate::sched::current_thread_ref();
		{
			let mut inner = self.inner.lock();
			if inner.signaled {
				if self.kind == EventKind::Synchronization {
					inner.signaled = false;
				}
				return;
			}
			inner.waiters.push_back(this_thread);
		}
		crate::sched::block_current_thread_on_event(self);
	}

	/// Removes `thread` from the wait queue without waking it, used when a
	/// thread is being terminated while blocked so its wait-block is never
	/// touched again after the thread object is torn down.
	pub(crate) fn cancel_wait(&self, thread: ThreadRef) {
		let mut inner = self.inner.lock();
		inner.waiters.retain(|w| *w != thread);
	}

	pub fn is_signaled(&self) -> bool {
		self.inner.lock().signaled
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn notification_event_latches_until_reset() {
		let ev = Event::new(EventKind::Notification);
		ev.set();
		assert!(ev.is_signaled());
		ev.reset();
		assert!(!ev.is_signaled());
	}
}
