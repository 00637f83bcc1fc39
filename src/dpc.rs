//! Deferred Procedure Call dispatcher: short, non-blocking work retired at
//! `DISPATCH_LEVEL`.
//!
//! Grounded on `original_source/kernel/core/me/dpc.c`.

use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::irql;
use crate::percpu;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DpcPriority {
	Low,
	Medium,
	High,
}

/// Queue depth at or above which a Low/Medium priority insertion still
/// requests an immediate software interrupt instead of waiting for a
/// naturally occurring IRQL lowering.
const URGENT_DEPTH_THRESHOLD: usize = 8;

type DpcRoutine = fn(&Dpc, usize, usize, usize);

pub struct Dpc {
	next: AtomicPtr<Dpc>,
	routine: DpcRoutine,
	context: usize,
	arg1: AtomicUsize,
	arg2: AtomicUsize,
	priority: DpcPriority,
	/// Non-null while queued on some CPU's queue; used as the "already
	/// inserted" guard via compare-and-swap against NULL.
	inserted: AtomicPtr<DpcQueue>,
}

impl Dpc {
	pub const fn new(routine: DpcRoutine, context: usize, priority: DpcPriority) -> Self {
		Dpc {
			next: AtomicPtr::new(ptr::null_mut()),
			routine,
			context,
			arg1: AtomicUsize::new(0),
			arg2: AtomicUsize::new(0),
			priority,
			inserted: AtomicPtr::new(ptr::null_mut()),
		}
	}
}

pub struct DpcQueue {
	head: AtomicPtr<Dpc>,
	tail: AtomicPtr<Dpc>,
	lock: crate::sync::spinlock::RawSpinlock,
	depth: AtomicUsize,
	routine_active: AtomicBool,
	interrupt_requested: AtomicBool,
}

impl DpcQueue {
	pub const fn new() -> Self {
		DpcQueue {
			head: AtomicPtr::new(ptr::null_mut()),
			tail: AtomicPtr::new(ptr::null_mut()),
			lock: crate::sync::spinlock::RawSpinlock::new(),
			depth: AtomicUsize::new(0),
			routine_active: AtomicBool::new(false),
			interrupt_requested: AtomicBool::new(false),
		}
	}
}

/// Queues `dpc` on the current CPU's queue. Returns `false` if `dpc` was
/// already queued somewhere (idempotent enqueue).
pub fn enqueue(dpc: &'static Dpc, arg1: usize, arg2: usize) -> bool {
	let old_irql = irql::raise(irql::HIGH_LEVEL);
	let queue = &percpu::current().dpc_queue;

	let won = dpc
		.inserted
		.compare_exchange(
			ptr::null_mut(),
			queue as *const DpcQueue as *mut DpcQueue,
			Ordering::AcqRel,
			Ordering::Acquire,
		)
		.is_ok();

	if !won {
		irql::lower(old_irql);
		return false;
	}

	dpc.arg1.store(arg1, Ordering::Relaxed);
	dpc.arg2.store(arg2, Ordering::Relaxed);
	dpc.next.store(ptr::null_mut(), Ordering::Relaxed);

	queue.lock.raw_acquire();
	let dpc_ptr = dpc as *const Dpc as *mut Dpc;
	if dpc.priority == DpcPriority::High {
		let old_head = queue.head.load(Ordering::Relaxed);
		dpc.next.store(old_head, Ordering::Relaxed);
		queue.head.store(dpc_ptr, Ordering::Relaxed);
		if old_head.is_null() {
			queue.tail.store(dpc_ptr, Ordering::Relaxed);
		}
	} else {
		let old_tail = queue.tail.load(Ordering::Relaxed);
		if old_tail.is_null() {
			queue.head.store(dpc_ptr, Ordering::Relaxed);
		} else {
			unsafe { (*old_tail).next.store(dpc_ptr, Ordering::Relaxed) };
		}
		queue.tail.store(dpc_ptr, Ordering::Relaxed);
	}
	let depth = queue.depth.fetch_add(1, Ordering::Relaxed) + 1;
	queue.lock.raw_release();

	let should_interrupt = !queue.routine_active.load(Ordering::Acquire)
		&& !queue.interrupt_requested.load(Ordering::Acquire)
		&& (dpc.priority != DpcPriority::Low || depth >= URGENT_DEPTH_THRESHOLD);

	if should_interrupt {
		queue.interrupt_requested.store(true, Ordering::Release);
		if old_irql < irql::DISPATCH_LEVEL {
			request_dispatch_interrupt();
		}
	}

	irql::lower(old_irql);
	won
}

/// Called from `irql::lower` whenever IRQL drops to or below
/// `DISPATCH_LEVEL`: if a DPC interrupt was requested and none is currently
/// running, requests one now.
pub(crate) fn request_software_interrupt_if_pending() {
	let queue = &percpu::current().dpc_queue;
	if queue.interrupt_requested.load(Ordering::Acquire) && !queue.routine_active.load(Ordering::Acquire) {
		request_dispatch_interrupt();
	}
}

fn request_dispatch_interrupt() {
	crate::arch::x86_64::apic::request_self_interrupt(crate::arch::x86_64::apic::DISPATCH_VECTOR);
}

/// The DPC retire loop. Entered at `DISPATCH_LEVEL` with interrupts
/// disabled; exits the same way. A routine may not block, attach to a
/// process, or lower IRQL below `DISPATCH_LEVEL`.
pub fn retire_queue() {
	debug_assert_eq!(irql::current(), irql::DISPATCH_LEVEL);
	let queue = &percpu::current().dpc_queue;

	loop {
		queue.routine_active.store(true, Ordering::Release);

		loop {
			queue.lock.raw_acquire();
			let head = queue.head.load(Ordering::Relaxed);
			if head.is_null() {
				queue.lock.raw_release();
				break;
			}
			let dpc = unsafe { &*head };
			let next = dpc.next.load(Ordering::Relaxed);
			queue.head.store(next, Ordering::Relaxed);
			if next.is_null() {
				queue.tail.store(ptr::null_mut(), Ordering::Relaxed);
			}
			dpc.inserted.store(ptr::null_mut(), Ordering::Release);
			queue.depth.fetch_sub(1, Ordering::Relaxed);
			queue.lock.raw_release();

			let (routine, context, a1, a2) = (
				dpc.routine,
				dpc.context,
				dpc.arg1.load(Ordering::Relaxed),
				dpc.arg2.load(Ordering::Relaxed),
			);

			unsafe { x86_64::instructions::interrupts::enable() };
			routine(dpc, context, a1, a2);
			unsafe { x86_64::instructions::interrupts::disable() };

			debug_assert_eq!(irql::current(), irql::DISPATCH_LEVEL);
		}

		queue.routine_active.store(false, Ordering::Release);
		queue.interrupt_requested.store(false, Ordering::Release);
		if queue.depth.load(Ordering::Relaxed) == 0 {
			break;
		}
	}
}

/// Allocates a dynamically created, heap-owned DPC with `'static` lifetime
/// (leaked intentionally — DPCs are long-lived kernel objects, never freed
/// individually; the few dynamic users, like the stack reaper, keep one
/// instance per CPU for the lifetime of the kernel).
pub fn new_static(routine: DpcRoutine, context: usize, priority: DpcPriority) -> &'static Dpc {
	Box::leak(Box::new(Dpc::new(routine, context, priority)))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn noop_routine(_dpc: &Dpc, _context: usize, _a1: usize, _a2: usize) {}

	#[test]
	fn dpc_starts_uninserted() {
		let dpc = Dpc::new(noop_routine, 0, DpcPriority::Low);
		assert!(dpc.inserted.load(Ordering::Relaxed).is_null());
	}
}
