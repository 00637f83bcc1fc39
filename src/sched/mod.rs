//! Per-CPU scheduler: ready queues, work stealing, blocking/waking, and the
//! reschedule entry point.
//!
//! Grounded on `original_source/kernel/core/me/scheduler.c` for the
//! dispatch policy, and on the teacher's
//! `scheduler::mod::PerCoreScheduler`/`SCHEDULER_INPUTS` pairing for the
//! per-CPU-queue-plus-global-registry shape that makes work stealing
//! possible without a single global run queue.

pub mod process;
pub mod thread;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hermit_sync::OnceCell;

use crate::irql;
use crate::percpu;
use crate::sync::event::Event;
use crate::sync::spinlock::Spinlock;
use thread::{ThreadRef, ThreadState};
use process::ProcessRef;

/// A single CPU's ready list. Owned by that CPU's [`crate::percpu::PerCpu`]
/// block; other CPUs only ever touch it through [`ReadyQueue::steal`].
pub struct ReadyQueue {
	queue: Spinlock<VecDeque<ThreadRef>>,
}

impl ReadyQueue {
	pub const fn new() -> Self {
		ReadyQueue {
			queue: Spinlock::new(VecDeque::new()),
		}
	}

	pub fn push(&self, thread: ThreadRef) {
		self.queue.lock().push_back(thread);
	}

	pub fn pop(&self) -> Option<ThreadRef> {
		self.queue.lock().pop_front()
	}

	/// Takes one thread from the tail of another CPU's queue. Stealing from
	/// the opposite end from local `pop` keeps a thief from contending with
	/// the owning CPU's own dequeues on a short queue.
	pub fn steal(&self) -> Option<ThreadRef> {
		self.queue.lock().pop_back()
	}

	pub fn len(&self) -> usize {
		self.queue.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Registry of every online CPU's ready queue, consulted only when the
/// local queue runs dry. Populated by [`register_current_cpu`] during boot.
static REGISTRY: Spinlock<Vec<&'static ReadyQueue>> = Spinlock::new(Vec::new());

/// Registers the calling CPU's ready queue in the global stealing registry.
/// Must run after [`percpu::init_one`] on that CPU.
pub fn register_current_cpu() {
	let queue = &percpu::current().ready_queue;
	REGISTRY.lock().push(queue);
}

fn steal_from_other_cpus() -> Option<ThreadRef> {
	let local = &percpu::current().ready_queue as *const ReadyQueue;
	for queue in REGISTRY.lock().iter() {
		if core::ptr::eq(*queue, local) {
			continue;
		}
		if let Some(thread) = queue.steal() {
			return Some(thread);
		}
	}
	None
}

/// Returns the [`Arc`] handle for the thread currently running on this CPU.
/// Panics if called before the first thread has been scheduled.
pub fn current_thread_ref() -> ThreadRef {
	let slot = unsafe { &*percpu::current().current_thread_ref.get() };
	slot.clone().expect("no thread is current on this CPU yet")
}

/// Returns the process owning the thread currently running on this CPU.
pub fn current_process() -> ProcessRef {
	Arc::clone(&current_thread_ref().process)
}

/// Installs `thread` as the CPU's current thread, updating both the raw
/// pointer used by the context-switch path and the owning handle used by
/// everything else.
fn install_current_thread(thread: ThreadRef) {
	let cpu = percpu::current();
	let raw = Arc::as_ptr(&thread) as *mut thread::Thread;
	unsafe {
		*cpu.current_thread_ref.get() = Some(thread);
		*cpu.current_thread.get() = raw;
	}
}

/// Marks `thread` ready and places it on a ready queue, preferring the
/// calling CPU's own queue so a woken thread tends to run close to whatever
/// last touched it.
pub fn wake_thread(thread: ThreadRef) {
	thread.set_state(ThreadState::Ready);
	percpu::current().ready_queue.push(thread);
}

/// Blocks the calling thread until `event` wakes it. The thread has already
/// been enqueued on the event's wait list by [`Event::wait`]; this just
/// marks it blocked and picks something else to run.
///
/// Must be called at IRQL below `DISPATCH_LEVEL`.
pub fn block_current_thread_on_event(_event: &Event) {
	irql::assert_suspendable();
	let current = current_thread_ref();
	current.set_state(ThreadState::Blocked);
	reschedule();
}

/// Picks the next thread to run on this CPU and switches to it: the local
/// ready queue first, then a steal attempt against every other online CPU,
/// then the CPU's idle thread.
///
/// Never called at `DISPATCH_LEVEL` or above.
pub fn reschedule() {
	irql::assert_suspendable();
	let cpu = percpu::current();

	let previous = current_thread_ref();
	let next = cpu
		.ready_queue
		.pop()
		.or_else(steal_from_other_cpus)
		.unwrap_or_else(idle_thread);

	if previous.state() == ThreadState::Running {
		// The outgoing thread is neither blocked nor terminating: it simply
		// used up its slice, so requeue it instead of dropping it.
		previous.set_state(ThreadState::Ready);
		cpu.ready_queue.push(previous.clone());
	} else if previous.state() == ThreadState::Terminated {
		// Stack reclamation runs off a Medium-priority DPC rather than here,
		// since this thread is still executing on the very stack that would
		// need freeing. Once the reaper runs, the thread moves to `Zombie`.
		thread::queue_for_reaping(previous.clone());
	}

	if Arc::ptr_eq(&previous, &next) {
		// Nothing else is runnable and the caller was already the idle or
		// sole ready thread: no stack switch needed.
		next.set_state(ThreadState::Running);
		return;
	}

	next.set_state(ThreadState::Running);
	install_current_thread(next.clone());
	crate::arch::x86_64::context::switch_to(&previous, &next);
}

fn idle_thread() -> ThreadRef {
	let ptr = unsafe { *percpu::current().idle_thread.get() };
	debug_assert!(!ptr.is_null(), "idle thread not installed on this CPU");
	unsafe { Arc::increment_strong_count(ptr) };
	unsafe { Arc::from_raw(ptr) }
}

/// Every CPU's idle thread belongs to the same process: there is no real
/// "System" image to load, it exists purely to own the idle threads' TID
/// namespace and handle table.
static IDLE_PROCESS: OnceCell<ProcessRef> = OnceCell::new();

fn idle_process() -> &'static ProcessRef {
	IDLE_PROCESS.get_or_init(|| process::create_process("System", None).expect("failed to create the idle process"))
}

extern "C" fn idle_entry(_arg: u64) {
	loop {
		x86_64::instructions::hlt();
	}
}

/// Creates and installs this CPU's idle thread as the running thread. Must
/// run once per CPU, after [`percpu::init_one`] and
/// [`register_current_cpu`] and before the first [`reschedule`] or
/// [`current_thread_ref`] call on this CPU — both assume a thread is
/// already installed.
pub fn bootstrap_current_cpu() {
	let process = idle_process();
	let idle = thread::create_thread(process, idle_entry as usize as u64, 0).expect("failed to create the idle thread");
	idle.set_state(ThreadState::Running);

	let raw = Arc::into_raw(Arc::clone(&idle)) as *mut thread::Thread;
	unsafe { *percpu::current().idle_thread.get() = raw };
	install_current_thread(idle);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ready_queue_is_fifo_on_the_local_end() {
		// Construction-only smoke test: full push/pop needs a real ThreadRef,
		// which needs a mapped kernel stack, so the fuller behavior is
		// exercised by the integration tests instead.
		let queue = ReadyQueue::new();
		assert!(queue.is_empty());
	}
}
