//! Thread object and the kernel-stack allocator.
//!
//! Grounded on `original_source/kernel/core/ps/thread.c` (thread state and
//! termination sequencing) and
//! `examples/hermit-os-kernel/src/arch/x86_64/kernel/kernel_stack.rs`
//! (guard-paged stack layout).

use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::config::{KERNEL_STACK_GUARD_PAGES, KERNEL_STACK_SIZE, KERNEL_STACK_SIZE_LARGE, PAGE_SIZE};
use crate::dpc::{Dpc, DpcPriority};
use crate::mm::paging::{Pte, PteFlags};
use crate::mm::pfn::{self, AllocationKind};
use crate::mm::poolva::VaBitmap;
use crate::status::Status;
use crate::sync::rundown::RundownRef;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ThreadState {
	Ready,
	Running,
	Blocked,
	Terminating,
	Terminated,
	Zombie,
}

/// A trap frame: the saved register image a thread resumes into. Layout is
/// architecture-specific; on x86-64 it matches what the syscall/interrupt
/// entry trampoline pushes.
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct TrapFrame {
	pub rax: u64,
	pub rbx: u64,
	pub rcx: u64,
	pub rdx: u64,
	pub rsi: u64,
	pub rdi: u64,
	pub rbp: u64,
	pub r8: u64,
	pub r9: u64,
	pub r10: u64,
	pub r11: u64,
	pub r12: u64,
	pub r13: u64,
	pub r14: u64,
	pub r15: u64,
	pub rip: u64,
	pub cs: u64,
	pub rflags: u64,
	pub rsp: u64,
	pub ss: u64,
}

pub struct KernelStack {
	pub base_va: u64,
	pub top_va: u64,
	pub page_count: usize,
}

/// Allocates a kernel stack: `page_count` mapped pages preceded by
/// [`KERNEL_STACK_GUARD_PAGES`] unmapped guard pages at the low end.
/// Returns the top-of-stack VA (one byte past the last valid stack byte).
pub fn allocate_kernel_stack(large: bool, va_bitmap: &VaBitmap) -> Result<KernelStack, Status> {
	let size = if large { KERNEL_STACK_SIZE_LARGE } else { KERNEL_STACK_SIZE };
	let stack_pages = size / PAGE_SIZE;
	let total_pages = stack_pages + KERNEL_STACK_GUARD_PAGES;

	let offset = va_bitmap.allocate_contiguous(total_pages).ok_or(Status::NoMemory)?;
	let region_base = crate::mm::poolva::POOL_BASE + offset;
	let guard_va = region_base;
	let stack_base = region_base + (KERNEL_STACK_GUARD_PAGES * PAGE_SIZE) as u64;

	let guard_pte = Pte::new(0, PteFlags::GUARD);
	crate::mm::paging::map_page(guard_va, guard_pte)?;

	for i in 0..stack_pages {
		let frame = pfn::request(AllocationKind::Zeroed).ok_or(Status::NoMemory)?;
		let page_va = stack_base + (i * PAGE_SIZE) as u64;
		let pte = Pte::new(pfn::frame_to_phys(frame), PteFlags::PRESENT | PteFlags::WRITABLE);
		crate::mm::paging::map_page(page_va, pte)?;
		pfn::activate(frame, page_va);
	}

	Ok(KernelStack {
		base_va: stack_base,
		top_va: stack_base + (stack_pages * PAGE_SIZE) as u64,
		page_count: total_pages,
	})
}

/// Unmaps and releases a kernel stack's pages. Must never run on the very
/// stack being freed — callers enqueue the stack on the reaper's list
/// instead of calling this directly from the owning thread's context.
pub fn free_kernel_stack(stack: &KernelStack, va_bitmap: &VaBitmap) {
	let guard_va = stack.base_va - PAGE_SIZE as u64;
	crate::mm::paging::unmap_page(guard_va);

	let stack_pages = stack.page_count - KERNEL_STACK_GUARD_PAGES;
	for i in 0..stack_pages {
		let page_va = stack.base_va + (i * PAGE_SIZE) as u64;
		if let Ok(pte_ptr) = crate::mm::paging::get_pte_pointer(page_va) {
			let pte = unsafe { *pte_ptr };
			if pte.is_present() {
				pfn::release(pfn::phys_to_frame(pte.address()));
			}
		}
		crate::mm::paging::unmap_page(page_va);
	}

	let offset = guard_va - crate::mm::poolva::POOL_BASE;
	va_bitmap.free(offset, stack.page_count);
}

pub struct Thread {
	tid: core::sync::atomic::AtomicU32,
	pub parent_pid: u32,
	pub process: crate::sched::process::ProcessRef,
	pub state: core::sync::atomic::AtomicU8,
	pub trap_frame: crate::sync::spinlock::Spinlock<TrapFrame>,
	/// Saved stack pointer used by [`crate::arch::x86_64::context::switch_to`].
	/// Valid only while the thread is *not* the one currently executing;
	/// written by the outgoing side of a switch and read by the incoming
	/// side, both under the scheduler's guarantee that a thread is never
	/// switched into from two CPUs at once.
	pub kernel_rsp: core::cell::UnsafeCell<u64>,
	pub kernel_stack: KernelStack,
	pub time_slice_remaining: core::sync::atomic::AtomicU32,
	pub exit_status: core::sync::atomic::AtomicI32,
	pub rundown: RundownRef,
	/// Intrusive link for [`REAP_LIST`]. Valid only while the thread is
	/// queued for stack reclamation.
	reap_next: AtomicPtr<Thread>,
}

pub type ThreadRef = Arc<Thread>;

// SAFETY: `kernel_rsp` is only ever touched by the switch routine, which the
// scheduler guarantees never runs for the same thread on two CPUs
// concurrently.
unsafe impl Sync for Thread {}

impl PartialEq for Thread {
	fn eq(&self, other: &Self) -> bool {
		self.tid() == other.tid()
	}
}

impl Thread {
	pub fn tid(&self) -> u32 {
		self.tid.load(core::sync::atomic::Ordering::Relaxed)
	}

	pub fn state(&self) -> ThreadState {
		match self.state.load(core::sync::atomic::Ordering::Acquire) {
			0 => ThreadState::Ready,
			1 => ThreadState::Running,
			2 => ThreadState::Blocked,
			3 => ThreadState::Terminating,
			4 => ThreadState::Terminated,
			_ => ThreadState::Zombie,
		}
	}

	pub fn set_state(&self, state: ThreadState) {
		self.state.store(state as u8, core::sync::atomic::Ordering::Release);
	}
}

/// Creates a thread belonging to `process`: allocates a kernel stack, seeds
/// the trap frame to resume at `entry(arg)`, registers the thread under a
/// fresh TID in the CID table, and links it into the process's thread list.
/// The thread starts `Ready` but is not yet on any ready queue — the caller
/// decides when to [`crate::sched::wake_thread`] it.
///
/// Grounded on `original_source/kernel/core/ps/thread.c`'s `PsCreateThread`.
pub fn create_thread(
	process: &crate::sched::process::ProcessRef,
	entry: u64,
	arg: u64,
) -> Result<ThreadRef, Status> {
	let stack = crate::mm::pool::with_va_bitmap(|bitmap| allocate_kernel_stack(false, bitmap))?;

	let mut frame = TrapFrame::default();
	frame.rip = entry;
	frame.rdi = arg;
	frame.rsp = stack.top_va;
	frame.rflags = 0x202;
	frame.cs = crate::arch::x86_64::gdt::KERNEL_CODE_SELECTOR as u64;
	frame.ss = crate::arch::x86_64::gdt::KERNEL_DATA_SELECTOR as u64;

	let kernel_rsp = unsafe { crate::arch::x86_64::context::prepare_initial_stack(stack.top_va) };

	let thread = Arc::new(Thread {
		tid: core::sync::atomic::AtomicU32::new(0),
		parent_pid: process.pid(),
		process: Arc::clone(process),
		state: core::sync::atomic::AtomicU8::new(ThreadState::Ready as u8),
		trap_frame: crate::sync::spinlock::Spinlock::new(frame),
		kernel_rsp: core::cell::UnsafeCell::new(kernel_rsp),
		kernel_stack: stack,
		time_slice_remaining: core::sync::atomic::AtomicU32::new(crate::config::DEFAULT_TIME_SLICE_TICKS),
		exit_status: core::sync::atomic::AtomicI32::new(0),
		rundown: RundownRef::new(),
		reap_next: AtomicPtr::new(ptr::null_mut()),
	});

	let raw = Arc::into_raw(Arc::clone(&thread)) as *mut ();
	let tid = crate::ob::cid::insert(raw, crate::ob::ObjectKind::Thread)?;
	thread.tid.store(tid, core::sync::atomic::Ordering::Release);

	process.threads.lock().push(Arc::clone(&thread));
	Ok(thread)
}

/// Like [`create_thread`], but seeds a ring-3 trap frame instead of a
/// ring-0 one: `entry` and `user_stack_top` are user-mode addresses, and
/// the thread's first dispatch drops to ring 3 via
/// [`crate::arch::x86_64::context::thread_trampoline`]'s `iretq` path
/// rather than calling `entry` directly. The kernel stack allocated here
/// is still needed even though the thread never runs kernel code
/// voluntarily: every syscall or interrupt taken while the thread is in
/// user mode lands on it.
pub fn create_user_thread(process: &crate::sched::process::ProcessRef, entry: u64, user_stack_top: u64) -> Result<ThreadRef, Status> {
	let stack = crate::mm::pool::with_va_bitmap(|bitmap| allocate_kernel_stack(false, bitmap))?;

	let mut frame = TrapFrame::default();
	frame.rip = entry;
	frame.rsp = user_stack_top;
	frame.rflags = 0x202;
	frame.cs = (crate::arch::x86_64::gdt::USER_CODE_SELECTOR | 3) as u64;
	frame.ss = (crate::arch::x86_64::gdt::USER_DATA_SELECTOR | 3) as u64;

	let kernel_rsp = unsafe { crate::arch::x86_64::context::prepare_initial_stack(stack.top_va) };

	let thread = Arc::new(Thread {
		tid: core::sync::atomic::AtomicU32::new(0),
		parent_pid: process.pid(),
		process: Arc::clone(process),
		state: core::sync::atomic::AtomicU8::new(ThreadState::Ready as u8),
		trap_frame: crate::sync::spinlock::Spinlock::new(frame),
		kernel_rsp: core::cell::UnsafeCell::new(kernel_rsp),
		kernel_stack: stack,
		time_slice_remaining: core::sync::atomic::AtomicU32::new(crate::config::DEFAULT_TIME_SLICE_TICKS),
		exit_status: core::sync::atomic::AtomicI32::new(0),
		rundown: RundownRef::new(),
		reap_next: AtomicPtr::new(ptr::null_mut()),
	});

	let raw = Arc::into_raw(Arc::clone(&thread)) as *mut ();
	let tid = crate::ob::cid::insert(raw, crate::ob::ObjectKind::Thread)?;
	thread.tid.store(tid, core::sync::atomic::Ordering::Release);

	process.threads.lock().push(Arc::clone(&thread));
	Ok(thread)
}

/// Lock-free (Treiber) stack of threads awaiting stack reclamation. Pushed
/// to by [`queue_for_reaping`] from `reschedule`'s outgoing-thread check,
/// drained by [`reap_terminated_stacks`].
static REAP_LIST: AtomicPtr<Thread> = AtomicPtr::new(ptr::null_mut());

static REAPER_DPC: Dpc = Dpc::new(reap_terminated_stacks, 0, DpcPriority::Medium);

/// Queues `thread`'s kernel stack for reclamation and ensures the reaper DPC
/// runs. Grounded on `original_source/kernel/core/ps/thread.c`'s
/// `PspDeleteThread` deferring real teardown off the terminating thread's
/// own stack.
pub fn queue_for_reaping(thread: ThreadRef) {
	let raw = Arc::into_raw(thread) as *mut Thread;
	let mut head = REAP_LIST.load(Ordering::Relaxed);
	loop {
		unsafe { (*raw).reap_next.store(head, Ordering::Relaxed) };
		match REAP_LIST.compare_exchange_weak(head, raw, Ordering::AcqRel, Ordering::Relaxed) {
			Ok(_) => break,
			Err(actual) => head = actual,
		}
	}
	crate::dpc::enqueue(&REAPER_DPC, 0, 0);
}

/// The Medium-priority reaper routine: drains every thread currently queued
/// for reaping, frees its kernel stack, and marks it `Zombie`. Runs at
/// `DISPATCH_LEVEL`, so it must never block.
fn reap_terminated_stacks(_dpc: &Dpc, _context: usize, _a1: usize, _a2: usize) {
	let mut current = REAP_LIST.swap(ptr::null_mut(), Ordering::AcqRel);
	while !current.is_null() {
		let thread = unsafe { Arc::from_raw(current as *const Thread) };
		let next = thread.reap_next.load(Ordering::Relaxed);

		crate::mm::pool::with_va_bitmap(|bitmap| free_kernel_stack(&thread.kernel_stack, bitmap));
		thread.set_state(ThreadState::Zombie);

		current = next;
	}
}
