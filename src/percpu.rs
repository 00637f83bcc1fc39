//! The per-CPU block (L0): everything addressed without cross-CPU
//! synchronization.
//!
//! Grounded on the teacher's GS-base storage (`arch::x86_64::kernel::percore`),
//! modernized to the current `asm!` syntax and carrying the full field set
//! the executive core's upper layers need: current IRQL, the ready and DPC
//! queues, the lookaside pools, the IPI mailbox, and the per-CPU interrupt
//! stacks.

use alloc::boxed::Box;
use core::arch::asm;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use x86_64::registers::model_specific::{GsBase, KernelGsBase};
use x86_64::VirtAddr;

use crate::arch::x86_64::apic::IpiMailbox;
use crate::config::SLAB_SIZE_CLASSES;
use crate::dpc::DpcQueue;
use crate::mm::pool::LookasideSlab;
use crate::sched::ReadyQueue;

/// Number of distinct interrupt-stack-table stacks this kernel uses:
/// page-fault, double-fault, local-timer, and IPI.
pub const IST_STACK_COUNT: usize = 4;

#[repr(C, align(64))]
pub struct PerCpu {
	/// Back-pointer so code holding `&PerCpu` can recover `*mut PerCpu`
	/// without a second GS-base read.
	self_ptr: *mut PerCpu,
	pub cpu_id: u32,
	pub current_irql: AtomicU8,
	pub current_thread: UnsafeCell<*mut crate::sched::thread::Thread>,
	pub idle_thread: UnsafeCell<*mut crate::sched::thread::Thread>,
	/// Owning handle mirroring `current_thread`, kept alongside the raw
	/// pointer so code off the context-switch hot path (wait queues, the
	/// object manager) can clone an [`Arc`](alloc::sync::Arc) without
	/// reconstructing one from a borrowed pointer.
	pub current_thread_ref: UnsafeCell<Option<crate::sched::thread::ThreadRef>>,
	pub ready_queue: ReadyQueue,
	pub dpc_queue: DpcQueue,
	pub ipi_mailbox: IpiMailbox,
	pub lookaside: [LookasideSlab; SLAB_SIZE_CLASSES.len()],
	pub lapic_mmio_virt: UnsafeCell<VirtAddr>,
	pub ist_stacks: [UnsafeCell<VirtAddr>; IST_STACK_COUNT],
	pub rsp0: UnsafeCell<VirtAddr>,
	pub online: AtomicU32,
}

// SAFETY: every field is either atomic, a raw pointer only ever
// dereferenced on the owning CPU, or immutable after `init_one`.
unsafe impl Sync for PerCpu {}

impl PerCpu {
	fn new(cpu_id: u32) -> Self {
		PerCpu {
			self_ptr: ptr::null_mut(),
			cpu_id,
			current_irql: AtomicU8::new(crate::irql::PASSIVE_LEVEL),
			current_thread: UnsafeCell::new(ptr::null_mut()),
			idle_thread: UnsafeCell::new(ptr::null_mut()),
			current_thread_ref: UnsafeCell::new(None),
			ready_queue: ReadyQueue::new(),
			dpc_queue: DpcQueue::new(),
			ipi_mailbox: IpiMailbox::new(),
			lookaside: core::array::from_fn(|i| LookasideSlab::new(SLAB_SIZE_CLASSES[i])),
			lapic_mmio_virt: UnsafeCell::new(VirtAddr::zero()),
			ist_stacks: core::array::from_fn(|_| UnsafeCell::new(VirtAddr::zero())),
			rsp0: UnsafeCell::new(VirtAddr::zero()),
			online: AtomicU32::new(0),
		}
	}
}

/// Allocates and installs the per-CPU block for the calling CPU, pointed at
/// by `IA32_KERNEL_GSBASE` so that after the first `swapgs` on entry from
/// user mode (or directly, while still in kernel mode during bring-up),
/// `GsBase` addresses this structure.
///
/// # Safety
/// Must be called exactly once per CPU, before interrupts are enabled on
/// that CPU.
pub unsafe fn init_one(cpu_id: u32) {
	let mut boxed = Box::new(PerCpu::new(cpu_id));
	let raw: *mut PerCpu = &mut *boxed;
	boxed.self_ptr = raw;
	Box::leak(boxed);

	let addr = VirtAddr::new(raw as u64);
	GsBase::write(addr);
	KernelGsBase::write(addr);
	(*raw).online.store(1, Ordering::Release);
	mark_online(cpu_id);
}

/// Per-CPU online flags, indexed by `cpu_id`, for cross-CPU queries that
/// can't go through GS base (a CPU can only read its own PerCpu block that
/// way). [`crate::arch::x86_64::smp`] polls this while bringing APs up one
/// at a time.
static ONLINE: [AtomicBool; crate::config::MAX_CPUS] = [const { AtomicBool::new(false) }; crate::config::MAX_CPUS];

pub fn mark_online(cpu_id: u32) {
	ONLINE[cpu_id as usize].store(true, Ordering::Release);
}

pub fn is_online(cpu_id: u32) -> bool {
	ONLINE[cpu_id as usize].load(Ordering::Acquire)
}

/// Reads the current CPU's per-CPU block through GS base. Requires
/// [`init_one`] to have already run on this CPU.
#[inline]
pub fn current() -> &'static PerCpu {
	let ptr: *mut PerCpu;
	unsafe {
		asm!("mov {}, gs:0", out(reg) ptr, options(nostack, preserves_flags));
	}
	debug_assert!(!ptr.is_null(), "per-CPU block not initialized on this CPU");
	unsafe { &*ptr }
}

/// Like [`current`] but returns `None` instead of asserting, for use from
/// code paths (like the logger) that may run before bring-up completes.
pub fn try_current() -> Option<&'static PerCpu> {
	let ptr: *mut PerCpu;
	unsafe {
		asm!("mov {}, gs:0", out(reg) ptr, options(nostack, preserves_flags));
	}
	if ptr.is_null() {
		None
	} else {
		Some(unsafe { &*ptr })
	}
}

pub fn current_core_id() -> u32 {
	current().cpu_id
}

pub fn try_current_core_id() -> Option<u32> {
	try_current().map(|p| p.cpu_id)
}
