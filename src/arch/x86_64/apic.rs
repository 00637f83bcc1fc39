//! Local APIC in x2APIC mode: timer-independent interrupt delivery, EOI,
//! and the inter-processor-interrupt primitives the DPC dispatcher, TLB
//! shootdown, and AP bring-up all build on.
//!
//! Grounded on the teacher's `arch::x86_64::kernel::apic`; bring-up always
//! selects x2APIC (every x2APIC-capable CPU this kernel targets supports
//! it), skipping the teacher's xAPIC MMIO fallback path.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use x86_64::registers::model_specific::Msr;

use crate::sync::spinlock::Spinlock;

const IA32_APIC_BASE: u32 = 0x1B;
const X2APIC_ENABLE: u64 = 1 << 10;
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;

const MSR_APICID: u32 = 0x802;
const MSR_TPR: u32 = 0x808;
const MSR_EOI: u32 = 0x80B;
const MSR_SIVR: u32 = 0x80F;
const MSR_ICR: u32 = 0x830;
const MSR_LVT_TIMER: u32 = 0x832;
const MSR_LVT_THERMAL: u32 = 0x833;
const MSR_LVT_PMI: u32 = 0x834;
const MSR_LVT_LINT0: u32 = 0x835;
const MSR_LVT_LINT1: u32 = 0x836;
const MSR_LVT_ERROR: u32 = 0x837;

const LVT_MASKED: u64 = 1 << 16;
const SIVR_APIC_ENABLE: u64 = 1 << 8;

const ICR_DELIVERY_FIXED: u64 = 0x0 << 8;
const ICR_DELIVERY_INIT: u64 = 0x5 << 8;
const ICR_DELIVERY_STARTUP: u64 = 0x6 << 8;
const ICR_LEVEL_ASSERT: u64 = 1 << 14;
const ICR_TRIGGER_LEVEL: u64 = 1 << 15;
const ICR_SHORTHAND_ALL_EXCLUDING_SELF: u64 = 0b11 << 18;

/// Software vector the DPC dispatcher self-interrupts on to retire the
/// queue once IRQL drops below `DISPATCH_LEVEL`.
pub const DISPATCH_VECTOR: u8 = 0xF0;
/// Broadcast to every other CPU after any PTE change that revokes a
/// translation another CPU might be caching.
pub const TLB_SHOOTDOWN_VECTOR: u8 = 0xF1;
/// Targeted wake, used to pull a CPU out of `hlt` when work lands on its
/// ready queue from another CPU.
pub const IPI_WAKE_VECTOR: u8 = 0xF2;
pub const SPURIOUS_VECTOR: u8 = 0xFF;
/// Halts every other CPU during a bugcheck.
pub const STOP_VECTOR: u8 = 0xF3;

fn write(msr: u32, value: u64) {
	unsafe { Msr::new(msr).write(value) };
}

fn read(msr: u32) -> u64 {
	unsafe { Msr::new(msr).read() }
}

/// Enables x2APIC mode and unmasks the local APIC. Must run on every CPU
/// before that CPU relies on any interrupt delivery.
pub fn init_current_cpu() {
	let base = read(IA32_APIC_BASE);
	write(IA32_APIC_BASE, base | APIC_GLOBAL_ENABLE | X2APIC_ENABLE);

	write(MSR_LVT_TIMER, LVT_MASKED);
	write(MSR_LVT_THERMAL, LVT_MASKED);
	write(MSR_LVT_PMI, LVT_MASKED);
	write(MSR_LVT_LINT0, LVT_MASKED);
	write(MSR_LVT_LINT1, LVT_MASKED);
	write(MSR_LVT_ERROR, 0xFE);
	write(MSR_TPR, 0);
	write(MSR_SIVR, SIVR_APIC_ENABLE | u64::from(SPURIOUS_VECTOR));
}

pub fn local_apic_id() -> u32 {
	read(MSR_APICID) as u32
}

pub fn eoi() {
	write(MSR_EOI, 0);
}

/// Sends a fixed-vector IPI to this same CPU. Used to defer DPC retirement
/// and wait-block wakeups to a point where interrupts are enabled again.
pub fn request_self_interrupt(vector: u8) {
	let icr = ICR_DELIVERY_FIXED | ICR_LEVEL_ASSERT | u64::from(vector) | (u64::from(local_apic_id()) << 32);
	write(MSR_ICR, icr);
}

/// Sends a fixed-vector IPI to every other online CPU, used for TLB
/// shootdown and for the bugcheck stop broadcast.
pub fn broadcast_except_self(vector: u8) {
	let icr = ICR_DELIVERY_FIXED | ICR_LEVEL_ASSERT | ICR_TRIGGER_LEVEL | ICR_SHORTHAND_ALL_EXCLUDING_SELF | u64::from(vector);
	write(MSR_ICR, icr);
}

/// Serializes concurrent shootdown broadcasts: [`PENDING_ACKS`] tracks one
/// broadcast's outstanding acknowledgments at a time, so two CPUs racing to
/// unmap pages can't stomp on each other's counter.
static SHOOTDOWN_LOCK: Spinlock<()> = Spinlock::new(());
static PENDING_ACKS: AtomicU32 = AtomicU32::new(0);

/// Invalidates `va` on every other online CPU and blocks until all of them
/// have flushed, so a caller that just unmapped a page can rely on no other
/// CPU still translating through the stale PTE once this returns. The
/// address itself isn't carried in the IPI payload (fixed-delivery IPIs
/// have none to spare) — every recipient just flushes its entire TLB,
/// trading a slightly more expensive remote flush for not needing a shared
/// mailbox per shootdown.
pub fn broadcast_tlb_shootdown(va: u64) {
	let _ = va;
	let expected = online_cpu_count_excluding_self();
	if expected == 0 {
		return;
	}
	let _guard = SHOOTDOWN_LOCK.lock();
	PENDING_ACKS.store(expected, Ordering::Release);
	broadcast_except_self(TLB_SHOOTDOWN_VECTOR);
	while PENDING_ACKS.load(Ordering::Acquire) != 0 {
		core::hint::spin_loop();
	}
}

/// Called from the TLB-shootdown interrupt handler once this CPU's flush is
/// done, letting a CPU spinning in [`broadcast_tlb_shootdown`] know one more
/// recipient has caught up.
pub fn acknowledge_tlb_shootdown() {
	PENDING_ACKS.fetch_sub(1, Ordering::AcqRel);
}

fn online_cpu_count_excluding_self() -> u32 {
	let self_id = crate::percpu::current_core_id();
	(0..crate::config::MAX_CPUS as u32)
		.filter(|&id| id != self_id && crate::percpu::is_online(id))
		.count() as u32
}

/// Sends the INIT-SIPI-SIPI sequence that starts an application processor
/// executing the real-mode trampoline at `trampoline_page << 12`.
///
/// # Safety
/// `apic_id` must name an idle, uninitialized AP and `trampoline_page` must
/// point at a valid, identity-mapped copy of the AP trampoline below 1 MiB.
pub unsafe fn send_startup_sequence(apic_id: u32, trampoline_page: u8) {
	let dest = u64::from(apic_id) << 32;
	write(MSR_ICR, dest | ICR_DELIVERY_INIT | ICR_LEVEL_ASSERT | ICR_TRIGGER_LEVEL);
	crate::arch::x86_64::smp::busy_wait_microseconds(10_000);
	write(MSR_ICR, dest | ICR_DELIVERY_INIT | ICR_TRIGGER_LEVEL);
	crate::arch::x86_64::smp::busy_wait_microseconds(200);

	for _ in 0..2 {
		write(MSR_ICR, dest | ICR_DELIVERY_STARTUP | u64::from(trampoline_page));
		crate::arch::x86_64::smp::busy_wait_microseconds(200);
	}
}

/// Per-CPU mailbox of pending cross-CPU wake reasons, consulted by the
/// idle loop right after `hlt` returns so a wake reason is never dropped
/// between being posted and the target CPU actually sleeping.
pub struct IpiMailbox {
	pending: AtomicU64,
}

pub const REASON_RESCHEDULE: u64 = 1 << 0;
pub const REASON_TLB_SHOOTDOWN: u64 = 1 << 1;

impl IpiMailbox {
	pub const fn new() -> Self {
		IpiMailbox {
			pending: AtomicU64::new(0),
		}
	}

	pub fn post(&self, reason: u64) {
		self.pending.fetch_or(reason, Ordering::Release);
	}

	pub fn take(&self) -> u64 {
		self.pending.swap(0, Ordering::Acquire)
	}
}

impl Default for IpiMailbox {
	fn default() -> Self {
		Self::new()
	}
}
