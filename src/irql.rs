//! Interrupt Request Level: a per-CPU software priority gating preemption
//! and the legality of blocking.
//!
//! Grounded on `original_source/kernel/core/me/irql.c`. Levels below
//! `DISPATCH_LEVEL` permit scheduling and blocking; `DISPATCH_LEVEL` and
//! above do not.

use core::sync::atomic::Ordering;

use crate::dpc;
use crate::percpu;

pub type Irql = u8;

pub const PASSIVE_LEVEL: Irql = 0;
pub const APC_LEVEL: Irql = 1;
pub const DISPATCH_LEVEL: Irql = 2;
pub const PROFILE_LEVEL: Irql = 27;
pub const CLOCK_LEVEL: Irql = 28;
pub const IPI_LEVEL: Irql = 29;
pub const POWER_LEVEL: Irql = 30;
pub const HIGH_LEVEL: Irql = 31;

#[inline]
pub fn current() -> Irql {
	percpu::current().current_irql.load(Ordering::Relaxed)
}

/// Raises the current CPU's IRQL to `new_irql`, returning the previous
/// value. Bugchecks if `new_irql` is lower than the current level.
#[track_caller]
pub fn raise(new_irql: Irql) -> Irql {
	let cpu = percpu::current();
	let old = cpu.current_irql.load(Ordering::Relaxed);
	if new_irql < old {
		crate::bugcheck::stop(
			crate::bugcheck::StopCode::IrqlNotGreaterOrEqual,
			[new_irql as u64, old as u64, 0, 0],
		);
	}
	cpu.current_irql.store(new_irql, Ordering::Relaxed);
	write_task_priority(new_irql);
	old
}

/// Lowers the current CPU's IRQL to `new_irql`. Bugchecks if `new_irql` is
/// higher than the current level. May drain the DPC queue as a side effect
/// when lowering to or below `DISPATCH_LEVEL`.
#[track_caller]
pub fn lower(new_irql: Irql) {
	let cpu = percpu::current();
	let old = cpu.current_irql.load(Ordering::Relaxed);
	if new_irql > old {
		crate::bugcheck::stop(
			crate::bugcheck::StopCode::IrqlNotLessOrEqual,
			[new_irql as u64, old as u64, 0, 0],
		);
	}
	cpu.current_irql.store(new_irql, Ordering::Relaxed);
	write_task_priority(new_irql);

	if new_irql <= DISPATCH_LEVEL {
		dpc::request_software_interrupt_if_pending();
	}
}

/// `true` when the scheduler may legally preempt or the caller may legally
/// block: strictly below `DISPATCH_LEVEL`.
pub fn scheduler_enabled() -> bool {
	current() < DISPATCH_LEVEL
}

/// Asserts the calling context is allowed to block. Bugchecks otherwise.
#[track_caller]
pub fn assert_suspendable() {
	if current() >= DISPATCH_LEVEL {
		crate::bugcheck::stop(
			crate::bugcheck::StopCode::IrqlNotLessOrEqual,
			[current() as u64, DISPATCH_LEVEL as u64, 0, 0],
		);
	}
}

/// Writes the architectural task-priority register so hardware masks
/// interrupts below the software level's mapped vector band. The mapping is
/// linear: IRQL `L` maps to TPR class `L` (both are 0..31 priority spaces on
/// this architecture once APIC is in use).
fn write_task_priority(irql: Irql) {
	use x86_64::registers::model_specific::Msr;
	// IA32_TPR is only available through the xAPIC MMIO window pre-x2APIC;
	// once x2APIC is active TPR is MSR 0x808. Architectural bring-up selects
	// x2APIC unconditionally (see `arch::x86_64::apic`), so write the MSR.
	const IA32_X2APIC_TPR: u32 = 0x808;
	unsafe {
		Msr::new(IA32_X2APIC_TPR).write((irql as u64) << 4);
	}
}

/// RAII guard restoring the previous IRQL on drop. Mirrors the
/// raise/lower pairing every caller in the design performs manually; used
/// internally by spinlocks.
pub struct IrqlGuard {
	previous: Irql,
}

impl IrqlGuard {
	pub fn raise_to(new_irql: Irql) -> Self {
		IrqlGuard {
			previous: raise(new_irql),
		}
	}
}

impl Drop for IrqlGuard {
	fn drop(&mut self) {
		lower(self.previous);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn level_ordering_matches_spec() {
		assert!(PASSIVE_LEVEL < APC_LEVEL);
		assert!(APC_LEVEL < DISPATCH_LEVEL);
		assert!(DISPATCH_LEVEL < PROFILE_LEVEL);
		assert!(PROFILE_LEVEL < CLOCK_LEVEL);
		assert!(CLOCK_LEVEL < IPI_LEVEL);
		assert!(IPI_LEVEL < POWER_LEVEL);
		assert!(POWER_LEVEL < HIGH_LEVEL);
	}
}
