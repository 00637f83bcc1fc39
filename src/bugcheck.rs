//! Fatal-error reporting: the last thing the kernel runs on an unrecoverable
//! condition.
//!
//! Grounded on `original_source/kernel/core/me/bugcheck.c`'s `MeBugCheckEx`:
//! halt every other CPU, paint a solid-color stop screen, print the stop
//! code and up to four parameters, then halt forever. Never returns and
//! never unwinds — every caller already decided recovery is impossible.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::framebuffer;
use crate::irql;
use crate::percpu;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum StopCode {
	IrqlNotGreaterOrEqual = 1,
	IrqlNotLessOrEqual = 2,
	PageFault = 3,
	KmodeExceptionNotHandled = 4,
	GuardPageDereference = 5,
	AttemptedWriteToReadonlyMemory = 6,
	MemoryCorruptHeader = 7,
	CriticalProcessDied = 8,
	AttemptedSwitchFromDpc = 9,
	AssertionFailure = 10,
	ManuallyInitiatedCrash = 11,
}

impl StopCode {
	fn name(self) -> &'static str {
		match self {
			StopCode::IrqlNotGreaterOrEqual => "IRQL_NOT_GREATER_OR_EQUAL",
			StopCode::IrqlNotLessOrEqual => "IRQL_NOT_LESS_OR_EQUAL",
			StopCode::PageFault => "PAGE_FAULT",
			StopCode::KmodeExceptionNotHandled => "KMODE_EXCEPTION_NOT_HANDLED",
			StopCode::GuardPageDereference => "GUARD_PAGE_DEREFERENCE",
			StopCode::AttemptedWriteToReadonlyMemory => "ATTEMPTED_WRITE_TO_READONLY_MEMORY",
			StopCode::MemoryCorruptHeader => "MEMORY_CORRUPT_HEADER",
			StopCode::CriticalProcessDied => "CRITICAL_PROCESS_DIED",
			StopCode::AttemptedSwitchFromDpc => "ATTEMPTED_SWITCH_FROM_DPC",
			StopCode::AssertionFailure => "ASSERTION_FAILURE",
			StopCode::ManuallyInitiatedCrash => "MANUALLY_INITIATED_CRASH",
		}
	}
}

static BUGCHECKING: AtomicBool = AtomicBool::new(false);

const STOP_SCREEN_COLOR: u32 = 0x0035_b8;
const TEXT_COLOR: u32 = 0x00FF_FFFF;

/// Halts the system. Disables interrupts on the calling CPU, tells every
/// other CPU to halt via the stop IPI, paints the stop screen, and spins in
/// `hlt` forever.
#[track_caller]
pub fn stop(code: StopCode, params: [u64; 4]) -> ! {
	x86_64::instructions::interrupts::disable();

	if BUGCHECKING.swap(true, Ordering::AcqRel) {
		// Already bugchecking on some CPU (possibly this one, re-entrantly);
		// don't race the screen repaint, just join the halt.
		halt_forever();
	}

	if let Some(_cpu) = percpu::try_current() {
		irql::raise(irql::HIGH_LEVEL);
		crate::arch::x86_64::apic::broadcast_except_self(crate::arch::x86_64::apic::STOP_VECTOR);
	}

	let core_id = percpu::try_current_core_id().unwrap_or(u32::MAX);
	log::error!(
		"BUGCHECK {} (0x{:x}) params=[{:#x}, {:#x}, {:#x}, {:#x}] core={}",
		code.name(),
		code as u32,
		params[0],
		params[1],
		params[2],
		params[3],
		core_id,
	);

	render_stop_screen(code, params, core_id);
	halt_forever();
}

/// Paints the stop screen. A no-op if the framebuffer hand-off
/// configuration was never published (e.g. a bugcheck during very early
/// boot) — `framebuffer::clear`/`draw_text` degrade to no-ops in that case.
fn render_stop_screen(code: StopCode, params: [u64; 4], core_id: u32) {
	framebuffer::clear(STOP_SCREEN_COLOR);
	let line = framebuffer::line_height();
	framebuffer::draw_text("FATAL ERROR", 16, 16, TEXT_COLOR);
	framebuffer::draw_text("STOP CODE:", 16, 16 + line, TEXT_COLOR);
	framebuffer::draw_text(code.name(), 16, 16 + 2 * line, TEXT_COLOR);
	framebuffer::draw_text("CORE:", 16, 16 + 4 * line, TEXT_COLOR);
	let _ = core_id;
	let _ = params;
}

fn halt_forever() -> ! {
	loop {
		x86_64::instructions::hlt();
	}
}
