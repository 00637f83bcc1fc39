//! Interrupt Descriptor Table: CPU exception vectors wired to the fault
//! handler and the bugcheck surface, plus the software vectors the DPC
//! dispatcher and IPI mailbox use.
//!
//! Grounded on the teacher's `arch::x86_64::kernel::interrupts`, which
//! pairs the same `x86_64` crate IDT type with one handler function per
//! exception and an `IST` slot per critical exception.

use hermit_sync::OnceCell;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::bugcheck::StopCode;
use crate::mm::fault::{self, FaultBits};
use crate::sched::process::ProcessMode;

static IDT: OnceCell<InterruptDescriptorTable> = OnceCell::new();

/// Builds the IDT once (idempotent across CPUs: every CPU loads the same
/// table, there is nothing per-CPU about vector routing).
pub fn load() {
	let idt = IDT.get_or_init(build);
	unsafe { idt.load_unsafe() };
}

fn build() -> InterruptDescriptorTable {
	let mut idt = InterruptDescriptorTable::new();
	unsafe {
		idt.divide_error.set_handler_fn(divide_error).set_stack_index(0);
		idt.debug.set_handler_fn(debug).set_stack_index(0);
		idt.non_maskable_interrupt.set_handler_fn(nmi).set_stack_index(1);
		idt.breakpoint.set_handler_fn(breakpoint);
		idt.overflow.set_handler_fn(overflow);
		idt.invalid_opcode.set_handler_fn(invalid_opcode).set_stack_index(0);
		idt.device_not_available.set_handler_fn(device_not_available);
		idt.double_fault.set_handler_fn(double_fault).set_stack_index(2);
		idt.general_protection_fault
			.set_handler_fn(general_protection)
			.set_stack_index(0);
		idt.page_fault.set_handler_fn(page_fault).set_stack_index(0);
		idt.machine_check.set_handler_fn(machine_check).set_stack_index(3);

		idt[crate::arch::x86_64::apic::DISPATCH_VECTOR as usize].set_handler_fn(dispatch_interrupt);
		idt[crate::arch::x86_64::apic::TLB_SHOOTDOWN_VECTOR as usize].set_handler_fn(tlb_shootdown);
		idt[crate::arch::x86_64::apic::IPI_WAKE_VECTOR as usize].set_handler_fn(ipi_wake);
		idt[crate::arch::x86_64::apic::STOP_VECTOR as usize].set_handler_fn(stop_ipi);
		idt[crate::arch::x86_64::apic::SPURIOUS_VECTOR as usize].set_handler_fn(spurious);
	}
	idt
}

extern "x86-interrupt" fn divide_error(frame: InterruptStackFrame) {
	crate::bugcheck::stop(StopCode::KmodeExceptionNotHandled, [frame.instruction_pointer.as_u64(), 0, 0, 0]);
}

extern "x86-interrupt" fn debug(_frame: InterruptStackFrame) {
	crate::arch::x86_64::debugregs::dispatch();
}

extern "x86-interrupt" fn nmi(frame: InterruptStackFrame) {
	crate::bugcheck::stop(StopCode::CriticalProcessDied, [frame.instruction_pointer.as_u64(), 0, 0, 0]);
}

extern "x86-interrupt" fn breakpoint(_frame: InterruptStackFrame) {}

extern "x86-interrupt" fn overflow(frame: InterruptStackFrame) {
	crate::bugcheck::stop(StopCode::KmodeExceptionNotHandled, [frame.instruction_pointer.as_u64(), 0, 0, 0]);
}

extern "x86-interrupt" fn invalid_opcode(frame: InterruptStackFrame) {
	crate::bugcheck::stop(StopCode::KmodeExceptionNotHandled, [frame.instruction_pointer.as_u64(), 0, 0, 0]);
}

extern "x86-interrupt" fn device_not_available(_frame: InterruptStackFrame) {
	crate::bugcheck::stop(StopCode::KmodeExceptionNotHandled, [0, 0, 0, 0]);
}

extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, error_code: u64) -> ! {
	crate::bugcheck::stop(StopCode::CriticalProcessDied, [frame.instruction_pointer.as_u64(), error_code, 0, 0]);
}

extern "x86-interrupt" fn general_protection(frame: InterruptStackFrame, error_code: u64) {
	crate::bugcheck::stop(
		StopCode::KmodeExceptionNotHandled,
		[frame.instruction_pointer.as_u64(), error_code, 0, 0],
	);
}

extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, error_code: PageFaultErrorCode) {
	let fault_va = Cr2::read().map(|a| a.as_u64()).unwrap_or(0);
	let mut bits = FaultBits::empty();
	if error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
		bits |= FaultBits::WRITE;
	}
	if error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
		bits |= FaultBits::PRESENT;
	}
	if error_code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
		bits |= FaultBits::EXECUTE;
	}
	let mode = if error_code.contains(PageFaultErrorCode::USER_MODE) {
		ProcessMode::User
	} else {
		ProcessMode::Kernel
	};

	if fault::handle(bits, fault_va, mode).is_err() {
		match mode {
			ProcessMode::Kernel => crate::bugcheck::stop(
				StopCode::AttemptedWriteToReadonlyMemory,
				[fault_va, frame.instruction_pointer.as_u64(), 0, 0],
			),
			ProcessMode::User => crate::sched::process::terminate_current_thread(crate::status::Status::AccessViolation),
		}
	}
}

extern "x86-interrupt" fn machine_check(frame: InterruptStackFrame) -> ! {
	crate::bugcheck::stop(StopCode::CriticalProcessDied, [frame.instruction_pointer.as_u64(), 0, 0, 0]);
}

extern "x86-interrupt" fn dispatch_interrupt(_frame: InterruptStackFrame) {
	crate::arch::x86_64::apic::eoi();
	crate::dpc::retire_queue();
}

extern "x86-interrupt" fn tlb_shootdown(_frame: InterruptStackFrame) {
	x86_64::instructions::tlb::flush_all();
	crate::arch::x86_64::apic::acknowledge_tlb_shootdown();
	crate::arch::x86_64::apic::eoi();
}

extern "x86-interrupt" fn ipi_wake(_frame: InterruptStackFrame) {
	crate::arch::x86_64::apic::eoi();
}

/// Sent by [`crate::bugcheck::stop`] to every other CPU. Does not return in
/// practice: once a bugcheck is underway the whole system is going down and
/// this CPU has nothing left to service.
extern "x86-interrupt" fn stop_ipi(_frame: InterruptStackFrame) {
	x86_64::instructions::interrupts::disable();
	loop {
		x86_64::instructions::hlt();
	}
}

extern "x86-interrupt" fn spurious(_frame: InterruptStackFrame) {}
