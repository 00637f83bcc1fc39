//! x86-64 architectural bring-up: GDT/TSS, IDT, the local APIC, the AP
//! bring-up trampoline, hardware breakpoints, the syscall entry trampoline,
//! and the serial console.
//!
//! Grounded on the teacher's `arch::x86_64::kernel` module and on
//! `original_source/kernel/core/mh/{apic,smp,ap_main}.c`.

pub mod apic;
pub mod context;
pub mod debugregs;
pub mod gdt;
pub mod idt;
pub mod serial;
pub mod smp;
pub mod syscall;

/// Runs the per-CPU architectural bring-up sequence: GDT/TSS, IDT, and the
/// local APIC. Must run on every CPU after [`crate::percpu::init_one`] and
/// before that CPU enables interrupts.
pub fn init_current_cpu() {
	gdt::init_current_cpu();
	idt::load();
	apic::init_current_cpu();
	syscall::init_current_cpu();
}
