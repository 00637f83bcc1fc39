//! Per-CPU GDT and TSS.
//!
//! Grounded on the teacher's `arch::x86_64::kernel::gdt`, modernized to the
//! `x86_64` crate's typed `GlobalDescriptorTable`/`TaskStateSegment` instead
//! of hand-packed descriptor bytes. Unlike the teacher (one shared GDT with
//! a per-core TSS slot pair) each CPU here owns a fully independent,
//! leaked GDT; with a fixed, small [`crate::config::MAX_CPUS`] the extra
//! page per CPU is cheaper than serializing access to a shared table.

use alloc::boxed::Box;

use x86_64::instructions::segmentation::{Segment, CS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::model_specific::Msr;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::percpu;

const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;

/// Every CPU builds an identical table in the same order (null, kernel
/// code, kernel data, an unused 32-bit user code slot, user data, user
/// code, TSS), so these raw selector values are stable across CPUs even
/// though each CPU's GDT is a distinct, independently leaked allocation.
///
/// The gap at index 3 isn't decorative: `syscall`/`sysret` derive the
/// kernel and user selector pairs from `STAR` by arithmetic on a single
/// base index (kernel SS = kernel CS + 8; user CS = user-base + 16, user
/// SS = user-base + 8), so the user data/code pair has to sit exactly two
/// and three slots above the base index `STAR` names, matching the
/// `SegmentSelector::new(5, Ring3)`/`new(4, Ring3)` pair [`syscall::init_current_cpu`]
/// writes into it.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_DATA_SELECTOR: u16 = 0x20;
pub const USER_CODE_SELECTOR: u16 = 0x28;

/// Builds this CPU's TSS from the per-CPU interrupt stacks already
/// installed by [`crate::percpu::init_one`], then loads a freshly leaked
/// GDT pointing at it.
pub fn init_current_cpu() {
	let cpu = percpu::current();

	let mut tss = TaskStateSegment::new();
	tss.privilege_stack_table[0] = unsafe { *cpu.rsp0.get() };
	for (i, stack) in cpu.ist_stacks.iter().enumerate() {
		tss.interrupt_stack_table[i] = unsafe { *stack.get() };
	}
	let tss: &'static TaskStateSegment = Box::leak(Box::new(tss));

	let mut gdt = GlobalDescriptorTable::new();
	let code = gdt.append(Descriptor::kernel_code_segment());
	let data = gdt.append(Descriptor::kernel_data_segment());
	let _sysret_base_placeholder = gdt.append(Descriptor::user_data_segment());
	let user_data = gdt.append(Descriptor::user_data_segment());
	let user_code = gdt.append(Descriptor::user_code_segment());
	let tss_selector = gdt.append(Descriptor::tss_segment(tss));
	let gdt: &'static GlobalDescriptorTable = Box::leak(Box::new(gdt));

	debug_assert_eq!(code.0, KERNEL_CODE_SELECTOR);
	debug_assert_eq!(data.0, KERNEL_DATA_SELECTOR);
	debug_assert_eq!(user_data.0, USER_DATA_SELECTOR | 3);
	debug_assert_eq!(user_code.0, USER_CODE_SELECTOR | 3);

	gdt.load();
	unsafe {
		CS::set_reg(code);
		SS::set_reg(data);
		load_tss(tss_selector);
	}

	// Keep IA32_KERNEL_GS_BASE pointed at this CPU's block even across the
	// segment reload above, matching the convention `percpu::init_one`
	// establishes: GS_BASE and KERNEL_GS_BASE both address the PerCpu block
	// while running in kernel mode.
	let addr = VirtAddr::new(cpu as *const _ as u64);
	unsafe { Msr::new(IA32_KERNEL_GS_BASE).write(addr.as_u64()) };
}
