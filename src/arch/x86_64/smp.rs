//! Application-processor bring-up: copies the real-mode trampoline to a
//! fixed low physical address, hands each AP its own stack and PerCpu
//! block, and walks them through INIT-SIPI-SIPI one at a time.
//!
//! Grounded on `original_source/kernel/core/mh/smp.c`'s `MhInitializeSMP`/
//! `install_trampoline`/`prepare_percpu`/`send_startup_ipis`, restructured
//! around this kernel's per-CPU-block-via-GS-base model instead of the
//! original's shared `cpus[]` array indexed by APIC ID. `build.rs` assembles
//! `smp/trampoline.s` into the flat binary embedded here.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use x86_64::VirtAddr;

use crate::mm::paging::{self, Pte, PteFlags};
use crate::status::Status;

/// Fixed physical load address for the real-mode trampoline. Must match the
/// `--section-start=.text=0x8000` link flag in `build.rs` and fit in a
/// single 4 KiB, sub-1 MiB page so a single SIPI vector addresses it.
pub const AP_TRAMP_PHYS: u64 = 0x8000;

const TRAMPOLINE_BIN: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/trampoline.bin"));

/// Byte offsets into the trampoline page where the BSP stashes
/// per-bring-up values before sending SIPI. The trampoline's 64-bit landing
/// stub reads these once it has paging and long mode enabled.
mod offset {
	pub const PML4_PHYS: usize = 0xFF0;
	pub const STACK_TOP: usize = 0xFE8;
	pub const ENTRY_VIRT: usize = 0xFE0;
}

static TRAMPOLINE_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Copies the trampoline binary to [`AP_TRAMP_PHYS`] and identity-maps that
/// page so both real mode (running at its physical address) and the BSP
/// (writing the per-AP fields below) can see it.
fn install_trampoline() -> Result<(), Status> {
	if TRAMPOLINE_INSTALLED.swap(true, Ordering::AcqRel) {
		return Ok(());
	}
	assert!(TRAMPOLINE_BIN.len() <= 0xFE0, "trampoline must leave room for the bring-up fields");

	let pte = Pte::new(AP_TRAMP_PHYS, PteFlags::PRESENT | PteFlags::WRITABLE);
	paging::map_page(AP_TRAMP_PHYS, pte)?;

	unsafe {
		core::ptr::copy_nonoverlapping(TRAMPOLINE_BIN.as_ptr(), AP_TRAMP_PHYS as *mut u8, TRAMPOLINE_BIN.len());
	}

	for off in (0..4096u64).step_by(64) {
		unsafe { core::arch::asm!("clflush [{}]", in(reg) (AP_TRAMP_PHYS + off), options(nostack)) };
	}
	x86_64::instructions::tlb::flush(VirtAddr::new(AP_TRAMP_PHYS));
	Ok(())
}

fn write_bringup_field(offset: usize, value: u64) {
	unsafe { core::ptr::write_volatile((AP_TRAMP_PHYS as usize + offset) as *mut u64, value) };
}

/// Crude calibration-free delay loop. INIT-SIPI-SIPI timing only needs to be
/// in the right ballpark (the architecture manual's figures are themselves
/// conservative), so this avoids depending on the PIT or TSC being
/// calibrated this early in bring-up.
pub fn busy_wait_microseconds(us: u64) {
	for _ in 0..(us * 400) {
		core::hint::spin_loop();
	}
}

/// Brings up every AP named in `apic_ids` (which must not include the BSP's
/// own local APIC ID), one at a time: install this CPU's stack and identity
/// in the trampoline's bring-up fields, send INIT-SIPI-SIPI, then wait for
/// the AP to mark itself online before moving to the next one. Serializing
/// bring-up lets every AP share the one trampoline page safely.
pub fn start_application_processors(apic_ids: &[u32]) -> Result<(), Status> {
	install_trampoline()?;

	let pml4_phys = unsafe { x86_64::registers::control::Cr3::read().0.start_address().as_u64() };
	write_bringup_field(offset::PML4_PHYS, pml4_phys);
	write_bringup_field(offset::ENTRY_VIRT, ap_long_mode_entry as usize as u64);

	for (i, &apic_id) in apic_ids.iter().enumerate() {
		let cpu_id = (i + 1) as u32; // 0 is reserved for the BSP.
		let stack = allocate_ap_stack()?;
		write_bringup_field(offset::STACK_TOP, stack);

		PENDING_CPU_ID.store(cpu_id, Ordering::Release);
		unsafe { crate::arch::x86_64::apic::send_startup_sequence(apic_id, (AP_TRAMP_PHYS >> 12) as u8) };

		while !crate::percpu::is_online(cpu_id) {
			core::hint::spin_loop();
		}
	}
	Ok(())
}

static PENDING_CPU_ID: AtomicU32 = AtomicU32::new(0);

fn allocate_ap_stack() -> Result<u64, Status> {
	let stack = crate::mm::pool::with_va_bitmap(|bitmap| {
		crate::sched::thread::allocate_kernel_stack(false, bitmap)
	})?;
	Ok(stack.top_va)
}

/// Long-mode landing point. The trampoline's assembly has already loaded
/// CR3, enabled paging and long mode, and switched to the stack written at
/// `offset::STACK_TOP`; this is a normal Rust function from here on.
extern "C" fn ap_long_mode_entry() -> ! {
	let cpu_id = PENDING_CPU_ID.load(Ordering::Acquire);
	unsafe { crate::percpu::init_one(cpu_id) };
	crate::arch::x86_64::init_current_cpu();
	crate::sched::register_current_cpu();
	crate::sched::bootstrap_current_cpu();
	crate::percpu::mark_online(cpu_id);

	x86_64::instructions::interrupts::enable();
	loop {
		x86_64::instructions::hlt();
	}
}

