//! Executive core of a small x86-64 operating-system kernel: the IRQL/DPC
//! discipline, the memory hierarchy (PFN database through VADs), the object
//! manager and handle tables, the per-CPU scheduler, and the x86-64
//! architectural layer (GDT/IDT, x2APIC, SMP bring-up, the `syscall` fast
//! path) that ties them to real hardware.
//!
//! Grounded on the teacher's `lib.rs` module layout (bring-up driven from a
//! single crate root, `log`-crate logging installed before anything else
//! runs, a `#[panic_handler]` that routes through the same fatal-error path
//! as every other unrecoverable condition) adapted to this crate's own boot
//! hand-off shape.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::panic::PanicInfo;

pub mod arch;
pub mod bugcheck;
pub mod config;
pub mod dpc;
pub mod fs;
pub mod framebuffer;
pub mod irql;
pub mod logging;
pub mod mm;
pub mod ob;
pub mod percpu;
pub mod sched;
pub mod status;
pub mod sync;

/// Brings up every subsystem on the bootstrap processor in the order each
/// one's dependencies require, then falls into the idle loop. Called once,
/// by the loader's hand-off code, with CPU 0's own per-CPU block not yet
/// installed.
///
/// `regions` describes physical memory exactly as the firmware memory map
/// reported it; `cfg` carries the rest of the hand-off (framebuffer
/// geometry, the direct-map base, the ACPI RSDP). `application_processor_apic_ids`
/// is whatever the loader already parsed out of the ACPI MADT (an ACPI table
/// reader lives outside this crate); pass an empty slice to run
/// single-processor.
///
/// # Safety
/// Must be called exactly once, with interrupts disabled, before any other
/// crate entry point runs.
pub unsafe fn kernel_main(
	cfg: config::BootConfig,
	total_pages: u64,
	regions: &[mm::pfn::MemoryRegion],
	application_processor_apic_ids: &[u32],
) -> ! {
	logging::init();
	log::info!("booting");

	config::init(cfg);
	mm::init(total_pages, regions);

	unsafe { percpu::init_one(0) };
	arch::x86_64::init_current_cpu();
	sched::register_current_cpu();
	sched::bootstrap_current_cpu();

	#[cfg(feature = "smp")]
	if !application_processor_apic_ids.is_empty() {
		if let Err(status) = arch::x86_64::smp::start_application_processors(application_processor_apic_ids) {
			log::warn!("application-processor bring-up failed: {status:?}");
		}
	}

	x86_64::instructions::interrupts::enable();
	log::info!("boot complete, entering idle loop on the bootstrap processor");

	idle_forever();
}

fn idle_forever() -> ! {
	loop {
		x86_64::instructions::hlt();
	}
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
	log::error!("{info}");
	bugcheck::stop(bugcheck::StopCode::AssertionFailure, [0, 0, 0, 0]);
}
