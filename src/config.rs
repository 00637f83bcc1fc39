//! Compile-time and boot-time tunables.
//!
//! Compile-time constants live here as plain `const`s, matching the
//! teacher's `config.rs`. Values only known once the loader hands off
//! control (framebuffer geometry, the physical-memory direct-map base, the
//! ACPI RSDP) are collected into [`BootConfig`] and published once via
//! [`init`].

use hermit_sync::OnceCell;

pub const PAGE_SIZE: usize = 0x1000;
pub const LARGE_PAGE_SIZE: usize = 0x20_0000;

/// Byte span of physical memory one [`PAGE_SIZE`] PFN-database entry covers.
pub const PFN_FRAME_SIZE: usize = PAGE_SIZE;

/// Total virtual-address span reserved for the nonpaged pool bitmap.
pub const POOL_VA_SPAN: usize = 8 * 1024 * 1024 * 1024;

/// Lookaside slab size classes, smallest to largest, each including the
/// 16-byte pool header.
pub const SLAB_SIZE_CLASSES: [usize; 7] = [32, 64, 128, 256, 512, 1024, 2048];

pub const POOL_HEADER_SIZE: usize = 16;
pub const POOL_HEADER_CANARY: u32 = u32::from_be_bytes(*b"BEKA");

pub const KERNEL_STACK_SIZE: usize = 24 * 1024;
pub const KERNEL_STACK_SIZE_LARGE: usize = 96 * 1024;
pub const KERNEL_STACK_GUARD_PAGES: usize = 1;

/// Default size of a freshly created process's main-thread user stack.
pub const USER_STACK_SIZE: usize = 1024 * 1024;
pub const USER_STACK_GUARD_PAGES: usize = 1;

/// Default scheduler quantum, expressed in timer ticks.
pub const DEFAULT_TIME_SLICE_TICKS: u32 = 20;

pub const MAX_CPUS: usize = 256;

/// Index of the PML4 slot used for the recursive self-map. Matches the
/// fixed virtual address `0xFFFF_FFFF_FFFF_F000` used throughout `mm::paging`.
pub const RECURSIVE_PML4_INDEX: usize = 511;

pub const HANDLE_GRANULARITY: u32 = 4;
pub const HANDLE_TABLE_LEVEL0_ENTRIES: usize = 256;

/// Highest address a user-mode thread may name in a syscall argument.
/// Deliberately short of the full canonical-low ceiling: the area just
/// below that ceiling is reserved for the thread's own stack, and letting
/// a syscall target it would make a pointer into the caller's own stack
/// look like a normal, probeable user buffer.
pub const MAX_USER_ADDRESS: u64 = 0x0000_7000_0000_0000;

/// Lowest address `find_gap` will ever hand out, keeping the zero page and
/// the next handful of pages permanently unmapped so a null-pointer
/// dereference from user code reliably faults instead of landing on real
/// data.
pub const MIN_USER_ADDRESS: u64 = 0x0001_0000;

/// Values handed off by the UEFI loader. Field layout mirrors the shape
/// described by the external boot contract: framebuffer parameters, a
/// memory-descriptor array with explicit per-descriptor size for
/// forward compatibility, the ACPI RSDP, and the kernel's own PML4.
#[derive(Clone, Copy, Debug)]
pub struct BootConfig {
	pub framebuffer_base: u64,
	pub framebuffer_size: u64,
	pub framebuffer_width: u32,
	pub framebuffer_height: u32,
	pub framebuffer_stride: u32,
	pub physical_memory_offset: u64,
	pub acpi_rsdp: Option<u64>,
	pub kernel_pml4_phys: u64,
	pub initial_stack_top: u64,
}

static BOOT_CONFIG: OnceCell<BootConfig> = OnceCell::new();

/// Publishes the boot configuration. Must be called exactly once, before
/// any other subsystem reads [`boot_config`].
pub fn init(cfg: BootConfig) {
	BOOT_CONFIG
		.set(cfg)
		.unwrap_or_else(|_| panic!("config::init called more than once"));
}

pub fn boot_config() -> &'static BootConfig {
	BOOT_CONFIG.get().expect("config::init not called yet")
}

/// Like [`boot_config`] but `None` instead of panicking, for code that may
/// run before hand-off configuration is published (the bugcheck screen, in
/// particular, must never panic while rendering a panic).
pub fn try_boot_config() -> Option<&'static BootConfig> {
	BOOT_CONFIG.get()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn slab_classes_are_sorted_and_fit_before_pool_cutoff() {
		for pair in SLAB_SIZE_CLASSES.windows(2) {
			assert!(pair[0] < pair[1]);
		}
		assert!(*SLAB_SIZE_CLASSES.last().unwrap() <= PAGE_SIZE / 2);
	}
}
