//! Page-table entries and the recursive self-map walker.
//!
//! Grounded on `examples/hermit-os-kernel/src/arch/x86_64/mm/paging.rs`: the
//! fixed recursive PML4 slot address and the `PageTableEntryFlags` bitflags
//! layout are carried over directly; the walker itself (allocating
//! intermediate tables on demand, returning a leaf PTE address) is this
//! crate's own per §4.4.

use bitflags::bitflags;
use x86_64::VirtAddr;

use crate::config::RECURSIVE_PML4_INDEX;
use crate::mm::pfn;
use crate::status::Status;

/// Virtual address of the PML4 table, reached through the recursive
/// self-map slot at index 511: `0xFFFF_FFFF_FFFF_F000`.
pub const PML4_ADDRESS: u64 = recursive_table_address(4);

bitflags! {
	#[derive(Copy, Clone, Debug, Eq, PartialEq)]
	pub struct PteFlags: u64 {
		const PRESENT          = 1 << 0;
		const WRITABLE         = 1 << 1;
		const USER_ACCESSIBLE  = 1 << 2;
		const WRITE_THROUGH    = 1 << 3;
		const CACHE_DISABLE    = 1 << 4;
		const ACCESSED         = 1 << 5;
		const DIRTY            = 1 << 6;
		const HUGE_PAGE        = 1 << 7;
		const GLOBAL           = 1 << 8;
		/// Software-defined: set on demand-zero/transition PTEs that are
		/// not currently present, to mean "copy-on-write once materialized".
		const COPY_ON_WRITE    = 1 << 9;
		/// Software-defined, not-present only: page is on the Standby list
		/// (transition state) rather than never having been touched.
		const TRANSITION       = 1 << 10;
		/// Software-defined, not-present only: this page is a guard page;
		/// any access bugchecks `GUARD_PAGE_DEREFERENCE`.
		const GUARD            = 1 << 11;
		const NO_EXECUTE       = 1 << 63;
	}
}

impl PteFlags {
	pub fn normal() -> Self {
		PteFlags::PRESENT
	}

	pub fn writable(mut self) -> Self {
		self |= PteFlags::WRITABLE;
		self
	}

	pub fn user(mut self) -> Self {
		self |= PteFlags::USER_ACCESSIBLE;
		self
	}

	pub fn no_execute(mut self) -> Self {
		self |= PteFlags::NO_EXECUTE;
		self
	}

	pub fn device(mut self) -> Self {
		self |= PteFlags::WRITE_THROUGH | PteFlags::CACHE_DISABLE;
		self
	}
}

const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

#[derive(Copy, Clone)]
#[repr(transparent)]
pub struct Pte(pub u64);

impl Pte {
	pub const EMPTY: Pte = Pte(0);

	pub fn new(phys: u64, flags: PteFlags) -> Self {
		Pte((phys & PHYS_ADDR_MASK) | flags.bits())
	}

	pub fn is_present(self) -> bool {
		self.0 & PteFlags::PRESENT.bits() != 0
	}

	pub fn is_huge(self) -> bool {
		self.0 & PteFlags::HUGE_PAGE.bits() != 0
	}

	pub fn address(self) -> u64 {
		self.0 & PHYS_ADDR_MASK
	}

	pub fn flags(self) -> PteFlags {
		PteFlags::from_bits_truncate(self.0)
	}

	pub fn set_dirty(&mut self) {
		self.0 |= PteFlags::DIRTY.bits();
	}
}

/// Computes the virtual address of the table one level up from `level`
/// (4 = PML4, 3 = PDPT, 2 = PD, 1 = PT) that contains the entry governing
/// `va`, using the fixed recursive self-map slot.
fn table_address(va: u64, level: u8) -> u64 {
	let recursive = RECURSIVE_PML4_INDEX as u64;
	let shift = 12 + 9 * (level as u64);
	let mut addr = 0xFFFF_0000_0000_0000u64;
	for l in 0..(4 - level) {
		addr |= recursive << (39 - 9 * l);
	}
	addr |= (va >> shift) << 12;
	canonicalize(addr)
}

const fn recursive_table_address(_level: u8) -> u64 {
	0xFFFF_FFFF_FFFF_F000
}

fn canonicalize(addr: u64) -> u64 {
	if addr & (1 << 47) != 0 {
		addr | 0xFFFF_0000_0000_0000
	} else {
		addr & 0x0000_FFFF_FFFF_FFFF
	}
}

fn pte_ptr_at(table_va: u64, index: usize) -> *mut Pte {
	(table_va + (index as u64) * 8) as *mut Pte
}

fn index(va: u64, level: u8) -> usize {
	((va >> (12 + 9 * (level as u64 - 1))) & 0x1FF) as usize
}

/// Returns the address of the leaf (level-1, i.e. 4 KiB PTE) entry
/// governing `va`, allocating and splicing in any missing intermediate
/// table along the way. Returns [`Status::NoMemory`] if an intermediate
/// table could not be allocated.
pub fn get_pte_pointer(va: u64) -> Result<*mut Pte, Status> {
	let pml4 = pte_ptr_at(PML4_ADDRESS, index(va, 4));
	ensure_present(pml4, va, 3)?;

	let pdpt = pte_ptr_at(table_address(va, 3), index(va, 3));
	ensure_present(pdpt, va, 2)?;

	let pd = pte_ptr_at(table_address(va, 2), index(va, 2));
	let pd_entry = unsafe { *pd };
	if pd_entry.is_present() && pd_entry.is_huge() {
		return Ok(pd);
	}
	ensure_present(pd, va, 1)?;

	let pt = pte_ptr_at(table_address(va, 1), index(va, 1));
	Ok(pt)
}

fn ensure_present(entry: *mut Pte, _va: u64, _child_level: u8) -> Result<(), Status> {
	let current = unsafe { *entry };
	if current.is_present() {
		return Ok(());
	}
	let frame = pfn::request(pfn::AllocationKind::Zeroed).ok_or(Status::NoMemory)?;
	let phys = pfn::frame_to_phys(frame);
	let new_entry = Pte::new(phys, PteFlags::PRESENT | PteFlags::WRITABLE);
	unsafe { core::ptr::write_volatile(entry, new_entry) };
	Ok(())
}

/// Writes `pte` at the leaf entry for `va` and invalidates the local TLB
/// (and, on SMP, broadcasts a shootdown) for that address.
pub fn map_page(va: u64, pte: Pte) -> Result<(), Status> {
	let leaf = get_pte_pointer(va)?;
	unsafe { core::ptr::write_volatile(leaf, pte) };
	invalidate_page(VirtAddr::new(va));
	Ok(())
}

pub fn unmap_page(va: u64) {
	if let Ok(leaf) = get_pte_pointer(va) {
		unsafe { core::ptr::write_volatile(leaf, Pte::EMPTY) };
	}
	invalidate_page(VirtAddr::new(va));
}

pub fn invalidate_page(va: VirtAddr) {
	x86_64::instructions::tlb::flush(va);
	#[cfg(feature = "smp")]
	crate::arch::x86_64::apic::broadcast_tlb_shootdown(va.as_u64());
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pte_round_trips_address_and_flags() {
		let phys = 0x13_3700_0000u64;
		let pte = Pte::new(phys, PteFlags::PRESENT | PteFlags::WRITABLE);
		assert_eq!(pte.address(), phys);
		assert!(pte.is_present());
		assert!(pte.flags().contains(PteFlags::WRITABLE));
	}

	#[test]
	fn index_decomposition_covers_512_entries() {
		for i in 0..512usize {
			let va = (i as u64) << 12;
			assert_eq!(index(va, 1), i);
		}
	}
}
