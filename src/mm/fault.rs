//! Page-fault handler: classifies every fault and services demand-zero,
//! transition, and file-backed cases.
//!
//! Grounded on `original_source/kernel/core/mm/fault.c`; the decision table
//! is reproduced directly from the design's §4.7.

use bitflags::bitflags;

use crate::bugcheck::StopCode;
use crate::config::PAGE_SIZE;
use crate::irql;
use crate::mm::hyperspace;
use crate::mm::paging::{self, Pte, PteFlags};
use crate::mm::pfn::{self, AllocationKind, FrameIndex};
use crate::sched::process::ProcessMode;
use crate::status::Status;

bitflags! {
	#[derive(Copy, Clone, Debug)]
	pub struct FaultBits: u32 {
		const WRITE   = 1 << 0;
		const PRESENT = 1 << 1;
		const EXECUTE = 1 << 2;
	}
}

const KERNEL_RANGE_START: u64 = 0xFFFF_8000_0000_0000;

fn is_canonical(va: u64) -> bool {
	let top17 = va >> 47;
	top17 == 0 || top17 == 0x1FFFF
}

/// Services a page fault. Returns `Ok(())` when the fault was resolved and
/// execution may resume; `Err(Status::AccessViolation)` to reflect a fault
/// back to the faulting user-mode context. Kernel-mode faults that cannot
/// be resolved bugcheck and never return.
pub fn handle(bits: FaultBits, fault_va: u64, mode: ProcessMode) -> Result<(), Status> {
	if !is_canonical(fault_va) {
		return reject(mode, StopCode::PageFault, fault_va);
	}

	let in_kernel_range = fault_va >= KERNEL_RANGE_START;

	if bits.contains(FaultBits::EXECUTE) && bits.contains(FaultBits::PRESENT) {
		if let Ok(pte_ptr) = paging::get_pte_pointer(fault_va) {
			let pte = unsafe { *pte_ptr };
			if pte.flags().contains(PteFlags::NO_EXECUTE) {
				return reject(mode, StopCode::KmodeExceptionNotHandled, fault_va);
			}
		}
	}

	if !in_kernel_range {
		if mode == ProcessMode::Kernel {
			return Err(Status::AccessViolation);
		}
		return handle_user_fault(bits, fault_va);
	}

	if mode == ProcessMode::User {
		return Err(Status::AccessViolation);
	}

	handle_kernel_fault(bits, fault_va)
}

fn handle_kernel_fault(bits: FaultBits, fault_va: u64) -> Result<(), Status> {
	let pte_ptr = match paging::get_pte_pointer(fault_va) {
		Ok(p) => p,
		Err(_) => crate::bugcheck::stop(StopCode::PageFault, [fault_va, 0, 0, 0]),
	};
	let pte = unsafe { *pte_ptr };

	if !pte.is_present() {
		if pte.flags().contains(PteFlags::GUARD) {
			crate::bugcheck::stop(StopCode::GuardPageDereference, [fault_va, 0, 0, 0]);
		}
	} else if bits.contains(FaultBits::WRITE) && !pte.flags().contains(PteFlags::WRITABLE) {
		crate::bugcheck::stop(StopCode::AttemptedWriteToReadonlyMemory, [fault_va, 0, 0, 0]);
	} else if bits.contains(FaultBits::WRITE) {
		let mut writable = pte;
		writable.set_dirty();
		let _ = paging::map_page(fault_va & !0xFFF, writable);
		return Ok(());
	}

	if !pte.is_present() && pte.flags().contains(PteFlags::TRANSITION) {
		irql::assert_suspendable();
		return reactivate_transition(fault_va, pte);
	}

	if !pte.is_present() && !pte.flags().contains(PteFlags::TRANSITION) && !pte.flags().contains(PteFlags::GUARD) {
		irql::assert_suspendable();
		return demand_zero(fault_va, pte.flags().contains(PteFlags::WRITABLE));
	}

	crate::bugcheck::stop(StopCode::PageFault, [fault_va, 0, 0, 0]);
}

fn demand_zero(fault_va: u64, writable: bool) -> Result<(), Status> {
	let frame = pfn::request(AllocationKind::Zeroed).ok_or(Status::NoMemory)?;
	let page_va = fault_va & !0xFFF;
	let mut flags = PteFlags::PRESENT;
	if writable {
		flags |= PteFlags::WRITABLE;
	}
	let pte = Pte::new(pfn::frame_to_phys(frame), flags);
	paging::map_page(page_va, pte)?;
	pfn::activate(frame, page_va);
	Ok(())
}

fn reactivate_transition(fault_va: u64, soft_pte: Pte) -> Result<(), Status> {
	let frame = pfn::FrameIndex::try_from(soft_pte.0 >> 12).map_err(|_| Status::InvalidState)?;
	let page_va = fault_va & !0xFFF;
	let pte = Pte::new(pfn::frame_to_phys(frame), PteFlags::PRESENT | PteFlags::WRITABLE);
	paging::map_page(page_va, pte)?;
	pfn::activate(frame, page_va);
	Ok(())
}

/// Fills a freshly allocated frame from a file-backed VAD's backing file:
/// maps it into hyperspace, reads `PAGE_SIZE` bytes starting at `offset`,
/// zero-fills whatever the read came up short on (the tail of the last
/// page of a segment almost always extends past the file's own length),
/// and unmaps.
fn read_file_page(frame: FrameIndex, file_body: *mut u8, offset: u64) -> Result<(), Status> {
	let (hyperspace_va, token) = hyperspace::map(frame);
	let buf = unsafe { core::slice::from_raw_parts_mut(hyperspace_va as *mut u8, PAGE_SIZE) };
	let result = crate::fs::read_file(file_body, offset, buf);
	let read = match result {
		Ok(read) => read,
		Err(status) => {
			hyperspace::unmap(token);
			return Err(status);
		}
	};
	if read < buf.len() {
		buf[read..].fill(0);
	}
	hyperspace::unmap(token);
	Ok(())
}

fn handle_user_fault(bits: FaultBits, fault_va: u64) -> Result<(), Status> {
	let process = crate::sched::current_process();
	let vad_info = process
		.vad_space
		.with_shared(|tree| tree.find_containing(fault_va).map(|v| (v.flags(), v.file_offset, v.file_body(), v.start())));

	let (flags, file_offset, file_body, vad_start) = match vad_info {
		Some(v) => v,
		None => return Err(Status::AccessViolation),
	};

	if flags.contains(crate::mm::vad::VadFlags::RESERVED) {
		return Err(Status::AccessViolation);
	}

	irql::assert_suspendable();
	let frame = pfn::request(AllocationKind::Zeroed).ok_or(Status::NoMemory)?;
	let page_va = fault_va & !0xFFF;

	if let (Some(base_offset), Some(body)) = (file_offset, file_body) {
		let page_offset_in_vad = page_va - vad_start;
		if read_file_page(frame, body, base_offset + page_offset_in_vad).is_err() {
			pfn::release(frame);
			return Err(Status::AccessViolation);
		}
	}

	let mut page_flags = PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE | PteFlags::NO_EXECUTE;
	if flags.contains(crate::mm::vad::VadFlags::WRITE) {
		page_flags |= PteFlags::WRITABLE;
	}
	if flags.contains(crate::mm::vad::VadFlags::EXECUTE) {
		page_flags.remove(PteFlags::NO_EXECUTE);
	}

	let pte = Pte::new(pfn::frame_to_phys(frame), page_flags);
	paging::map_page(page_va, pte)?;
	pfn::activate(frame, page_va);
	let _ = bits;
	Ok(())
}

fn reject(mode: ProcessMode, kernel_stop: StopCode, fault_va: u64) -> Result<(), Status> {
	if mode == ProcessMode::User {
		Err(Status::AccessViolation)
	} else {
		crate::bugcheck::stop(kernel_stop, [fault_va, 0, 0, 0]);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn canonical_address_check() {
		assert!(is_canonical(0x0000_7FFF_FFFF_FFFF));
		assert!(is_canonical(0xFFFF_8000_0000_0000));
		assert!(!is_canonical(0x0001_0000_0000_0000));
	}
}
