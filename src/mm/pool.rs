//! Pool allocator: per-CPU lookaside slabs for small nonpaged blocks, a
//! global overflow pool for large blocks, and a paged path that routes
//! through the VAD tree.
//!
//! Grounded on `original_source/kernel/core/mm/pool.c`; the slab layout
//! mirrors the teacher's `mm::allocator`/`mm::mod` pairing (a generic
//! pool layer over arch-specific physical/virtual allocation).

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::config::{PAGE_SIZE, POOL_HEADER_CANARY, POOL_HEADER_SIZE, SLAB_SIZE_CLASSES};
use crate::irql;
use crate::mm::paging::{Pte, PteFlags};
use crate::mm::pfn::{self, AllocationKind};
use crate::mm::poolva::VaBitmap;
use crate::status::Status;
use crate::sync::spinlock::Spinlock;

#[repr(C)]
struct PoolHeader {
	canary: u32,
	/// Slab index for slab blocks, `0xFF` for the global-overflow block,
	/// `0xFE` for a paged (VAD-backed) allocation.
	pool_index: u8,
	_pad: [u8; 3],
	size: u32,
	tag: u32,
}

const SLAB_POOL: u8 = 0;
const LARGE_POOL_INDEX: u8 = 0xFF;

struct FreeBlock {
	next: *mut FreeBlock,
}

pub struct LookasideSlab {
	block_size: usize,
	free_list: Spinlock<*mut FreeBlock>,
	free_count: core::sync::atomic::AtomicUsize,
}

unsafe impl Send for LookasideSlab {}
unsafe impl Sync for LookasideSlab {}

impl LookasideSlab {
	pub const fn new(block_size: usize) -> Self {
		LookasideSlab {
			block_size,
			free_list: Spinlock::new(ptr::null_mut()),
			free_count: core::sync::atomic::AtomicUsize::new(0),
		}
	}

	fn pop(&self) -> Option<*mut u8> {
		let mut head = self.free_list.lock();
		if head.is_null() {
			return None;
		}
		let block = *head;
		*head = unsafe { (*block).next };
		self.free_count.fetch_sub(1, Ordering::Relaxed);
		Some(block as *mut u8)
	}

	fn push(&self, block: *mut u8) {
		let mut head = self.free_list.lock();
		let node = block as *mut FreeBlock;
		unsafe { (*node).next = *head };
		*head = node;
		self.free_count.fetch_add(1, Ordering::Relaxed);
	}
}

static OVERFLOW_LOCK: Spinlock<*mut FreeBlock> = Spinlock::new(ptr::null_mut());
static POOL_VA: Spinlock<Option<VaBitmap>> = Spinlock::new(None);

pub fn init() {
	*POOL_VA.lock() = Some(VaBitmap::new());
}

/// Grants a callback shared access to the pool's VA bitmap, for allocators
/// that live outside this module but carve their ranges from the same
/// nonpaged pool span (kernel stacks, in particular).
pub fn with_va_bitmap<R>(f: impl FnOnce(&VaBitmap) -> R) -> R {
	f(POOL_VA.lock().as_ref().expect("pool::init not called"))
}

fn slab_index_for(size: usize) -> Option<usize> {
	SLAB_SIZE_CLASSES
		.iter()
		.position(|&class| size + POOL_HEADER_SIZE <= class)
}

/// Allocates `size` bytes of nonpaged kernel memory tagged `tag` (a 4-byte
/// identifier used for leak diagnostics). Bugchecks if called above
/// `DISPATCH_LEVEL`.
pub fn allocate(size: usize, tag: u32) -> Result<*mut u8, Status> {
	if irql::current() > irql::DISPATCH_LEVEL {
		crate::bugcheck::stop(crate::bugcheck::StopCode::IrqlNotLessOrEqual, [irql::current() as u64, 0, 0, 0]);
    }

	if let Some(slab_idx) = slab_index_for(size) {
		loop {
			let slab = &crate::percpu::current().lookaside[slab_idx];
			if let Some(block) = slab.pop() {
				return Ok(init_header(block, SLAB_POOL, slab_idx as u32, size, tag));
			}
			refill_slab(slab_idx)?;
		}
	}

	allocate_large(size, tag)
}

fn init_header(block: *mut u8, pool_index: u8, size_or_index: u32, size: usize, tag: u32) -> *mut u8 {
	let header = block as *mut PoolHeader;
	unsafe {
		ptr::write(
			header,
			PoolHeader {
				canary: POOL_HEADER_CANARY,
				pool_index,
				_pad: [0; 3],
				size: if pool_index == SLAB_POOL { size_or_index } else { size as u32 },
				tag,
			},
		);
		block.add(POOL_HEADER_SIZE)
	}
}

fn refill_slab(slab_idx: usize) -> Result<(), Status> {
	let block_size = SLAB_SIZE_CLASSES[slab_idx];
	let va_offset = POOL_VA
		.lock()
		.as_ref()
		.expect("pool::init not called")
		.allocate_one()
		.ok_or(Status::NoMemory)?;
	let va = crate::mm::poolva::POOL_BASE + va_offset;

	let frame = pfn::request(AllocationKind::Zeroed).ok_or(Status::NoMemory)?;
	let pte = Pte::new(pfn::frame_to_phys(frame), PteFlags::PRESENT | PteFlags::WRITABLE);
	crate::mm::paging::map_page(va, pte)?;
	pfn::activate(frame, va);

	let slab = &crate::percpu::current().lookaside[slab_idx];
	let blocks_per_page = PAGE_SIZE / block_size;
	for i in 0..blocks_per_page {
		let block = (va as usize + i * block_size) as *mut u8;
		let header = block as *mut PoolHeader;
		unsafe {
			ptr::write(
				header,
				PoolHeader {
					canary: POOL_HEADER_CANARY,
					pool_index: SLAB_POOL,
					_pad: [0; 3],
					size: slab_idx as u32,
					tag: 0,
				},
			);
		}
		slab.push(block);
	}
	Ok(())
}

fn allocate_large(size: usize, tag: u32) -> Result<*mut u8, Status> {
	let total = size + POOL_HEADER_SIZE;
	let page_count = total.div_ceil(PAGE_SIZE);
	let va_offset = POOL_VA
		.lock()
		.as_ref()
		.expect("pool::init not called")
		.allocate_contiguous(page_count)
		.ok_or(Status::NoMemory)?;
	let va = crate::mm::poolva::POOL_BASE + va_offset;

	for p in 0..page_count {
		let page_va = va + (p * PAGE_SIZE) as u64;
		let frame = pfn::request(AllocationKind::Zeroed).ok_or(Status::NoMemory)?;
		let pte = Pte::new(pfn::frame_to_phys(frame), PteFlags::PRESENT | PteFlags::WRITABLE);
		crate::mm::paging::map_page(page_va, pte)?;
		pfn::activate(frame, page_va);
	}

	Ok(init_header(va as *mut u8, LARGE_POOL_INDEX, 0, size, tag))
}

/// Frees a pointer previously returned by [`allocate`]. Bugchecks
/// (`MEMORY_CORRUPT_HEADER`) if the canary does not match.
pub fn free(ptr: *mut u8) {
	let block = unsafe { ptr.sub(POOL_HEADER_SIZE) };
	let header = block as *const PoolHeader;
	let (canary, pool_index, size_or_index) = unsafe { ((*header).canary, (*header).pool_index, (*header).size) };

	if canary != POOL_HEADER_CANARY {
		crate::bugcheck::stop(crate::bugcheck::StopCode::MemoryCorruptHeader, [block as u64, 0, 0, 0]);
	}

	match pool_index {
		SLAB_POOL => {
			let slab = &crate::percpu::current().lookaside[size_or_index as usize];
			slab.push(block);
		}
		LARGE_POOL_INDEX => {
			let node = block as *mut FreeBlock;
			let mut head = OVERFLOW_LOCK.lock();
			unsafe { (*node).next = *head };
			*head = node;
		}
		_ => unreachable!("unknown pool index"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn slab_index_picks_smallest_fit() {
		assert_eq!(slab_index_for(10), Some(0));
		assert_eq!(slab_index_for(2000), Some(6));
		assert_eq!(slab_index_for(2048), None);
	}
}
