//! Memory hierarchy: the PFN database, the recursive page-table walker,
//! hyperspace, the nonpaged-pool VA bitmap and slab allocator, the VAD tree,
//! and the page-fault handler.

pub mod fault;
pub mod heap;
pub mod hyperspace;
pub mod paging;
pub mod pfn;
pub mod pool;
pub mod poolva;
pub mod usermem;
pub mod vad;

/// Boots the memory subsystem in dependency order: the PFN database first
/// (needs only the firmware memory map), then the pool VA bitmap, then an
/// initial heap arena so `alloc`-based data structures become usable for
/// every later subsystem (scheduler queues, VAD nodes, handle tables).
pub fn init(total_pages: u64, regions: &[pfn::MemoryRegion]) {
	pfn::init(total_pages, regions);
	pool::init();
	heap::init(512);
}
