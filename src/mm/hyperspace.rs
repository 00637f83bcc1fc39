//! Hyperspace: one scoped virtual-address slot for temporarily mapping an
//! arbitrary physical frame.
//!
//! Grounded on `original_source/kernel/core/mm/hypermap.c`. Intended for
//! short, bounded kernel operations — zeroing a page, staging a file-backed
//! page's contents — never held across a blocking call.

use crate::irql::Irql;
use crate::mm::paging::{Pte, PteFlags};
use crate::mm::pfn::{self, FrameIndex};
use crate::sync::spinlock::RawSpinlock;

/// Fixed reserved virtual address for the hyperspace window. Placed
/// directly below the recursive self-map region.
const HYPERSPACE_VA: u64 = 0xFFFF_FFFF_FFFE_F000;

static LOCK: RawSpinlock = RawSpinlock::new();

/// Opaque proof-of-ownership returned by [`map`] and consumed by [`unmap`].
pub struct MapToken {
	old_irql: Irql,
}

/// Maps `frame` at the hyperspace VA with read/write access and returns the
/// VA plus a token that must be passed to [`unmap`] to release the window.
pub fn map(frame: FrameIndex) -> (u64, MapToken) {
	let old_irql = crate::irql::raise(crate::irql::DISPATCH_LEVEL);
	LOCK.raw_acquire();

	let phys = pfn::frame_to_phys(frame);
	let pte = Pte::new(phys, PteFlags::PRESENT | PteFlags::WRITABLE);
	let _ = crate::mm::paging::map_page(HYPERSPACE_VA, pte);

	(HYPERSPACE_VA, MapToken { old_irql })
}

pub fn unmap(token: MapToken) {
	crate::mm::paging::unmap_page(HYPERSPACE_VA);
	LOCK.raw_release();
	crate::irql::lower(token.old_irql);
}
