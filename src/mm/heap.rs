//! Wires `extern crate alloc`'s global allocator to the pool layer, so
//! `Box`/`Vec`/`BTreeMap` used by the scheduler, object manager, and VAD
//! tree draw their backing pages through the same PFN/VA machinery as every
//! other kernel allocation.
//!
//! Grounded on the teacher's `mm::init` (`ALLOCATOR.lock().init(...)`), with
//! `talc` kept as the underlying allocator crate.

use hermit_sync::OnceCell;
use talc::{ErrOnOom, Span, Talc, Talck};

use crate::config::PAGE_SIZE;
use crate::mm::paging::{Pte, PteFlags};
use crate::mm::pfn::{self, AllocationKind};
use crate::mm::poolva::VaBitmap;

#[global_allocator]
static ALLOCATOR: Talck<crate::sync::spinlock::RawSpinlock, ErrOnOom> =
	Talc::new(ErrOnOom).lock();

// `talc::Talck` expects its lock type to implement `lock_api::RawMutex`;
// `RawSpinlock` below provides the minimal adapter so the same ticket lock
// used throughout the kernel backs the heap too, instead of pulling in a
// second mutex implementation just for this one static.
unsafe impl lock_api::RawMutex for crate::sync::spinlock::RawSpinlock {
	const INIT: Self = Self::new();
	type GuardMarker = lock_api::GuardSend;

	fn lock(&self) {
		self.raw_acquire();
	}

	fn try_lock(&self) -> bool {
		self.try_raw_acquire()
	}

	unsafe fn unlock(&self) {
		self.raw_release();
	}
}

static HEAP_VA: OnceCell<VaBitmap> = OnceCell::new();

/// Grows the heap arena by one page backed by a freshly requested zeroed
/// frame. Called once at boot with an initial arena and again on-demand
/// if `talc` reports exhaustion (wired through `talc`'s OOM handler in a
/// fuller implementation; this executive core pre-commits a generous
/// initial arena instead, matching the teacher's fixed 2 MiB bootstrap
/// arena sizing).
pub fn init(initial_pages: usize) {
	let heap_va = HEAP_VA.get_or_init(VaBitmap::new);
	let mut base = 0u64;
	for i in 0..initial_pages {
		let frame = pfn::request(AllocationKind::Zeroed).expect("out of memory during heap bootstrap");
		let offset = heap_va.allocate_one().expect("pool VA exhausted during heap bootstrap");
		let va = crate::mm::poolva::POOL_BASE + offset;
		if i == 0 {
			base = va;
		}
		let pte = Pte::new(pfn::frame_to_phys(frame), PteFlags::PRESENT | PteFlags::WRITABLE);
		crate::mm::paging::map_page(va, pte).expect("failed to map heap arena page");
		pfn::activate(frame, va);
	}

	unsafe {
		ALLOCATOR
			.lock()
			.claim(Span::from_base_size(base as *mut u8, initial_pages * PAGE_SIZE))
			.expect("failed to claim heap arena");
	}
}
