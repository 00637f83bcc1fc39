//! Object manager: typed, reference-counted kernel objects.
//!
//! Grounded on `original_source/kernel/core/ob/ob.c`.

pub mod cid;
pub mod handle;

use core::sync::atomic::{AtomicU64, Ordering};

use self::handle::HandleTable;
use crate::mm::pool;
use crate::status::Status;

/// Access-right bits threaded through every handle lookup. Named after the
/// bits `original_source/kernel/core/mt/systemcalls.c` checks for a process
/// handle (`MT_PROCESS_TERMINATE`, `MT_PROCESS_VM_OPERATION`,
/// `MT_PROCESS_CREATE_PROCESS`) and the file bits
/// `original_source/kernel/includes/fs.h` defines (`MT_FILE_READ_DATA`,
/// `MT_FILE_WRITE_DATA`); the concrete bit positions are this crate's own,
/// since the two sources never share one ACCESS_MASK layout.
pub const ACCESS_TERMINATE: u32 = 1 << 0;
pub const ACCESS_VM_OPERATION: u32 = 1 << 1;
pub const ACCESS_CREATE_PROCESS: u32 = 1 << 2;
pub const ACCESS_FILE_READ_DATA: u32 = 1 << 3;
pub const ACCESS_FILE_WRITE_DATA: u32 = 1 << 4;
pub const ACCESS_ALL: u32 = ACCESS_TERMINATE | ACCESS_VM_OPERATION | ACCESS_CREATE_PROCESS | ACCESS_FILE_READ_DATA | ACCESS_FILE_WRITE_DATA;

/// `true` when `granted` carries every bit `desired` asks for.
pub fn access_allows(granted: u32, desired: u32) -> bool {
	granted & desired == desired
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ObjectKind {
	Process,
	Thread,
	Event,
	Mutex,
	Section,
	File,
}

pub struct ObjectType {
	pub name: &'static str,
	pub total_objects: AtomicU64,
	pub total_handles: AtomicU64,
}

/// Header placed immediately before every managed object's body.
#[repr(C, align(16))]
pub struct ObjectHeader {
	pub pointer_count: AtomicU64,
	pub handle_count: AtomicU64,
	pub kind: ObjectKind,
}

impl ObjectHeader {
	pub fn new(kind: ObjectKind) -> Self {
		ObjectHeader {
			pointer_count: AtomicU64::new(1),
			handle_count: AtomicU64::new(0),
			kind,
		}
	}
}

/// Allocates `body_size` bytes plus a header, tagged for `kind`. Returns a
/// pointer to the body (the header immediately precedes it).
pub fn create(kind: ObjectKind, body_size: usize) -> Result<*mut u8, Status> {
	let total = core::mem::size_of::<ObjectHeader>() + body_size;
	let raw = pool::allocate(total, kind_tag(kind))?;
	let header = raw as *mut ObjectHeader;
	unsafe { core::ptr::write(header, ObjectHeader::new(kind)) };
	Ok(unsafe { raw.add(core::mem::size_of::<ObjectHeader>()) })
}

fn kind_tag(kind: ObjectKind) -> u32 {
	match kind {
		ObjectKind::Process => u32::from_be_bytes(*b"PROC"),
		ObjectKind::Thread => u32::from_be_bytes(*b"THRD"),
		ObjectKind::Event => u32::from_be_bytes(*b"EVNT"),
		ObjectKind::Mutex => u32::from_be_bytes(*b"MTX "),
		ObjectKind::Section => u32::from_be_bytes(*b"SECT"),
		ObjectKind::File => u32::from_be_bytes(*b"FILE"),
	}
}

fn header_of(body: *mut u8) -> *mut ObjectHeader {
	unsafe { body.sub(core::mem::size_of::<ObjectHeader>()) as *mut ObjectHeader }
}

/// Adds a reference. Returns `false` if the object's count had already
/// reached zero (the object is being or has been destroyed).
pub fn reference(body: *mut u8) -> bool {
	let header = unsafe { &*header_of(body) };
	let mut cur = header.pointer_count.load(Ordering::Relaxed);
	loop {
		if cur == 0 {
			return false;
		}
		match header
			.pointer_count
			.compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
		{
			Ok(_) => return true,
			Err(observed) => cur = observed,
		}
	}
}

/// Drops a reference, freeing the object's memory when the count reaches
/// zero.
pub fn dereference(body: *mut u8) {
	let header_ptr = header_of(body);
	let header = unsafe { &*header_ptr };
	if header.pointer_count.fetch_sub(1, Ordering::AcqRel) == 1 {
		pool::free(header_ptr as *mut u8);
	}
}

/// Places `body` (an `ob::create`-backed object) into `table` under a fresh
/// handle, bumping the object's `handle_count` so [`close_handle_body`] has
/// something real to undo. Process and Thread handles don't go through
/// here: their bodies are bare `Arc::into_raw` pointers with no
/// [`ObjectHeader`] in front of them, so `sched::process` owns their own
/// create/close pair instead.
pub fn create_handle(table: &HandleTable, body: *mut u8, access: u32, kind: ObjectKind) -> Result<u32, Status> {
	let header = unsafe { &*header_of(body) };
	header.handle_count.fetch_add(1, Ordering::AcqRel);
	table.create_handle(body as *mut (), access, kind)
}

/// Undoes [`create_handle`] for one object body: decrements `handle_count`
/// and releases the pointer-count reference the handle held, running
/// kind-specific teardown first where one is needed (a `File` body must
/// close its backend cookie before its memory is freed).
pub fn close_handle_body(body: *mut u8, kind: ObjectKind) {
	let header = unsafe { &*header_of(body) };
	header.handle_count.fetch_sub(1, Ordering::AcqRel);
	match kind {
		ObjectKind::File => crate::fs::close_file(body),
		_ => dereference(body),
	}
}
