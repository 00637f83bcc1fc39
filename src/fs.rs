//! The file-object seam `CreateFile`/`ReadFile`/`WriteFile` bind to.
//!
//! A filesystem layout is explicitly out of scope here: this module only
//! carries the object-manager-visible type and the contract a real
//! filesystem driver (FAT, in the lineage this is grounded on) implements
//! against. Grounded on `original_source/kernel/core/ob/ob.c`'s
//! object-header convention for the body layout, and on
//! `kernel/core/mt/systemcalls.c`'s `MtReadFile`/`MtWriteFile`, which call
//! through to `FsReadFile`/`FsWriteFile` exactly the way the syscall layer
//! here calls through to [`read_file`]/[`write_file`].

use hermit_sync::OnceCell;

use crate::ob::{self, ObjectKind};
use crate::status::Status;

/// Contract the out-of-tree filesystem driver implements. `open` resolves a
/// path into an opaque `cookie` the backend can interpret however it
/// likes (inode number, open file descriptor, whatever); `read`/`write`
/// then operate purely in terms of that cookie plus a byte offset.
pub trait FileSystem: Sync {
	fn open(&self, path: &str, desired_access: u32) -> Result<u64, Status>;
	fn read(&self, cookie: u64, offset: u64, buf: &mut [u8]) -> Result<usize, Status>;
	fn write(&self, cookie: u64, offset: u64, buf: &[u8]) -> Result<usize, Status>;
	fn close(&self, cookie: u64);
}

static BACKEND: OnceCell<&'static dyn FileSystem> = OnceCell::new();

/// Registers the driver backing every later `CreateFile`. Until this runs,
/// `CreateFile` fails with `NotFound` rather than panicking, the same way a
/// real boot would keep scheduling other work if the AHCI/FAT collaborators
/// never came up.
pub fn register_backend(backend: &'static dyn FileSystem) {
	BACKEND
		.set(backend)
		.unwrap_or_else(|_| panic!("fs::register_backend called more than once"));
}

fn backend() -> Result<&'static dyn FileSystem, Status> {
	BACKEND.get().copied().ok_or(Status::NotFound)
}

struct FileObject {
	backend: &'static dyn FileSystem,
	cookie: u64,
}

/// Opens `path` through the registered backend and wraps the result in a
/// pool-allocated object body, ready to be placed in a handle table.
pub fn create_file(path: &str, desired_access: u32) -> Result<*mut u8, Status> {
	let backend = backend()?;
	let cookie = backend.open(path, desired_access)?;
	let body = ob::create(ObjectKind::File, core::mem::size_of::<FileObject>())?;
	unsafe { (body as *mut FileObject).write(FileObject { backend, cookie }) };
	Ok(body)
}

pub fn read_file(body: *mut u8, offset: u64, buf: &mut [u8]) -> Result<usize, Status> {
	let file = unsafe { &*(body as *const FileObject) };
	file.backend.read(file.cookie, offset, buf)
}

pub fn write_file(body: *mut u8, offset: u64, buf: &[u8]) -> Result<usize, Status> {
	let file = unsafe { &*(body as *const FileObject) };
	file.backend.write(file.cookie, offset, buf)
}

/// Closes the backend's cookie and releases the object body. Callers reach
/// this through the handle table's own close path, never directly.
pub fn close_file(body: *mut u8) {
	let file = unsafe { &*(body as *const FileObject) };
	file.backend.close(file.cookie);
	ob::dereference(body);
}
