//! The CID table: a single kernel-wide handle table mapping process and
//! thread IDs to their objects, used by lookups that only have a numeric
//! PID/TID (wait-for-process-exit, debug attach, the `kill`-style syscall).
//!
//! Grounded on `original_source/kernel/core/ps/cid.c`. Unlike a per-process
//! [`crate::ob::handle::HandleTable`] this table is global and its "handle"
//! values are the PIDs/TIDs themselves, not opaque caller-facing handles.

use hermit_sync::OnceCell;

use crate::ob::handle::HandleTable;
use crate::ob::ObjectKind;
use crate::status::Status;

static CID_TABLE: OnceCell<HandleTable> = OnceCell::new();

pub fn init() {
	CID_TABLE.set(HandleTable::new()).unwrap_or_else(|_| panic!("cid::init called more than once"));
}

fn table() -> &'static HandleTable {
	CID_TABLE.get().expect("cid::init not called yet")
}

/// Registers `object` under a fresh CID, returning the assigned PID/TID.
pub fn insert(object: *mut (), kind: ObjectKind) -> Result<u32, Status> {
	table().create_handle(object, 0, kind)
}

pub fn lookup(cid: u32) -> Result<(*mut (), ObjectKind), Status> {
	table().lookup(cid).map(|(object, _access, kind)| (object, kind))
}

pub fn remove(cid: u32) -> Result<*mut (), Status> {
	table().delete_handle(cid)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ensure_init() {
		if CID_TABLE.get().is_none() {
			init();
		}
	}

	#[test]
	fn insert_then_lookup_roundtrips() {
		ensure_init();
		let fake = 0x4242usize as *mut ();
		let cid = insert(fake, ObjectKind::Process).unwrap();
		let (object, kind) = lookup(cid).unwrap();
		assert_eq!(object, fake);
		assert_eq!(kind, ObjectKind::Process);
		remove(cid).unwrap();
	}
}
