//! Two-level per-process handle table.
//!
//! Grounded on `original_source/kernel/core/ht/handle.c`. Level 0 is a
//! single page of entries; level 1 is a directory of level-0 pages. Handle
//! values are multiples of 4; 0 is reserved for "invalid".

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config::{HANDLE_GRANULARITY, HANDLE_TABLE_LEVEL0_ENTRIES};
use crate::ob::ObjectKind;
use crate::status::Status;
use crate::sync::pushlock::PushLock;

#[derive(Copy, Clone)]
struct Entry {
	object: *mut (),
	access: u32,
	kind: ObjectKind,
	/// Valid when `object` is null: index of the next free entry in the
	/// same level-0 page's free list, or `u32::MAX` at the list tail.
	next_free: u32,
}

impl Entry {
	const fn free(next_free: u32) -> Self {
		Entry {
			object: core::ptr::null_mut(),
			access: 0,
			kind: ObjectKind::Event,
			next_free,
		}
	}

	fn is_free(&self) -> bool {
		self.object.is_null()
	}
}

struct Level0Page {
	entries: [Entry; HANDLE_TABLE_LEVEL0_ENTRIES],
}

enum Table {
	Level0(Box<Level0Page>),
	Level1(Vec<Box<Level0Page>>),
}

struct Inner {
	table: Table,
	first_free: u32,
}

pub struct HandleTable {
	inner: PushLock,
	state: core::cell::UnsafeCell<Inner>,
}

unsafe impl Sync for HandleTable {}

fn new_level0_page(first_index: u32) -> Box<Level0Page> {
	let mut entries = [Entry::free(0); HANDLE_TABLE_LEVEL0_ENTRIES];
	for (i, e) in entries.iter_mut().enumerate() {
		let global_index = first_index + i as u32;
		e.next_free = if (i + 1) < HANDLE_TABLE_LEVEL0_ENTRIES {
			global_index + 1
		} else {
			u32::MAX
		};
	}
	Box::new(Level0Page { entries })
}

fn to_handle_value(index: u32) -> u32 {
	(index + 1) * HANDLE_GRANULARITY
}

fn to_index(handle: u32) -> Option<u32> {
	if handle == 0 || handle % HANDLE_GRANULARITY != 0 {
		return None;
	}
	Some(handle / HANDLE_GRANULARITY - 1)
}

impl HandleTable {
	pub fn new() -> Self {
		HandleTable {
			inner: PushLock::new(),
			state: core::cell::UnsafeCell::new(Inner {
				table: Table::Level0(new_level0_page(0)),
				first_free: 0,
			}),
		}
	}

	pub fn create_handle(&self, object: *mut (), access: u32, kind: ObjectKind) -> Result<u32, Status> {
		self.inner.acquire_exclusive();
		let result = unsafe { self.create_handle_locked(object, access, kind) };
		self.inner.release_exclusive();
		result
	}

	unsafe fn create_handle_locked(&self, object: *mut (), access: u32, kind: ObjectKind) -> Result<u32, Status> {
		let state = &mut *self.state.get();
		if state.first_free == u32::MAX {
			self.expand(state);
		}
		let index = state.first_free;
		let (page_idx, slot) = (
			index as usize / HANDLE_TABLE_LEVEL0_ENTRIES,
			index as usize % HANDLE_TABLE_LEVEL0_ENTRIES,
		);
		let entry_ref = match &mut state.table {
			Table::Level0(page) => &mut page.entries[slot],
			Table::Level1(pages) => &mut pages[page_idx].entries[slot],
		};
		state.first_free = entry_ref.next_free;
		*entry_ref = Entry {
			object,
			access,
			kind,
			next_free: 0,
		};
		Ok(to_handle_value(index))
	}

	fn expand(&self, state: &mut Inner) {
		match &mut state.table {
			Table::Level0(_) => {
				let Table::Level0(old) = core::mem::replace(&mut state.table, Table::Level1(Vec::new())) else {
					unreachable!()
				};
				let new_page = new_level0_page(HANDLE_TABLE_LEVEL0_ENTRIES as u32);
				state.table = Table::Level1(alloc::vec![old, new_page]);
				state.first_free = HANDLE_TABLE_LEVEL0_ENTRIES as u32;
			}
			Table::Level1(pages) => {
				let first_index = (pages.len() * HANDLE_TABLE_LEVEL0_ENTRIES) as u32;
				pages.push(new_level0_page(first_index));
				state.first_free = first_index;
			}
		}
	}

	/// Current table level: 0 while a single page is in use, 1 once
	/// promoted to a directory of pages.
	pub fn level(&self) -> u32 {
		let state = unsafe { &*self.state.get() };
		match &state.table {
			Table::Level0(_) => 0,
			Table::Level1(_) => 1,
		}
	}

	pub fn lookup(&self, handle: u32) -> Result<(*mut (), u32, ObjectKind), Status> {
		self.inner.acquire_shared();
		let result = unsafe { self.lookup_locked(handle) };
		self.inner.release_shared();
		result
	}

	unsafe fn lookup_locked(&self, handle: u32) -> Result<(*mut (), u32, ObjectKind), Status> {
		let index = to_index(handle).ok_or(Status::InvalidHandle)?;
		let state = &*self.state.get();
		let (page_idx, slot) = (
			index as usize / HANDLE_TABLE_LEVEL0_ENTRIES,
			index as usize % HANDLE_TABLE_LEVEL0_ENTRIES,
		);
		let entry = match &state.table {
			Table::Level0(page) => page.entries.get(slot),
			Table::Level1(pages) => pages.get(page_idx).and_then(|p| p.entries.get(slot)),
		}
		.ok_or(Status::InvalidHandle)?;
		if entry.is_free() {
			return Err(Status::InvalidHandle);
		}
		Ok((entry.object, entry.access, entry.kind))
	}

	pub fn delete_handle(&self, handle: u32) -> Result<*mut (), Status> {
		self.inner.acquire_exclusive();
		let result = unsafe { self.delete_handle_locked(handle) };
		self.inner.release_exclusive();
		result
	}

	unsafe fn delete_handle_locked(&self, handle: u32) -> Result<*mut (), Status> {
		let index = to_index(handle).ok_or(Status::InvalidHandle)?;
		let state = &mut *self.state.get();
		let (page_idx, slot) = (
			index as usize / HANDLE_TABLE_LEVEL0_ENTRIES,
			index as usize % HANDLE_TABLE_LEVEL0_ENTRIES,
		);
		let entry_ref = match &mut state.table {
			Table::Level0(page) => page.entries.get_mut(slot),
			Table::Level1(pages) => pages.get_mut(page_idx).map(|p| &mut p.entries[slot]),
		}
		.ok_or(Status::InvalidHandle)?;
		if entry_ref.is_free() {
			return Err(Status::InvalidHandle);
		}
		let object = entry_ref.object;
		let freed_next = state.first_free;
		let entry_ref = match &mut state.table {
			Table::Level0(page) => &mut page.entries[slot],
			Table::Level1(pages) => &mut pages[page_idx].entries[slot],
		};
		*entry_ref = Entry::free(freed_next);
		state.first_free = index;
		Ok(object)
	}

	/// Empties the table, invoking `on_close` once per live handle before
	/// discarding it. Used at process teardown to flush outstanding
	/// references before the table itself is dropped; the table is left
	/// usable afterward (fresh free list from index 0), but nothing calls
	/// into it again once a process reaches this point.
	pub fn close_all(&self, mut on_close: impl FnMut(*mut (), ObjectKind)) {
		self.inner.acquire_exclusive();
		unsafe {
			let state = &mut *self.state.get();
			let pages: &mut [Box<Level0Page>] = match &mut state.table {
				Table::Level0(page) => core::slice::from_mut(page),
				Table::Level1(pages) => pages.as_mut_slice(),
			};
			for page in pages.iter_mut() {
				for entry in page.entries.iter_mut() {
					if !entry.is_free() {
						on_close(entry.object, entry.kind);
					}
				}
			}
			*state = Inner {
				table: Table::Level0(new_level0_page(0)),
				first_free: 0,
			};
		}
		self.inner.release_exclusive();
	}
}

impl Default for HandleTable {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn create_then_lookup_returns_same_object() {
		let table = HandleTable::new();
		let fake_object = 0x1234usize as *mut ();
		let handle = table.create_handle(fake_object, 0xF, ObjectKind::Event).unwrap();
		let (object, _, _) = table.lookup(handle).unwrap();
		assert_eq!(object, fake_object);
	}

	#[test]
	fn level_promotes_after_257_handles() {
		let table = HandleTable::new();
		let mut last = 0;
		for i in 0..257u32 {
			last = table
				.create_handle((0x1000 + i as usize) as *mut (), 0, ObjectKind::Event)
				.unwrap();
		}
		assert_eq!(table.level(), 1);
		assert!(last > 0);
	}

	#[test]
	fn delete_then_recreate_reuses_handle_lifo() {
		let table = HandleTable::new();
		for i in 0..257u32 {
			table
				.create_handle((0x2000 + i as usize) as *mut (), 0, ObjectKind::Event)
				.unwrap();
		}
		table.delete_handle(129 * 4).unwrap();
		let reused = table.create_handle(0x9999usize as *mut (), 0, ObjectKind::Event).unwrap();
		assert_eq!(reused, 129 * 4);
	}
}
