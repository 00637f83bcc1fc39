//! Process object and the create/terminate lifecycle.
//!
//! Grounded on `original_source/kernel/core/ps/{process,mmproc,section}.c`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use elf::abi::PT_LOAD;
use elf::endian::AnyEndian;
use elf::segment::ProgramHeader;
use elf::ElfBytes;

use crate::config::{MAX_USER_ADDRESS, MIN_USER_ADDRESS, PAGE_SIZE, USER_STACK_GUARD_PAGES, USER_STACK_SIZE};
use crate::mm::paging::{Pte, PteFlags};
use crate::mm::pfn::{self, AllocationKind};
use crate::mm::vad::{VadFlags, VadSpace};
use crate::ob::handle::HandleTable;
use crate::ob::ObjectKind;
use crate::sched::thread::{self, ThreadRef};
use crate::status::Status;
use crate::sync::pushlock::PushLock;
use crate::sync::rundown::RundownRef;
use crate::sync::spinlock::Spinlock;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ProcessMode {
	Kernel,
	User,
}

pub struct Process {
	pid: AtomicU32,
	pub image_name: String,
	pub page_directory_phys: u64,
	pub handle_table: HandleTable,
	pub vad_space: VadSpace,
	pub address_space_lock: PushLock,
	pub rundown: RundownRef,
	pub threads: Spinlock<Vec<ThreadRef>>,
	pub terminating: AtomicBool,
	pub critical: bool,
	pub parent_pid: u32,
	/// File-object body backing every file-backed VAD this process's image
	/// loader created, kept open for the process's whole lifetime since a
	/// text or data page can fault in at any time. Null for processes with
	/// no loaded image (the bootstrap/idle process). Closed once, from
	/// [`terminate_process`].
	image_file_body: AtomicPtr<u8>,
}

pub type ProcessRef = Arc<Process>;

/// Creates a fresh address space: a zeroed PML4 frame with every
/// kernel-range entry copied from the current address space and a
/// self-referencing recursive entry installed at the fixed slot.
pub fn create_address_space() -> Result<u64, Status> {
	let frame = pfn::request(AllocationKind::Zeroed).ok_or(Status::NoMemory)?;
	let phys = pfn::frame_to_phys(frame);

	let (hyperspace_va, token) = crate::mm::hyperspace::map(frame);
	unsafe {
		let new_pml4 = hyperspace_va as *mut u64;
		let current_pml4 = crate::mm::paging::PML4_ADDRESS as *const u64;
		// Kernel half: indices 256..511 (canonical higher half), copied
		// verbatim so every process shares the same kernel mappings.
		for i in 256..511 {
			let entry = core::ptr::read_volatile(current_pml4.add(i));
			core::ptr::write_volatile(new_pml4.add(i), entry);
		}
		let recursive = Pte::new(phys, PteFlags::PRESENT | PteFlags::WRITABLE);
		core::ptr::write_volatile(
			new_pml4.add(crate::config::RECURSIVE_PML4_INDEX),
			recursive.0,
		);
	}
	crate::mm::hyperspace::unmap(token);

	Ok(phys)
}

impl Process {
	pub fn pid(&self) -> u32 {
		self.pid.load(Ordering::Relaxed)
	}

	/// Creates the handle for this process in `creator`'s handle table,
	/// per §4.11 step 7 (the handle is created in the *caller's* table, not
	/// the new process's own).
	pub fn create_handle_in(self: &Arc<Self>, creator: &Process, access: u32) -> Result<u32, Status> {
		let object = Arc::into_raw(Arc::clone(self)) as *mut ();
		creator.handle_table.create_handle(object, access, ObjectKind::Process)
	}

	pub fn is_terminating(&self) -> bool {
		self.terminating.load(Ordering::Acquire)
	}

	/// Atomically flips the terminating flag. Returns `false` if it was
	/// already set (caller should report `ProcessIsTerminating`).
	pub fn begin_termination(&self) -> bool {
		!self.terminating.swap(true, Ordering::AcqRel)
	}

	/// Reserves `byte_count` bytes of the process's address space, either at
	/// `*base` (non-overlap checked) when `*base != 0`, or at the first
	/// large-enough gap in the user range, which is then written back to
	/// `*base`.
	///
	/// Grounded on `original_source/kernel/core/mm/vad.c`'s
	/// `MmAllocateVirtualMemory`: rundown protection on the process, then
	/// the VAD push-lock exclusive, matching the lock-ordering rule that the
	/// process rundown is always acquired before the VAD lock.
	pub fn allocate_virtual_memory(&self, base: &mut u64, byte_count: u64, flags: VadFlags) -> Result<(), Status> {
		if byte_count == 0 {
			return Err(Status::InvalidParameter);
		}
		let pages = (byte_count as usize).div_ceil(PAGE_SIZE) as u64;
		let span = pages * PAGE_SIZE as u64;

		if !self.rundown.acquire() {
			return Err(Status::InvalidState);
		}
		let result = self.vad_space.with_exclusive(|tree| {
			let start = if *base == 0 {
				tree.find_gap(MIN_USER_ADDRESS, MAX_USER_ADDRESS, span, PAGE_SIZE as u64)
					.ok_or(Status::NotFound)?
			} else {
				*base
			};
			let end = start.checked_add(span - 1).ok_or(Status::InvalidAddress)?;
			if end >= MAX_USER_ADDRESS {
				return Err(Status::InvalidAddress);
			}
			tree.insert(start, end, flags)?;
			Ok(start)
		});
		self.rundown.release();

		let start = result?;
		*base = start;
		Ok(())
	}
}

/// Creates a process: a fresh address space, an empty handle table and VAD
/// tree, and registration under a freshly assigned PID. The process starts
/// with no threads; callers create its initial thread separately with
/// [`thread::create_thread`] and wake it once setup (argv, initial VAD
/// mappings) is complete.
///
/// Grounded on `original_source/kernel/core/ps/process.c`'s `PsCreateProcess`.
pub fn create_process(image_name: &str, parent: Option<&Process>) -> Result<ProcessRef, Status> {
	let page_directory_phys = create_address_space()?;

	let process = Arc::new(Process {
		pid: AtomicU32::new(0),
		image_name: String::from(image_name),
		page_directory_phys,
		handle_table: HandleTable::new(),
		vad_space: VadSpace::new(),
		address_space_lock: PushLock::new(),
		rundown: RundownRef::new(),
		threads: Spinlock::new(Vec::new()),
		terminating: AtomicBool::new(false),
		critical: false,
		parent_pid: parent.map(Process::pid).unwrap_or(0),
		image_file_body: AtomicPtr::new(ptr::null_mut()),
	});

	let raw = Arc::into_raw(Arc::clone(&process)) as *mut ();
	let pid = crate::ob::cid::insert(raw, crate::ob::ObjectKind::Process)?;
	process.pid.store(pid, Ordering::Release);

	Ok(process)
}

/// Undoes [`Process::create_handle_in`]: removes the table entry and drops
/// the strong reference it held. Process handles never go through
/// [`crate::ob::close_handle_body`] — there's no [`crate::ob::ObjectHeader`]
/// in front of a process body to update, just a plain `Arc::into_raw`
/// pointer to drop.
pub fn close_handle_in(creator: &Process, handle: u32) -> Result<(), Status> {
	let object = creator.handle_table.delete_handle(handle)?;
	let raw = object as *const Process;
	unsafe { drop(Arc::from_raw(raw)) };
	Ok(())
}

/// Flushes every outstanding handle in `process`'s own table, releasing
/// whatever it references (other processes, open files). Grounded on the
/// cyclic-reference teardown the process/handle-table/object-manager design
/// settles on: the handle table owns handle-entries only, and tearing it
/// down first cascades the rest of the cleanup.
fn close_all_handles(process: &Process) {
	process.handle_table.close_all(|object, kind| match kind {
		ObjectKind::Process => unsafe { drop(Arc::from_raw(object as *const Process)) },
		ObjectKind::Thread => unsafe { drop(Arc::from_raw(object as *const thread::Thread)) },
		_ => crate::ob::close_handle_body(object as *mut u8, kind),
	});
}

fn page_align_down(value: u64) -> u64 {
	value & !(PAGE_SIZE as u64 - 1)
}

fn page_align_up(value: u64) -> u64 {
	(value + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Bound on how much of an image this loader will read into memory to
/// parse headers and program-header-described segments. The filesystem
/// collaborator has no `stat`/seek primitive, so the whole file (up to this
/// bound) is read up front; segment contents themselves are never touched
/// here, only their headers — the fault handler pages actual data in later.
const MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;

fn read_whole_file(body: *mut u8) -> Result<Vec<u8>, Status> {
	let mut buf = alloc::vec![0u8; MAX_IMAGE_BYTES];
	let mut total = 0usize;
	loop {
		let read = crate::fs::read_file(body, total as u64, &mut buf[total..])?;
		if read == 0 {
			break;
		}
		total += read;
		if total == buf.len() {
			return Err(Status::InvalidImageFormat);
		}
	}
	buf.truncate(total);
	Ok(buf)
}

/// Maps one `PT_LOAD` segment into `process`'s VAD tree: a file-backed VAD
/// over `[page_align_down(vaddr), page_align_up(vaddr + filesz))` with
/// `file_offset` adjusted by the same sub-page skew, plus — when
/// `memsz > filesz` — a second, purely anonymous demand-zero VAD covering
/// the bss tail beyond the file-backed region.
fn map_load_segment(process: &ProcessRef, file_body: *mut u8, phdr: &ProgramHeader) -> Result<(), Status> {
	let mut flags = VadFlags::MAPPED_FILE;
	if phdr.p_flags & elf::abi::PF_R != 0 {
		flags |= VadFlags::READ;
	}
	if phdr.p_flags & elf::abi::PF_W != 0 {
		flags |= VadFlags::WRITE;
	}
	if phdr.p_flags & elf::abi::PF_X != 0 {
		flags |= VadFlags::EXECUTE;
	}

	let page_start = page_align_down(phdr.p_vaddr);
	let file_backed_end = page_align_up(phdr.p_vaddr + phdr.p_filesz);
	let skew = phdr.p_vaddr - page_start;
	let file_offset = phdr.p_offset.checked_sub(skew).ok_or(Status::InvalidImageFormat)?;

	if file_backed_end > page_start {
		process
			.vad_space
			.with_exclusive(|tree| tree.insert_backed(page_start, file_backed_end - 1, flags, Some(file_offset), Some(file_body)))?;
	}

	if phdr.p_memsz > phdr.p_filesz {
		let bss_start = file_backed_end;
		let bss_end = page_align_up(phdr.p_vaddr + phdr.p_memsz);
		if bss_end > bss_start {
			let anon_flags = flags & !VadFlags::MAPPED_FILE;
			process.vad_space.with_exclusive(|tree| tree.insert(bss_start, bss_end - 1, anon_flags))?;
		}
	}

	Ok(())
}

/// Opens `path` through the registered filesystem backend, parses it as an
/// ELF64 image, and maps every `PT_LOAD` segment into `process`. The
/// opened file body is stashed in `process.image_file_body` rather than
/// closed here: every file-backed VAD this creates keeps pointing at it
/// for as long as the process lives, since a segment's pages can fault in
/// at any later time.
///
/// Grounded on `original_source/kernel/core/mm/section.c`'s section-mapping
/// step, adapted from that file's bespoke section-header format to ELF64
/// program headers via the `elf` crate.
fn load_image(process: &ProcessRef, path: &str) -> Result<u64, Status> {
	let body = crate::fs::create_file(path, crate::ob::ACCESS_FILE_READ_DATA)?;
	let image = read_whole_file(body)?;

	let elf_file = ElfBytes::<AnyEndian>::minimal_parse(&image).map_err(|_| Status::InvalidImageFormat)?;
	let segments = elf_file.segments().ok_or(Status::InvalidImageFormat)?;

	for phdr in segments.iter() {
		if phdr.p_type == PT_LOAD {
			map_load_segment(process, body, &phdr)?;
		}
	}

	process.image_file_body.store(body, Ordering::Release);
	Ok(elf_file.ehdr.e_entry)
}

/// Reserves a user-mode stack near the top of `process`'s address space: a
/// demand-zero VAD of [`USER_STACK_SIZE`] bytes with a
/// [`USER_STACK_GUARD_PAGES`]-page `RESERVED` guard region immediately
/// below it, so a stack overflow faults instead of silently walking into
/// whatever sits below. Returns the initial stack pointer — the byte past
/// the stack's last valid byte, the same top-of-stack convention the
/// kernel-stack allocator uses.
fn create_user_stack(process: &ProcessRef) -> Result<u64, Status> {
	let guard_size = (USER_STACK_GUARD_PAGES * PAGE_SIZE) as u64;
	let stack_size = USER_STACK_SIZE as u64;
	let span = guard_size + stack_size;

	let base = process
		.vad_space
		.with_exclusive(|tree| tree.find_gap(MIN_USER_ADDRESS, MAX_USER_ADDRESS, span, PAGE_SIZE as u64).ok_or(Status::NotFound))?;

	let guard_end = base + guard_size - 1;
	let stack_start = base + guard_size;
	let stack_end = base + span - 1;

	process.vad_space.with_exclusive(|tree| tree.insert(base, guard_end, VadFlags::RESERVED))?;
	process
		.vad_space
		.with_exclusive(|tree| tree.insert(stack_start, stack_end, VadFlags::READ | VadFlags::WRITE))?;

	Ok(stack_end + 1)
}

/// Creates a user process by loading an ELF image: same address-space,
/// handle-table, and PID setup as [`create_process`], plus the image's
/// loadable segments mapped into the VAD tree, a user stack, and a main
/// thread seeded at the entry point. Returns a handle to the new process,
/// created in `creator`'s handle table. On any failure after that handle
/// exists, it is closed so normal dereference tears the partially built
/// process down instead of leaking it.
///
/// Grounded on `original_source/kernel/core/ps/process.c`'s
/// `PsCreateProcess` sequencing.
pub fn create_user_process(path: &str, desired_access: u32, creator: &Process, parent: Option<&Process>) -> Result<u32, Status> {
	let process = create_process(path, parent)?;
	let entry = load_image(&process, path)?;
	let handle = process.create_handle_in(creator, desired_access)?;

	let spawn_result = create_user_stack(&process).and_then(|user_stack_top| thread::create_user_thread(&process, entry, user_stack_top));

	match spawn_result {
		Ok(main_thread) => {
			crate::sched::wake_thread(main_thread);
			Ok(handle)
		}
		Err(status) => {
			let _ = close_handle_in(creator, handle);
			Err(status)
		}
	}
}

/// Looks a process up by PID through the global CID table, returning a new
/// owning reference. Grounded on `original_source/kernel/core/ps/cid.c`'s
/// backing for `PsLookupProcessByProcessId`.
pub fn lookup_by_pid(pid: u32) -> Result<ProcessRef, Status> {
	let (object, kind) = crate::ob::cid::lookup(pid)?;
	if kind != crate::ob::ObjectKind::Process {
		return Err(Status::ObjectTypeMismatch);
	}
	let raw = object as *const Process;
	unsafe { Arc::increment_strong_count(raw) };
	Ok(unsafe { Arc::from_raw(raw) })
}

/// Begins termination of `process`: flips the terminating flag (failing
/// idempotently if termination was already underway), then marks every
/// thread in the process terminating and wakes any that are currently
/// blocked so they notice and unwind. Actual thread teardown (stack
/// release, CID removal) happens as each thread reaches its own exit path,
/// matching the reaper handoff `thread::free_kernel_stack` documents.
///
/// `raw_exit_status` is stored verbatim rather than taken as a [`Status`]:
/// a caller terminating another process (or itself, via a syscall) supplies
/// whatever exit code it wants observers to see, which need not be one of
/// the kernel's own status values.
pub fn terminate_process(process: &ProcessRef, raw_exit_status: i32) -> Result<(), Status> {
	if !process.begin_termination() {
		return Err(Status::ProcessIsTerminating);
	}
	for victim in process.threads.lock().iter() {
		victim.exit_status.store(raw_exit_status, Ordering::Release);
		if victim.state() == thread::ThreadState::Blocked {
			victim.set_state(thread::ThreadState::Terminating);
			crate::sched::wake_thread(Arc::clone(victim));
		} else {
			victim.set_state(thread::ThreadState::Terminating);
		}
	}

	close_all_handles(process);
	let image_file_body = process.image_file_body.swap(ptr::null_mut(), Ordering::AcqRel);
	if !image_file_body.is_null() {
		crate::fs::close_file(image_file_body);
	}

	Ok(())
}

/// Terminates the thread currently running on this CPU with `status` and
/// reschedules. Never returns.
pub fn terminate_current_thread(status: Status) -> ! {
	let current = crate::sched::current_thread_ref();
	current.exit_status.store(status.to_raw(), Ordering::Release);
	current.set_state(thread::ThreadState::Terminated);
	crate::sched::reschedule();
	unreachable!("reschedule must not return into a terminated thread");
}
