//! The `syscall`/`sysret` fast path: MSR setup, the entry trampoline, and
//! the six core system calls.
//!
//! Grounded on the teacher's `arch::x86_64::kernel::syscall::syscall_handler`
//! for the entry/exit trampoline shape (`swapgs`, a per-CPU kernel-stack
//! switch, dispatch through a flat table indexed by the syscall number,
//! `sysretq` on the way out) and on
//! `original_source/kernel/core/mt/systemcalls.c` for what each of the six
//! calls actually does.

use core::arch::naked_asm;
use core::mem::offset_of;

use alloc::sync::Arc;

use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::arch::x86_64::gdt;
use crate::mm::usermem;
use crate::mm::vad::VadFlags;
use crate::ob::ObjectKind;
use crate::percpu::PerCpu;
use crate::sched::process::{self, Process, ProcessRef};
use crate::status::Status;

pub const SYS_ALLOCATE_VIRTUAL_MEMORY: u64 = 0;
pub const SYS_OPEN_PROCESS: u64 = 1;
pub const SYS_TERMINATE_PROCESS: u64 = 2;
pub const SYS_READ_FILE: u64 = 3;
pub const SYS_WRITE_FILE: u64 = 4;
pub const SYS_CREATE_FILE: u64 = 5;

const SYSCALL_COUNT: usize = 6;

/// Sentinel process handle meaning "the caller's own process", matching
/// `MtCurrentProcess()` in the original.
const CURRENT_PROCESS_HANDLE: u64 = u64::MAX;

const PROT_EXEC_RW: u64 = 0;
const PROT_EXEC_R: u64 = 1;
const PROT_RW: u64 = 2;
const PROT_NO_ACCESS: u64 = 3;

/// Enables `syscall`/`sysret` and points `LSTAR` at the entry trampoline.
/// Must run on every CPU after its GDT is loaded, since the selector pair
/// `STAR` is about to encode lives at the fixed indices
/// [`gdt::init_current_cpu`] always builds.
pub fn init_current_cpu() {
	unsafe {
		Efer::update(|flags| *flags |= EferFlags::SYSTEM_CALL_EXTENSIONS);
	}

	let cs_syscall = SegmentSelector::new(gdt::KERNEL_CODE_SELECTOR >> 3, PrivilegeLevel::Ring0);
	let ss_syscall = SegmentSelector::new(gdt::KERNEL_DATA_SELECTOR >> 3, PrivilegeLevel::Ring0);
	let cs_sysret = SegmentSelector::new(gdt::USER_CODE_SELECTOR >> 3, PrivilegeLevel::Ring3);
	let ss_sysret = SegmentSelector::new(gdt::USER_DATA_SELECTOR >> 3, PrivilegeLevel::Ring3);
	Star::write(cs_sysret, ss_sysret, cs_syscall, ss_syscall).expect("STAR selector layout must satisfy the SYSCALL/SYSRET selector-math constraint");

	LStar::write(VirtAddr::new(syscall_entry as usize as u64));
	SFMask::write(RFlags::INTERRUPT_FLAG | RFlags::TRAP_FLAG);
}

/// `syscall` lands here directly, in the caller's ring and on the caller's
/// stack. Saves the scratch registers `syscall` doesn't, switches onto this
/// CPU's kernel stack, dispatches through [`SYSCALL_TABLE`], and `sysretq`s
/// back.
#[unsafe(naked)]
unsafe extern "C" fn syscall_entry() -> ! {
	naked_asm!(
		"push rcx",
		"push r11",
		"push rdi",
		"push rsi",
		"push rdx",
		"push r10",
		"push r8",
		"push r9",
		"swapgs",
		"mov rcx, rsp",
		"mov rsp, gs:{rsp0}",
		"push rcx",
		"mov rcx, r10", // fourth argument: syscall ABI passes it in r10, the C ABI wants it in rcx
		"sti",
		"cmp rax, {count}",
		"jae 2f",
		"lea r11, [rip + {table}]",
		"call [r11 + 8*rax]",
		"jmp 3f",
		"2:",
		"mov rax, {bad_syscall}",
		"3:",
		"cli",
		"pop rcx",
		"mov rsp, rcx",
		"swapgs",
		"pop r9",
		"pop r8",
		"pop r10",
		"pop rdx",
		"pop rsi",
		"pop rdi",
		"pop r11",
		"pop rcx",
		"sysretq",
		rsp0 = const offset_of!(PerCpu, rsp0),
		count = const SYSCALL_COUNT,
		bad_syscall = const INVALID_PARAMETER_RAW,
		table = sym SYSCALL_TABLE,
	);
}

/// Encoded the same way [`encode`] encodes every other status: the 32-bit
/// value's bit pattern, zero-extended into the 64-bit register `syscall`
/// reads its return value from.
const INVALID_PARAMETER_RAW: u64 = (Status::InvalidParameter as i32 as u32) as u64;

#[used]
#[unsafe(no_mangle)]
static SYSCALL_TABLE: [unsafe extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64; SYSCALL_COUNT] = [
	sys_allocate_virtual_memory,
	sys_open_process,
	sys_terminate_process,
	sys_read_file,
	sys_write_file,
	sys_create_file,
];

fn encode(result: Result<(), Status>) -> u64 {
	let status = match result {
		Ok(()) => Status::Success,
		Err(status) => status,
	};
	(status.to_raw() as u32) as u64
}

/// Resolves a syscall's process-handle argument, accepting both the
/// [`CURRENT_PROCESS_HANDLE`] sentinel (always allowed, regardless of
/// `desired_access` — a thread never needs permission to act on itself)
/// and a real handle from the caller's own handle table, which must carry
/// every bit `desired_access` asks for.
fn process_from_handle(handle: u64, desired_access: u32) -> Result<ProcessRef, Status> {
	if handle == CURRENT_PROCESS_HANDLE {
		return Ok(crate::sched::current_process());
	}
	let caller = crate::sched::current_process();
	let (object, access, kind) = caller.handle_table.lookup(handle as u32)?;
	if kind != ObjectKind::Process {
		return Err(Status::ObjectTypeMismatch);
	}
	if !crate::ob::access_allows(access, desired_access) {
		return Err(Status::AccessDenied);
	}
	let raw = object as *const Process;
	unsafe { Arc::increment_strong_count(raw) };
	Ok(unsafe { Arc::from_raw(raw) })
}

fn protection_to_vad_flags(protection: u64) -> Result<VadFlags, Status> {
	match protection {
		PROT_EXEC_RW => Ok(VadFlags::READ | VadFlags::WRITE | VadFlags::EXECUTE),
		PROT_EXEC_R => Ok(VadFlags::READ | VadFlags::EXECUTE),
		PROT_RW => Ok(VadFlags::READ | VadFlags::WRITE),
		PROT_NO_ACCESS => Ok(VadFlags::RESERVED),
		_ => Err(Status::InvalidParameter),
	}
}

unsafe extern "C" fn sys_allocate_virtual_memory(process_handle: u64, base_inout_ptr: u64, byte_count: u64, protection: u64, _r8: u64, _r9: u64) -> u64 {
	encode((|| {
		usermem::probe_typed::<u64>(base_inout_ptr)?;
		let process = process_from_handle(process_handle, crate::ob::ACCESS_VM_OPERATION)?;
		if process.is_terminating() {
			return Err(Status::ProcessIsTerminating);
		}
		let flags = protection_to_vad_flags(protection)?;
		let mut base = unsafe { (base_inout_ptr as *const u64).read_unaligned() };
		process.allocate_virtual_memory(&mut base, byte_count, flags)?;
		unsafe { usermem::write_user(base_inout_ptr, base) };
		Ok(())
	})())
}

unsafe extern "C" fn sys_open_process(pid: u64, out_handle_ptr: u64, desired_access: u64, _r10: u64, _r8: u64, _r9: u64) -> u64 {
	encode((|| {
		usermem::probe_typed::<u32>(out_handle_ptr)?;
		let process = process::lookup_by_pid(pid as u32)?;
		let caller = crate::sched::current_process();
		let handle = process.create_handle_in(&caller, desired_access as u32)?;
		unsafe { usermem::write_user(out_handle_ptr, handle) };
		Ok(())
	})())
}

unsafe extern "C" fn sys_terminate_process(process_handle: u64, exit_status: u64, _rdx: u64, _r10: u64, _r8: u64, _r9: u64) -> u64 {
	let terminating_self = process_handle == CURRENT_PROCESS_HANDLE;
	let result = (|| {
		let process = process_from_handle(process_handle, crate::ob::ACCESS_TERMINATE)?;
		process::terminate_process(&process, exit_status as i32)
	})();
	if terminating_self && result.is_ok() {
		// `terminate_process` already recorded this thread's exit status and
		// marked it Terminating; finish the transition to Terminated so
		// `reschedule` queues this stack for reaping instead of silently
		// dropping it, then get off this stack for good. Whichever thread
		// the scheduler picks next never hands control back here.
		crate::sched::current_thread_ref().set_state(crate::sched::thread::ThreadState::Terminated);
		crate::sched::reschedule();
		unreachable!("a thread marked Terminated must not be rescheduled back onto its own stack");
	}
	encode(result)
}

unsafe extern "C" fn sys_read_file(handle: u64, offset: u64, out_buf_ptr: u64, byte_count: u64, out_bytes_read_ptr: u64, _r9: u64) -> u64 {
	encode((|| {
		usermem::probe_range(out_buf_ptr, byte_count, 1)?;
		if out_bytes_read_ptr != 0 {
			usermem::probe_typed::<u64>(out_bytes_read_ptr)?;
		}
		let caller = crate::sched::current_process();
		let (body, access, kind) = caller.handle_table.lookup(handle as u32)?;
		if kind != ObjectKind::File {
			return Err(Status::ObjectTypeMismatch);
		}
		if !crate::ob::access_allows(access, crate::ob::ACCESS_FILE_READ_DATA) {
			return Err(Status::AccessDenied);
		}
		let mut kernel_buf = alloc::vec![0u8; byte_count as usize];
		let read = crate::fs::read_file(body as *mut u8, offset, &mut kernel_buf)?;
		if read > 0 {
			unsafe { usermem::copy_to_user(out_buf_ptr, kernel_buf.as_ptr(), read) };
		}
		if out_bytes_read_ptr != 0 {
			unsafe { usermem::write_user(out_bytes_read_ptr, read as u64) };
		}
		Ok(())
	})())
}

unsafe extern "C" fn sys_write_file(handle: u64, offset: u64, buf_ptr: u64, byte_count: u64, out_bytes_written_ptr: u64, _r9: u64) -> u64 {
	encode((|| {
		usermem::probe_range(buf_ptr, byte_count, 1)?;
		if out_bytes_written_ptr != 0 {
			usermem::probe_typed::<u64>(out_bytes_written_ptr)?;
		}
		let caller = crate::sched::current_process();
		let (body, access, kind) = caller.handle_table.lookup(handle as u32)?;
		if kind != ObjectKind::File {
			return Err(Status::ObjectTypeMismatch);
		}
		if !crate::ob::access_allows(access, crate::ob::ACCESS_FILE_WRITE_DATA) {
			return Err(Status::AccessDenied);
		}
		let mut kernel_buf = alloc::vec![0u8; byte_count as usize];
		unsafe { usermem::copy_from_user(kernel_buf.as_mut_ptr(), buf_ptr, byte_count as usize) };
		let written = crate::fs::write_file(body as *mut u8, offset, &kernel_buf)?;
		if out_bytes_written_ptr != 0 {
			unsafe { usermem::write_user(out_bytes_written_ptr, written as u64) };
		}
		Ok(())
	})())
}

const MAX_PATH_BYTES: usize = 260;

unsafe extern "C" fn sys_create_file(path_ptr: u64, desired_access: u64, out_handle_ptr: u64, _r10: u64, _r8: u64, _r9: u64) -> u64 {
	encode((|| {
		usermem::probe_typed::<u32>(out_handle_ptr)?;
		let mut path_buf = [0u8; MAX_PATH_BYTES];
		let len = usermem::copy_user_cstr(path_ptr, &mut path_buf)?;
		let path = core::str::from_utf8(&path_buf[..len]).map_err(|_| Status::InvalidParameter)?;
		let body = crate::fs::create_file(path, desired_access as u32)?;
		let caller = crate::sched::current_process();
		let handle = crate::ob::create_handle(&caller.handle_table, body, desired_access as u32, ObjectKind::File)?;
		unsafe { usermem::write_user(out_handle_ptr, handle) };
		Ok(())
	})())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn protection_codes_map_to_the_expected_vad_flags() {
		assert_eq!(protection_to_vad_flags(PROT_EXEC_RW).unwrap(), VadFlags::READ | VadFlags::WRITE | VadFlags::EXECUTE);
		assert_eq!(protection_to_vad_flags(PROT_EXEC_R).unwrap(), VadFlags::READ | VadFlags::EXECUTE);
		assert_eq!(protection_to_vad_flags(PROT_RW).unwrap(), VadFlags::READ | VadFlags::WRITE);
		assert_eq!(protection_to_vad_flags(PROT_NO_ACCESS).unwrap(), VadFlags::RESERVED);
	}

	#[test]
	fn unrecognized_protection_code_is_rejected() {
		assert_eq!(protection_to_vad_flags(4), Err(Status::InvalidParameter));
	}

	#[test]
	fn encode_round_trips_success_and_failure_through_the_raw_status_width() {
		assert_eq!(encode(Ok(())), Status::Success.to_raw() as u32 as u64);
		assert_eq!(encode(Err(Status::AccessDenied)), Status::AccessDenied.to_raw() as u32 as u64);
	}

	#[test]
	fn bad_syscall_number_raw_value_matches_invalid_parameter() {
		assert_eq!(INVALID_PARAMETER_RAW, encode(Err(Status::InvalidParameter)));
	}
}
