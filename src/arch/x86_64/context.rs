//! Kernel-to-kernel context switch.
//!
//! Grounded on the teacher's `arch::x86_64::kernel::switch::switch`, ported
//! from hand-written AT&T asm to `core::arch::naked_asm!` and from the
//! teacher's single-threaded `Rc<RefCell<Task>>` call site to the `Arc`-based
//! [`crate::sched::thread::Thread`]. The teacher also saves/restores
//! `FS_BASE`/`GS_BASE` per task for its userspace TLS story; this kernel has
//! no TLS segment to swap (kernel-mode GS addressing is per-CPU, not
//! per-thread, per [`crate::percpu`]), so only the standard callee-saved
//! integer registers and RFLAGS cross a switch.

use core::arch::naked_asm;

use crate::sched::thread::ThreadRef;

/// Number of 8-byte slots the fabricated initial frame and the in-flight
/// switch frame both occupy: r15, r14, r13, r12, rbp, rbx, rflags, and the
/// return address `ret` will pop.
const FRAME_SLOTS: usize = 8;

/// Writes a fabricated switch frame at the top of a brand-new kernel stack
/// so that the first [`switch_to`] landing on this thread "returns" into
/// [`thread_trampoline`] instead of a real suspended call site.
///
/// # Safety
/// `stack_top` must be the exclusive top of a mapped, writable kernel stack
/// that nothing else is using yet.
pub unsafe fn prepare_initial_stack(stack_top: u64) -> u64 {
	let rsp = stack_top - (FRAME_SLOTS * 8) as u64;
	let slots = rsp as *mut u64;
	unsafe {
		slots.add(0).write(0); // r15
		slots.add(1).write(0); // r14
		slots.add(2).write(0); // r13
		slots.add(3).write(0); // r12
		slots.add(4).write(0); // rbp
		slots.add(5).write(0); // rbx
		slots.add(6).write(0x202); // rflags: IF set, nothing else
		slots.add(7).write(thread_trampoline as usize as u64); // return address
	}
	rsp
}

/// Switches from `previous` to `next`, suspending `previous` at exactly
/// this point and resuming it here the next time it is switched back in.
/// The caller must already have updated the per-CPU current-thread pointers
/// to `next` before calling this — by the time it returns (for `previous`,
/// on some later switch back) the per-CPU state and the register file must
/// agree on who is running.
///
/// Must run at IRQL below `DISPATCH_LEVEL`.
pub fn switch_to(previous: &ThreadRef, next: &ThreadRef) {
	let next_rsp = unsafe { *next.kernel_rsp.get() };
	unsafe { raw_switch(previous.kernel_rsp.get(), next_rsp) };
}

#[unsafe(naked)]
unsafe extern "C" fn raw_switch(prev_rsp_slot: *mut u64, next_rsp: u64) {
	naked_asm!(
		"pushfq",
		"push rbx",
		"push rbp",
		"push r12",
		"push r13",
		"push r14",
		"push r15",
		"mov [rdi], rsp",
		"mov rsp, rsi",
		"pop r15",
		"pop r14",
		"pop r13",
		"pop r12",
		"pop rbp",
		"pop rbx",
		"popfq",
		"ret",
	);
}

/// Entry point for a thread that has never run before. Reads the trap frame
/// [`crate::sched::thread::create_thread`]/[`crate::sched::thread::create_user_thread`]
/// prepared. A kernel thread's frame carries the kernel code selector: call
/// straight into `entry(arg)`, and if it ever returns, exit with success
/// rather than running off the end of the stack. A user thread's frame
/// carries the user code selector: this is that thread's first and only
/// transition into its own image, so drop to ring 3 via `iretq` instead of
/// a plain call — everything after this point reaches ring 0 again only
/// through a real trap.
extern "C" fn thread_trampoline() -> ! {
	let current: ThreadRef = crate::sched::current_thread_ref();
	let frame = *current.trap_frame.lock();
	drop(current);

	if frame.cs as u16 == crate::arch::x86_64::gdt::USER_CODE_SELECTOR | 3 {
		unsafe { enter_user_mode(frame.ss, frame.rsp, frame.rflags, frame.cs, frame.rip) };
	}

	let entry: extern "C" fn(u64) = unsafe { core::mem::transmute::<u64, extern "C" fn(u64)>(frame.rip) };
	entry(frame.rdi);

	crate::sched::process::terminate_current_thread(crate::status::Status::Success);
}

/// Drops to ring 3 at `(cs, rip)` with stack `(ss, rsp)` and flags
/// `rflags`, never returning to the caller. Mirrors the `swapgs` +
/// privilege-transition shape of [`crate::arch::x86_64::syscall::syscall_entry`]'s
/// exit path, but via `iretq` rather than `sysretq` since there is no
/// `syscall`-saved return context to restore on a thread's very first entry.
#[unsafe(naked)]
unsafe extern "C" fn enter_user_mode(ss: u64, rsp: u64, rflags: u64, cs: u64, rip: u64) -> ! {
	naked_asm!(
		"push rdi", // ss
		"push rsi", // rsp
		"push rdx", // rflags
		"push rcx", // cs
		"push r8",  // rip
		"swapgs",
		"iretq",
	)
}
