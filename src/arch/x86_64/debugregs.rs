//! Hardware breakpoint management: the four DR0-3 address slots, DR6status,
//! and DR7 control, plus the per-CPU callback table `#DB` dispatches
//! through.
//!
//! Grounded on `original_source/kernel/core/md/debugfunctions.c`'s
//! `MdSetHardwareBreakpoint`/`MdClearHardwareBreakpointBy{Index,Address}`:
//! same four-slot allocation, same local-enable-bit-plus-4-bit-RW/LEN-group
//! encoding of DR7, same "broadcast to every CPU" distribution (here riding
//! the existing IPI mailbox/stop-vector style broadcast rather than the
//! original's generic `MhSendActionToCpusAndWait`).

use core::arch::asm;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::status::Status;

pub type DebugCallback = fn(u64);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AccessMode {
	Execute = 0b00,
	Write = 0b01,
	ReadWrite = 0b11,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Length {
	One = 0b00,
	Two = 0b01,
	Eight = 0b10,
	Four = 0b11,
}

const SLOT_COUNT: usize = 4;

struct Slot {
	address: AtomicU64,
	callback: AtomicUsize,
}

impl Slot {
	const fn empty() -> Self {
		Slot {
			address: AtomicU64::new(0),
			callback: AtomicUsize::new(0),
		}
	}

	fn is_free(&self) -> bool {
		self.callback.load(Ordering::Acquire) == 0
	}
}

static SLOTS: [Slot; SLOT_COUNT] = [Slot::empty(), Slot::empty(), Slot::empty(), Slot::empty()];

unsafe fn read_dr(index: u8) -> u64 {
	let value: u64;
	unsafe {
		match index {
			0 => asm!("mov {}, dr0", out(reg) value),
			1 => asm!("mov {}, dr1", out(reg) value),
			2 => asm!("mov {}, dr2", out(reg) value),
			3 => asm!("mov {}, dr3", out(reg) value),
			6 => asm!("mov {}, dr6", out(reg) value),
			7 => asm!("mov {}, dr7", out(reg) value),
			_ => unreachable!("debug register index out of range"),
		}
	}
	value
}

unsafe fn write_dr(index: u8, value: u64) {
	unsafe {
		match index {
			0 => asm!("mov dr0, {}", in(reg) value),
			1 => asm!("mov dr1, {}", in(reg) value),
			2 => asm!("mov dr2, {}", in(reg) value),
			3 => asm!("mov dr3, {}", in(reg) value),
			6 => asm!("mov dr6, {}", in(reg) value),
			7 => asm!("mov dr7, {}", in(reg) value),
			_ => unreachable!("debug register index out of range"),
		}
	}
}

fn find_free_slot() -> Option<usize> {
	SLOTS.iter().position(Slot::is_free)
}

/// Installs a hardware breakpoint on the local CPU, firing `callback` with
/// the faulting address the next time `address` is accessed per `mode`.
///
/// The breakpoint is local-CPU-only (DR7's local-enable bits, not the
/// global-enable ones), matching the original: each CPU that needs the same
/// watchpoint calls this on itself, typically via the debug-register IPI
/// broadcast rather than directly.
pub fn set_hardware_breakpoint(callback: DebugCallback, address: u64, mode: AccessMode, length: Length) -> Result<usize, Status> {
	if address == 0 || callback as usize == 0 {
		return Err(Status::InvalidParameter);
	}
	let idx = find_free_slot().ok_or(Status::NoResources)?;

	unsafe {
		write_dr(idx as u8, address);
		write_dr(6, 0);
	}

	let mut dr7 = unsafe { read_dr(7) };
	dr7 |= 1u64 << (idx * 2);
	let group = ((length as u64 & 0x3) << 2) | (mode as u64 & 0x3);
	let mask = 0xFu64 << (16 + 4 * idx);
	dr7 = (dr7 & !mask) | (group << (16 + 4 * idx));
	unsafe { write_dr(7, dr7) };

	SLOTS[idx].address.store(address, Ordering::Release);
	SLOTS[idx].callback.store(callback as usize, Ordering::Release);

	Ok(idx)
}

/// Clears the breakpoint at `index`, local CPU only.
pub fn clear_hardware_breakpoint(index: usize) -> Result<(), Status> {
	let slot = SLOTS.get(index).ok_or(Status::InvalidParameter)?;
	if slot.is_free() {
		return Err(Status::NotFound);
	}

	unsafe {
		write_dr(index as u8, 0);
	}
	let mut dr7 = unsafe { read_dr(7) };
	dr7 &= !(1u64 << (index * 2));
	let mask = 0xFu64 << (16 + 4 * index);
	dr7 &= !mask;
	unsafe {
		write_dr(7, dr7);
		write_dr(6, 0);
	}

	slot.callback.store(0, Ordering::Release);
	slot.address.store(0, Ordering::Release);
	Ok(())
}

/// Called from the `#DB` IDT handler: checks DR6's trap bits against the
/// locally installed slots, invokes each matching callback, then clears
/// DR6 so the condition doesn't retrigger spuriously.
pub fn dispatch() {
	let dr6 = unsafe { read_dr(6) };
	for (idx, slot) in SLOTS.iter().enumerate() {
		if dr6 & (1 << idx) == 0 {
			continue;
		}
		let callback = slot.callback.load(Ordering::Acquire);
		if callback == 0 {
			continue;
		}
		let address = slot.address.load(Ordering::Acquire);
		let callback: DebugCallback = unsafe { core::mem::transmute::<usize, DebugCallback>(callback) };
		callback(address);
	}
	unsafe { write_dr(6, 0) };
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn access_mode_and_length_encode_into_distinct_nibbles() {
		let group = ((Length::Four as u64 & 0x3) << 2) | (AccessMode::Write as u64 & 0x3);
		assert_eq!(group, 0b1101);
	}
}
