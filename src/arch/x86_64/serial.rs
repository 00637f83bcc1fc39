//! The COM1 serial console the logger writes every record to.
//!
//! Grounded on the teacher's `arch::x86_64::kernel::serial::SerialPort`, cut
//! down to the single always-present UART path (no uhyve hypercall console:
//! this kernel only ever runs on bare hardware or a plain VM, never inside
//! that particular hypervisor).

use core::fmt;

use crate::sync::spinlock::{Spinlock, SpinlockGuard};

const COM1_BASE: u16 = 0x3f8;

struct SerialPort {
	port: uart_16550::SerialPort,
}

impl SerialPort {
	unsafe fn new(base: u16) -> Self {
		let mut port = unsafe { uart_16550::SerialPort::new(base) };
		port.init();
		SerialPort { port }
	}
}

impl fmt::Write for SerialPort {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		for byte in s.bytes() {
			self.port.send(byte);
		}
		Ok(())
	}
}

static COM1: Spinlock<Option<SerialPort>> = Spinlock::new(None);

/// Brings up the COM1 UART. Safe to call before interrupts are enabled;
/// must run before [`writer`] is used for anything other than silently
/// dropped output.
pub fn init() {
	let mut com1 = COM1.lock();
	if com1.is_none() {
		*com1 = Some(unsafe { SerialPort::new(COM1_BASE) });
	}
}

/// A `core::fmt::Write` handle onto the serial port, held under the lock for
/// the duration of one formatted write. Writes that arrive before [`init`]
/// has run are dropped rather than panicking, so an early `log::error!` from
/// a pre-console boot failure doesn't itself fault.
pub struct Writer<'a> {
	guard: SpinlockGuard<'a, Option<SerialPort>>,
}

impl fmt::Write for Writer<'_> {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		match self.guard.as_mut() {
			Some(port) => port.write_str(s),
			None => Ok(()),
		}
	}
}

pub fn writer() -> Writer<'static> {
	Writer { guard: COM1.lock() }
}

#[cfg(test)]
mod tests {
	use super::*;
	use core::fmt::Write;

	#[test]
	fn writes_before_init_are_dropped_not_faulted() {
		assert!(COM1.lock().is_none());
		let mut writer = writer();
		assert!(write!(writer, "pre-init output").is_ok());
	}
}
