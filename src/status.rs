//! Kernel-wide status codes.
//!
//! Every fallible routine in the executive returns a [`Status`] (or a bare
//! sentinel at the few boundaries the design calls out explicitly). A
//! `Status` is `repr(i32)` so the same values double as the syscall return
//! encoding: negative is failure, zero or positive is success.

use thiserror::Error;

pub type KResult<T> = Result<T, Status>;

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum Status {
	#[error("success")]
	Success = 0,

	// --- parameter errors ---
	#[error("invalid parameter")]
	InvalidParameter = -1,
	#[error("invalid address")]
	InvalidAddress = -2,
	#[error("datatype misalignment")]
	DatatypeMisalignment = -3,
	#[error("invalid handle")]
	InvalidHandle = -4,
	#[error("object type mismatch")]
	ObjectTypeMismatch = -5,
	#[error("access denied")]
	AccessDenied = -6,

	// --- resource errors ---
	#[error("insufficient memory")]
	NoMemory = -7,
	#[error("insufficient resources")]
	NoResources = -8,
	#[error("conflicting addresses")]
	ConflictingAddresses = -9,
	#[error("object not found")]
	NotFound = -10,

	// --- policy errors ---
	#[error("process is terminating")]
	ProcessIsTerminating = -11,
	#[error("mutex already owned by caller")]
	MutexAlreadyOwned = -12,
	#[error("mutex not owned by caller")]
	MutexNotOwned = -13,
	#[error("invalid state for this operation")]
	InvalidState = -14,

	// --- storage / image errors ---
	#[error("invalid image format")]
	InvalidImageFormat = -15,
	#[error("invalid checksum")]
	InvalidCheck = -16,
	#[error("unexpected end of file")]
	EndOfFile = -17,

	// --- faults (reflected to the faulting context, never a syscall return) ---
	#[error("access violation")]
	AccessViolation = -18,
	#[error("guard page violation")]
	GuardPageViolation = -19,
}

impl Status {
	pub const fn is_success(self) -> bool {
		(self as i32) >= 0
	}

	pub const fn is_failure(self) -> bool {
		!self.is_success()
	}

	/// Encodes the status as the raw `i32` placed in RAX on syscall return.
	pub const fn to_raw(self) -> i32 {
		self as i32
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn success_is_nonnegative() {
		assert!(Status::Success.is_success());
		assert!(!Status::Success.is_failure());
	}

	#[test]
	fn failures_are_negative() {
		assert!(Status::InvalidParameter.to_raw() < 0);
		assert!(Status::AccessViolation.is_failure());
	}
}
