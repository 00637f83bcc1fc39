//! Architecture-specific glue. x86-64 is the only supported target; the
//! module split mirrors the teacher's `arch::{x86_64,aarch64,riscv64}`
//! layout even though only one arm is populated, so a second architecture
//! has an obvious place to land.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::serial;
