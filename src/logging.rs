//! Installs a [`log::Log`] implementation backed by the serial console.
//!
//! The wire format mirrors what the teacher's `printlog!` macro produced
//! (`[core][LEVEL] message`) but is routed through the standard `log` facade
//! instead of crate-local macros, so call sites use `log::info!`,
//! `log::warn!`, etc. directly.

use core::fmt::Write;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::arch::serial;
use crate::percpu;

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

/// Compiled-in default; there is no environment before boot to read
/// `RUST_LOG` from. A boot-command-line token may raise or lower this via
/// [`set_max_level`].
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

static CURRENT_LEVEL: AtomicU32 = AtomicU32::new(LevelFilter::Info as u32);

impl Log for KernelLogger {
	fn enabled(&self, metadata: &Metadata) -> bool {
		(metadata.level() as u32) <= CURRENT_LEVEL.load(Ordering::Relaxed)
	}

	fn log(&self, record: &Record) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let core_id = percpu::try_current_core_id().unwrap_or(u32::MAX);
		let level = level_tag(record.level());

		let mut writer = serial::writer();
		let _ = writeln!(writer, "[{core_id}][{level}] {}", record.args());
	}

	fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
	match level {
		Level::Error => "ERROR",
		Level::Warn => "WARNING",
		Level::Info => "INFO",
		Level::Debug => "DEBUG",
		Level::Trace => "TRACE",
	}
}

/// Installs the kernel logger. Must run before any other subsystem emits a
/// log record; safe to call more than once (later calls are no-ops).
pub fn init() {
	serial::init();
	CURRENT_LEVEL.store(DEFAULT_LEVEL as u32, Ordering::Relaxed);
	let _ = log::set_logger(&LOGGER);
	log::set_max_level(DEFAULT_LEVEL);
}

/// Applies a boot-command-line override (e.g. `loglevel=debug`).
pub fn set_max_level(level: LevelFilter) {
	CURRENT_LEVEL.store(level as u32, Ordering::Relaxed);
	log::set_max_level(level);
}
