//! Simulator message logging.

use std::io::Write;

use anstyle::AnsiColor;
use log::{Level, LevelFilter, Metadata, Record};

/// Installs the logger. The level filter is taken from the
/// `MOTESIM_LOG_LEVEL_FILTER` environment variable and defaults to `Info`.
pub fn init() {
	log::set_logger(&LOGGER).expect("logger already set");
	log::set_max_level(level_filter());
}

fn level_filter() -> LevelFilter {
	match std::env::var("MOTESIM_LOG_LEVEL_FILTER").as_deref() {
		Ok(var) => var.parse().unwrap_or(LevelFilter::Info),
		Err(_) => LevelFilter::Info,
	}
}

static LOGGER: SimLogger = SimLogger;

struct SimLogger;

impl log::Log for SimLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let style = match record.level() {
			Level::Error => AnsiColor::Red.on_default().bold(),
			Level::Warn => AnsiColor::Yellow.on_default(),
			Level::Info => AnsiColor::Green.on_default(),
			Level::Debug => AnsiColor::Cyan.on_default(),
			Level::Trace => AnsiColor::BrightBlack.on_default(),
		};

		let mut stderr = std::io::stderr().lock();
		let _ = writeln!(
			stderr,
			"[{style}{}{style:#}] {}",
			record.level(),
			record.args()
		);
	}

	fn flush(&self) {}
}
