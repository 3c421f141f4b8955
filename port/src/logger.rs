use std::time::SystemTime;

use log::{Level, LevelFilter};
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

pub struct Logger;

static LOGGER: Logger = Logger;

/// Installs the stderr logger at the given level.
pub fn init(level: LevelFilter) {
	if log::set_logger(&LOGGER).is_ok() {
		log::set_max_level(level);
	}
}

impl log::Log for Logger {
	fn enabled(&self, _: &log::Metadata) -> bool {
		true
	}

	fn log(&self, record: &log::Record) {
		let time = humantime::format_rfc3339_seconds(SystemTime::now());

		let dim = Style::new().dimmed().prefix();

		let color = match record.level() {
			Level::Trace => Color::Purple,
			Level::Debug => Color::Blue,
			Level::Info => Color::Green,
			Level::Warn => Color::Yellow,
			Level::Error => Color::Red,
		};

		eprintln!(
			"{dim}{time}{RESET} {}{:5}{RESET} {}{}{RESET}{dim}:{RESET} {}",
			color.bold().prefix(),
			record.level(),
			Style::new().bold().prefix(),
			record.target(),
			record.args()
		);
	}

	fn flush(&self) {}
}
