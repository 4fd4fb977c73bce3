use std::io::IsTerminal;
use std::time::SystemTime;

use log::{Level, LevelFilter};
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

pub struct Logger {
	color: bool,
}

/// Registers the logger as the global `log` sink and fixes the verbosity for
/// the lifetime of the process. There is no runtime control surface: the
/// level is set once here, from the startup configuration, and does not
/// change while the process runs.
pub fn init(verbose: bool) {
	let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
	let color = std::io::stderr().is_terminal();

	log::set_max_level(level);

	if log::set_boxed_logger(Box::new(Logger { color })).is_err() {
		// Already initialised; harmless in tests that call init() more than once.
	}
}

impl log::Log for Logger {
	fn enabled(&self, _: &log::Metadata) -> bool {
		true
	}

	fn log(&self, record: &log::Record) {
		let time = humantime::format_rfc3339_nanos(SystemTime::now());

		if !self.color {
			eprintln!("{time} {:5} {}: {}", record.level(), record.target(), record.args());
			return;
		}

		let dim = Style::new().dimmed().prefix();

		eprintln!(
			"{dim}{time}{RESET} {}{:5}{RESET} {}{}{RESET}{dim}:{RESET} {}",
			match record.level() {
				Level::Trace => Color::Purple,
				Level::Debug => Color::Blue,
				Level::Info => Color::Green,
				Level::Warn => Color::Yellow,
				Level::Error => Color::Red,
			}
			.bold()
			.prefix(),
			record.level(),
			Style::new().bold().prefix(),
			record.target(),
			record.args()
		);
	}

	fn flush(&self) {}
}
