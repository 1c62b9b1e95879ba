//! Log-backend initialization. The teacher wires a Prometheus recorder
//! here; this crate has no metrics-exporter dependency (see DESIGN.md), so
//! this module's job narrows to the ambient logging stack SPEC_FULL.md
//! §10.1 calls for: the `log` facade backed by `env_logger`, honoring the
//! configured level and optional log file.

use std::fs::OpenOptions;
use std::io::Write;

use crate::config::Config;

/// Initializes the global logger exactly once. Safe to call more than once
/// per process (subsequent calls are no-ops), which matters for test
/// binaries that construct multiple `Config`s.
pub fn init_logging(config: &Config) {
	let mut builder = env_logger::Builder::new();
	builder.filter_level(config.log_level);

	if let Some(path) = &config.log_file_path {
		let path = path.clone();
		match OpenOptions::new().create(true).append(true).open(&path) {
			Ok(file) => {
				builder.target(env_logger::Target::Pipe(Box::new(file)));
			}
			Err(e) => {
				eprintln!("failed to open log file {path}: {e}, falling back to stderr");
			}
		}
	}

	let _ = builder.try_init();
}

/// Flushes any buffered log output; called from the shutdown path.
pub fn flush() {
	let _ = std::io::stdout().flush();
}
