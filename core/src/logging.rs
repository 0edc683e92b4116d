//! Logger installation for the worker binary.
//!
//! The library side only ever talks to the `log` facade and leaves installing
//! a logger to whatever application loaded it. The worker binary has no such
//! application, so it installs this minimal line logger: one line per record
//! on stderr, tagged with a per-bridge prefix, verbosity taken from the
//! `PLUGBRIDGE_LOG` environment variable. At `trace` level the dialect
//! bridges also log every request and response they pass along.

use log::{LevelFilter, Log, Metadata, Record};
use std::io::Write;

struct LineLogger {
    prefix: String,
}

impl Log for LineLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let stderr = std::io::stderr();
        let mut stderr = stderr.lock();
        let _ = writeln!(stderr, "{}{}", self.prefix, record.args());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Parse `PLUGBRIDGE_LOG` into a level filter. Unset or unparsable values
/// default to `info`.
pub fn verbosity_from_environment() -> LevelFilter {
    match std::env::var("PLUGBRIDGE_LOG").ok().as_deref() {
        Some("off") => LevelFilter::Off,
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Install the line logger with the given prefix. A no-op if a logger is
/// already installed (which happens when a group worker hosts more than one
/// plugin).
pub fn install_logger(prefix: impl Into<String>) {
    let logger = Box::new(LineLogger { prefix: prefix.into() });

    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(verbosity_from_environment());
    }
}
