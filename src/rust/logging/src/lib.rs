//! Process-wide logging (§6A): every lifecycle transition in the backends logs through the
//! `log` facade at a level proportional to severity. This crate installs the one logger that
//! actually renders those records — a dynamically adjustable level (so a long-lived process can
//! be told to log more verbosely without restarting), ANSI-colored level tags when writing to a
//! terminal and plain text otherwise, RFC3339 timestamps, and a per-process run identifier
//! attached to every line so that concurrently interleaved requests' log output can be told
//! apart.

use std::io::{IsTerminal, Write};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};
use num_enum::TryFromPrimitive;
use parking_lot::RwLock;
use regex::Regex;

static RUN_ID: OnceLock<String> = OnceLock::new();
static LOGGER: OnceLock<ProcessLogger> = OnceLock::new();

/// A short identifier generated once per process and threaded into every log line, so that two
/// requests' interleaved output in a multi-threaded executor can still be told apart by eye.
pub fn run_id() -> &'static str {
    RUN_ID.get_or_init(|| {
        let full = uuid::Uuid::new_v4().simple().to_string();
        full[..8].to_string()
    })
}

/// A coarse numeric verbosity, the shape a `--verbosity` CLI flag or an env var naturally takes,
/// mapped onto `log`'s own `LevelFilter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Verbosity {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl From<Verbosity> for LevelFilter {
    fn from(v: Verbosity) -> Self {
        match v {
            Verbosity::Error => LevelFilter::Error,
            Verbosity::Warn => LevelFilter::Warn,
            Verbosity::Info => LevelFilter::Info,
            Verbosity::Debug => LevelFilter::Debug,
            Verbosity::Trace => LevelFilter::Trace,
        }
    }
}

/// Parses a numeric verbosity, falling back to `Info` for an out-of-range value rather than
/// failing process startup over a malformed flag.
pub fn verbosity_from_u8(raw: u8) -> LevelFilter {
    Verbosity::try_from(raw).map(LevelFilter::from).unwrap_or(LevelFilter::Info)
}

struct ProcessLogger {
    level: ArcSwap<LevelFilter>,
    overrides: RwLock<Vec<(Regex, LevelFilter)>>,
    color: bool,
}

impl ProcessLogger {
    fn effective_level(&self, target: &str) -> LevelFilter {
        for (pattern, level) in self.overrides.read().iter() {
            if pattern.is_match(target) {
                return *level;
            }
        }
        **self.level.load()
    }

    fn refresh_max_level(&self) {
        let mut max = **self.level.load();
        for (_, level) in self.overrides.read().iter() {
            if *level > max {
                max = *level;
            }
        }
        log::set_max_level(max);
    }
}

impl Log for ProcessLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.effective_level(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let tag = level_tag(record.level(), self.color);
        let line = format!(
            "{timestamp} {tag} [{run}] {target} - {args}",
            run = run_id(),
            target = record.target(),
            args = record.args(),
        );
        let _ = writeln!(std::io::stderr(), "{line}");
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn level_tag(level: Level, color: bool) -> String {
    let text = match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    };
    if !color {
        return text.to_string();
    }
    match level {
        Level::Error => text.red().bold().to_string(),
        Level::Warn => text.yellow().bold().to_string(),
        Level::Info => text.green().to_string(),
        Level::Debug => text.blue().to_string(),
        Level::Trace => text.dimmed().to_string(),
    }
}

/// Installs the process-wide logger at `level`. A second call is a no-op, mirroring
/// `log::set_logger`'s own idempotence contract — this is meant to run once at process start,
/// not be re-entered per request.
pub fn init(level: LevelFilter) {
    let logger = LOGGER.get_or_init(|| ProcessLogger {
        level: ArcSwap::from_pointee(level),
        overrides: RwLock::new(Vec::new()),
        color: std::io::stderr().is_terminal(),
    });
    if log::set_logger(logger).is_ok() {
        logger.refresh_max_level();
    }
}

/// Adjusts the process-wide level at runtime. A no-op if `init` has not run yet.
pub fn set_level(level: LevelFilter) {
    if let Some(logger) = LOGGER.get() {
        logger.level.store(Arc::new(level));
        logger.refresh_max_level();
    }
}

/// Overrides the effective level for every target matching `pattern`, checked before the global
/// level and in the order overrides were added. Returns an error if `pattern` is not a valid
/// regex; a no-op if `init` has not run yet.
pub fn set_target_override(pattern: &str, level: LevelFilter) -> Result<(), regex::Error> {
    let regex = Regex::new(pattern)?;
    if let Some(logger) = LOGGER.get() {
        logger.overrides.write().push((regex, level));
        logger.refresh_max_level();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_stable_within_a_process() {
        assert_eq!(run_id(), run_id());
        assert_eq!(run_id().len(), 8);
    }

    #[test]
    fn plain_tag_has_no_escape_codes() {
        let tag = level_tag(Level::Error, false);
        assert_eq!(tag, "ERROR");
        assert!(!tag.contains('\u{1b}'));
    }

    #[test]
    fn colored_tag_carries_escape_codes() {
        let tag = level_tag(Level::Error, true);
        assert!(tag.contains('\u{1b}'));
    }

    #[test]
    fn verbosity_out_of_range_falls_back_to_info() {
        assert_eq!(verbosity_from_u8(99), LevelFilter::Info);
        assert_eq!(verbosity_from_u8(4), LevelFilter::Trace);
    }

    #[test]
    fn target_override_wins_over_the_global_level() {
        let logger = ProcessLogger {
            level: ArcSwap::from_pointee(LevelFilter::Warn),
            overrides: RwLock::new(Vec::new()),
            color: false,
        };
        assert_eq!(logger.effective_level("sandbox_coordinator"), LevelFilter::Warn);
        logger
            .overrides
            .write()
            .push((Regex::new("^sandbox_coordinator").unwrap(), LevelFilter::Trace));
        assert_eq!(logger.effective_level("sandbox_coordinator"), LevelFilter::Trace);
        assert_eq!(logger.effective_level("process_execution"), LevelFilter::Warn);
    }
}
