//! Leveled stderr tracing plus the tab-separated event log file.
//!
//! Debug traces go to stderr, gated by a 0..=3 verbosity and a category
//! mask. The event log records one flushed line per datapath event so runs
//! can be analyzed offline.

use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TraceFlags: u32 {
        const MUX      = 0b0000_0001;
        const DEMUX    = 0b0000_0010;
        const BLAST    = 0b0000_0100;
        const FEEDBACK = 0b0000_1000;
        const NATIVE   = 0b0001_0000;
        const POLL     = 0b0010_0000;
        const ALL      = u32::MAX;
    }
}

pub fn set_verbosity(level: u8) {
    LOGGER.verbosity.store(level.min(3), Ordering::Relaxed);
}

pub fn verbosity() -> u8 {
    LOGGER.verbosity.load(Ordering::Relaxed)
}

pub fn set_trace_mask(mask: TraceFlags) {
    LOGGER.trace_mask.store(mask.bits(), Ordering::Relaxed);
}

pub fn error(message: impl AsRef<str>) {
    eprintln!("{}", message.as_ref());
}

pub fn warn(message: impl AsRef<str>) {
    if verbosity() >= 1 {
        eprintln!("{}", message.as_ref());
    }
}

/// Emits a stderr trace when the verbosity reaches `level` and `flag` is in
/// the trace mask.
pub fn debug(level: u8, flag: TraceFlags, message: impl AsRef<str>) {
    LOGGER.trace(level, flag, message.as_ref());
}

/// Routes the event log to a file, or to stdout when `path` is `"stdout"`.
pub fn install_event_log(path: &Path) -> io::Result<()> {
    LOGGER.install_event_log(path)
}

pub fn event_log_installed() -> bool {
    LOGGER.sink.lock().is_some()
}

/// Writes one line to the event log and flushes it. A no-op when no log was
/// installed.
pub fn event(line: fmt::Arguments<'_>) {
    LOGGER.event(line);
}

/// Microseconds since the Unix epoch; the timestamp unit of the event log
/// and of all datapath timers.
pub fn timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

enum EventSink {
    Stdout(io::Stdout),
    File(File),
}

impl EventSink {
    fn write_line(&mut self, line: fmt::Arguments<'_>) {
        // Best effort once open; a failed write must not stall the datapath.
        let _ = match self {
            EventSink::Stdout(out) => {
                let mut handle = out.lock();
                writeln!(handle, "{line}").and_then(|_| handle.flush())
            }
            EventSink::File(file) => writeln!(file, "{line}").and_then(|_| file.flush()),
        };
    }
}

struct LogManager {
    verbosity: AtomicU8,
    trace_mask: AtomicU32,
    sink: Mutex<Option<EventSink>>,
}

impl LogManager {
    fn new() -> Self {
        Self {
            verbosity: AtomicU8::new(0),
            trace_mask: AtomicU32::new(TraceFlags::ALL.bits()),
            sink: Mutex::new(None),
        }
    }

    fn trace(&self, level: u8, flag: TraceFlags, message: &str) {
        if self.verbosity.load(Ordering::Relaxed) < level {
            return;
        }
        let mask = TraceFlags::from_bits_truncate(self.trace_mask.load(Ordering::Relaxed));
        if !mask.intersects(flag) {
            return;
        }
        eprintln!("{message}");
    }

    fn install_event_log(&self, path: &Path) -> io::Result<()> {
        let sink = if path.to_str() == Some("stdout") {
            EventSink::Stdout(io::stdout())
        } else {
            EventSink::File(File::create(path)?)
        };
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn event(&self, line: fmt::Arguments<'_>) {
        let mut guard = self.sink.lock();
        if let Some(sink) = guard.as_mut() {
            sink.write_line(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_is_clamped() {
        set_verbosity(7);
        assert_eq!(verbosity(), 3);
        set_verbosity(0);
        assert_eq!(verbosity(), 0);
    }

    #[test]
    fn timestamps_advance() {
        let first = timestamp_us();
        let second = timestamp_us();
        assert!(second >= first);
        assert!(first > 1_000_000_000_000_000); // past 2001 in microseconds
    }
}
