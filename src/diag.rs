//! Severity-tagged diagnostic printer.
//!
//! The crate reports argument-validation failures through this module as
//! single text lines of the form `[ERROR]message\r\n`. Formatting happens on
//! the stack into a buffer of [`crate::MAX_DIAG_LEN`] bytes; anything longer
//! is silently truncated. Where the line goes is up to the application: until
//! [`set_sink`] installs one, lines are dropped.
//!
//! With the `semihosting` feature, [`semihosting::sink`] is a ready-made sink
//! for QEMU and debug probes. With the `defmt` feature every line is also
//! mirrored to defmt.

use core::cell::Cell;
use core::fmt::{self, Write};

use critical_section::Mutex;

use crate::MAX_DIAG_LEN;

#[cfg(feature = "semihosting")]
pub mod semihosting;

/// Severity of a diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    /// An operation failed; the accompanying error code was returned.
    Error,
    /// Informational.
    Info,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Error => "[ERROR]",
            Level::Info => "[INFO]",
        }
    }
}

/// A diagnostic sink: receives one complete line per call.
pub type SinkFn = fn(&[u8]);

static SINK: Mutex<Cell<Option<SinkFn>>> = Mutex::new(Cell::new(None));

/// Installs the sink diagnostic lines are written to.
pub fn set_sink(sink: SinkFn) {
    critical_section::with(|cs| SINK.borrow(cs).set(Some(sink)));
}

/// Formats one diagnostic line and hands it to the installed sink.
///
/// Usually called through [`diag_error!`](crate::diag_error) or
/// [`diag_info!`](crate::diag_info).
pub fn print(level: Level, args: fmt::Arguments<'_>) {
    #[cfg(feature = "defmt")]
    match level {
        Level::Error => defmt::error!("{}", defmt::Display2Format(&args)),
        Level::Info => defmt::info!("{}", defmt::Display2Format(&args)),
    }

    let Some(sink) = critical_section::with(|cs| SINK.borrow(cs).get()) else {
        return;
    };

    let mut line = Line {
        buf: [0; MAX_DIAG_LEN],
        len: 0,
    };
    // Overflow is deliberately ignored; see `Line::write_str`.
    let _ = line.write_str(level.tag());
    let _ = line.write_fmt(args);
    let _ = line.write_str("\r\n");
    sink(&line.buf[..line.len]);
}

/// Fixed-size line buffer that drops whatever does not fit.
struct Line {
    buf: [u8; MAX_DIAG_LEN],
    len: usize,
}

impl fmt::Write for Line {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let count = s.len().min(room);
        self.buf[self.len..self.len + count].copy_from_slice(&s.as_bytes()[..count]);
        self.len += count;
        Ok(())
    }
}

/// Prints an error-severity diagnostic line through [`diag::print`](print).
#[macro_export]
macro_rules! diag_error {
    ($($arg:tt)*) => {
        $crate::diag::print($crate::diag::Level::Error, ::core::format_args!($($arg)*))
    };
}

/// Prints an info-severity diagnostic line through [`diag::print`](print).
#[macro_export]
macro_rules! diag_info {
    ($($arg:tt)*) => {
        $crate::diag::print($crate::diag::Level::Info, ::core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod test {
    use super::*;
    use core::cell::RefCell;
    use std::string::String;
    use std::vec::Vec;

    // Per-thread capture: the sink runs on the emitting thread, so parallel
    // tests cannot pollute each other's view.
    std::thread_local! {
        static CAPTURED: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
    }

    fn capture(line: &[u8]) {
        CAPTURED.with(|c| c.borrow_mut().extend_from_slice(line));
    }

    fn take_captured() -> Vec<u8> {
        CAPTURED.with(|c| core::mem::take(&mut *c.borrow_mut()))
    }

    #[test]
    fn lines_carry_severity_tag_and_terminator() {
        set_sink(capture);
        take_captured();

        crate::diag_error!("stream buffer cannot be {}", "null");
        crate::diag_info!("{} bytes released", 42);

        let captured = String::from_utf8(take_captured()).unwrap();
        assert_eq!(
            captured,
            "[ERROR]stream buffer cannot be null\r\n[INFO]42 bytes released\r\n"
        );
    }

    #[test]
    fn overlong_lines_are_truncated_silently() {
        set_sink(capture);
        take_captured();

        crate::diag_info!("{:a<1000}", "");

        let captured = take_captured();
        assert_eq!(captured.len(), crate::MAX_DIAG_LEN);
        assert!(captured.starts_with(b"[INFO]aaaa"));
    }
}
