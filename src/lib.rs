#![no_std]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

#[cfg(test)]
extern crate std;

use static_assertions::const_assert;

pub mod diag;

mod chain;
mod linear;
mod stream;

pub use chain::ChainData;
pub use stream::{ByteStream, DataBlock, Offset, ReleaseFn, StreamProvider};

// Logical positions must cover at least the 32-bit range and always match the
// platform size type, so `Offset` is `usize` on a 32-bit-or-wider target.
const_assert!(core::mem::size_of::<usize>() >= 4);

/// Upper bound on one formatted diagnostic line, severity tag and line
/// terminator included. Longer lines are silently truncated.
pub const MAX_DIAG_LEN: usize = 256;

/// Outcome reported by every fallible stream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The cursor is at the end of the stream; no bytes were produced.
    ///
    /// This is a terminal condition of `read`, not a failure: the stream is
    /// intact and earlier positions can still be revisited with
    /// [`ByteStream::set_position`].
    Eof,
    /// A required pointer was null, a read buffer was empty, a position
    /// preceded the stream's logical origin, or position arithmetic would
    /// overflow.
    IllegalArgument,
    /// The position refers to bytes this cursor has already released, or a
    /// reset was attempted after everything was released.
    NoSuchElement,
    /// Caller-supplied storage for a composite was missing.
    OutOfMemory,
    /// The backing media is temporarily busy. Surfaced by media adapters.
    Busy,
    /// The operation was cancelled inside the media adapter.
    Cancelled,
    /// The media adapter denied the operation.
    Security,
    /// The operation failed at the system level inside the media adapter.
    System,
}

/// Shorthand for results carrying a stream [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
