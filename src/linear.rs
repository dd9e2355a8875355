//! Reference media adapter over a contiguous byte buffer.
//!
//! The buffer is supplied by the caller, address plus length, together with
//! an optional release callback for it and one for the block storage. `read`
//! is a plain copy. `release` narrows the window but never frees bytes; the
//! buffer goes back to the caller in one piece when the last instance is
//! dropped.

use core::slice;

use crate::stream::{ByteStream, DataBlock, ReleaseFn, StreamProvider};
use crate::{Error, Result};

struct Linear;

static LINEAR: Linear = Linear;

impl StreamProvider for Linear {
    fn read(&self, stream: &mut ByteStream, buffer: &mut [u8]) -> Result<usize> {
        if buffer.is_empty() {
            crate::diag_error!("read buffer cannot be empty");
            return Err(Error::IllegalArgument);
        }
        let remaining = stream.inner_end - stream.inner_current;
        if remaining == 0 {
            return Err(Error::Eof);
        }
        let count = buffer.len().min(remaining);
        // SAFETY: `media` is the caller's buffer of `inner_end` bytes, valid
        // while the block holds references, and `inner_current + count` stays
        // within it by the window invariant. The source cannot overlap
        // `buffer`: the media is logically immutable and never handed out
        // mutably.
        let source = unsafe {
            slice::from_raw_parts(
                stream
                    .block()
                    .media()
                    .cast_const()
                    .cast::<u8>()
                    .add(stream.inner_current),
                count,
            )
        };
        buffer[..count].copy_from_slice(source);
        stream.inner_current += count;
        Ok(count)
    }
}

impl ByteStream {
    /// Creates a stream over a contiguous byte buffer.
    ///
    /// `block` is caller-supplied storage for the shared [`DataBlock`];
    /// `buffer` is the data source. The optional callbacks run exactly once
    /// when the last instance over the block is dropped, `buffer_release`
    /// first.
    ///
    /// Fails with [`Error::IllegalArgument`] on a null pointer or an empty
    /// buffer.
    ///
    /// # Safety
    ///
    /// - `block` must be valid for writes of `DataBlock` and stay valid until
    ///   `block_release` reclaims it.
    /// - `buffer` must point at `buffer_len` initialized bytes that stay
    ///   valid and unmodified until `buffer_release` reclaims them.
    pub unsafe fn from_raw_parts(
        block: *mut DataBlock,
        block_release: Option<ReleaseFn>,
        buffer: *const u8,
        buffer_len: usize,
        buffer_release: Option<ReleaseFn>,
    ) -> Result<ByteStream> {
        if block.is_null() {
            crate::diag_error!("stream block cannot be null");
            return Err(Error::IllegalArgument);
        }
        if buffer.is_null() {
            crate::diag_error!("stream buffer cannot be null");
            return Err(Error::IllegalArgument);
        }
        if buffer_len == 0 {
            crate::diag_error!("stream buffer cannot be empty");
            return Err(Error::IllegalArgument);
        }
        // SAFETY: storage and media validity are the caller's contract,
        // forwarded verbatim from this function's own.
        unsafe {
            DataBlock::init_at(
                block,
                &LINEAR,
                buffer.cast_mut().cast(),
                buffer_release,
                block_release,
            );
            ByteStream::from_block(block, 0, 0, buffer_len)
        }
    }
}
