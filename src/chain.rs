//! Composite streams: two child streams chained into one.
//!
//! `concat` clones its two operands into caller-supplied [`ChainData`]
//! storage and hands back an ordinary [`ByteStream`] that reads the first
//! child's remaining bytes, then the second's, as one seamless sequence. The
//! sources stay untouched and can be dropped right after.
//!
//! All composite cursors over one `ChainData` share the two child instances.
//! Sibling access to the children is serialized with a critical section, and
//! each child stays alive exactly as long as some composite cursor can still
//! reach bytes in its half: per-child contribution counts drop as cursors
//! release past a child's end or are dropped, and the child is disposed on
//! the last drop. The critical section is a leaf lock: it is taken once at
//! the outermost composite, children that are themselves composites are read
//! through an internal unlocked path, and release callbacks never run while
//! it is held.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering, fence};

use crate::stream::{ByteStream, DataBlock, Offset, ReleaseFn, StreamProvider};
use crate::{Error, Result};

/// Caller-supplied storage backing one composite stream.
///
/// Holds the composite's [`DataBlock`], the two cloned child instances, and
/// the per-child contribution counts. Opaque to the caller: allocate it
/// (typically as `MaybeUninit<ChainData>`), pass it to
/// [`ByteStream::concat`], and reclaim it in the release callback given
/// there.
pub struct ChainData {
    block: DataBlock,
    children: UnsafeCell<Children>,
    /// Composite inner position where the second child begins.
    first_len: usize,
    /// Composite inner position one past the second child's end.
    total_len: usize,
    first_refs: AtomicU32,
    second_refs: AtomicU32,
}

struct Children {
    first: Option<ByteStream>,
    second: Option<ByteStream>,
}

// SAFETY: the mutable state is the two children behind the `UnsafeCell`,
// which are only touched with the critical section held, and the atomic
// counters. Everything else is written once during `concat`.
unsafe impl Send for ChainData {}
// SAFETY: see the `Send` argument above.
unsafe impl Sync for ChainData {}

struct Chained;

static CHAINED: Chained = Chained;

fn chain_ptr(stream: &ByteStream) -> *const ChainData {
    stream.block().media().cast_const().cast::<ChainData>()
}

/// Whether the stream reads through the composite engine.
fn is_chained(stream: &ByteStream) -> bool {
    stream.block().chained
}

impl ByteStream {
    /// Chains `other`'s remaining bytes after this stream's remaining bytes.
    ///
    /// Both operands are cloned; neither is consumed or repositioned, and
    /// disposing them afterwards does not disturb the composite. The returned
    /// stream starts at logical position zero and spans both remainders.
    ///
    /// A null `storage` reports [`Error::OutOfMemory`]. If cloning the second
    /// operand fails, the first clone is disposed again and `storage_release`
    /// runs before the error is returned.
    ///
    /// # Safety
    ///
    /// `storage` must be valid for writes of `ChainData` and stay valid (and
    /// pinned) until `storage_release` reclaims it.
    pub unsafe fn concat(
        &self,
        other: &ByteStream,
        storage: *mut ChainData,
        storage_release: Option<ReleaseFn>,
    ) -> Result<ByteStream> {
        if storage.is_null() {
            crate::diag_error!("not enough memory to create the chained stream");
            return Err(Error::OutOfMemory);
        }

        let first = self.clone_at(0)?;
        let first_len = first.inner_end() - first.inner_base();
        let second = match other.clone_at(first_len) {
            Ok(second) => second,
            Err(e) => {
                drop(first);
                if let Some(release) = storage_release {
                    // SAFETY: `storage` was never initialized; the callback
                    // only reclaims the allocation.
                    unsafe { release(storage.cast()) };
                }
                return Err(e);
            }
        };
        // The second clone was rebased to `first_len`, which already proves
        // this sum fits in an `Offset`.
        let total_len = first_len + (second.inner_end() - second.inner_base());

        // SAFETY: `storage` is valid for writes per the caller contract.
        // Plain `write` does not drop the uninitialized old contents.
        unsafe {
            storage.write(ChainData {
                block: DataBlock {
                    api: &CHAINED,
                    media: storage.cast(),
                    ref_count: AtomicU32::new(1),
                    media_release: storage_release,
                    block_release: None,
                    chained: true,
                },
                children: UnsafeCell::new(Children {
                    first: Some(first),
                    second: Some(second),
                }),
                first_len,
                total_len,
                first_refs: AtomicU32::new(1),
                second_refs: AtomicU32::new(1),
            });
        }

        // SAFETY: just initialized, so the block pointer is valid and
        // non-null; the instance starts with the window [0, total_len).
        unsafe {
            let block = &raw mut (*storage).block;
            ByteStream::from_block(block, 0, 0, total_len)
        }
    }
}

impl StreamProvider for Chained {
    fn read(&self, stream: &mut ByteStream, buffer: &mut [u8]) -> Result<usize> {
        if buffer.is_empty() {
            crate::diag_error!("read buffer cannot be empty");
            return Err(Error::IllegalArgument);
        }
        // One acquisition at the outermost composite, spanning the whole
        // read, so sibling cursors never observe a half-updated child
        // cursor. This is a leaf lock: nested composite children go through
        // `read_in_lock` directly, and leaf provider reads run under the
        // lock without reacquiring it.
        critical_section::with(|_| read_in_lock(stream, buffer))
    }

    fn release(&self, stream: &mut ByteStream, position: Offset) -> Result<()> {
        let chain = chain_ptr(stream);
        let old_first_valid = stream.inner_first_valid();
        let current = stream.inner_current();

        // Validate against this cursor's window up front; the window itself
        // is only narrowed once the child forwarding below went through, so
        // a child failure leaves the composite untouched.
        let inner = stream.to_inner(position)?;
        if inner >= current {
            return Err(Error::IllegalArgument);
        }
        if inner < old_first_valid {
            return Err(Error::NoSuchElement);
        }

        let (first_gone, second_gone) = critical_section::with(|_| {
            // SAFETY: as in `read`; children only under the critical section.
            let chain = unsafe { &*chain };
            let children = unsafe { &mut *chain.children.get() };

            // Byte-level forwarding is only safe while this cursor is the
            // child's sole remaining contributor: other contributors may
            // still rewind below this release point. It also stops at
            // composite children, whose own release would reacquire the
            // held lock; they reclaim through dispose when their
            // contribution count reaches zero.
            if inner < chain.first_len {
                if chain.first_refs.load(Ordering::Acquire) == 1 {
                    if let Some(first) = children.first.as_mut() {
                        if !is_chained(first) {
                            first.set_position(current.min(chain.first_len))?;
                            first.release(inner)?;
                        }
                    }
                }
            } else {
                if chain.first_len > 0 && chain.first_refs.load(Ordering::Acquire) == 1 {
                    if let Some(first) = children.first.as_mut() {
                        if !is_chained(first) && first.inner_first_valid() < first.inner_end() {
                            first.set_position(chain.first_len)?;
                            first.release(chain.first_len - 1)?;
                        }
                    }
                }
                if chain.second_refs.load(Ordering::Acquire) == 1 {
                    if let Some(second) = children.second.as_mut() {
                        if !is_chained(second) {
                            second.set_position(current)?;
                            second.release(inner)?;
                        }
                    }
                }
            }

            stream.inner_first_valid = inner + 1;
            let new_first_valid = stream.inner_first_valid;

            // A cursor that released past a child's end stops contributing
            // to it; the last contributor takes the child out for disposal.
            let mut first_gone = None;
            let mut second_gone = None;
            if old_first_valid < chain.first_len && new_first_valid >= chain.first_len {
                if chain.first_refs.fetch_sub(1, Ordering::Release) == 1 {
                    fence(Ordering::Acquire);
                    first_gone = children.first.take();
                }
            }
            if old_first_valid < chain.total_len && new_first_valid >= chain.total_len {
                if chain.second_refs.fetch_sub(1, Ordering::Release) == 1 {
                    fence(Ordering::Acquire);
                    second_gone = children.second.take();
                }
            }
            Ok::<_, Error>((first_gone, second_gone))
        })?;

        // Child dispose may run release callbacks; keep it outside the
        // critical section.
        drop(first_gone);
        drop(second_gone);
        Ok(())
    }

    fn clone_at(&self, stream: &ByteStream, offset: Offset) -> Result<ByteStream> {
        // SAFETY: as in `read`.
        let chain = unsafe { &*chain_ptr(stream) };
        let clone = stream.clone_plain(offset)?;
        // The clone's window starts at the source's current position; count
        // its contribution for every child range the window still touches.
        // The source keeps contributing on its own, so neither count can hit
        // zero concurrently.
        if clone.inner_first_valid() < chain.first_len {
            chain.first_refs.fetch_add(1, Ordering::Relaxed);
        }
        if clone.inner_first_valid() < chain.total_len {
            chain.second_refs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(clone)
    }

    fn dispose(&self, stream: &mut ByteStream) {
        let chain = chain_ptr(stream);
        let first_valid = stream.inner_first_valid();

        // SAFETY: the chain data stays valid until the block reference this
        // instance still holds is returned below.
        let chain = unsafe { &*chain };

        let (first_gone, second_gone) = critical_section::with(|_| {
            // SAFETY: children only under the critical section.
            let children = unsafe { &mut *chain.children.get() };
            let mut first_gone = None;
            let mut second_gone = None;
            if first_valid < chain.first_len
                && chain.first_refs.fetch_sub(1, Ordering::Release) == 1
            {
                fence(Ordering::Acquire);
                first_gone = children.first.take();
            }
            if first_valid < chain.total_len
                && chain.second_refs.fetch_sub(1, Ordering::Release) == 1
            {
                fence(Ordering::Acquire);
                second_gone = children.second.take();
            }
            (first_gone, second_gone)
        });
        drop(first_gone);
        drop(second_gone);

        if chain.block.ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);

        // Last composite cursor. Children whose range was never entered (an
        // empty operand) still hold their initial contribution; dispose them
        // now, again outside the critical section.
        let (first_gone, second_gone) = critical_section::with(|_| {
            // SAFETY: sole owner at this point; the critical section only
            // guards against in-flight sibling reads that raced the final
            // decrement.
            let children = unsafe { &mut *chain.children.get() };
            (children.first.take(), children.second.take())
        });
        drop(first_gone);
        drop(second_gone);

        let media = chain.block.media;
        let media_release = chain.block.media_release;
        if let Some(release) = media_release {
            // SAFETY: last reference is gone and the children are disposed;
            // the callback reclaims the whole `ChainData` storage.
            unsafe { release(media) };
        }
    }
}

/// Composite read body. The caller holds the critical section.
fn read_in_lock(stream: &mut ByteStream, buffer: &mut [u8]) -> Result<usize> {
    // SAFETY: the chain data lives for as long as this instance holds its
    // block reference.
    let chain = unsafe { &*chain_ptr(stream) };
    let pos = stream.inner_current;
    if pos >= stream.inner_end {
        return Err(Error::Eof);
    }
    // SAFETY: children are only touched with the critical section held.
    let children = unsafe { &mut *chain.children.get() };

    if pos < chain.first_len {
        let first = children.first.as_mut().ok_or(Error::System)?;
        // Realign on every read: a sibling may have moved the child cursor
        // since this instance last used it.
        first.set_position(pos)?;
        match child_read(first, buffer) {
            Ok(produced) => {
                stream.inner_current = pos + produced;
                return Ok(produced);
            }
            // First child drained early; continue into the second.
            Err(Error::Eof) => {}
            Err(e) => return Err(e),
        }
    }

    let pos = pos.max(chain.first_len);
    let second = children.second.as_mut().ok_or(Error::System)?;
    second.set_position(pos)?;
    let produced = child_read(second, buffer)?;
    stream.inner_current = pos + produced;
    Ok(produced)
}

/// Reads from a child. A composite child recurses through [`read_in_lock`]
/// instead of its public `read`, which would reacquire the held lock.
fn child_read(child: &mut ByteStream, buffer: &mut [u8]) -> Result<usize> {
    if is_chained(child) {
        read_in_lock(child, buffer)
    } else {
        child.read(buffer)
    }
}
