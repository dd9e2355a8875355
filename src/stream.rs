//! Core data model: the shared [`DataBlock`], the per-consumer [`ByteStream`]
//! cursor, and the [`StreamProvider`] contract media adapters implement.
//!
//! A producer builds one `DataBlock` describing its media plus an initial
//! `ByteStream`. Consumers never share an instance; they call
//! [`ByteStream::clone_at`] to obtain their own cursor over the same block.
//! The block is reference counted and its release callbacks run exactly once,
//! on the count's one-to-zero edge, media callback first.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering, fence};

use crate::{Error, Result};

/// A position in a stream, logical or inner. Matches the platform size type.
pub type Offset = usize;

/// Callback returning a piece of caller-supplied storage.
///
/// Invoked with the same pointer that was registered alongside it. The crate
/// guarantees exactly one invocation, on the owning block's final dispose,
/// and never while the composite critical section is held.
pub type ReleaseFn = unsafe fn(*mut ());

/// Shared descriptor of a stream's backing media.
///
/// One `DataBlock` exists per data source, no matter how many [`ByteStream`]
/// cursors look at it. The storage for the block itself is supplied by the
/// caller (or embedded in a [`crate::ChainData`]); the block only tracks the
/// media handle, the provider that knows how to read it, and the reference
/// count tying the release callbacks to the last dispose.
pub struct DataBlock {
    pub(crate) api: &'static dyn StreamProvider,
    pub(crate) media: *mut (),
    pub(crate) ref_count: AtomicU32,
    pub(crate) media_release: Option<ReleaseFn>,
    pub(crate) block_release: Option<ReleaseFn>,
    /// Set only by `concat`. Streams over a chained block are routed around
    /// the composite lock instead of through their public operations.
    pub(crate) chained: bool,
}

// SAFETY: `api` is a `Sync` singleton, `ref_count` is atomic, and the
// remaining fields are written once during init and read-only afterwards.
// The media behind the raw pointer is only touched through the provider,
// which owns the cross-instance synchronization rules.
unsafe impl Send for DataBlock {}
// SAFETY: see the `Send` argument above.
unsafe impl Sync for DataBlock {}

impl DataBlock {
    /// Initializes block storage in place for a media adapter.
    ///
    /// Sets the reference count to one, owed to the initial instance the
    /// adapter is about to hand out.
    ///
    /// # Safety
    ///
    /// - `block` must be valid for writes of `DataBlock` and stay valid (and
    ///   pinned) until `block_release` reclaims it.
    /// - `media` must remain valid for the provider's use for as long as the
    ///   reference count is non-zero.
    pub unsafe fn init_at(
        block: *mut DataBlock,
        api: &'static dyn StreamProvider,
        media: *mut (),
        media_release: Option<ReleaseFn>,
        block_release: Option<ReleaseFn>,
    ) {
        // SAFETY: `block` is valid for writes per the caller contract. Plain
        // `write` does not drop the (possibly uninitialized) old contents.
        unsafe {
            block.write(DataBlock {
                api,
                media,
                ref_count: AtomicU32::new(1),
                media_release,
                block_release,
                chained: false,
            });
        }
    }

    /// The provider this block dispatches through.
    pub fn api(&self) -> &'static dyn StreamProvider {
        self.api
    }

    /// The opaque media handle registered at init.
    pub fn media(&self) -> *mut () {
        self.media
    }

    /// Takes one more reference for a cloned instance.
    pub fn acquire(&self) {
        // Relaxed: taking a reference needs no synchronization by itself; the
        // happens-before edge that matters is on the final decrement.
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference; on the one-to-zero edge runs the release
    /// callbacks, media first, then block storage.
    ///
    /// # Safety
    ///
    /// `block` must point at a live block holding at least one reference, and
    /// the caller's instance must not use the block afterwards.
    pub unsafe fn release_ref(block: NonNull<DataBlock>) {
        // SAFETY: the block is live per the caller contract; `NonNull::as_ref`
        // with an unbound lifetime is confined to this function.
        let b = unsafe { block.as_ref() };
        if b.ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        // Acquire: everything prior dropping owners did to the media
        // happens-before the release callbacks.
        fence(Ordering::Acquire);
        let media = b.media;
        let media_release = b.media_release;
        let block_release = b.block_release;
        if let Some(release) = media_release {
            // SAFETY: last reference; nobody else can reach the media.
            unsafe { release(media) };
        }
        if let Some(release) = block_release {
            // SAFETY: `b` is not touched after this point; the callback may
            // reclaim the block storage itself.
            unsafe { release(block.as_ptr().cast()) };
        }
    }
}

/// A single consumer's cursor into a [`DataBlock`].
///
/// The cursor exposes a window of logical positions
/// `[first_valid, origin + len)`: `release` moves the lower edge up
/// permanently, `read` and `set_position` move the current position inside
/// it, and the end position itself stays addressable so EOF can be observed
/// with a read. Instances are single-owner; hand a clone, not a reference, to
/// another execution context.
///
/// Dropping an instance disposes it: the block's reference count drops and,
/// when it reaches zero, the registered release callbacks run.
pub struct ByteStream {
    pub(crate) block: NonNull<DataBlock>,
    /// Logical position of `inner_base`; the offset given at clone time.
    pub(crate) origin: Offset,
    /// Inner position where this instance's view starts.
    pub(crate) inner_base: Offset,
    pub(crate) inner_first_valid: Offset,
    pub(crate) inner_current: Offset,
    /// One past the last readable inner position.
    pub(crate) inner_end: Offset,
}

// SAFETY: an instance is owned by exactly one consumer at a time, so moving
// it to another thread transfers that ownership wholesale. Everything shared
// behind `block` is either immutable, atomic, or (for composites) serialized
// by the critical section.
unsafe impl Send for ByteStream {}

impl ByteStream {
    /// Builds the initial instance over a freshly initialized block.
    ///
    /// Media adapter entry point; the linear adapter's
    /// [`ByteStream::from_raw_parts`] is a thin wrapper around
    /// [`DataBlock::init_at`] plus this.
    ///
    /// # Safety
    ///
    /// `block` must have been initialized with [`DataBlock::init_at`] (or
    /// equivalent) and must stay valid until the last instance referencing it
    /// is dropped. The inner range `[inner_base, inner_end)` must describe
    /// positions the provider can actually serve.
    pub unsafe fn from_block(
        block: *mut DataBlock,
        origin: Offset,
        inner_base: Offset,
        inner_end: Offset,
    ) -> Result<ByteStream> {
        let Some(block) = NonNull::new(block) else {
            crate::diag_error!("stream block cannot be null");
            return Err(Error::IllegalArgument);
        };
        if inner_end < inner_base || origin.checked_add(inner_end - inner_base).is_none() {
            crate::diag_error!("stream window overflows the position range");
            return Err(Error::IllegalArgument);
        }
        Ok(ByteStream {
            block,
            origin,
            inner_base,
            inner_first_valid: inner_base,
            inner_current: inner_base,
            inner_end,
        })
    }

    /// The block this instance reads through.
    pub fn block(&self) -> &DataBlock {
        // SAFETY: the instance holds a reference on the block, keeping it
        // alive at least as long as `self`.
        unsafe { self.block.as_ref() }
    }

    fn api(&self) -> &'static dyn StreamProvider {
        self.block().api
    }

    /// Logical position of the given inner position.
    ///
    /// The result cannot overflow for inner positions inside the instance
    /// window; that is checked once at creation.
    pub fn logical_of(&self, inner: Offset) -> Offset {
        self.origin + (inner - self.inner_base)
    }

    /// Translates a logical position into the inner coordinate space.
    ///
    /// Positions preceding the logical origin are an [`Error::IllegalArgument`]
    /// (the subtraction would underflow); positions so large that the
    /// translation overflows lie past the end and report
    /// [`Error::NoSuchElement`]. The result is *not* range checked.
    pub fn to_inner(&self, position: Offset) -> Result<Offset> {
        let relative = position
            .checked_sub(self.origin)
            .ok_or(Error::IllegalArgument)?;
        self.inner_base
            .checked_add(relative)
            .ok_or(Error::NoSuchElement)
    }

    /// Inner position where this instance's view starts.
    pub fn inner_base(&self) -> Offset {
        self.inner_base
    }

    /// Inner position of the earliest byte not yet released.
    pub fn inner_first_valid(&self) -> Offset {
        self.inner_first_valid
    }

    /// Inner position the next read starts at.
    pub fn inner_current(&self) -> Offset {
        self.inner_current
    }

    /// One past the last readable inner position.
    pub fn inner_end(&self) -> Offset {
        self.inner_end
    }

    /// Moves the cursor forward by `count` produced bytes, clamped to the end
    /// of the window. For use by `read` implementations.
    pub fn advance(&mut self, count: usize) {
        self.inner_current = self.inner_current.saturating_add(count).min(self.inner_end);
    }

    /// Plain instance clone: same block, new logical origin `offset`, window
    /// starting at the current position. Shared by the provider defaults;
    /// composite providers add their own bookkeeping on top.
    pub(crate) fn clone_plain(&self, offset: Offset) -> Result<ByteStream> {
        let remaining = self.inner_end - self.inner_current;
        if offset.checked_add(remaining).is_none() {
            crate::diag_error!("clone offset overflows the position range");
            return Err(Error::IllegalArgument);
        }
        self.block().acquire();
        Ok(ByteStream {
            block: self.block,
            origin: offset,
            inner_base: self.inner_current,
            inner_first_valid: self.inner_current,
            inner_current: self.inner_current,
            inner_end: self.inner_end,
        })
    }

    /// Copies the next bytes into `buffer`, advancing the cursor by the
    /// number of bytes produced.
    ///
    /// Short reads are normal; only [`Error::Eof`] means the stream is
    /// drained. An empty `buffer` is an [`Error::IllegalArgument`].
    pub fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        self.api().read(self, buffer)
    }

    /// Moves the cursor to the logical `position`.
    ///
    /// Any position in `[first_valid, end]` is accepted; the end position
    /// itself is addressable so a subsequent read reports EOF. Released
    /// positions are an [`Error::NoSuchElement`], positions preceding the
    /// logical origin an [`Error::IllegalArgument`].
    pub fn set_position(&mut self, position: Offset) -> Result<()> {
        self.api().set_position(self, position)
    }

    /// Moves the cursor back to the first position not yet released.
    ///
    /// Fails with [`Error::NoSuchElement`] once every byte was released.
    pub fn reset(&mut self) -> Result<()> {
        self.api().reset(self)
    }

    /// The current logical position.
    pub fn position(&self) -> Result<Offset> {
        self.api().position(self)
    }

    /// Number of bytes between the cursor and the end of the stream.
    pub fn remaining_size(&self) -> Result<usize> {
        self.api().remaining_size(self)
    }

    /// Declares every byte at logical positions `<= position` unreachable for
    /// this instance.
    ///
    /// The position must lie strictly below the current one
    /// ([`Error::IllegalArgument`] otherwise) and must not be released
    /// already ([`Error::NoSuchElement`]). Whether anything is physically
    /// reclaimed is up to the provider.
    pub fn release(&mut self, position: Offset) -> Result<()> {
        self.api().release(self, position)
    }

    /// Creates an independent cursor over the same data, rebased so that its
    /// first readable byte sits at logical position `offset`.
    ///
    /// The clone starts at this instance's current position and sees exactly
    /// the remaining bytes. Fails with [`Error::IllegalArgument`] when
    /// `offset` plus the remaining size would overflow.
    pub fn clone_at(&self, offset: Offset) -> Result<ByteStream> {
        self.api().clone_at(self, offset)
    }

    /// Ends this instance's life, dropping its reference on the block.
    ///
    /// Equivalent to dropping the value; spelled out for callers that want
    /// the release to read as an operation.
    pub fn dispose(self) {}
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        self.api().dispose(self);
    }
}

/// The eight-operation contract a media adapter implements.
///
/// Implementations are installed as `&'static` singletons in a
/// [`DataBlock`]; all consumer calls dispatch through the block, so an
/// instance can never reach a provider it was not created by.
///
/// The position-bookkeeping operations have provider-agnostic defaults that
/// operate purely on the instance window. An adapter that transforms data on
/// the fly (so that produced positions diverge from media positions) can
/// override them, as long as all reported positions stay in the *produced*
/// coordinate space.
///
/// A stream handed to [`ByteStream::concat`] has its `read`, `set_position`,
/// and `release` invoked while the composite critical section is held;
/// implementations of those must not acquire it themselves.
pub trait StreamProvider: Sync {
    /// Copies up to `buffer.len()` bytes from the current position and
    /// advances the cursor by the amount produced. Returns [`Error::Eof`]
    /// (and produces nothing) once the cursor sits at the end.
    fn read(&self, stream: &mut ByteStream, buffer: &mut [u8]) -> Result<usize>;

    /// Moves the cursor to `position` within `[first_valid, end]`.
    fn set_position(&self, stream: &mut ByteStream, position: Offset) -> Result<()> {
        let inner = stream.to_inner(position)?;
        if inner < stream.inner_first_valid || inner > stream.inner_end {
            return Err(Error::NoSuchElement);
        }
        stream.inner_current = inner;
        Ok(())
    }

    /// Moves the cursor back to the first valid position.
    fn reset(&self, stream: &mut ByteStream) -> Result<()> {
        if stream.inner_first_valid == stream.inner_end {
            return Err(Error::NoSuchElement);
        }
        stream.inner_current = stream.inner_first_valid;
        Ok(())
    }

    /// Reports the current logical position.
    fn position(&self, stream: &ByteStream) -> Result<Offset> {
        Ok(stream.logical_of(stream.inner_current))
    }

    /// Reports the number of bytes from the cursor to the end.
    fn remaining_size(&self, stream: &ByteStream) -> Result<usize> {
        Ok(stream.inner_end - stream.inner_current)
    }

    /// Marks everything at and below `position` released. The default only
    /// narrows the instance window; providers that can reclaim resources
    /// override it.
    fn release(&self, stream: &mut ByteStream, position: Offset) -> Result<()> {
        stream_release(stream, position).map(|_| ())
    }

    /// Clones `stream` into a new instance with logical origin `offset`,
    /// taking one more reference on the block.
    fn clone_at(&self, stream: &ByteStream, offset: Offset) -> Result<ByteStream> {
        stream.clone_plain(offset)
    }

    /// Releases the instance's share of the block. Infallible: an instance
    /// that exists is always disposable.
    fn dispose(&self, stream: &mut ByteStream) {
        // SAFETY: the instance being disposed holds a reference on its block.
        unsafe { DataBlock::release_ref(stream.block) };
    }
}

/// Window-narrowing part of `release`, shared by providers. Returns the
/// released inner position on success.
pub(crate) fn stream_release(stream: &mut ByteStream, position: Offset) -> Result<Offset> {
    let inner = stream.to_inner(position)?;
    if inner >= stream.inner_current {
        return Err(Error::IllegalArgument);
    }
    if inner < stream.inner_first_valid {
        return Err(Error::NoSuchElement);
    }
    stream.inner_first_valid = inner + 1;
    Ok(inner)
}
