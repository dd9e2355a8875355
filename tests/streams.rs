//! End-to-end behavior of linear and chained streams through the public API.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use bytestream::{ByteStream, ChainData, DataBlock, Error};

const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn leak_block() -> *mut DataBlock {
    Box::into_raw(Box::new(MaybeUninit::<DataBlock>::uninit())).cast()
}

fn leak_chain() -> *mut ChainData {
    Box::into_raw(Box::new(MaybeUninit::<ChainData>::uninit())).cast()
}

fn linear(data: &'static [u8]) -> ByteStream {
    // SAFETY: leaked block storage, 'static data, no release callbacks.
    unsafe { ByteStream::from_raw_parts(leak_block(), None, data.as_ptr(), data.len(), None) }
        .unwrap()
}

fn read_all(stream: &mut ByteStream, chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        match stream.read(&mut buf) {
            Ok(n) => {
                assert!(n > 0, "a successful read must produce bytes");
                out.extend_from_slice(&buf[..n]);
            }
            Err(Error::Eof) => return out,
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
}

#[test]
fn linear_full_read_in_ten_byte_chunks() {
    let mut stream = linear(ALPHABET);
    let mut chunk = [0u8; 10];
    let mut sizes = Vec::new();
    let mut collected = Vec::new();

    loop {
        match stream.read(&mut chunk) {
            Ok(n) => {
                sizes.push(n);
                collected.extend_from_slice(&chunk[..n]);
            }
            Err(Error::Eof) => break,
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    assert_eq!(sizes, [10, 10, 10, 10, 10, 10, 2]);
    assert_eq!(collected, ALPHABET);
}

#[test]
fn clone_with_offset_one_thousand() {
    static HUNDRED_AS: [u8; 100] = [b'A'; 100];
    let stream = linear(&HUNDRED_AS);

    let mut clone = stream.clone_at(1000).unwrap();
    assert_eq!(clone.position(), Ok(1000));
    assert_eq!(clone.set_position(1010), Ok(()));
    assert_eq!(clone.set_position(999), Err(Error::IllegalArgument));
    // The end position is addressable for EOF readback.
    assert_eq!(clone.set_position(1100), Ok(()));
    let mut buf = [0u8; 1];
    assert_eq!(clone.read(&mut buf), Err(Error::Eof));
}

#[test]
fn release_and_reset() {
    let mut stream = linear(b"0123456789ABCDEFGHIJ");
    let mut buf = [0u8; 10];
    assert_eq!(stream.read(&mut buf), Ok(10));

    stream.release(4).unwrap();
    stream.reset().unwrap();
    assert_eq!(stream.position(), Ok(5));

    let mut rest = [0u8; 15];
    assert_eq!(stream.read(&mut rest), Ok(15));
    assert_eq!(&rest, b"56789ABCDEFGHIJ");

    assert_eq!(stream.set_position(3), Err(Error::NoSuchElement));
}

#[test]
fn concat_three_streams() {
    let a = linear(b"0123456789");
    let b = linear(b"ABCDEFGHIJKLMNOPQRSTUVWXYZ");
    let c = linear(b"abcdefghijklmnopqrstuvwxyz");

    // SAFETY: leaked chain storage, no release callbacks.
    let ab = unsafe { a.concat(&b, leak_chain(), None) }.unwrap();
    let mut abc = unsafe { ab.concat(&c, leak_chain(), None) }.unwrap();

    // Disposing the sources must not disturb the composite.
    drop(ab);
    drop(b);
    drop(c);

    assert_eq!(abc.remaining_size(), Ok(62));
    assert_eq!(read_all(&mut abc, 10), ALPHABET);
}

#[test]
fn composite_equivalence_for_any_chunk_size() {
    for chunk in [1, 3, 7, 10, 61, 62, 100] {
        let a = linear(b"0123456789");
        let b = linear(b"ABCDEFGHIJKLMNOPQRSTUVWXYZ");
        let c = linear(b"abcdefghijklmnopqrstuvwxyz");
        // SAFETY: as above.
        let ab = unsafe { a.concat(&b, leak_chain(), None) }.unwrap();
        let mut abc = unsafe { ab.concat(&c, leak_chain(), None) }.unwrap();

        assert_eq!(read_all(&mut abc, chunk), ALPHABET, "chunk size {chunk}");
    }
}

#[test]
fn concat_out_of_memory_leaves_sources_unchanged() {
    let mut a = linear(b"0123456789");
    let b = linear(b"ABCDEFGHIJKLMNOPQRSTUVWXYZ");
    let mut buf = [0u8; 4];
    a.read(&mut buf).unwrap();

    // SAFETY: the null check fires before any storage is touched.
    let result = unsafe { a.concat(&b, core::ptr::null_mut(), None) };
    assert_eq!(result.err(), Some(Error::OutOfMemory));

    assert_eq!(a.position(), Ok(4));
    assert_eq!(b.position(), Ok(0));
    assert_eq!(read_all(&mut a, 10), b"456789");
}

#[test]
fn refcounts_conserve_across_clone_and_dispose() {
    static A_MEDIA: AtomicUsize = AtomicUsize::new(0);
    static A_BLOCK: AtomicUsize = AtomicUsize::new(0);
    static B_MEDIA: AtomicUsize = AtomicUsize::new(0);
    static B_BLOCK: AtomicUsize = AtomicUsize::new(0);
    static CHAIN: AtomicUsize = AtomicUsize::new(0);

    unsafe fn a_media(_: *mut ()) {
        A_MEDIA.fetch_add(1, Ordering::SeqCst);
    }
    unsafe fn a_block(_: *mut ()) {
        A_BLOCK.fetch_add(1, Ordering::SeqCst);
    }
    unsafe fn b_media(_: *mut ()) {
        B_MEDIA.fetch_add(1, Ordering::SeqCst);
    }
    unsafe fn b_block(_: *mut ()) {
        B_BLOCK.fetch_add(1, Ordering::SeqCst);
    }
    unsafe fn chain_storage(_: *mut ()) {
        CHAIN.fetch_add(1, Ordering::SeqCst);
    }

    // SAFETY: leaked storage everywhere; the callbacks only count.
    let a = unsafe {
        ByteStream::from_raw_parts(
            leak_block(),
            Some(a_block),
            b"0123456789".as_ptr(),
            10,
            Some(a_media),
        )
    }
    .unwrap();
    // SAFETY: as above.
    let b = unsafe {
        ByteStream::from_raw_parts(
            leak_block(),
            Some(b_block),
            b"abcdefghij".as_ptr(),
            10,
            Some(b_media),
        )
    }
    .unwrap();

    // SAFETY: as above.
    let ab = unsafe { a.concat(&b, leak_chain(), Some(chain_storage)) }.unwrap();
    let sibling = ab.clone_at(500).unwrap();

    // The composite holds its own clones of both operands.
    drop(a);
    drop(b);
    assert_eq!(A_MEDIA.load(Ordering::SeqCst), 0);
    assert_eq!(B_MEDIA.load(Ordering::SeqCst), 0);

    let mut sibling = sibling;
    assert_eq!(read_all(&mut sibling, 7), b"0123456789abcdefghij");
    drop(sibling);
    assert_eq!(CHAIN.load(Ordering::SeqCst), 0);

    drop(ab);
    // Every callback ran exactly once.
    assert_eq!(A_MEDIA.load(Ordering::SeqCst), 1);
    assert_eq!(A_BLOCK.load(Ordering::SeqCst), 1);
    assert_eq!(B_MEDIA.load(Ordering::SeqCst), 1);
    assert_eq!(B_BLOCK.load(Ordering::SeqCst), 1);
    assert_eq!(CHAIN.load(Ordering::SeqCst), 1);
}

#[test]
fn set_position_is_idempotent() {
    let a = linear(b"0123456789");
    let b = linear(b"abcdefghij");
    // SAFETY: as above.
    let mut ab = unsafe { a.concat(&b, leak_chain(), None) }.unwrap();

    let mut first = [0u8; 6];
    ab.set_position(8).unwrap();
    ab.set_position(8).unwrap();
    ab.read(&mut first).unwrap();

    let mut second = [0u8; 6];
    ab.set_position(8).unwrap();
    ab.read(&mut second).unwrap();

    assert_eq!(first, second);
}

#[test]
fn released_bytes_never_come_back() {
    let mut stream = linear(ALPHABET);
    let mut buf = [0u8; 30];
    stream.read(&mut buf).unwrap();
    stream.release(19).unwrap();

    for position in [0, 5, 19] {
        assert_eq!(stream.set_position(position), Err(Error::NoSuchElement));
    }
    stream.reset().unwrap();
    assert_eq!(stream.position(), Ok(20));
    assert_eq!(read_all(&mut stream, 64), &ALPHABET[20..]);
}

#[test]
fn composite_window_invariant_under_mixed_operations() {
    let a = linear(b"0123456789");
    let b = linear(b"abcdefghij");
    // SAFETY: as above.
    let mut ab = unsafe { a.concat(&b, leak_chain(), None) }.unwrap();

    let mut buf = [0u8; 6];
    ab.read(&mut buf).unwrap();
    ab.release(2).unwrap();
    ab.set_position(12).unwrap();
    let clone = ab.clone_at(40).unwrap();
    ab.reset().unwrap();

    // first_valid <= current <= end, in logical terms, on both cursors.
    assert_eq!(ab.position(), Ok(3));
    assert_eq!(ab.remaining_size(), Ok(17));
    assert_eq!(clone.position(), Ok(40));
    assert_eq!(clone.remaining_size(), Ok(8));

    let mut clone = clone;
    assert_eq!(read_all(&mut clone, 3), b"cdefghij");
    assert_eq!(read_all(&mut ab, 20), b"3456789abcdefghij");
}
