//! Semihosting diagnostic sink.
//!
//! When the `semihosting` feature is enabled, [`sink`] can be installed with
//! [`super::set_sink`] to route diagnostic lines to semihosting stdout,
//! where QEMU or a debug probe can capture them.

use core::cell::UnsafeCell;
use cortex_m_semihosting::hio::{self, HostStream};

static STDOUT: SyncCell<Option<HostStream>> = SyncCell(UnsafeCell::new(None));

struct SyncCell<T>(UnsafeCell<T>);

// SAFETY: Access is protected by the critical section taken in `sink`.
unsafe impl<T> Sync for SyncCell<T> {}

/// Writes one diagnostic line to semihosting stdout.
pub fn sink(line: &[u8]) {
    critical_section::with(|_| {
        // SAFETY: the handle is only touched with the critical section held.
        let handle = unsafe { &mut *STDOUT.0.get() };

        // Lazily initialize stdout handle (only once, to avoid W_TRUNC on reopens).
        if handle.is_none() {
            *handle = hio::hstdout().ok();
        }

        if let Some(stdout) = handle {
            let _ = stdout.write_all(line);
        }
    });
}
