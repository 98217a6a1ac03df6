//! Notification descriptors waking `poll_wait` callers.
//!
//! `eventfd` where available, a named FIFO elsewhere. Peers exchange these
//! descriptors over the control socket, so both sides of a queue pair can
//! signal each other with a single write.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{NaError, Result};

#[cfg(not(any(target_os = "linux", target_os = "android")))]
use super::SHM_PREFIX;

/// FIFO path for the fallback notification channel of one queue pair.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn fifo_path(uri: &str, pair_idx: u8, dir: char) -> String {
    format!("/tmp/{SHM_PREFIX}-{uri}/fifo-{pair_idx}-{dir}")
}

/// One signalable, pollable descriptor.
pub(crate) struct Notifier {
    fd: OwnedFd,
    /// Backing FIFO to unlink at teardown, if this side created one.
    fifo_path: Option<String>,
}

impl Notifier {
    /// Create a notifier for the queue pair `pair_idx` of peer `uri`.
    ///
    /// The `uri`/`pair_idx`/`dir` naming only matters for the FIFO fallback;
    /// `eventfd` descriptors are anonymous. Semaphore semantics are
    /// required: one wakeup is consumed per acknowledgment, so queued
    /// messages each get their own progress pass.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) fn create(_uri: &str, _pair_idx: u8, _dir: char) -> Result<Self> {
        // SAFETY: FFI, no preconditions.
        let fd = unsafe {
            libc::eventfd(
                0,
                libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE,
            )
        };
        if fd < 0 {
            return Err(NaError::last_os_error());
        }
        Ok(Self {
            // SAFETY: `eventfd` returned a fresh descriptor we now own.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            fifo_path: None,
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(crate) fn create(uri: &str, pair_idx: u8, dir: char) -> Result<Self> {
        Self::create_fifo_at(fifo_path(uri, pair_idx, dir))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn create_fifo_at(path: String) -> Result<Self> {
        use std::ffi::CString;

        let c_path = CString::new(path.clone()).map_err(|_| NaError::InvalidArg)?;
        // SAFETY: FFI with a valid NUL-terminated path.
        if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(NaError::from(&err));
            }
        }
        // SAFETY: FFI; O_RDWR keeps the FIFO open without a peer.
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(NaError::last_os_error());
        }
        Ok(Self {
            // SAFETY: `open` returned a fresh descriptor we now own.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            fifo_path: Some(path),
        })
    }

    /// Create an unnamed local notifier (endpoint-local tx/rx signaling).
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) fn anonymous() -> Result<Self> {
        Self::create("", 0, 'l')
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(crate) fn anonymous() -> Result<Self> {
        use std::sync::atomic::{AtomicU32, Ordering};

        static SEQ: AtomicU32 = AtomicU32::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let path = format!(
            "/tmp/{SHM_PREFIX}-local-{}-{seq}",
            std::process::id()
        );
        Self::create_fifo_at(path)
    }

    /// Wrap a descriptor received over the control socket.
    pub(crate) fn from_received(fd: OwnedFd) -> Self {
        Self {
            fd,
            fifo_path: None,
        }
    }

    /// Wake whoever polls this descriptor.
    pub(crate) fn signal(&self) -> Result<()> {
        let mut file = self.file();
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let buf = 1u64.to_ne_bytes();
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let buf = [1u8];

        match file.write(&buf) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Saturated counter/FIFO still wakes the poller.
                Ok(())
            }
            Err(err) => Err(NaError::from(&err)),
        }
    }

    /// Consume one pending notification; `Ok(false)` when none was pending.
    ///
    /// Consumes exactly one signal (eventfd semaphore read / one FIFO
    /// byte); remaining signals keep the descriptor readable.
    pub(crate) fn ack(&self) -> Result<bool> {
        let mut file = self.file();
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let mut buf = [0u8; 8];
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let mut buf = [0u8; 1];
        match file.read(&mut buf) {
            Ok(n) => Ok(n > 0),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(NaError::from(&err)),
        }
    }

    /// Borrow the descriptor as a `File` without taking ownership.
    fn file(&self) -> std::mem::ManuallyDrop<File> {
        // SAFETY: the raw fd stays owned by `self`; ManuallyDrop prevents a
        // double close.
        std::mem::ManuallyDrop::new(unsafe { File::from_raw_fd(self.fd.as_raw_fd()) })
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if let Some(path) = &self.fifo_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_ack_roundtrip() {
        let notifier = Notifier::create("test", 0, 't').unwrap();
        assert!(!notifier.ack().unwrap());
        notifier.signal().unwrap();
        notifier.signal().unwrap();
        // Semaphore semantics: one acknowledgment per signal.
        assert!(notifier.ack().unwrap());
        assert!(notifier.ack().unwrap());
        assert!(!notifier.ack().unwrap());
    }
}
