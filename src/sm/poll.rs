//! Poll set over notification descriptors and the control socket.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{NaError, Result};

/// One readiness event; `token` identifies the registered source.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub(crate) token: u64,
}

/// Thin epoll/kqueue wrapper.
///
/// The poll-set descriptor itself is pollable, which is what
/// `poll_get_fd` hands to external event loops.
pub(crate) struct Poller {
    fd: OwnedFd,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Poller {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: FFI, no preconditions.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(NaError::last_os_error());
        }
        Ok(Self {
            // SAFETY: fresh descriptor owned by us.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: u64) -> Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        // SAFETY: FFI on live descriptors.
        let ret = unsafe {
            libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if ret != 0 {
            return Err(NaError::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> Result<()> {
        // SAFETY: FFI on live descriptors; the event argument is ignored
        // for EPOLL_CTL_DEL on modern kernels.
        let ret = unsafe {
            libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret != 0 {
            return Err(NaError::last_os_error());
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` for events; 0 polls, -1 blocks forever.
    ///
    /// An interrupted wait reports no events rather than an error.
    pub(crate) fn wait(
        &self,
        events: &mut Vec<PollEvent>,
        max_events: usize,
        timeout_ms: i32,
    ) -> Result<()> {
        events.clear();
        let mut raw: [libc::epoll_event; 64] = [libc::epoll_event { events: 0, u64: 0 }; 64];
        let max = max_events.min(raw.len()) as i32;

        // SAFETY: FFI; `raw` provides `max` writable event slots.
        let n = unsafe { libc::epoll_wait(self.fd.as_raw_fd(), raw.as_mut_ptr(), max, timeout_ms) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(NaError::from(&err));
        }
        for event in raw.iter().take(n as usize) {
            events.push(PollEvent { token: event.u64 });
        }
        Ok(())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Poller {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: FFI, no preconditions.
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(NaError::last_os_error());
        }
        Ok(Self {
            // SAFETY: fresh descriptor owned by us.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn change(&self, fd: RawFd, flags: u16, token: u64) -> Result<()> {
        let changes = [libc::kevent {
            ident: fd as usize,
            filter: libc::EVFILT_READ,
            flags,
            fflags: 0,
            data: 0,
            udata: token as *mut libc::c_void,
        }];
        // SAFETY: FFI with a valid changelist.
        let ret = unsafe {
            libc::kevent(
                self.fd.as_raw_fd(),
                changes.as_ptr(),
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if ret < 0 {
            return Err(NaError::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn register(&self, fd: RawFd, token: u64) -> Result<()> {
        self.change(fd, libc::EV_ADD, token)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> Result<()> {
        self.change(fd, libc::EV_DELETE, 0)
    }

    pub(crate) fn wait(
        &self,
        events: &mut Vec<PollEvent>,
        max_events: usize,
        timeout_ms: i32,
    ) -> Result<()> {
        events.clear();
        let mut raw: [libc::kevent; 64] = unsafe { std::mem::zeroed() };
        let max = max_events.min(raw.len()) as i32;

        let timeout = libc::timespec {
            tv_sec: libc::time_t::from(timeout_ms.max(0)) / 1000,
            tv_nsec: i64::from(timeout_ms.max(0) % 1000) * 1_000_000,
        };
        let timeout_ptr = if timeout_ms < 0 {
            std::ptr::null()
        } else {
            &timeout as *const libc::timespec
        };

        // SAFETY: FFI; `raw` provides `max` writable event slots.
        let n = unsafe {
            libc::kevent(
                self.fd.as_raw_fd(),
                std::ptr::null(),
                0,
                raw.as_mut_ptr(),
                max,
                timeout_ptr,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(NaError::from(&err));
        }
        for event in raw.iter().take(n as usize) {
            events.push(PollEvent {
                token: event.udata as u64,
            });
        }
        Ok(())
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::event::Notifier;

    #[test]
    fn test_poller_wakeup() {
        let poller = Poller::new().unwrap();
        let notifier = Notifier::create("poll-test", 0, 't').unwrap();
        poller.register(notifier.as_raw_fd(), 7).unwrap();

        let mut events = Vec::new();
        poller.wait(&mut events, 16, 0).unwrap();
        assert!(events.is_empty());

        notifier.signal().unwrap();
        poller.wait(&mut events, 16, 1000).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 7);

        assert!(notifier.ack().unwrap());
        poller.deregister(notifier.as_raw_fd()).unwrap();
    }
}
