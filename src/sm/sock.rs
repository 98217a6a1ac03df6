//! Out-of-band control channel over UNIX-domain datagram sockets.
//!
//! Carries the 64-bit command header plus, on the resolve path, the tx/rx
//! notification descriptors as `SCM_RIGHTS` ancillary data. Listening
//! endpoints bind `/tmp/<prefix>-<uri>/sock`; non-listening endpoints use an
//! unbound socket purely for sending.

use std::ffi::OsStr;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::{NaError, Result};

use super::SHM_PREFIX;

/// Directory holding the control socket (and FIFO fallbacks) of `uri`.
pub(crate) fn sock_dir(uri: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/{SHM_PREFIX}-{uri}"))
}

fn sock_path(uri: &str) -> PathBuf {
    sock_dir(uri).join("sock")
}

fn sockaddr_for(path: &Path) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: sockaddr_un is plain data.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(NaError::Overflow);
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let base = mem::size_of::<libc::sockaddr_un>() - addr.sun_path.len();
    Ok((addr, (base + bytes.len() + 1) as libc::socklen_t))
}

fn set_nonblock_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: FFI on a live descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(NaError::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(NaError::last_os_error());
        }
    }
    Ok(())
}

/// Open the endpoint's control socket.
///
/// Listening endpoints create the socket directory and bind; `uri` is
/// ignored otherwise.
pub(crate) fn sock_open(uri: Option<&str>, listen: bool) -> Result<OwnedFd> {
    // SAFETY: FFI, no preconditions.
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(NaError::last_os_error());
    }
    // SAFETY: fresh descriptor owned by us.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    set_nonblock_cloexec(fd.as_raw_fd())?;

    if listen {
        let uri = uri.ok_or(NaError::InvalidArg)?;
        let dir = sock_dir(uri);
        std::fs::create_dir_all(&dir).map_err(|err| {
            log::error!("could not create socket directory {:?}: {err}", dir);
            NaError::from(&err)
        })?;
        let path = sock_path(uri);
        let (addr, len) = sockaddr_for(&path)?;
        // SAFETY: FFI with a valid sockaddr.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if ret != 0 {
            let err = NaError::last_os_error();
            log::error!("could not bind control socket {:?}: {err}", path);
            return Err(err);
        }
    }

    Ok(fd)
}

/// Remove the socket file and directory of a listening endpoint.
pub(crate) fn sock_cleanup(uri: &str) {
    let _ = std::fs::remove_file(sock_path(uri));
    let _ = std::fs::remove_dir(sock_dir(uri));
}

const FD_PAYLOAD: usize = 2 * mem::size_of::<RawFd>();

/// Cmsg buffer sized for two descriptors, correctly aligned.
#[repr(C)]
union CmsgBuf {
    buf: [u8; 64],
    _align: libc::cmsghdr,
}

/// Send a command header, optionally passing the tx/rx descriptors.
///
/// `ETOOMANYREFS` (and a transiently full socket) map to `Again` so the
/// caller can park the operation and retry from progress.
pub(crate) fn event_send(
    sock: RawFd,
    dest_uri: &str,
    cmd: u64,
    fds: Option<(RawFd, RawFd)>,
    ignore_error: bool,
) -> Result<()> {
    let (mut addr, addr_len) = sockaddr_for(&sock_path(dest_uri))?;

    let mut cmd_bytes = cmd.to_le_bytes();
    let mut iov = libc::iovec {
        iov_base: cmd_bytes.as_mut_ptr().cast(),
        iov_len: cmd_bytes.len(),
    };

    // SAFETY: msghdr is plain data.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut addr as *mut libc::sockaddr_un as *mut libc::c_void;
    msg.msg_namelen = addr_len;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let mut cmsg_buf = CmsgBuf { buf: [0; 64] };
    if let Some((tx, rx)) = fds {
        // SAFETY: the union is at least CMSG_SPACE(FD_PAYLOAD) bytes.
        unsafe {
            msg.msg_control = cmsg_buf.buf.as_mut_ptr().cast();
            msg.msg_controllen = libc::CMSG_SPACE(FD_PAYLOAD as u32) as _;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(FD_PAYLOAD as u32) as _;
            let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
            data.write_unaligned(tx);
            data.add(1).write_unaligned(rx);
        }
    }

    // SAFETY: FFI with a fully initialized msghdr.
    let sent = unsafe { libc::sendmsg(sock, &msg, 0) };
    if sent < 0 && !ignore_error {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            // In-flight descriptor budget exhausted on the receiver side.
            Some(libc::ETOOMANYREFS) => Err(NaError::Again),
            _ => Err(NaError::from(&err)),
        };
    }
    Ok(())
}

/// Receive a command header and any passed descriptors.
///
/// `Ok(None)` when nothing is pending.
pub(crate) fn event_recv(sock: RawFd) -> Result<Option<(u64, Option<OwnedFd>, Option<OwnedFd>)>> {
    let mut cmd_bytes = [0u8; 8];
    let mut iov = libc::iovec {
        iov_base: cmd_bytes.as_mut_ptr().cast(),
        iov_len: cmd_bytes.len(),
    };

    // SAFETY: msghdr is plain data.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let mut cmsg_buf = CmsgBuf { buf: [0; 64] };
    // SAFETY: the union provides an aligned control buffer.
    unsafe {
        msg.msg_control = cmsg_buf.buf.as_mut_ptr().cast();
        msg.msg_controllen = libc::CMSG_SPACE(FD_PAYLOAD as u32) as _;
    }

    // SAFETY: FFI with a fully initialized msghdr.
    let received = unsafe { libc::recvmsg(sock, &mut msg, 0) };
    if received < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(None);
        }
        return Err(NaError::from(&err));
    }

    let cmd = u64::from_le_bytes(cmd_bytes);

    let mut tx = None;
    let mut rx = None;
    // SAFETY: cmsg traversal over the control buffer filled by recvmsg.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if !cmsg.is_null()
            && (*cmsg).cmsg_level == libc::SOL_SOCKET
            && (*cmsg).cmsg_type == libc::SCM_RIGHTS
        {
            let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
            let tx_fd = data.read_unaligned();
            let rx_fd = data.add(1).read_unaligned();
            if tx_fd >= 0 {
                tx = Some(OwnedFd::from_raw_fd(tx_fd));
            }
            if rx_fd >= 0 {
                rx = Some(OwnedFd::from_raw_fd(rx_fd));
            }
        }
    }

    Ok(Some((cmd, tx, rx)))
}

/// Whether a path component belongs to this plugin's namespace.
pub(crate) fn has_prefix(name: &OsStr) -> bool {
    name.as_bytes().starts_with(SHM_PREFIX.as_bytes())
        && name.as_bytes().get(SHM_PREFIX.len()) == Some(&b'-')
}
