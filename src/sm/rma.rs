//! One-sided transfers over cross-process vector I/O.
//!
//! There is no wire state: a `put` or `get` translates both scatter/gather
//! lists against the requested offset/length window and hands them to the
//! OS (`process_vm_readv`/`process_vm_writev` on Linux, `mach_vm_*` on
//! macOS). The peer's PID is all that is needed; its address does not have
//! to be resolved.

use std::sync::Arc;

use crate::addr::Addr;
use crate::context::Context;
use crate::error::{NaError, Result};
use crate::mem::{MemAccess, MemHandle, Segment};
use crate::op::{Callback, OpId, OpKind};

use super::addr::{SmAddr, SmAddrRef};
use super::endpoint::SmEndpoint;
use super::op::{SmOp, OP_COMPLETED};
use super::IOV_STATIC_MAX;

/// Scatter/gather list with inline storage for small registrations.
enum SegList {
    Inline {
        segs: [Segment; IOV_STATIC_MAX],
        count: usize,
    },
    Heap(Vec<Segment>),
}

impl SegList {
    fn from_slice(segments: &[Segment]) -> Self {
        if segments.len() <= IOV_STATIC_MAX {
            let mut segs = [Segment { base: 0, len: 0 }; IOV_STATIC_MAX];
            segs[..segments.len()].copy_from_slice(segments);
            SegList::Inline {
                segs,
                count: segments.len(),
            }
        } else {
            SegList::Heap(segments.to_vec())
        }
    }

    fn as_slice(&self) -> &[Segment] {
        match self {
            SegList::Inline { segs, count } => &segs[..*count],
            SegList::Heap(segs) => segs,
        }
    }
}

/// Shared-memory registration descriptor.
///
/// Serializable to a little-endian byte form for transmission to a peer;
/// the deserialized copy describes the same memory as a remote area.
pub(crate) struct SmMemHandle {
    segments: SegList,
    len: u64,
    access: MemAccess,
}

impl SmMemHandle {
    pub(crate) fn from_buffer(base: *const u8, len: usize, access: MemAccess) -> Self {
        Self {
            segments: SegList::from_slice(&[Segment {
                base: base as u64,
                len: len as u64,
            }]),
            len: len as u64,
            access,
        }
    }

    pub(crate) fn from_segments(segments: &[Segment], access: MemAccess) -> Self {
        Self {
            segments: SegList::from_slice(segments),
            len: segments.iter().map(|s| s.len).sum(),
            access,
        }
    }

    pub(crate) fn iov_count(&self) -> usize {
        self.segments.as_slice().len()
    }

    pub(crate) fn serialize_size(&self) -> usize {
        8 + 8 + 1 + 16 * self.iov_count()
    }

    /// Encode as `{count:u64, len:u64, access:u8, (base:u64, len:u64)*}`,
    /// all little-endian.
    pub(crate) fn serialize(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < self.serialize_size() {
            return Err(NaError::Overflow);
        }
        buf[0..8].copy_from_slice(&(self.iov_count() as u64).to_le_bytes());
        buf[8..16].copy_from_slice(&self.len.to_le_bytes());
        buf[16] = self.access.to_u8();
        let mut pos = 17;
        for seg in self.segments.as_slice() {
            buf[pos..pos + 8].copy_from_slice(&seg.base.to_le_bytes());
            buf[pos + 8..pos + 16].copy_from_slice(&seg.len.to_le_bytes());
            pos += 16;
        }
        Ok(())
    }

    pub(crate) fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 17 {
            return Err(NaError::InvalidArg);
        }
        let count = u64::from_le_bytes(bytes[0..8].try_into().expect("sliced")) as usize;
        let len = u64::from_le_bytes(bytes[8..16].try_into().expect("sliced"));
        let access = MemAccess::from_u8(bytes[16]).ok_or(NaError::InvalidArg)?;
        if bytes.len() < 17 + 16 * count {
            return Err(NaError::InvalidArg);
        }
        let mut segments = Vec::with_capacity(count);
        let mut pos = 17;
        for _ in 0..count {
            segments.push(Segment {
                base: u64::from_le_bytes(bytes[pos..pos + 8].try_into().expect("sliced")),
                len: u64::from_le_bytes(bytes[pos + 8..pos + 16].try_into().expect("sliced")),
            });
            pos += 16;
        }
        Ok(Self {
            segments: SegList::from_slice(&segments),
            len,
            access,
        })
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        self.segments.as_slice()
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }
}

/// Maximum scatter/gather entries accepted per registration.
pub(crate) fn iov_max() -> usize {
    #[cfg(all(target_os = "linux", feature = "cma"))]
    {
        // SAFETY: FFI, no side effects.
        let ret = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
        if ret > 0 {
            return ret as usize;
        }
        IOV_STATIC_MAX
    }
    #[cfg(not(all(target_os = "linux", feature = "cma")))]
    {
        1
    }
}

/// Translated iovec list, inline when it fits.
enum TransIov {
    Inline {
        iov: [libc::iovec; IOV_STATIC_MAX],
        count: usize,
    },
    Heap(Vec<libc::iovec>),
}

impl TransIov {
    fn with_capacity(count: usize) -> Self {
        if count <= IOV_STATIC_MAX {
            TransIov::Inline {
                iov: [libc::iovec {
                    iov_base: std::ptr::null_mut(),
                    iov_len: 0,
                }; IOV_STATIC_MAX],
                count: 0,
            }
        } else {
            TransIov::Heap(Vec::with_capacity(count))
        }
    }

    fn push(&mut self, entry: libc::iovec) {
        match self {
            TransIov::Inline { iov, count } => {
                iov[*count] = entry;
                *count += 1;
            }
            TransIov::Heap(vec) => vec.push(entry),
        }
    }

    fn as_slice(&self) -> &[libc::iovec] {
        match self {
            TransIov::Inline { iov, count } => &iov[..*count],
            TransIov::Heap(vec) => vec,
        }
    }
}

/// Locate the segment and in-segment offset covering `offset`.
fn iov_index_offset(segments: &[Segment], offset: u64) -> (usize, u64) {
    let mut remaining = offset;
    for (index, seg) in segments.iter().enumerate() {
        if remaining < seg.len {
            return (index, remaining);
        }
        remaining -= seg.len;
    }
    (segments.len().saturating_sub(1), remaining)
}

/// Number of segments needed to cover `length` from the given start.
fn iov_count(segments: &[Segment], start_index: usize, start_offset: u64, length: u64) -> usize {
    let mut remaining = length.saturating_sub(
        length.min(segments[start_index].len - start_offset),
    );
    let mut count = 1;
    for seg in &segments[start_index + 1..] {
        if remaining == 0 {
            break;
        }
        remaining -= remaining.min(seg.len);
        count += 1;
    }
    count
}

/// Build the iovec list covering `(offset, length)` over `segments`.
fn iov_translate(segments: &[Segment], offset: u64, length: u64) -> TransIov {
    let (start_index, start_offset) = iov_index_offset(segments, offset);
    let count = iov_count(segments, start_index, start_offset, length);
    let mut out = TransIov::with_capacity(count);

    let first = &segments[start_index];
    let first_len = length.min(first.len - start_offset);
    out.push(libc::iovec {
        iov_base: (first.base + start_offset) as *mut libc::c_void,
        iov_len: first_len as usize,
    });

    let mut remaining = length - first_len;
    for seg in &segments[start_index + 1..] {
        if remaining == 0 {
            break;
        }
        let seg_len = remaining.min(seg.len);
        out.push(libc::iovec {
            iov_base: seg.base as *mut libc::c_void,
            iov_len: seg_len as usize,
        });
        remaining -= seg_len;
    }
    out
}

/// Submit a one-sided transfer.
#[allow(clippy::too_many_arguments)]
pub(crate) fn rma(
    endpoint: &Arc<SmEndpoint>,
    ctx: &Context,
    kind: OpKind,
    cb: Callback,
    local: &MemHandle,
    local_offset: u64,
    remote: &MemHandle,
    remote_offset: u64,
    length: u64,
    addr: &Addr,
    op: &OpId,
) -> Result<()> {
    let local_handle = local.downcast::<SmMemHandle>().ok_or(NaError::InvalidArg)?;
    let remote_handle = remote.downcast::<SmMemHandle>().ok_or(NaError::InvalidArg)?;
    let sm_op = op.downcast_arc::<SmOp>().ok_or(NaError::InvalidArg)?;
    let sm_addr = addr.downcast_arc::<SmAddr>().ok_or(NaError::InvalidArg)?;

    match remote_handle.access {
        MemAccess::ReadOnly if kind == OpKind::Put => {
            log::error!("remote memory requires write permission");
            return Err(NaError::Permission);
        }
        MemAccess::WriteOnly if kind == OpKind::Get => {
            log::error!("remote memory requires read permission");
            return Err(NaError::Permission);
        }
        _ => {}
    }

    if local_offset + length > local_handle.len() || remote_offset + length > remote_handle.len() {
        return Err(NaError::InvalidArg);
    }

    if sm_op.status() & OP_COMPLETED == 0 {
        log::error!("attempting to reuse an operation that has not completed");
        return Err(NaError::Busy);
    }
    sm_op.reset(kind, ctx, cb, Some(SmAddrRef::new(&sm_addr)));

    let local_iov = iov_translate(local_handle.segments(), local_offset, length);
    let remote_iov = iov_translate(remote_handle.segments(), remote_offset, length);

    let ret = match kind {
        OpKind::Put => {
            process_vm_write(sm_addr.key.pid, local_iov.as_slice(), remote_iov.as_slice(), length)
        }
        OpKind::Get => {
            process_vm_read(sm_addr.key.pid, local_iov.as_slice(), remote_iov.as_slice(), length)
        }
        _ => Err(NaError::InvalidArg),
    };

    match ret {
        Ok(()) => {
            // One-sided transfers have no wire state: the syscall returning
            // is the completion.
            endpoint.complete_inline(&sm_op, Ok(()));
            Ok(())
        }
        Err(err) => {
            sm_op.release();
            Err(err)
        }
    }
}

#[cfg(all(target_os = "linux", feature = "cma"))]
fn ptrace_scope_restricted() -> bool {
    std::fs::read_to_string("/proc/sys/kernel/yama/ptrace_scope")
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .is_some_and(|v| v != 0)
}

#[cfg(all(target_os = "linux", feature = "cma"))]
fn rma_os_error(what: &str) -> NaError {
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EPERM) && ptrace_scope_restricted() {
        log::error!(
            "{what} failed ({err}): the kernel Yama configuration does not allow \
             cross-memory attach; either run as root:\n\
             # /usr/sbin/sysctl kernel.yama.ptrace_scope=0\n\
             or, if set to restricted, add the following call to your application:\n\
             prctl(PR_SET_PTRACER, PR_SET_PTRACER_ANY, 0, 0, 0);\n\
             See https://www.kernel.org/doc/Documentation/security/Yama.txt for details"
        );
        return NaError::Permission;
    }
    log::error!("{what} failed: {err}");
    NaError::from(&err)
}

#[cfg(all(target_os = "linux", feature = "cma"))]
fn process_vm_write(
    pid: i32,
    local: &[libc::iovec],
    remote: &[libc::iovec],
    length: u64,
) -> Result<()> {
    // SAFETY: FFI; the iovec lists describe registered caller memory.
    let written = unsafe {
        libc::process_vm_writev(
            pid,
            local.as_ptr(),
            local.len() as libc::c_ulong,
            remote.as_ptr(),
            remote.len() as libc::c_ulong,
            0,
        )
    };
    if written < 0 {
        return Err(rma_os_error("process_vm_writev()"));
    }
    if written as u64 != length {
        log::error!("wrote {written} bytes, was expecting {length}");
        return Err(NaError::MsgSize);
    }
    Ok(())
}

#[cfg(all(target_os = "linux", feature = "cma"))]
fn process_vm_read(
    pid: i32,
    local: &[libc::iovec],
    remote: &[libc::iovec],
    length: u64,
) -> Result<()> {
    // SAFETY: FFI; the iovec lists describe registered caller memory.
    let read = unsafe {
        libc::process_vm_readv(
            pid,
            local.as_ptr(),
            local.len() as libc::c_ulong,
            remote.as_ptr(),
            remote.len() as libc::c_ulong,
            0,
        )
    };
    if read < 0 {
        return Err(rma_os_error("process_vm_readv()"));
    }
    if read as u64 != length {
        log::error!("read {read} bytes, was expecting {length}");
        return Err(NaError::MsgSize);
    }
    Ok(())
}

#[cfg(target_os = "macos")]
mod mach {
    extern "C" {
        pub(super) static mach_task_self_: libc::mach_port_t;

        pub(super) fn task_for_pid(
            target: libc::mach_port_t,
            pid: libc::pid_t,
            task: *mut libc::mach_port_t,
        ) -> libc::c_int;

        pub(super) fn mach_vm_write(
            task: libc::mach_port_t,
            address: u64,
            data: usize,
            count: u32,
        ) -> libc::c_int;

        pub(super) fn mach_vm_read_overwrite(
            task: libc::mach_port_t,
            address: u64,
            size: u64,
            data: u64,
            out_size: *mut u64,
        ) -> libc::c_int;
    }
}

#[cfg(target_os = "macos")]
fn mach_remote_task(pid: i32) -> Result<libc::mach_port_t> {
    let mut task: libc::mach_port_t = 0;
    // SAFETY: FFI; requires the task-for-pid entitlement.
    let kret = unsafe { mach::task_for_pid(mach::mach_task_self_, pid, &mut task) };
    if kret != 0 {
        log::error!(
            "task_for_pid() failed ({kret}): permission must be granted to access remote \
             memory, please refer to the documentation for instructions"
        );
        return Err(NaError::Permission);
    }
    Ok(task)
}

#[cfg(target_os = "macos")]
fn process_vm_write(
    pid: i32,
    local: &[libc::iovec],
    remote: &[libc::iovec],
    length: u64,
) -> Result<()> {
    if local.len() > 1 || remote.len() > 1 {
        log::error!("non-contiguous transfers are not supported on this platform");
        return Err(NaError::OpNotSupported);
    }
    let task = mach_remote_task(pid)?;
    // SAFETY: FFI; single-segment transfer of `length` bytes.
    let kret = unsafe {
        mach::mach_vm_write(
            task,
            remote[0].iov_base as u64,
            local[0].iov_base as usize,
            length as u32,
        )
    };
    if kret != 0 {
        log::error!("mach_vm_write() failed ({kret})");
        return Err(NaError::ProtocolError);
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn process_vm_read(
    pid: i32,
    local: &[libc::iovec],
    remote: &[libc::iovec],
    length: u64,
) -> Result<()> {
    if local.len() > 1 || remote.len() > 1 {
        log::error!("non-contiguous transfers are not supported on this platform");
        return Err(NaError::OpNotSupported);
    }
    let task = mach_remote_task(pid)?;
    let mut out_size = 0u64;
    // SAFETY: FFI; single-segment transfer of `length` bytes.
    let kret = unsafe {
        mach::mach_vm_read_overwrite(
            task,
            remote[0].iov_base as u64,
            length,
            local[0].iov_base as u64,
            &mut out_size,
        )
    };
    if kret != 0 || out_size != length {
        log::error!("mach_vm_read_overwrite() failed ({kret})");
        return Err(NaError::ProtocolError);
    }
    Ok(())
}

#[cfg(not(any(all(target_os = "linux", feature = "cma"), target_os = "macos")))]
fn process_vm_write(
    _pid: i32,
    _local: &[libc::iovec],
    _remote: &[libc::iovec],
    _length: u64,
) -> Result<()> {
    Err(NaError::OpNotSupported)
}

#[cfg(not(any(all(target_os = "linux", feature = "cma"), target_os = "macos")))]
fn process_vm_read(
    _pid: i32,
    _local: &[libc::iovec],
    _remote: &[libc::iovec],
    _length: u64,
) -> Result<()> {
    Err(NaError::OpNotSupported)
}
