//! Shared-memory (SM) transport plugin.
//!
//! A complete in-node transport: POSIX shared-memory regions carry lock-free
//! message rings and copy buffers, UNIX-domain sockets pass notification
//! descriptors out of band, and one-sided transfers go through cross-process
//! vector I/O. Single-host only by design.

pub(crate) mod addr;
pub(crate) mod endpoint;
pub(crate) mod event;
pub(crate) mod hostid;
pub(crate) mod op;
pub(crate) mod poll;
pub(crate) mod region;
pub(crate) mod ring;
pub(crate) mod rma;
pub(crate) mod sock;

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::addr::Addr;
use crate::context::Context;
use crate::error::{NaError, Result};
use crate::info::{InitInfo, NaInfo, ProtocolInfo, NA_NO_BLOCK};
use crate::mem::{MemAccess, MemHandle, Segment};
use crate::op::{Callback, OpId, OpKind, Tag};
use crate::plugin::{Plugin, PluginClass, PluginContext};

use self::endpoint::SmEndpoint;
use self::op::SmOp;
use self::poll::PollEvent;
use self::rma::SmMemHandle;

/// Copy-buffer (and therefore message) size.
pub(crate) const COPY_BUF_SIZE: usize = crate::util::mem::PAGE_SIZE;

/// Number of copy buffers per region, reserved through one 64-bit bitmap.
pub(crate) const NUM_BUFS: usize = 64;

/// Message-ring capacity per direction of a queue pair.
pub(crate) const MSG_RING_SIZE: usize = NUM_BUFS;

/// Maximum peers attached to one region.
pub(crate) const MAX_PEERS: usize = 256;

/// Command-ring capacity; twice the peer count to tolerate attach/detach
/// bursts.
pub(crate) const CMD_RING_SIZE: usize = MAX_PEERS * 2;

/// Scatter/gather entries stored inline in a memory handle.
pub(crate) const IOV_STATIC_MAX: usize = 8;

/// Events processed per blocking progress pass.
pub(crate) const MAX_EVENTS: usize = 16;

/// Filesystem prefix for regions, socket directories and cache files.
pub(crate) const SHM_PREFIX: &str = "naos";

/// Default maximum unexpected-message payload.
pub const MAX_UNEXPECTED_SIZE: usize = COPY_BUF_SIZE;

/// Default maximum expected-message payload.
pub const MAX_EXPECTED_SIZE: usize = MAX_UNEXPECTED_SIZE;

/// Plugin-private context state: scratch buffer for poll events.
pub(crate) struct SmContext {
    pub(crate) events: Mutex<Vec<PollEvent>>,
}

impl PluginContext for SmContext {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Static plugin-table entry for the shared-memory transport.
pub(crate) struct SmPlugin;

pub(crate) static SM_PLUGIN: SmPlugin = SmPlugin;

impl Plugin for SmPlugin {
    fn name(&self) -> &'static str {
        "na"
    }

    fn check_protocol(&self, protocol_name: &str) -> bool {
        protocol_name == "sm"
    }

    fn protocol_info(&self, filter: Option<&NaInfo>) -> Result<Vec<ProtocolInfo>> {
        if let Some(filter) = filter {
            if filter.protocol_name != "sm" {
                return Ok(Vec::new());
            }
        }
        Ok(vec![ProtocolInfo {
            class_name: "na".to_owned(),
            protocol_name: "sm".to_owned(),
            device_name: "shm".to_owned(),
        }])
    }

    fn initialize(
        &self,
        info: &NaInfo,
        listen: bool,
        init_info: &InitInfo,
    ) -> Result<Box<dyn PluginClass>> {
        // SAFETY: rlimit is plain data filled by the call.
        let rlimit = unsafe {
            let mut rlimit: libc::rlimit = std::mem::zeroed();
            if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlimit) != 0 {
                return Err(NaError::last_os_error());
            }
            rlimit
        };
        log::debug!("RLIMIT_NOFILE is {}, max {}", rlimit.rlim_cur, rlimit.rlim_max);

        let no_block = init_info.progress_mode & NA_NO_BLOCK != 0;
        let endpoint = SmEndpoint::open(
            info.host_name.as_deref(),
            listen,
            no_block,
            rlimit.rlim_cur.min(u32::MAX as u64) as u32,
        )?;

        Ok(Box::new(SmClass {
            endpoint,
            iov_max: rma::iov_max(),
            max_unexpected: init_info
                .max_unexpected_size
                .unwrap_or(MAX_UNEXPECTED_SIZE)
                .min(COPY_BUF_SIZE),
            max_expected: init_info
                .max_expected_size
                .unwrap_or(MAX_EXPECTED_SIZE)
                .min(COPY_BUF_SIZE),
        }))
    }

    fn cleanup(&self) {
        cleanup_files();
    }
}

/// Remove orphaned shared-memory files and socket directories (best
/// effort), e.g. after a crashed process.
fn cleanup_files() {
    if let Ok(entries) = std::fs::read_dir("/dev/shm") {
        for entry in entries.flatten() {
            if sock::has_prefix(&entry.file_name()) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
    if let Ok(entries) = std::fs::read_dir("/tmp") {
        for entry in entries.flatten() {
            if sock::has_prefix(&entry.file_name()) && entry.path().is_dir() {
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
    }
}

/// Capability flags understood by [`PluginClass::has_opt_feature`].
///
/// Messages between one pair of peers are delivered in FIFO order.
pub const OPT_FIFO_ORDER: u64 = 1 << 0;

struct SmClass {
    endpoint: Arc<SmEndpoint>,
    iov_max: usize,
    max_unexpected: usize,
    max_expected: usize,
}

impl PluginClass for SmClass {
    fn finalize(&self) -> Result<()> {
        self.endpoint.close()
    }

    fn has_opt_feature(&self, flags: u64) -> bool {
        flags & !OPT_FIFO_ORDER == 0
    }

    fn context_create(&self, _id: u8) -> Result<Box<dyn PluginContext>> {
        Ok(Box::new(SmContext {
            events: Mutex::new(Vec::with_capacity(MAX_EVENTS)),
        }))
    }

    fn op_create(&self) -> Result<OpId> {
        Ok(OpId::new(SmOp::new()))
    }

    fn addr_lookup(&self, name: &str) -> Result<Addr> {
        self.endpoint.addr_lookup(name)
    }

    fn addr_self(&self) -> Result<Addr> {
        self.endpoint.addr_self()
    }

    fn addr_serialize(&self, addr: &Addr) -> Result<Vec<u8>> {
        let sm_addr = addr
            .downcast::<self::addr::SmAddr>()
            .ok_or(NaError::InvalidArg)?;
        Ok(self.endpoint.addr_serialize(sm_addr))
    }

    fn addr_deserialize(&self, bytes: &[u8]) -> Result<Addr> {
        self.endpoint.addr_deserialize(bytes)
    }

    fn msg_size_max_unexpected(&self) -> usize {
        self.max_unexpected
    }

    fn msg_size_max_expected(&self) -> usize {
        self.max_expected
    }

    fn msg_tag_max(&self) -> Tag {
        Tag::MAX
    }

    fn msg_send_unexpected(
        &self,
        ctx: &Context,
        cb: Callback,
        buf: &[u8],
        dest: &Addr,
        _dest_id: u8,
        tag: Tag,
        op: &OpId,
    ) -> Result<()> {
        self.endpoint
            .msg_send(ctx, OpKind::SendUnexpected, cb, buf, dest, tag, op)
    }

    fn msg_recv_unexpected(
        &self,
        ctx: &Context,
        cb: Callback,
        buf: Vec<u8>,
        op: &OpId,
    ) -> Result<()> {
        self.endpoint.msg_recv_unexpected(ctx, cb, buf, op)
    }

    fn msg_send_expected(
        &self,
        ctx: &Context,
        cb: Callback,
        buf: &[u8],
        dest: &Addr,
        _dest_id: u8,
        tag: Tag,
        op: &OpId,
    ) -> Result<()> {
        self.endpoint
            .msg_send(ctx, OpKind::SendExpected, cb, buf, dest, tag, op)
    }

    fn msg_recv_expected(
        &self,
        ctx: &Context,
        cb: Callback,
        buf: Vec<u8>,
        source: &Addr,
        _source_id: u8,
        tag: Tag,
        op: &OpId,
    ) -> Result<()> {
        self.endpoint
            .msg_recv_expected(ctx, cb, buf, source, tag, op)
    }

    fn mem_handle_create(&self, base: *const u8, len: usize, access: MemAccess) -> Result<MemHandle> {
        Ok(MemHandle::new(Box::new(SmMemHandle::from_buffer(
            base, len, access,
        ))))
    }

    fn mem_handle_create_segments(
        &self,
        segments: &[Segment],
        access: MemAccess,
    ) -> Result<MemHandle> {
        if segments.len() > self.iov_max {
            log::error!(
                "segment count exceeds IOV_MAX limit ({})",
                self.iov_max
            );
            return Err(NaError::InvalidArg);
        }
        Ok(MemHandle::new(Box::new(SmMemHandle::from_segments(
            segments, access,
        ))))
    }

    fn mem_handle_max_segments(&self) -> usize {
        self.iov_max
    }

    fn mem_handle_serialize_size(&self, handle: &MemHandle) -> Result<usize> {
        let handle = handle.downcast::<SmMemHandle>().ok_or(NaError::InvalidArg)?;
        Ok(handle.serialize_size())
    }

    fn mem_handle_serialize(&self, buf: &mut [u8], handle: &MemHandle) -> Result<()> {
        let handle = handle.downcast::<SmMemHandle>().ok_or(NaError::InvalidArg)?;
        handle.serialize(buf)
    }

    fn mem_handle_deserialize(&self, bytes: &[u8]) -> Result<MemHandle> {
        Ok(MemHandle::new(Box::new(SmMemHandle::deserialize(bytes)?)))
    }

    #[allow(clippy::too_many_arguments)]
    fn put(
        &self,
        ctx: &Context,
        cb: Callback,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        addr: &Addr,
        _remote_id: u8,
        op: &OpId,
    ) -> Result<()> {
        rma::rma(
            &self.endpoint,
            ctx,
            OpKind::Put,
            cb,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            addr,
            op,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn get(
        &self,
        ctx: &Context,
        cb: Callback,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        addr: &Addr,
        _remote_id: u8,
        op: &OpId,
    ) -> Result<()> {
        rma::rma(
            &self.endpoint,
            ctx,
            OpKind::Get,
            cb,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            addr,
            op,
        )
    }

    fn poll_get_fd(&self, _ctx: &Context) -> Option<std::os::fd::RawFd> {
        self.endpoint.poll_fd()
    }

    fn poll_try_wait(&self, _ctx: &Context) -> bool {
        self.endpoint.poll_try_wait()
    }

    fn poll(&self, ctx: &Context) -> Result<u32> {
        self.endpoint.poll(ctx)
    }

    fn poll_wait(&self, ctx: &Context, timeout_ms: u32) -> Option<Result<u32>> {
        Some(self.endpoint.poll_wait(ctx, timeout_ms))
    }

    fn cancel(&self, _ctx: &Context, op: &OpId) -> Result<()> {
        self.endpoint.cancel(op)
    }
}
