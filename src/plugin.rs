//! Transport-plugin dispatch surface.
//!
//! A plugin publishes a [`Plugin`] factory plus a [`PluginClass`]
//! implementation; every entry point of the consumer API forwards here after
//! argument validation. Entries a plugin does not implement keep their
//! default body, which reports [`NaError::OpNotSupported`] — the moral
//! equivalent of a `NULL` slot in a C operation table.

use std::any::Any;
use std::os::fd::RawFd;

use crate::addr::Addr;
use crate::context::Context;
use crate::error::{NaError, Result};
use crate::info::{InitInfo, NaInfo, ProtocolInfo};
use crate::mem::{MemAccess, MemHandle, MsgBuf, Segment};
use crate::op::{Callback, OpId, Tag};

/// Plugin factory: one entry of the static plugin table.
pub trait Plugin: Send + Sync {
    /// NA class name, e.g. `"na"`.
    fn name(&self) -> &'static str;

    /// Whether this plugin drives the given protocol.
    fn check_protocol(&self, protocol_name: &str) -> bool;

    /// Enumerate supported transports, optionally filtered.
    fn protocol_info(&self, filter: Option<&NaInfo>) -> Result<Vec<ProtocolInfo>>;

    /// Create a plugin class instance bound to one protocol.
    fn initialize(
        &self,
        info: &NaInfo,
        listen: bool,
        init_info: &InitInfo,
    ) -> Result<Box<dyn PluginClass>>;

    /// Process-wide cleanup of persistent plugin state (best effort).
    fn cleanup(&self) {}
}

/// Plugin-private per-context state (e.g. event scratch buffers).
pub trait PluginContext: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl PluginContext for () {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Operations implemented by a plugin class instance.
#[allow(unused_variables)]
pub trait PluginClass: Send + Sync {
    /// Checked teardown; fails `Busy` while resources are outstanding.
    fn finalize(&self) -> Result<()> {
        Ok(())
    }

    fn has_opt_feature(&self, flags: u64) -> bool {
        false
    }

    fn context_create(&self, id: u8) -> Result<Box<dyn PluginContext>> {
        Ok(Box::new(()))
    }

    fn op_create(&self) -> Result<OpId> {
        Err(NaError::OpNotSupported)
    }

    fn addr_lookup(&self, name: &str) -> Result<Addr> {
        Err(NaError::OpNotSupported)
    }

    fn addr_self(&self) -> Result<Addr> {
        Err(NaError::OpNotSupported)
    }

    fn addr_serialize(&self, addr: &Addr) -> Result<Vec<u8>> {
        Err(NaError::OpNotSupported)
    }

    fn addr_deserialize(&self, bytes: &[u8]) -> Result<Addr> {
        Err(NaError::OpNotSupported)
    }

    fn msg_size_max_unexpected(&self) -> usize {
        0
    }

    fn msg_size_max_expected(&self) -> usize {
        0
    }

    fn msg_tag_max(&self) -> Tag {
        Tag::MAX
    }

    /// Plugin-specific message-buffer allocator; `None` selects the core's
    /// page-aligned fallback.
    fn msg_buf_alloc(&self, size: usize) -> Option<Result<MsgBuf>> {
        None
    }

    /// Initialize a buffer before its first use as an unexpected message
    /// (e.g. transport headers). Optional; skipped silently when absent.
    fn msg_init_unexpected(&self, buf: &mut [u8]) -> Result<()> {
        Ok(())
    }

    /// Initialize a buffer before its first use as an expected message.
    fn msg_init_expected(&self, buf: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn msg_send_unexpected(
        &self,
        ctx: &Context,
        cb: Callback,
        buf: &[u8],
        dest: &Addr,
        dest_id: u8,
        tag: Tag,
        op: &OpId,
    ) -> Result<()> {
        Err(NaError::OpNotSupported)
    }

    fn msg_recv_unexpected(
        &self,
        ctx: &Context,
        cb: Callback,
        buf: Vec<u8>,
        op: &OpId,
    ) -> Result<()> {
        Err(NaError::OpNotSupported)
    }

    fn msg_send_expected(
        &self,
        ctx: &Context,
        cb: Callback,
        buf: &[u8],
        dest: &Addr,
        dest_id: u8,
        tag: Tag,
        op: &OpId,
    ) -> Result<()> {
        Err(NaError::OpNotSupported)
    }

    fn msg_recv_expected(
        &self,
        ctx: &Context,
        cb: Callback,
        buf: Vec<u8>,
        source: &Addr,
        source_id: u8,
        tag: Tag,
        op: &OpId,
    ) -> Result<()> {
        Err(NaError::OpNotSupported)
    }

    fn mem_handle_create(&self, base: *const u8, len: usize, access: MemAccess) -> Result<MemHandle> {
        Err(NaError::OpNotSupported)
    }

    fn mem_handle_create_segments(
        &self,
        segments: &[Segment],
        access: MemAccess,
    ) -> Result<MemHandle> {
        Err(NaError::OpNotSupported)
    }

    fn mem_handle_max_segments(&self) -> usize {
        1
    }

    /// Optional registration hook; a plugin without registration state
    /// silently succeeds.
    fn mem_register(&self, handle: &MemHandle) -> Result<()> {
        Ok(())
    }

    fn mem_deregister(&self, handle: &MemHandle) -> Result<()> {
        Ok(())
    }

    fn mem_handle_serialize_size(&self, handle: &MemHandle) -> Result<usize> {
        Err(NaError::OpNotSupported)
    }

    fn mem_handle_serialize(&self, buf: &mut [u8], handle: &MemHandle) -> Result<()> {
        Err(NaError::OpNotSupported)
    }

    fn mem_handle_deserialize(&self, bytes: &[u8]) -> Result<MemHandle> {
        Err(NaError::OpNotSupported)
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
        remote_id: u8,
        op: &OpId,
    ) -> Result<()> {
        Err(NaError::OpNotSupported)
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
        remote_id: u8,
        op: &OpId,
    ) -> Result<()> {
        Err(NaError::OpNotSupported)
    }

    /// Wakeable descriptor usable with an external poll loop, if any.
    fn poll_get_fd(&self, ctx: &Context) -> Option<RawFd> {
        None
    }

    /// Whether blocking on [`Self::poll_get_fd`] is currently safe.
    fn poll_try_wait(&self, ctx: &Context) -> bool {
        false
    }

    /// Non-blocking progress; returns the number of progressed events.
    fn poll(&self, ctx: &Context) -> Result<u32> {
        Err(NaError::OpNotSupported)
    }

    /// Blocking progress; `None` selects the core's busy-wait fallback over
    /// [`Self::poll`].
    fn poll_wait(&self, ctx: &Context, timeout_ms: u32) -> Option<Result<u32>> {
        None
    }

    fn cancel(&self, ctx: &Context, op: &OpId) -> Result<()> {
        Err(NaError::OpNotSupported)
    }
}
