//! NA classes and the static plugin table.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::addr::Addr;
use crate::context::Context;
use crate::error::{NaError, Result};
use crate::info::{InitInfo, NaInfo, ProtocolInfo};
use crate::mem::{MemAccess, MemHandle, MsgBuf, Segment};
use crate::op::{Callback, CallbackInfo, OpId, Tag};
use crate::plugin::{Plugin, PluginClass};
use crate::util::mem::{page_size, AlignedBuf};

/// Statically linked transport plugins.
///
/// Immutable after startup; dynamic loading is deliberately not supported.
pub(crate) static PLUGINS: &[&dyn Plugin] = &[&crate::sm::SM_PLUGIN];

struct ClassInner {
    plugin_class: Box<dyn PluginClass>,
    class_name: &'static str,
    protocol_name: String,
    listen: bool,
    max_contexts: u8,
    context_count: AtomicU32,
}

/// Process-wide handle binding one transport plugin to one protocol.
///
/// Cheap to clone; all clones refer to the same plugin instance. Immutable
/// after initialization.
pub struct Class {
    inner: Arc<ClassInner>,
}

impl Clone for Class {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Class {
    /// Initialize a class from an info string such as `"sm://"`.
    ///
    /// With `listen`, the plugin opens a listening endpoint reachable by
    /// other processes.
    pub fn initialize(info_string: &str, listen: bool) -> Result<Self> {
        Self::initialize_opt(info_string, listen, &InitInfo::default())
    }

    /// Initialize a class with explicit options.
    pub fn initialize_opt(info_string: &str, listen: bool, init_info: &InitInfo) -> Result<Self> {
        let info = NaInfo::parse(info_string)?;

        let plugin = PLUGINS
            .iter()
            .find(|p| {
                if let Some(class_name) = &info.class_name {
                    if p.name() != class_name {
                        return false;
                    }
                }
                p.check_protocol(&info.protocol_name)
            })
            .ok_or_else(|| {
                log::error!(
                    "no plugin found for protocol \"{}\"",
                    info.protocol_name
                );
                NaError::ProtoNoSupport
            })?;

        log::debug!(
            "initializing class {}+{} (listen={})",
            plugin.name(),
            info.protocol_name,
            listen
        );

        let plugin_class = plugin.initialize(&info, listen, init_info)?;
        Ok(Self {
            inner: Arc::new(ClassInner {
                plugin_class,
                class_name: plugin.name(),
                protocol_name: info.protocol_name,
                listen,
                max_contexts: init_info.max_contexts.max(1),
                context_count: AtomicU32::new(0),
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_test(plugin_class: Box<dyn PluginClass>) -> Self {
        Self {
            inner: Arc::new(ClassInner {
                plugin_class,
                class_name: "test",
                protocol_name: "mock".to_owned(),
                listen: false,
                max_contexts: u8::MAX,
                context_count: AtomicU32::new(0),
            }),
        }
    }

    pub(crate) fn plugin(&self) -> &dyn PluginClass {
        self.inner.plugin_class.as_ref()
    }

    pub(crate) fn ptr_eq(&self, other: &Class) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn context_released(&self) {
        self.inner.context_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// NA class name, e.g. `"na"`.
    pub fn class_name(&self) -> &str {
        self.inner.class_name
    }

    /// Protocol driven by this class, e.g. `"sm"`.
    pub fn protocol_name(&self) -> &str {
        &self.inner.protocol_name
    }

    /// Whether the class listens for incoming connections.
    pub fn is_listening(&self) -> bool {
        self.inner.listen
    }

    /// Query optional plugin capabilities.
    pub fn has_opt_feature(&self, flags: u64) -> bool {
        self.plugin().has_opt_feature(flags)
    }

    /// Tear down the class.
    ///
    /// Fails `Busy` while contexts or other clones of the handle are alive;
    /// the class is handed back untouched in that case.
    pub fn finalize(self) -> std::result::Result<(), (Self, NaError)> {
        if Arc::strong_count(&self.inner) > 1
            || self.inner.context_count.load(Ordering::Acquire) > 0
        {
            return Err((self, NaError::Busy));
        }
        if let Err(err) = self.inner.plugin_class.finalize() {
            return Err((self, err));
        }
        Ok(())
    }

    /// Create a progress context with identifier 0.
    pub fn context_create(&self) -> Result<Context> {
        self.context_create_id(0)
    }

    /// Create a progress context with an explicit identifier.
    pub fn context_create_id(&self, id: u8) -> Result<Context> {
        let max = u32::from(self.inner.max_contexts);
        if self
            .inner
            .context_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            })
            .is_err()
        {
            return Err(NaError::Busy);
        }
        match Context::new(self.clone(), id) {
            Ok(ctx) => Ok(ctx),
            Err(err) => {
                self.context_released();
                Err(err)
            }
        }
    }

    /// Destroy a progress context created on this class.
    pub fn context_destroy(&self, context: Context) -> std::result::Result<(), (Context, NaError)> {
        if !context.class().ptr_eq(self) {
            return Err((context, NaError::InvalidArg));
        }
        context.destroy()
    }

    /// Create a fresh operation identifier, pre-set to the completed state.
    pub fn op_create(&self) -> Result<OpId> {
        let op = self.plugin().op_create()?;
        log::debug!("created op {:?}", op);
        Ok(op)
    }

    /// Destroy an operation identifier.
    pub fn op_destroy(&self, op: OpId) {
        if !op.is_completed() {
            log::warn!("destroying op that has not completed");
        }
    }

    /// Look up a peer address by name.
    ///
    /// An explicit class prefix (`"na+sm://..."`) is stripped before the
    /// plugin sees the name.
    pub fn addr_lookup(&self, name: &str) -> Result<Addr> {
        let short_name = match name.find('+') {
            Some(pos) => &name[pos + 1..],
            None => name,
        };
        log::debug!("looking up addr {}", short_name);
        self.plugin().addr_lookup(short_name)
    }

    /// Release an address handle.
    pub fn addr_free(&self, addr: Addr) {
        drop(addr);
    }

    /// The endpoint's own address.
    pub fn addr_self(&self) -> Result<Addr> {
        self.plugin().addr_self()
    }

    /// Duplicate an address handle.
    pub fn addr_dup(&self, addr: &Addr) -> Addr {
        addr.clone()
    }

    /// Compare two addresses by peer key.
    pub fn addr_cmp(&self, a: &Addr, b: &Addr) -> bool {
        a == b
    }

    /// Printable form of an address: `<class>+<protocol>://<addr>`.
    pub fn addr_to_string(&self, addr: &Addr) -> Result<String> {
        let uri = match addr.inner.to_uri() {
            Ok(uri) => uri,
            Err(NaError::OpNotSupported) => {
                // Fallback for plugins without a native string form.
                let bytes = self.plugin().addr_serialize(addr)?;
                bytes.iter().map(|b| format!("{b:02x}")).collect()
            }
            Err(err) => return Err(err),
        };
        Ok(format!(
            "{}+{}://{}",
            self.inner.class_name, self.inner.protocol_name, uri
        ))
    }

    /// Serialize an address for transmission to a peer on the same host.
    pub fn addr_serialize(&self, addr: &Addr) -> Result<Vec<u8>> {
        self.plugin().addr_serialize(addr)
    }

    /// Reconstruct an address serialized by a peer.
    pub fn addr_deserialize(&self, bytes: &[u8]) -> Result<Addr> {
        self.plugin().addr_deserialize(bytes)
    }

    /// Maximum unexpected-message payload size.
    pub fn msg_size_max_unexpected(&self) -> usize {
        self.plugin().msg_size_max_unexpected()
    }

    /// Maximum expected-message payload size.
    pub fn msg_size_max_expected(&self) -> usize {
        self.plugin().msg_size_max_expected()
    }

    /// Maximum usable message tag.
    pub fn msg_tag_max(&self) -> Tag {
        self.plugin().msg_tag_max()
    }

    /// Allocate a message buffer.
    ///
    /// Uses the plugin's allocator when it has one, a page-aligned zeroed
    /// allocation otherwise.
    pub fn msg_buf_alloc(&self, size: usize) -> Result<MsgBuf> {
        if size == 0 {
            return Err(NaError::InvalidArg);
        }
        match self.plugin().msg_buf_alloc(size) {
            Some(ret) => ret,
            None => Ok(MsgBuf {
                buf: AlignedBuf::new(page_size(), size)?,
            }),
        }
    }

    /// Prepare a buffer for its first use as an unexpected message.
    pub fn msg_init_unexpected(&self, buf: &mut [u8]) -> Result<()> {
        self.plugin().msg_init_unexpected(buf)
    }

    /// Prepare a buffer for its first use as an expected message.
    pub fn msg_init_expected(&self, buf: &mut [u8]) -> Result<()> {
        self.plugin().msg_init_expected(buf)
    }

    fn check_msg_args(&self, ctx: &Context, size: usize, max: usize, tag: Tag) -> Result<()> {
        if !ctx.class().ptr_eq(self) {
            return Err(NaError::InvalidArg);
        }
        if size > max {
            return Err(NaError::Overflow);
        }
        if tag > self.msg_tag_max() {
            return Err(NaError::InvalidArg);
        }
        Ok(())
    }

    /// Send an unexpected message to `dest`.
    #[allow(clippy::too_many_arguments)]
    pub fn msg_send_unexpected(
        &self,
        ctx: &Context,
        cb: impl FnOnce(CallbackInfo) + Send + 'static,
        buf: &[u8],
        dest: &Addr,
        dest_id: u8,
        tag: Tag,
        op: &OpId,
    ) -> Result<()> {
        self.check_msg_args(ctx, buf.len(), self.msg_size_max_unexpected(), tag)?;
        log::debug!("send_unexpected size={} tag={}", buf.len(), tag);
        self.plugin()
            .msg_send_unexpected(ctx, Box::new(cb) as Callback, buf, dest, dest_id, tag, op)
    }

    /// Post a receive for an unexpected message from any source.
    pub fn msg_recv_unexpected(
        &self,
        ctx: &Context,
        cb: impl FnOnce(CallbackInfo) + Send + 'static,
        buf: Vec<u8>,
        op: &OpId,
    ) -> Result<()> {
        self.check_msg_args(ctx, buf.len(), self.msg_size_max_unexpected(), 0)?;
        log::debug!("recv_unexpected size={}", buf.len());
        self.plugin()
            .msg_recv_unexpected(ctx, Box::new(cb) as Callback, buf, op)
    }

    /// Send an expected message to `dest`.
    #[allow(clippy::too_many_arguments)]
    pub fn msg_send_expected(
        &self,
        ctx: &Context,
        cb: impl FnOnce(CallbackInfo) + Send + 'static,
        buf: &[u8],
        dest: &Addr,
        dest_id: u8,
        tag: Tag,
        op: &OpId,
    ) -> Result<()> {
        self.check_msg_args(ctx, buf.len(), self.msg_size_max_expected(), tag)?;
        log::debug!("send_expected size={} tag={}", buf.len(), tag);
        self.plugin()
            .msg_send_expected(ctx, Box::new(cb) as Callback, buf, dest, dest_id, tag, op)
    }

    /// Post a receive for an expected message matched on `(source, tag)`.
    #[allow(clippy::too_many_arguments)]
    pub fn msg_recv_expected(
        &self,
        ctx: &Context,
        cb: impl FnOnce(CallbackInfo) + Send + 'static,
        buf: Vec<u8>,
        source: &Addr,
        source_id: u8,
        tag: Tag,
        op: &OpId,
    ) -> Result<()> {
        self.check_msg_args(ctx, buf.len(), self.msg_size_max_expected(), tag)?;
        log::debug!("recv_expected size={} tag={}", buf.len(), tag);
        self.plugin()
            .msg_recv_expected(ctx, Box::new(cb) as Callback, buf, source, source_id, tag, op)
    }

    /// Register a contiguous buffer for one-sided access.
    ///
    /// The caller must keep the buffer alive and treat it as shared while
    /// any local or remote operation may reference the handle.
    pub fn mem_handle_create(&self, buf: &[u8], access: MemAccess) -> Result<MemHandle> {
        self.plugin().mem_handle_create(buf.as_ptr(), buf.len(), access)
    }

    /// Register a scatter/gather list for one-sided access.
    pub fn mem_handle_create_segments(
        &self,
        segments: &[Segment],
        access: MemAccess,
    ) -> Result<MemHandle> {
        if segments.is_empty() {
            return Err(NaError::InvalidArg);
        }
        self.plugin().mem_handle_create_segments(segments, access)
    }

    /// Release a memory handle.
    pub fn mem_handle_free(&self, handle: MemHandle) {
        drop(handle);
    }

    /// Maximum segments accepted by [`Self::mem_handle_create_segments`].
    pub fn mem_handle_max_segments(&self) -> usize {
        self.plugin().mem_handle_max_segments()
    }

    /// Register handle-backed memory with the transport (optional).
    pub fn mem_register(&self, handle: &MemHandle) -> Result<()> {
        self.plugin().mem_register(handle)
    }

    /// Deregister handle-backed memory (optional, silently succeeds).
    pub fn mem_deregister(&self, handle: &MemHandle) -> Result<()> {
        self.plugin().mem_deregister(handle)
    }

    /// Buffer size needed to serialize a memory handle.
    pub fn mem_handle_get_serialize_size(&self, handle: &MemHandle) -> Result<usize> {
        self.plugin().mem_handle_serialize_size(handle)
    }

    /// Serialize a memory handle into a caller buffer.
    pub fn mem_handle_serialize(&self, buf: &mut [u8], handle: &MemHandle) -> Result<()> {
        if buf.len() < self.mem_handle_get_serialize_size(handle)? {
            return Err(NaError::Overflow);
        }
        self.plugin().mem_handle_serialize(buf, handle)
    }

    /// Reconstruct a memory handle serialized by a peer.
    pub fn mem_handle_deserialize(&self, bytes: &[u8]) -> Result<MemHandle> {
        self.plugin().mem_handle_deserialize(bytes)
    }

    /// One-sided write of `length` bytes from `local` into `remote`.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        ctx: &Context,
        cb: impl FnOnce(CallbackInfo) + Send + 'static,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        addr: &Addr,
        remote_id: u8,
        op: &OpId,
    ) -> Result<()> {
        if !ctx.class().ptr_eq(self) || length == 0 {
            return Err(NaError::InvalidArg);
        }
        log::debug!("put length={}", length);
        self.plugin().put(
            ctx,
            Box::new(cb) as Callback,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            addr,
            remote_id,
            op,
        )
    }

    /// One-sided read of `length` bytes from `remote` into `local`.
    #[allow(clippy::too_many_arguments)]
    pub fn get(
        &self,
        ctx: &Context,
        cb: impl FnOnce(CallbackInfo) + Send + 'static,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        addr: &Addr,
        remote_id: u8,
        op: &OpId,
    ) -> Result<()> {
        if !ctx.class().ptr_eq(self) || length == 0 {
            return Err(NaError::InvalidArg);
        }
        log::debug!("get length={}", length);
        self.plugin().get(
            ctx,
            Box::new(cb) as Callback,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            addr,
            remote_id,
            op,
        )
    }
}

/// NA interface version as `(major, minor, patch)`.
pub fn version() -> (u32, u32, u32) {
    let parse = |s: &str| s.parse().unwrap_or(0);
    (
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

/// Enumerate transports supported by the registered plugins.
///
/// An info string restricts the enumeration to matching entries.
pub fn protocol_info_get(info_string: Option<&str>) -> Result<Vec<ProtocolInfo>> {
    let filter = info_string.map(NaInfo::parse).transpose()?;

    let mut entries = Vec::new();
    for plugin in PLUGINS {
        if let Some(filter) = &filter {
            if let Some(class_name) = &filter.class_name {
                if plugin.name() != class_name {
                    continue;
                }
            }
        }
        entries.extend(plugin.protocol_info(filter.as_ref())?);
    }
    Ok(entries)
}

/// Best-effort removal of persistent state left behind by dead processes.
pub fn cleanup() {
    for plugin in PLUGINS {
        plugin.cleanup();
    }
}

/// Log level requested through the `NA_LOG_LEVEL` environment variable.
pub fn log_level_from_env() -> Option<log::LevelFilter> {
    match std::env::var("NA_LOG_LEVEL").ok()?.to_lowercase().as_str() {
        "debug" => Some(log::LevelFilter::Debug),
        "info" => Some(log::LevelFilter::Info),
        "warn" | "warning" => Some(log::LevelFilter::Warn),
        "error" => Some(log::LevelFilter::Error),
        _ => None,
    }
}
