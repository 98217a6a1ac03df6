//! Shared-memory operation identifiers and their queues.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::error::Result;
use crate::op::{Callback, CompletionRecord, OpInfo, OpKind, PluginOp, Tag};
use crate::util::spin::Spin;

use super::addr::SmAddrRef;

pub(crate) const OP_COMPLETED: u32 = 1 << 0;
pub(crate) const OP_RETRYING: u32 = 1 << 1;
pub(crate) const OP_CANCELED: u32 = 1 << 2;
pub(crate) const OP_QUEUED: u32 = 1 << 3;
pub(crate) const OP_ERRORED: u32 = 1 << 4;

/// Per-submission fields, rewritten on every reset.
pub(crate) struct OpState {
    pub(crate) kind: OpKind,
    pub(crate) context: Option<Context>,
    pub(crate) callback: Option<Callback>,
    pub(crate) addr: Option<SmAddrRef>,
    pub(crate) tag: Tag,
    /// Owned copy of the payload for (possibly retried) sends.
    pub(crate) send_data: Vec<u8>,
    /// Posted buffer for receives, handed back through the callback.
    pub(crate) recv_buf: Option<Vec<u8>>,
    pub(crate) recv_actual: usize,
    pub(crate) recv_tag: Tag,
    pub(crate) recv_source: Option<SmAddrRef>,
}

impl Default for OpState {
    fn default() -> Self {
        Self {
            kind: OpKind::SendUnexpected,
            context: None,
            callback: None,
            addr: None,
            tag: 0,
            send_data: Vec::new(),
            recv_buf: None,
            recv_actual: 0,
            recv_tag: 0,
            recv_source: None,
        }
    }
}

/// Shared-memory operation identifier.
///
/// The status word carries the lifecycle bits; everything else lives behind
/// the state lock and is only touched at submit, match and completion time.
pub(crate) struct SmOp {
    status: AtomicU32,
    pub(crate) state: Spin<OpState>,
}

impl SmOp {
    /// Fresh operation, pre-set to completed so the first submit is legal.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU32::new(OP_COMPLETED),
            state: Spin::new(OpState::default()),
        })
    }

    #[inline]
    pub(crate) fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_status(&self, bits: u32) {
        self.status.fetch_or(bits, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn clear_status(&self, bits: u32) {
        self.status.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Arm the operation for a new submission.
    ///
    /// The caller must have verified the completed bit; this clears the
    /// whole status word and installs the per-submission fields.
    pub(crate) fn reset(
        &self,
        kind: OpKind,
        context: &Context,
        callback: Callback,
        addr: Option<SmAddrRef>,
    ) {
        let mut state = self.state.lock();
        state.kind = kind;
        state.context = Some(context.clone());
        state.callback = Some(callback);
        state.addr = addr;
        state.tag = 0;
        state.send_data.clear();
        state.recv_buf = None;
        state.recv_actual = 0;
        state.recv_tag = 0;
        state.recv_source = None;
        drop(state);
        self.status.store(0, Ordering::Release);
    }

    /// Release submission resources without completing (submit-path error).
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        state.addr = None;
        state.context = None;
        state.callback = None;
        state.send_data = Vec::new();
        state.recv_buf = None;
        drop(state);
        self.status.store(OP_COMPLETED, Ordering::Release);
    }

    /// Complete the operation and hand it to the context's pipeline.
    ///
    /// Sets the completed bit first, then moves the per-submission fields
    /// into the completion record; the address reference rides along as the
    /// plugin-release payload.
    pub(crate) fn complete(&self, ret: Result<()>) {
        self.set_status(OP_COMPLETED);

        let (context, record) = {
            let mut state = self.state.lock();
            let kind = state.kind;
            let context = state.context.take();
            let callback = state.callback.take();
            let addr = state.addr.take();
            state.send_data = Vec::new();

            let info = match kind {
                OpKind::SendUnexpected => OpInfo::SendUnexpected,
                OpKind::SendExpected => OpInfo::SendExpected,
                OpKind::RecvUnexpected => OpInfo::RecvUnexpected {
                    buf: state.recv_buf.take().unwrap_or_default(),
                    actual_size: state.recv_actual,
                    source: state.recv_source.take().map(SmAddrRef::into_addr),
                    tag: state.recv_tag,
                },
                OpKind::RecvExpected => OpInfo::RecvExpected {
                    buf: state.recv_buf.take().unwrap_or_default(),
                    actual_size: state.recv_actual,
                },
                OpKind::Put => OpInfo::Put,
                OpKind::Get => OpInfo::Get,
            };

            let record = CompletionRecord {
                ret,
                kind,
                info,
                callback,
                release: addr.map(|a| Box::new(a) as Box<dyn Any + Send>),
            };
            (context, record)
        };

        match context {
            Some(context) => context.completion_add(Box::new(record)),
            None => log::warn!("completing an operation with no context"),
        }
    }
}

impl PluginOp for SmOp {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn is_completed(&self) -> bool {
        self.status() & OP_COMPLETED != 0
    }
}

/// Spin-locked FIFO of parked operations.
pub(crate) type OpQueue = Spin<std::collections::VecDeque<Arc<SmOp>>>;
