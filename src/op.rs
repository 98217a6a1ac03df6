//! Operation identifiers and completion callbacks.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::addr::Addr;
use crate::error::Result;

/// Message tag carried by expected and unexpected messages.
pub type Tag = u32;

/// Kind of callback an operation will deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    SendUnexpected,
    SendExpected,
    RecvUnexpected,
    RecvExpected,
    Put,
    Get,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::SendUnexpected => "send_unexpected",
            OpKind::SendExpected => "send_expected",
            OpKind::RecvUnexpected => "recv_unexpected",
            OpKind::RecvExpected => "recv_expected",
            OpKind::Put => "put",
            OpKind::Get => "get",
        };
        f.write_str(s)
    }
}

/// Kind-specific completion payload.
///
/// Receive operations hand the posted buffer back to the caller by value so
/// that a parked operation never borrows caller memory.
pub enum OpInfo {
    SendUnexpected,
    SendExpected,
    RecvUnexpected {
        /// The posted buffer with the message bytes written in.
        buf: Vec<u8>,
        /// Number of bytes actually received.
        actual_size: usize,
        /// Sender of the message; absent on a canceled receive.
        source: Option<Addr>,
        /// Tag the message was sent with.
        tag: Tag,
    },
    RecvExpected {
        buf: Vec<u8>,
        actual_size: usize,
    },
    Put,
    Get,
}

impl fmt::Debug for OpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpInfo::SendUnexpected => f.write_str("SendUnexpected"),
            OpInfo::SendExpected => f.write_str("SendExpected"),
            OpInfo::RecvUnexpected {
                actual_size, tag, ..
            } => f
                .debug_struct("RecvUnexpected")
                .field("actual_size", actual_size)
                .field("tag", tag)
                .finish_non_exhaustive(),
            OpInfo::RecvExpected { actual_size, .. } => f
                .debug_struct("RecvExpected")
                .field("actual_size", actual_size)
                .finish_non_exhaustive(),
            OpInfo::Put => f.write_str("Put"),
            OpInfo::Get => f.write_str("Get"),
        }
    }
}

/// Data passed to a completion callback.
#[derive(Debug)]
pub struct CallbackInfo {
    /// Operation outcome: `Ok(())`, `Err(Canceled)`, or a fatal error.
    pub ret: Result<()>,
    /// Kind of the completed operation.
    pub kind: OpKind,
    /// Kind-specific payload.
    pub info: OpInfo,
}

/// Completion callback, set on every submission.
pub type Callback = Box<dyn FnOnce(CallbackInfo) + Send + 'static>;

/// One entry of a context's completion pipeline.
///
/// `trigger` drops `release` (plugin-held resources, e.g. an address
/// reference) before invoking the user callback, so a plugin may recycle the
/// operation identifier as soon as its resources are dropped.
pub(crate) struct CompletionRecord {
    pub(crate) ret: Result<()>,
    pub(crate) kind: OpKind,
    pub(crate) info: OpInfo,
    pub(crate) callback: Option<Callback>,
    pub(crate) release: Option<Box<dyn Any + Send>>,
}

/// Plugin-side operation state reachable through an [`OpId`].
pub trait PluginOp: Send + Sync {
    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Owned downcast support.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Whether the operation currently carries the `Completed` status bit.
    fn is_completed(&self) -> bool;
}

/// Caller-allocated handle describing one outstanding operation.
///
/// Created in the completed state so that its first use is legal; a submit
/// path observing a non-completed operation fails with `Busy`. The handle
/// may be reused for a new operation once its callback has run.
pub struct OpId {
    pub(crate) inner: Arc<dyn PluginOp>,
}

impl OpId {
    pub(crate) fn new(inner: Arc<dyn PluginOp>) -> Self {
        Self { inner }
    }

    /// Whether the operation has completed (or was never submitted).
    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }

    /// Downcast to an owned handle on the plugin's concrete operation type.
    pub(crate) fn downcast_arc<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner.clone().as_any_arc().downcast::<T>().ok()
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpId")
            .field("completed", &self.is_completed())
            .finish()
    }
}
