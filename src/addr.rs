//! Plugin-neutral address handles.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Plugin-side address state reachable through an [`Addr`].
///
/// Implementations carry a logical reference count covering user handles,
/// outstanding operations and poll-set membership; transport resources are
/// torn down when it reaches zero.
pub trait PluginAddr: Send + Sync {
    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Owned downcast support.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Take one logical reference.
    fn addr_ref(&self);

    /// Drop one logical reference, releasing transport resources at zero.
    fn addr_unref(&self);

    /// Whether this is the endpoint's own address.
    fn is_self(&self) -> bool;

    /// Key equality with another address of the same plugin.
    fn addr_eq(&self, other: &dyn PluginAddr) -> bool;

    /// Plugin-specific URI, generated lazily.
    ///
    /// Optional; the core falls back to a hex rendition of the serialized
    /// form when absent.
    fn to_uri(&self) -> Result<String> {
        Err(crate::error::NaError::OpNotSupported)
    }
}

/// Per-peer address handle.
///
/// Cloning takes a logical reference; dropping releases it. The last release
/// tears down the peer's transport resources exactly once.
pub struct Addr {
    pub(crate) inner: Arc<dyn PluginAddr>,
}

impl Addr {
    /// Wrap plugin address state whose logical reference count already
    /// accounts for this handle.
    pub(crate) fn from_ref(inner: Arc<dyn PluginAddr>) -> Self {
        Self { inner }
    }

    /// Whether this is the endpoint's own address.
    pub fn is_self(&self) -> bool {
        self.inner.is_self()
    }

    /// Downcast to the plugin's concrete address type.
    pub(crate) fn downcast<T: 'static>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    /// Downcast to an owned handle on the plugin's concrete address type.
    pub(crate) fn downcast_arc<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner.clone().as_any_arc().downcast::<T>().ok()
    }
}

impl Clone for Addr {
    fn clone(&self) -> Self {
        self.inner.addr_ref();
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Addr {
    fn drop(&mut self) {
        self.inner.addr_unref();
    }
}

impl PartialEq for Addr {
    fn eq(&self, other: &Self) -> bool {
        self.inner.addr_eq(other.inner.as_ref())
    }
}

impl Eq for Addr {}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("is_self", &self.is_self())
            .finish()
    }
}
