//! Shared-memory peer addresses.

use std::any::Any;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::addr::{Addr, PluginAddr};
use crate::error::Result;
use crate::util::spin::Spin;

use super::endpoint::SmEndpoint;
use super::event::Notifier;
use super::region::{QueuePair, Region, RegionHandle};
use super::ring::SharedRing;
use super::MSG_RING_SIZE;

/// Peer key: one shared-memory endpoint per `(pid, id)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AddrKey {
    pub(crate) pid: i32,
    pub(crate) id: u8,
}

impl AddrKey {
    /// Default URI form, `<pid>-<id>`.
    pub(crate) fn to_uri(self) -> String {
        format!("{}-{}", self.pid, self.id)
    }

    /// Parse the default URI form.
    pub(crate) fn parse(uri: &str) -> Option<Self> {
        let (pid, id) = uri.split_once('-')?;
        Some(Self {
            pid: pid.parse().ok()?,
            id: id.parse().ok()?,
        })
    }
}

/// Resolution state bits; see the resolve path in the endpoint module.
pub(crate) const ADDR_RESERVED: u32 = 1 << 0;
pub(crate) const ADDR_CMD_PUSHED: u32 = 1 << 1;
pub(crate) const ADDR_RESOLVED: u32 = 1 << 2;

/// Notification descriptors attached to an address.
#[derive(Default)]
pub(crate) struct AddrFds {
    pub(crate) tx: Option<Arc<Notifier>>,
    pub(crate) rx: Option<Arc<Notifier>>,
    pub(crate) tx_token: Option<u64>,
    pub(crate) rx_token: Option<u64>,
}

/// One shared-memory peer.
///
/// `refcount` is the logical reference count: user handles, outstanding
/// operations and cached unexpected messages. It reaching zero triggers the
/// release path exactly once; the `Arc` only keeps the memory alive.
pub(crate) struct SmAddr {
    pub(crate) key: AddrKey,
    pub(crate) endpoint: Weak<SmEndpoint>,
    /// Passive-side address created from a `Reserved` command.
    pub(crate) unexpected: bool,
    /// The endpoint's own address.
    pub(crate) is_source: bool,
    uri: OnceLock<String>,
    refcount: AtomicI32,
    pub(crate) status: AtomicU32,
    pub(crate) resolve_lock: Mutex<()>,
    pair_idx: AtomicU32,
    pub(crate) region: Spin<Option<Arc<RegionHandle>>>,
    pub(crate) fds: Spin<AddrFds>,
}

impl SmAddr {
    pub(crate) fn new(
        endpoint: Weak<SmEndpoint>,
        key: AddrKey,
        uri: Option<String>,
        unexpected: bool,
        is_source: bool,
    ) -> Arc<Self> {
        let addr = Arc::new(Self {
            key,
            endpoint,
            unexpected,
            is_source,
            uri: OnceLock::new(),
            refcount: AtomicI32::new(1),
            status: AtomicU32::new(0),
            resolve_lock: Mutex::new(()),
            pair_idx: AtomicU32::new(u32::MAX),
            region: Spin::new(None),
            fds: Spin::new(AddrFds::default()),
        });
        if let Some(uri) = uri {
            let _ = addr.uri.set(uri);
        }
        addr
    }

    /// URI of the peer, generated from the key when not set at creation.
    pub(crate) fn uri(&self) -> &str {
        self.uri.get_or_init(|| self.key.to_uri())
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

    pub(crate) fn is_resolved(&self) -> bool {
        self.status() & ADDR_RESOLVED != 0
    }

    pub(crate) fn set_pair_idx(&self, index: u8) {
        self.pair_idx.store(u32::from(index), Ordering::Release);
    }

    pub(crate) fn pair_idx(&self) -> u8 {
        self.pair_idx.load(Ordering::Acquire) as u8
    }

    pub(crate) fn region(&self) -> Option<Arc<RegionHandle>> {
        self.region.lock().clone()
    }

    fn queue_pair<'r>(&self, region: &'r Region) -> &'r QueuePair {
        region.queue_pair(self.pair_idx())
    }

    /// Ring this endpoint pushes to when sending to the peer.
    pub(crate) fn tx_ring<'r>(&self, region: &'r Region) -> &'r SharedRing<MSG_RING_SIZE> {
        let pair = self.queue_pair(region);
        if self.unexpected {
            // Passive side: local tx is the originator's rx.
            &pair.rx
        } else {
            // Originator and loopback both transmit on tx.
            &pair.tx
        }
    }

    /// Ring this endpoint drains when progressing the peer.
    pub(crate) fn rx_ring<'r>(&self, region: &'r Region) -> &'r SharedRing<MSG_RING_SIZE> {
        let pair = self.queue_pair(region);
        if self.unexpected || self.is_source {
            // Passive side receives on the originator's tx; loopback
            // aliases both directions onto the same ring.
            &pair.tx
        } else {
            &pair.rx
        }
    }

    pub(crate) fn ref_incr(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn ref_decr(&self) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(endpoint) = self.endpoint.upgrade() {
                endpoint.addr_release(self);
            } else {
                // Endpoint already gone; just drop our descriptors.
                let mut fds = self.fds.lock();
                fds.tx = None;
                fds.rx = None;
                *self.region.lock() = None;
            }
        }
    }

    /// Take a logical reference only if the address is still live.
    ///
    /// Fails when a concurrent release already drove the count to zero, in
    /// which case the map entry is stale and must be replaced.
    pub(crate) fn try_ref(addr: &Arc<Self>) -> Option<SmAddrRef> {
        let mut count = addr.refcount.load(Ordering::Acquire);
        loop {
            if count <= 0 {
                return None;
            }
            match addr.refcount.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(SmAddrRef::adopt(addr.clone())),
                Err(actual) => count = actual,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::Acquire)
    }
}

impl PluginAddr for SmAddr {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn addr_ref(&self) {
        self.ref_incr();
    }

    fn addr_unref(&self) {
        self.ref_decr();
    }

    fn is_self(&self) -> bool {
        self.is_source
    }

    fn addr_eq(&self, other: &dyn PluginAddr) -> bool {
        match other.as_any().downcast_ref::<SmAddr>() {
            Some(other) => self.key == other.key,
            None => false,
        }
    }

    fn to_uri(&self) -> Result<String> {
        Ok(self.uri().to_owned())
    }
}

/// Counted reference to an [`SmAddr`].
///
/// Construction takes a logical reference, drop releases it; conversion into
/// a user-facing [`Addr`] hands the reference over without touching the
/// count.
pub(crate) struct SmAddrRef(Arc<SmAddr>);

impl SmAddrRef {
    /// Take a new logical reference on `addr`.
    pub(crate) fn new(addr: &Arc<SmAddr>) -> Self {
        addr.ref_incr();
        Self(addr.clone())
    }

    /// Adopt an already-counted reference (e.g. the initial one).
    pub(crate) fn adopt(addr: Arc<SmAddr>) -> Self {
        Self(addr)
    }

    /// Convert into a user-facing handle, transferring the reference.
    pub(crate) fn into_addr(self) -> Addr {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the contained Arc moves out
        // exactly once and the logical reference transfers to the handle.
        let arc = unsafe { std::ptr::read(&this.0) };
        Addr::from_ref(arc)
    }

    pub(crate) fn arc(&self) -> &Arc<SmAddr> {
        &self.0
    }
}

impl Clone for SmAddrRef {
    fn clone(&self) -> Self {
        Self::new(&self.0)
    }
}

impl Deref for SmAddrRef {
    type Target = SmAddr;

    fn deref(&self) -> &SmAddr {
        &self.0
    }
}

impl Drop for SmAddrRef {
    fn drop(&mut self) {
        self.0.ref_decr();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_key_uri_roundtrip() {
        let key = AddrKey { pid: 4321, id: 9 };
        assert_eq!(key.to_uri(), "4321-9");
        assert_eq!(AddrKey::parse("4321-9"), Some(key));
        assert_eq!(AddrKey::parse("not-a-key"), None);
        assert_eq!(AddrKey::parse("4321"), None);
    }

    #[test]
    fn test_logical_refcounting() {
        let addr = SmAddr::new(
            Weak::new(),
            AddrKey { pid: 1, id: 0 },
            None,
            false,
            false,
        );
        assert_eq!(addr.refcount(), 1);
        assert_eq!(addr.uri(), "1-0");

        let first = SmAddrRef::new(&addr);
        let second = first.clone();
        assert_eq!(addr.refcount(), 3);
        drop(second);
        assert_eq!(addr.refcount(), 2);

        // Converting into a user handle transfers the count untouched.
        let handle = first.into_addr();
        assert_eq!(addr.refcount(), 2);
        drop(handle);
        assert_eq!(addr.refcount(), 1);

        // The last reference releases exactly once; afterwards the entry is
        // stale and refuses new references.
        SmAddrRef::adopt(addr.clone());
        assert_eq!(addr.refcount(), 0);
        assert!(SmAddr::try_ref(&addr).is_none());
    }
}
