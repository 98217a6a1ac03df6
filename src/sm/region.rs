//! Shared-memory region layout and lifetime.
//!
//! One page-aligned POSIX shared-memory object exists per listening
//! endpoint. Both sides map it and cast to [`Region`]; every field is either
//! atomic, lock-protected, or written once by the creator before the name is
//! published, and the all-zeroes state of a fresh mapping is valid except
//! for the availability bitmaps, which the creator sets to all-ones.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::error::{NaError, Result};
use crate::util::mem::{shm_map, shm_unmap, PAGE_SIZE};
use crate::util::spin::RawSpin;

use super::addr::AddrKey;
use super::ring::SharedRing;
use super::{CMD_RING_SIZE, COPY_BUF_SIZE, MAX_PEERS, MSG_RING_SIZE, NUM_BUFS, SHM_PREFIX};

#[repr(C, align(64))]
struct CachelineU64(AtomicU64);

#[repr(C, align(64))]
struct CachelineBitmap256([AtomicU64; 4]);

/// Pool of page-sized copy buffers with a 64-bit availability bitmap.
///
/// Reservation clears a bit with a CAS; the per-buffer spin lock only
/// serializes the copies themselves so that a peer never observes a torn
/// buffer.
#[repr(C)]
pub(crate) struct CopyBufPool {
    locks: [RawSpin; NUM_BUFS],
    bufs: [UnsafeCell<[u8; COPY_BUF_SIZE]>; NUM_BUFS],
    available: CachelineU64,
}

// SAFETY: buffer access is guarded by the per-buffer locks and the
// availability bitmap.
unsafe impl Sync for CopyBufPool {}

impl CopyBufPool {
    /// Reserve one buffer; `Again` when none is available.
    pub(crate) fn reserve(&self) -> Result<u8> {
        loop {
            let available = self.available.0.load(Ordering::Acquire);
            if available == 0 {
                return Err(NaError::Again);
            }
            let index = available.trailing_zeros();
            if self
                .available
                .0
                .compare_exchange_weak(
                    available,
                    available & !(1u64 << index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(index as u8);
            }
        }
    }

    /// Return a buffer to the pool.
    pub(crate) fn release(&self, index: u8) {
        self.available
            .0
            .fetch_or(1u64 << u64::from(index), Ordering::AcqRel);
    }

    pub(crate) fn copy_to(&self, index: u8, src: &[u8]) {
        let index = index as usize;
        self.locks[index].lock();
        // SAFETY: the buffer is reserved by the caller and the copy is
        // serialized by the per-buffer lock.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.bufs[index].get().cast::<u8>(),
                src.len().min(COPY_BUF_SIZE),
            );
        }
        self.locks[index].unlock();
    }

    pub(crate) fn copy_from(&self, index: u8, dst: &mut [u8]) {
        let index = index as usize;
        self.locks[index].lock();
        // SAFETY: symmetric with `copy_to`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.bufs[index].get().cast::<u8>(),
                dst.as_mut_ptr(),
                dst.len().min(COPY_BUF_SIZE),
            );
        }
        self.locks[index].unlock();
    }
}

/// One rx/tx ring pair between two peers.
#[repr(C)]
pub(crate) struct QueuePair {
    pub(crate) tx: SharedRing<MSG_RING_SIZE>,
    pub(crate) rx: SharedRing<MSG_RING_SIZE>,
}

#[repr(C, align(4096))]
struct QueuePairs([QueuePair; MAX_PEERS]);

/// Layout of a shared region.
#[repr(C)]
pub(crate) struct Region {
    owner_pid: AtomicI32,
    owner_id: AtomicU32,
    copy_bufs: CopyBufPool,
    queue_pairs: QueuePairs,
    cmd_ring: SharedRing<CMD_RING_SIZE>,
    available: CachelineBitmap256,
}

impl Region {
    /// Mapped size of a region, rounded up to a page.
    pub(crate) fn mapped_size() -> usize {
        std::mem::size_of::<Region>().div_ceil(PAGE_SIZE) * PAGE_SIZE
    }

    /// One-time initialization by the region creator.
    fn init(&self, key: AddrKey) {
        self.owner_pid.store(key.pid, Ordering::Release);
        self.owner_id.store(u32::from(key.id), Ordering::Release);
        self.copy_bufs.available.0.store(u64::MAX, Ordering::Release);
        for word in &self.available.0 {
            word.store(u64::MAX, Ordering::Release);
        }
    }

    /// Address key of the region owner.
    pub(crate) fn owner_key(&self) -> AddrKey {
        AddrKey {
            pid: self.owner_pid.load(Ordering::Acquire),
            id: self.owner_id.load(Ordering::Acquire) as u8,
        }
    }

    pub(crate) fn copy_bufs(&self) -> &CopyBufPool {
        &self.copy_bufs
    }

    pub(crate) fn cmd_ring(&self) -> &SharedRing<CMD_RING_SIZE> {
        &self.cmd_ring
    }

    pub(crate) fn queue_pair(&self, index: u8) -> &QueuePair {
        &self.queue_pairs.0[index as usize]
    }

    /// Reserve a queue-pair slot out of the 256-bit availability bitmap.
    pub(crate) fn reserve_queue_pair(&self) -> Result<u8> {
        for (word_idx, word) in self.available.0.iter().enumerate() {
            loop {
                let available = word.load(Ordering::Acquire);
                if available == 0 {
                    break;
                }
                let bit = available.trailing_zeros();
                if word
                    .compare_exchange_weak(
                        available,
                        available & !(1u64 << bit),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Ok((word_idx * 64 + bit as usize) as u8);
                }
            }
        }
        Err(NaError::Again)
    }

    /// Return a queue-pair slot to the bitmap and drain its rings.
    pub(crate) fn release_queue_pair(&self, index: u8) {
        let pair = self.queue_pair(index);
        // Drop stale headers so the next peer reserving this slot starts
        // from empty rings and does not leak copy buffers.
        while let Some(raw) = pair.tx.pop() {
            self.release_msg_buf(raw);
        }
        while let Some(raw) = pair.rx.pop() {
            self.release_msg_buf(raw);
        }
        self.available.0[usize::from(index) / 64]
            .fetch_or(1u64 << (u64::from(index) % 64), Ordering::AcqRel);
    }

    fn release_msg_buf(&self, raw: u64) {
        if let Some(hdr) = super::ring::MsgHdr::from_raw(raw) {
            if hdr.buf_size > 0 {
                self.copy_bufs.release(hdr.buf_idx);
            }
        }
    }
}

/// Shared-memory file name for an endpoint URI.
pub(crate) fn shm_name(uri: &str) -> String {
    format!("{SHM_PREFIX}-{uri}")
}

/// Owned mapping of a [`Region`].
///
/// The creator unlinks the backing object when dropped; peers only unmap.
pub(crate) struct RegionHandle {
    ptr: NonNull<libc::c_void>,
    name: String,
    owner: bool,
}

// SAFETY: the mapping is shared by design; all access goes through atomics
// and locks inside `Region`.
unsafe impl Send for RegionHandle {}
unsafe impl Sync for RegionHandle {}

impl RegionHandle {
    /// Create (listener) or open (peer) the region of `uri`.
    pub(crate) fn open(uri: &str, create: bool, key: Option<AddrKey>) -> Result<Self> {
        let name = shm_name(uri);
        let ptr = shm_map(&name, Region::mapped_size(), create).map_err(|err| {
            log::error!("could not open shared region \"{name}\": {err}");
            err
        })?;
        let handle = Self {
            ptr,
            name,
            owner: create,
        };
        if create {
            let key = key.ok_or(NaError::InvalidArg)?;
            handle.init(key);
        }
        Ok(handle)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl Deref for RegionHandle {
    type Target = Region;

    fn deref(&self) -> &Region {
        // SAFETY: the mapping is live, large enough, and `Region` is valid
        // for any bit pattern of its atomic/locked fields.
        unsafe { self.ptr.cast::<Region>().as_ref() }
    }
}

impl Drop for RegionHandle {
    fn drop(&mut self) {
        let name = self.owner.then_some(self.name.as_str());
        // SAFETY: `ptr` came from `shm_map` and is dropped exactly once.
        if let Err(err) = unsafe { shm_unmap(name, self.ptr, Region::mapped_size()) } {
            log::warn!("could not unmap shared region \"{}\": {err}", self.name);
        }
    }
}

/// Read the owner key of a region without keeping it mapped.
pub(crate) fn region_get_addr_key(uri: &str) -> Result<AddrKey> {
    let handle = RegionHandle::open(uri, false, None)?;
    Ok(handle.owner_key())
}

#[cfg(test)]
mod tests {
    use memoffset::offset_of;

    use super::*;

    /// Heap-allocate a zeroed region without staging it on the stack.
    fn zeroed_region() -> Box<Region> {
        let layout = std::alloc::Layout::new::<Region>();
        // SAFETY: all-zeroes is a valid `Region` state; the box takes
        // ownership of the allocation.
        unsafe {
            let ptr = std::alloc::alloc_zeroed(layout).cast::<Region>();
            assert!(!ptr.is_null());
            Box::from_raw(ptr)
        }
    }

    #[test]
    fn test_region_layout() {
        // The shared layout both processes cast to must keep its contended
        // words on separate cache lines and its queue pairs page-aligned.
        assert_eq!(offset_of!(Region, copy_bufs) % 64, 0);
        assert_eq!(offset_of!(Region, queue_pairs) % PAGE_SIZE, 0);
        assert_eq!(offset_of!(Region, cmd_ring) % 64, 0);
        assert_eq!(offset_of!(Region, available) % 64, 0);
        assert!(Region::mapped_size() % PAGE_SIZE == 0);
    }

    #[test]
    fn test_copy_buf_pool() {
        let region = zeroed_region();
        region.init(AddrKey { pid: 42, id: 1 });
        assert_eq!(region.owner_key(), AddrKey { pid: 42, id: 1 });

        let pool = region.copy_bufs();
        let mut reserved = Vec::new();
        for _ in 0..NUM_BUFS {
            reserved.push(pool.reserve().unwrap());
        }
        // All buffers distinct and the pool is now dry.
        reserved.sort_unstable();
        reserved.dedup();
        assert_eq!(reserved.len(), NUM_BUFS);
        assert_eq!(pool.reserve(), Err(NaError::Again));

        let payload = vec![0xA5u8; 100];
        pool.copy_to(reserved[0], &payload);
        let mut out = vec![0u8; 100];
        pool.copy_from(reserved[0], &mut out);
        assert_eq!(out, payload);

        for idx in reserved {
            pool.release(idx);
        }
        assert!(pool.reserve().is_ok());
    }

    #[test]
    fn test_queue_pair_bitmap() {
        let region = zeroed_region();
        region.init(AddrKey { pid: 1, id: 0 });

        let mut reserved = Vec::new();
        for _ in 0..MAX_PEERS {
            reserved.push(region.reserve_queue_pair().unwrap());
        }
        reserved.sort_unstable();
        reserved.dedup();
        assert_eq!(reserved.len(), MAX_PEERS);
        assert_eq!(region.reserve_queue_pair(), Err(NaError::Again));

        region.release_queue_pair(17);
        assert_eq!(region.reserve_queue_pair(), Ok(17));
    }
}
