//! Lock-free MPMC ring of owned entries.
//!
//! Algorithm derived from the FreeBSD `buf_ring` design: a bounded ring of
//! pointer-sized slots with separate producer and consumer head/tail pairs,
//! each pair on its own cache line. Producers claim a slot with a CAS on
//! `prod_head`, store the payload, then publish it by advancing `prod_tail`
//! once every earlier producer has published.

use std::hint;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicU32, AtomicU64, Ordering};

#[repr(C, align(64))]
struct Producer {
    head: AtomicU32,
    tail: AtomicU32,
    size: u32,
    mask: u32,
    drops: AtomicU64,
}

#[repr(C, align(64))]
struct Consumer {
    head: AtomicU32,
    tail: AtomicU32,
    mask: u32,
}

/// Bounded lock-free queue of boxed entries.
///
/// Capacity must be a power of two; one slot is kept free to distinguish
/// full from empty, so a queue of capacity `n` holds at most `n - 1`
/// entries.
pub(crate) struct AtomicQueue<T> {
    prod: Producer,
    cons: Consumer,
    ring: Box<[AtomicPtr<T>]>,
    _marker: PhantomData<Box<T>>,
}

// SAFETY: entries are owned boxes handed over atomically.
unsafe impl<T: Send> Send for AtomicQueue<T> {}
unsafe impl<T: Send> Sync for AtomicQueue<T> {}

impl<T> AtomicQueue<T> {
    /// Create a queue with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two greater than one.
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity > 1,
            "queue capacity must be a power of two > 1"
        );
        let ring = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let mask = (capacity - 1) as u32;
        Self {
            prod: Producer {
                head: AtomicU32::new(0),
                tail: AtomicU32::new(0),
                size: capacity as u32,
                mask,
                drops: AtomicU64::new(0),
            },
            cons: Consumer {
                head: AtomicU32::new(0),
                tail: AtomicU32::new(0),
                mask,
            },
            ring,
            _marker: PhantomData,
        }
    }

    /// Enqueue an entry; hand it back if the queue is full.
    pub(crate) fn push(&self, entry: Box<T>) -> std::result::Result<(), Box<T>> {
        let mut prod_head;
        let mut prod_next;
        loop {
            prod_head = self.prod.head.load(Ordering::Acquire);
            prod_next = (prod_head + 1) & self.prod.mask;
            let cons_tail = self.cons.tail.load(Ordering::Acquire);

            if prod_next == cons_tail {
                // Re-read both indices behind a fence so transient
                // contention is not reported as full.
                fence(Ordering::SeqCst);
                if prod_head == self.prod.head.load(Ordering::Acquire)
                    && cons_tail == self.cons.tail.load(Ordering::Acquire)
                {
                    self.prod.drops.fetch_add(1, Ordering::Relaxed);
                    return Err(entry);
                }
                continue;
            }

            if self
                .prod
                .head
                .compare_exchange_weak(prod_head, prod_next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        self.ring[prod_head as usize].store(Box::into_raw(entry), Ordering::Relaxed);

        // Wait for earlier producers to publish, then publish ours.
        while self.prod.tail.load(Ordering::Acquire) != prod_head {
            hint::spin_loop();
        }
        self.prod.tail.store(prod_next, Ordering::Release);

        Ok(())
    }

    /// Dequeue an entry, multi-consumer safe.
    pub(crate) fn pop_mc(&self) -> Option<Box<T>> {
        let mut cons_head;
        let mut cons_next;
        loop {
            cons_head = self.cons.head.load(Ordering::Acquire);
            cons_next = (cons_head + 1) & self.cons.mask;

            if cons_head == self.prod.tail.load(Ordering::Acquire) {
                return None;
            }

            if self
                .cons
                .head
                .compare_exchange_weak(cons_head, cons_next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let entry = self.ring[cons_head as usize].load(Ordering::Relaxed);

        while self.cons.tail.load(Ordering::Acquire) != cons_head {
            hint::spin_loop();
        }
        self.cons.tail.store(cons_next, Ordering::Release);

        // SAFETY: the slot was claimed by the CAS above; the pointer was
        // produced by `Box::into_raw` in `push` and is consumed exactly once.
        Some(unsafe { Box::from_raw(entry) })
    }

    /// Dequeue an entry, single-consumer fast path.
    ///
    /// # Safety
    ///
    /// Must not run concurrently with any other `pop_sc` or `pop_mc` call on
    /// the same queue.
    #[allow(dead_code)]
    pub(crate) unsafe fn pop_sc(&self) -> Option<Box<T>> {
        let cons_head = self.cons.head.load(Ordering::Acquire);
        let prod_tail = self.prod.tail.load(Ordering::Acquire);
        let cons_next = (cons_head + 1) & self.cons.mask;

        if cons_head == prod_tail {
            return None;
        }

        self.cons.head.store(cons_next, Ordering::Relaxed);
        let entry = self.ring[cons_head as usize].load(Ordering::Relaxed);
        self.cons.tail.store(cons_next, Ordering::Release);

        // SAFETY: single consumer per the caller contract.
        Some(unsafe { Box::from_raw(entry) })
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.cons.head.load(Ordering::Acquire) == self.prod.tail.load(Ordering::Acquire)
    }

    /// Number of entries currently queued.
    #[inline]
    pub(crate) fn count(&self) -> u32 {
        self.prod
            .size
            .wrapping_add(self.prod.tail.load(Ordering::Acquire))
            .wrapping_sub(self.cons.tail.load(Ordering::Acquire))
            & self.prod.mask
    }

    /// Number of rejected pushes since creation.
    #[allow(dead_code)]
    pub(crate) fn drops(&self) -> u64 {
        self.prod.drops.load(Ordering::Relaxed)
    }
}

impl<T> Drop for AtomicQueue<T> {
    fn drop(&mut self) {
        while self.pop_mc().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_push_pop_order() {
        let queue = AtomicQueue::new(16);
        for i in 0..15u32 {
            queue.push(Box::new(i)).unwrap();
        }
        assert_eq!(queue.count(), 15);
        // One slot stays free: the 16th push must fail.
        assert!(queue.push(Box::new(15u32)).is_err());
        assert_eq!(queue.drops(), 1);

        for i in 0..15u32 {
            assert_eq!(*queue.pop_mc().unwrap(), i);
        }
        assert!(queue.pop_mc().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_single_consumer_path() {
        let queue = AtomicQueue::new(8);
        queue.push(Box::new(41u64)).unwrap();
        queue.push(Box::new(42u64)).unwrap();
        // SAFETY: no concurrent consumers in this test.
        unsafe {
            assert_eq!(*queue.pop_sc().unwrap(), 41);
            assert_eq!(*queue.pop_sc().unwrap(), 42);
            assert!(queue.pop_sc().is_none());
        }
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        const PER_THREAD: usize = 20_000;
        let queue = Arc::new(AtomicQueue::new(1024));
        let sum = Arc::new(AtomicU64::new(0));
        let popped = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_THREAD as u64 {
                    let mut entry = Box::new(t * PER_THREAD as u64 + i + 1);
                    loop {
                        match queue.push(entry) {
                            Ok(()) => break,
                            Err(e) => {
                                entry = e;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }
        for _ in 0..4 {
            let queue = queue.clone();
            let sum = sum.clone();
            let popped = popped.clone();
            handles.push(std::thread::spawn(move || loop {
                if let Some(v) = queue.pop_mc() {
                    sum.fetch_add(*v, Ordering::Relaxed);
                    if popped.fetch_add(1, Ordering::Relaxed) + 1 == (4 * PER_THREAD) as u64 {
                        break;
                    }
                } else if popped.load(Ordering::Relaxed) == (4 * PER_THREAD) as u64 {
                    break;
                } else {
                    std::thread::yield_now();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let n = (4 * PER_THREAD) as u64;
        assert_eq!(sum.load(Ordering::Relaxed), n * (n + 1) / 2);
    }
}
