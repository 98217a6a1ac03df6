//! Lock-free rings living inside the shared region.
//!
//! Same `buf_ring` discipline as [`crate::util::queue`], but the slots carry
//! 64-bit values instead of pointers and the whole structure must be valid
//! when zero-initialized, since region memory is never constructed in place:
//! a fresh mapping is all zeroes and both processes just cast to the struct.

use std::hint;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use crate::op::{OpKind, Tag};

#[repr(C, align(64))]
struct ProdSide {
    head: AtomicU32,
    tail: AtomicU32,
    drops: AtomicU64,
}

#[repr(C, align(64))]
struct ConsSide {
    head: AtomicU32,
    tail: AtomicU32,
}

#[repr(C, align(64))]
struct Slots<const N: usize>([AtomicU64; N]);

/// Fixed-capacity MPMC ring of 64-bit payloads.
///
/// `N` must be a power of two; the ring holds at most `N - 1` entries.
/// Producer and consumer sides sit on distinct cache lines.
#[repr(C)]
pub(crate) struct SharedRing<const N: usize> {
    prod: ProdSide,
    cons: ConsSide,
    ring: Slots<N>,
}

impl<const N: usize> SharedRing<N> {
    const MASK: u32 = (N - 1) as u32;

    /// Enqueue a value; `false` when the ring is full.
    pub(crate) fn push(&self, value: u64) -> bool {
        const { assert!(N.is_power_of_two()) };
        let mut prod_head;
        let mut prod_next;
        loop {
            prod_head = self.prod.head.load(Ordering::Acquire);
            prod_next = (prod_head + 1) & Self::MASK;
            let cons_tail = self.cons.tail.load(Ordering::Acquire);

            if prod_next == cons_tail {
                fence(Ordering::SeqCst);
                if prod_head == self.prod.head.load(Ordering::Acquire)
                    && cons_tail == self.cons.tail.load(Ordering::Acquire)
                {
                    self.prod.drops.fetch_add(1, Ordering::Relaxed);
                    return false;
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

        self.ring.0[prod_head as usize].store(value, Ordering::Relaxed);

        while self.prod.tail.load(Ordering::Acquire) != prod_head {
            hint::spin_loop();
        }
        self.prod.tail.store(prod_next, Ordering::Release);

        true
    }

    /// Dequeue a value, multi-consumer safe.
    pub(crate) fn pop(&self) -> Option<u64> {
        let mut cons_head;
        let mut cons_next;
        loop {
            cons_head = self.cons.head.load(Ordering::Acquire);
            cons_next = (cons_head + 1) & Self::MASK;

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

        let value = self.ring.0[cons_head as usize].load(Ordering::Relaxed);

        while self.cons.tail.load(Ordering::Acquire) != cons_head {
            hint::spin_loop();
        }
        self.cons.tail.store(cons_next, Ordering::Release);

        Some(value)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cons.head.load(Ordering::Acquire) == self.prod.tail.load(Ordering::Acquire)
    }
}

/// Message kind carried in a message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MsgKind {
    Unexpected = 1,
    Expected = 2,
}

impl MsgKind {
    pub(crate) fn from_op_kind(kind: OpKind) -> Option<Self> {
        match kind {
            OpKind::SendUnexpected => Some(MsgKind::Unexpected),
            OpKind::SendExpected => Some(MsgKind::Expected),
            _ => None,
        }
    }
}

/// Message header exchanged through a queue pair.
///
/// Packed into one little-endian 64-bit slot:
/// `{tag:32, buf_size:16, buf_idx:8, kind:8}`, tag in the low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MsgHdr {
    pub(crate) tag: Tag,
    pub(crate) buf_size: u16,
    pub(crate) buf_idx: u8,
    pub(crate) kind: MsgKind,
}

impl MsgHdr {
    pub(crate) fn to_raw(self) -> u64 {
        u64::from(self.tag)
            | u64::from(self.buf_size) << 32
            | u64::from(self.buf_idx) << 48
            | (self.kind as u64) << 56
    }

    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        let kind = match (raw >> 56) as u8 {
            1 => MsgKind::Unexpected,
            2 => MsgKind::Expected,
            _ => return None,
        };
        Some(Self {
            tag: raw as u32,
            buf_size: (raw >> 32) as u16,
            buf_idx: (raw >> 48) as u8,
            kind,
        })
    }
}

/// Out-of-band address-control command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmdKind {
    Reserved = 1,
    Released = 2,
}

/// Command header pushed through a region's command ring or sent over the
/// control socket.
///
/// Packed into one little-endian 64-bit slot:
/// `{pid:32, id:8, pair_idx:8, kind:8, pad:8}`, pid in the low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CmdHdr {
    pub(crate) pid: i32,
    pub(crate) id: u8,
    pub(crate) pair_idx: u8,
    pub(crate) kind: CmdKind,
}

impl CmdHdr {
    pub(crate) fn to_raw(self) -> u64 {
        u64::from(self.pid as u32)
            | u64::from(self.id) << 32
            | u64::from(self.pair_idx) << 40
            | (self.kind as u64) << 48
    }

    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        let kind = match (raw >> 48) as u8 {
            1 => CmdKind::Reserved,
            2 => CmdKind::Released,
            _ => return None,
        };
        Some(Self {
            pid: raw as u32 as i32,
            id: (raw >> 32) as u8,
            pair_idx: (raw >> 40) as u8,
            kind,
        })
    }
}
