/// Page-aligned, huge-page and shared-memory allocation helpers.
pub(crate) mod mem;

/// Lock-free multi-producer multi-consumer ring.
pub(crate) mod queue;

/// Spin locks, including a raw variant usable in shared memory.
pub(crate) mod spin;
