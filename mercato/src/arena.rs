use std::fmt;

/// Read-only view of an arena, consumed by the market.
///
/// The arena itself (task queues, slot table, stealing) is an opaque
/// collaborator; this is the slice of its state the permit accounting
/// needs.
pub trait ArenaControl: Send + Sync + fmt::Debug + 'static {
    /// Index of the priority list this arena belongs to, 0 = highest.
    /// Fixed for the lifetime of the arena.
    fn priority_level(&self) -> usize;

    /// Monotonic reuse counter of the arena slot. Lets the market reject
    /// a detach attempt against a slot that has been freed and reused.
    fn aba_epoch(&self) -> u64;

    /// Number of threads still referencing the arena.
    fn references(&self) -> usize;

    /// Whether the arena has tasks sitting in its injection queue.
    fn has_enqueued_tasks(&self) -> bool;

    /// Publish a new worker allotment, returning the previous one. The
    /// arena uses the delta to wake workers or release slots.
    fn exchange_allotment(&self, allotted: usize) -> usize;
}
