use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32};

/// Shared state of one task group, broadcast to every thread that may hold
/// a snapshot of it.
#[derive(Debug, Default)]
pub struct TaskGroupContext {
    /// Fast-reject gate for propagation: until the group has forked at
    /// least once, no other thread can hold a stale copy of its state.
    pub may_have_children: AtomicBool,

    pub cancellation_requested: AtomicU32,
}

/// Selects which state word of a [`TaskGroupContext`] is being propagated.
///
/// A plain accessor keeps the broadcast generic over context fields the
/// same way a pointer-to-member would.
pub type GroupStateField = fn(&TaskGroupContext) -> &AtomicU32;

/// A thread record registered for task-group state broadcasts: either a
/// worker the dispatcher has spun up, or an external thread.
///
/// Recipients update their local copy of the state and sync their local
/// propagation epoch; the market only guarantees the broadcast itself is
/// not interleaved with another one.
pub trait ThreadContext: Send + Sync + fmt::Debug {
    fn propagate_group_state(&self, field: GroupStateField, src: &TaskGroupContext, new_state: u32);
}
