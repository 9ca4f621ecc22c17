use crate::context::{GroupStateField, TaskGroupContext, ThreadContext};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Broadcast domain for task-group state changes: one mutex over the
/// propagation epoch and the external-thread list. Holding it across the
/// whole broadcast keeps concurrent broadcasts from interleaving partial
/// updates into the context tree.
#[derive(Debug, Default)]
pub(crate) struct PropagationHub {
    state: Mutex<PropagationState>,
}

#[derive(Debug, Default)]
struct PropagationState {
    /// Bumped on every broadcast; recipients sync their local epoch to it
    /// so they can skip stale updates.
    epoch: u64,

    /// External threads registered for broadcasts, most recent first.
    masters: Vec<Arc<dyn ThreadContext>>,
}

impl PropagationHub {
    pub(crate) fn add_external_thread(&self, td: Arc<dyn ThreadContext>) {
        self.state.lock().masters.insert(0, td);
    }

    pub(crate) fn remove_external_thread(&self, td: &Arc<dyn ThreadContext>) {
        let mut state = self.state.lock();
        let idx = state
            .masters
            .iter()
            .position(|m| Arc::ptr_eq(m, td))
            .expect("external thread not registered");
        state.masters.remove(idx);
    }

    /// Deliver `new_state` to every live worker and every external thread.
    /// Returns false when another thread concurrently changed the source
    /// field; the caller backs off and retries.
    pub(crate) fn broadcast(
        &self,
        workers: &WorkerTable,
        field: GroupStateField,
        src: &TaskGroupContext,
        new_state: u32,
    ) -> bool {
        let mut state = self.state.lock();
        if field(src).load(Ordering::Relaxed) != new_state {
            return false;
        }

        state.epoch += 1;
        workers.for_each_live(|td| td.propagate_group_state(field, src, new_state));
        for td in &state.masters {
            td.propagate_group_state(field, src, new_state);
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }
}

/// Fixed-size table of worker records, one slot per potential worker up to
/// the hard limit. The dispatcher fills slots as workers spin up; the
/// broadcaster only walks slots below the high-water mark, skipping
/// workers that are still registering.
#[derive(Debug)]
pub(crate) struct WorkerTable {
    slots: RwLock<Vec<Option<Arc<dyn ThreadContext>>>>,

    /// High-water mark of slots the dispatcher has handed out so far.
    first_unused_idx: AtomicUsize,
}

impl WorkerTable {
    pub(crate) fn new(hard_limit: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; hard_limit]),
            first_unused_idx: AtomicUsize::new(0),
        }
    }

    #[track_caller]
    pub(crate) fn register(&self, index: usize, td: Arc<dyn ThreadContext>) {
        let mut slots = self.slots.write();
        assert!(index < slots.len(), "worker index beyond the hard limit");
        assert!(slots[index].is_none(), "worker slot already occupied");
        slots[index] = Some(td);
        self.first_unused_idx.fetch_max(index + 1, Ordering::Release);
    }

    #[track_caller]
    pub(crate) fn unregister(&self, index: usize) {
        let mut slots = self.slots.write();
        assert!(slots[index].take().is_some(), "worker slot already empty");
    }

    fn for_each_live<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<dyn ThreadContext>),
    {
        let slots = self.slots.read();
        let bound = self.first_unused_idx.load(Ordering::Acquire).min(slots.len());
        for td in slots[..bound].iter().flatten() {
            f(td);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.read().len()
    }
}
