use crate::arena::ArenaControl;
use crate::dispatcher::Ticket;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Per-arena record owned by the market.
///
/// This is the only place arena-specific state lives inside the market;
/// the arena itself stays an opaque collaborator behind [`ArenaControl`].
/// Demand bookkeeping is mutated exclusively under the arenas-list lock;
/// the atomics exist so readers outside the lock (the arena, tests) can
/// take snapshots.
#[derive(Debug)]
pub struct Client {
    arena: Arc<dyn ArenaControl>,

    ticket: Ticket,

    /// Demand this arena currently advertises. Only mutated through
    /// `update_request` under the arenas-list lock.
    num_workers_requested: AtomicI64,

    /// Outstanding mandatory requests from the arena. Only the 0->1 and
    /// 1->0 transitions reach the global totals.
    mandatory_requests: AtomicU32,

    /// Last allotment the engine computed for this arena.
    num_workers_allotted: AtomicUsize,

    /// The arena needs one worker despite a zero soft limit.
    global_concurrency_mode: AtomicBool,

    /// Set iff this client sits in the highest non-empty priority list.
    is_top_priority: AtomicBool,

    /// FIFO serialization of this client's dispatcher updates: a slot in
    /// the queue is claimed under the arenas-list lock, the dispatcher
    /// call happens outside it, in slot order.
    target_epoch: AtomicU64,
    gate: EpochGate,
}

impl Client {
    pub(crate) fn new(arena: Arc<dyn ArenaControl>) -> Arc<Self> {
        Arc::new(Self {
            arena,
            ticket: Ticket::next(),
            num_workers_requested: AtomicI64::new(0),
            mandatory_requests: AtomicU32::new(0),
            num_workers_allotted: AtomicUsize::new(0),
            global_concurrency_mode: AtomicBool::new(false),
            is_top_priority: AtomicBool::new(false),
            target_epoch: AtomicU64::new(0),
            gate: EpochGate::new(),
        })
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn priority_level(&self) -> usize {
        self.arena.priority_level()
    }

    pub fn aba_epoch(&self) -> u64 {
        self.arena.aba_epoch()
    }

    pub(crate) fn references(&self) -> usize {
        self.arena.references()
    }

    pub(crate) fn has_enqueued_tasks(&self) -> bool {
        self.arena.has_enqueued_tasks()
    }

    pub fn num_workers_requested(&self) -> i64 {
        self.num_workers_requested.load(Ordering::Relaxed)
    }

    pub fn num_workers_allotted(&self) -> usize {
        self.num_workers_allotted.load(Ordering::Relaxed)
    }

    pub fn is_top_priority(&self) -> bool {
        self.is_top_priority.load(Ordering::Relaxed)
    }

    pub fn global_concurrency_mode(&self) -> bool {
        self.global_concurrency_mode.load(Ordering::Acquire)
    }

    pub(crate) fn set_global_concurrency_mode(&self, on: bool) {
        self.global_concurrency_mode.store(on, Ordering::Release);
    }

    /// Fold a demand change into this client's bookkeeping and return the
    /// net change to apply to the global totals. Mandatory deltas are
    /// unit-sized and redundant ones (a second mandatory request while one
    /// is already outstanding, or a release that still leaves requests
    /// outstanding) are absorbed here, yielding zero.
    pub(crate) fn update_request(&self, delta: i64, mandatory: bool) -> i64 {
        let delta = if mandatory {
            debug_assert!(delta == 1 || delta == -1, "mandatory deltas are unit-sized");
            if delta > 0 {
                if self.mandatory_requests.fetch_add(1, Ordering::Relaxed) > 0 {
                    0
                } else {
                    1
                }
            } else {
                let prev = self.mandatory_requests.fetch_sub(1, Ordering::Relaxed);
                debug_assert!(prev > 0, "mandatory release without a matching request");
                if prev > 1 { 0 } else { -1 }
            }
        } else {
            delta
        };

        if delta != 0 {
            self.num_workers_requested.fetch_add(delta, Ordering::Relaxed);
        }
        delta
    }

    pub(crate) fn set_allotment(&self, allotted: usize) {
        self.num_workers_allotted.store(allotted, Ordering::Relaxed);
    }

    pub(crate) fn set_top_priority(&self, top: bool) {
        self.is_top_priority.store(top, Ordering::Relaxed);
    }

    /// Exchange the arena's published allotment with the last computed
    /// one. The arena observes the delta and wakes or releases slots.
    pub(crate) fn update_allotment(&self) {
        let _prev = self
            .arena
            .exchange_allotment(self.num_workers_allotted.load(Ordering::Relaxed));
    }

    /// Claim the next slot in this client's dispatcher-update queue.
    /// Must be called under the arenas-list lock.
    pub(crate) fn next_target_epoch(&self) -> u64 {
        self.target_epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// Block until all earlier slots have finished their dispatcher call.
    pub(crate) fn wait_for_epoch(&self, target: u64) {
        self.gate.wait_until(target);
    }

    /// Hand the queue over to the next slot.
    pub(crate) fn publish_epoch(&self, next: u64) {
        self.gate.advance_to(next);
    }
}

#[derive(Debug)]
struct EpochGate {
    current: Mutex<u64>,
    advanced: Condvar,
}

impl EpochGate {
    fn new() -> Self {
        Self {
            current: Mutex::new(0),
            advanced: Condvar::new(),
        }
    }

    fn wait_until(&self, target: u64) {
        let mut current = self.current.lock();
        while *current != target {
            self.advanced.wait(&mut current);
        }
    }

    fn advance_to(&self, next: u64) {
        let mut current = self.current.lock();
        debug_assert!(*current < next, "epoch can only move forward");
        *current = next;
        drop(current);
        self.advanced.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockArena;
    use static_assertions::assert_impl_all;
    use std::thread;

    assert_impl_all!(Client: Send, Sync);

    #[test]
    fn test_update_request_plain_deltas_pass_through() {
        let client = Client::new(MockArena::new(1));

        assert_eq!(client.update_request(3, false), 3);
        assert_eq!(client.num_workers_requested(), 3);

        assert_eq!(client.update_request(-2, false), -2);
        assert_eq!(client.num_workers_requested(), 1);
    }

    #[test]
    fn test_update_request_absorbs_redundant_mandatory() {
        let client = Client::new(MockArena::new(0));

        // Only the first request and the last release are visible.
        assert_eq!(client.update_request(1, true), 1);
        assert_eq!(client.update_request(1, true), 0);
        assert_eq!(client.update_request(1, true), 0);
        assert_eq!(client.num_workers_requested(), 1);

        assert_eq!(client.update_request(-1, true), 0);
        assert_eq!(client.update_request(-1, true), 0);
        assert_eq!(client.update_request(-1, true), -1);
        assert_eq!(client.num_workers_requested(), 0);
    }

    #[test]
    fn test_update_allotment_publishes_to_arena() {
        let arena = MockArena::new(2);
        let client = Client::new(arena.clone());

        client.set_allotment(4);
        client.update_allotment();
        assert_eq!(arena.published_allotment(), 4);
    }

    #[test]
    fn test_epoch_gate_orders_waiters() {
        let client = Client::new(MockArena::new(0));
        let first = client.next_target_epoch();
        let second = client.next_target_epoch();
        assert_eq!((first, second), (0, 1));

        let waiter = {
            let client = client.clone();
            thread::spawn(move || {
                client.wait_for_epoch(1);
                client.publish_epoch(2);
            })
        };

        // The waiter can only get through once slot 0 publishes.
        client.wait_for_epoch(0);
        client.publish_epoch(1);
        waiter.join().unwrap();

        assert_eq!(client.next_target_epoch(), 2);
    }
}
