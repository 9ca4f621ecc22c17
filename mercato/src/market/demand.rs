use crate::market::client::Client;
use crate::market::{PRIORITY_LEVELS, SPILL_TO_HEAP_THRESHOLD};
use smallvec::SmallVec;
use std::sync::Arc;

/// Ordered set of clients at one priority level. Insertion is push-front;
/// iteration order within a level is unspecified but stable between
/// mutations, which is what makes the allotment engine deterministic.
#[derive(Debug, Default)]
pub(crate) struct ClientList(Vec<Arc<Client>>);

impl ClientList {
    pub(crate) fn push_front(&mut self, client: Arc<Client>) {
        self.0.insert(0, client);
    }

    /// Unlink `client`, returning whether it was present.
    pub(crate) fn remove(&mut self, client: &Arc<Client>) -> bool {
        match self.0.iter().position(|c| Arc::ptr_eq(c, client)) {
            Some(idx) => {
                self.0.remove(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, client: &Arc<Client>) -> bool {
        self.0.iter().any(|c| Arc::ptr_eq(c, client))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Client>> {
        self.0.iter()
    }
}

/// Everything the arenas-list lock guards: the priority lists, the demand
/// totals, the last worker request, and the mandatory set. Keeping it all
/// behind one `Mutex` makes the lock the single writer, so the allotment
/// engine always observes a consistent snapshot.
#[derive(Debug, Default)]
pub(crate) struct DemandState {
    /// Clients grouped by priority, index 0 = highest.
    pub(crate) arenas: [ClientList; PRIORITY_LEVELS],

    /// Sum of demand over all clients.
    pub(crate) total_demand: i64,

    /// Per-priority demand totals.
    pub(crate) priority_demand: [i64; PRIORITY_LEVELS],

    /// Last value sent to the dispatcher. Never exceeds the effective
    /// soft limit.
    pub(crate) workers_requested: i64,

    /// Number of clients currently in mandatory-concurrency mode.
    pub(crate) mandatory_num_requested: u32,
}

impl DemandState {
    pub(crate) fn insert(&mut self, client: Arc<Client>) {
        let level = client.priority_level();
        assert!(level < PRIORITY_LEVELS, "priority level out of range");
        self.arenas[level].push_front(client);
    }

    pub(crate) fn unlink(&mut self, client: &Arc<Client>) {
        let removed = self.arenas[client.priority_level()].remove(client);
        debug_assert!(removed, "client is not in its priority list");
    }

    pub(crate) fn contains(&self, client: &Arc<Client>) -> bool {
        self.arenas.iter().any(|list| list.contains(client))
    }

    /// Both halves of the mandatory toggle must run under the arenas lock.
    pub(crate) fn enable_mandatory(&mut self, client: &Client) {
        debug_assert!(
            !client.global_concurrency_mode(),
            "mandatory mode already enabled"
        );
        client.set_global_concurrency_mode(true);
        self.mandatory_num_requested += 1;
    }

    pub(crate) fn disable_mandatory(&mut self, client: &Client) {
        debug_assert!(client.global_concurrency_mode(), "mandatory mode not enabled");
        debug_assert!(self.mandatory_num_requested > 0, "mandatory counter underflow");
        client.set_global_concurrency_mode(false);
        self.mandatory_num_requested -= 1;
    }

    /// The worker budget the policy allows right now: the soft limit,
    /// except that a non-empty mandatory set pins it to exactly one.
    pub(crate) fn effective_soft_limit(&self, soft_limit: usize) -> i64 {
        if self.mandatory_num_requested > 0 {
            debug_assert_eq!(soft_limit, 0, "mandatory mode implies a zero soft limit");
            1
        } else {
            soft_limit as i64
        }
    }

    /// Recompute `workers_requested` against the current soft limit, rerun
    /// the allotment engine, and return the delta to forward to the
    /// dispatcher (outside the lock).
    pub(crate) fn update_workers_request(&mut self, soft_limit: usize) -> i64 {
        let old_request = self.workers_requested;
        self.workers_requested = self.total_demand.min(soft_limit as i64);
        if self.mandatory_num_requested > 0 {
            debug_assert_eq!(soft_limit, 0, "mandatory mode implies a zero soft limit");
            self.workers_requested = 1;
        }
        self.update_allotment(self.workers_requested, soft_limit == 0);
        self.workers_requested - old_request
    }

    /// Snapshot the clients matching `pred` so the caller can toggle them
    /// without holding a borrow on the lists.
    pub(crate) fn collect_clients<F>(&self, pred: F) -> SmallVec<[Arc<Client>; SPILL_TO_HEAP_THRESHOLD]>
    where
        F: Fn(&Client) -> bool,
    {
        self.arenas
            .iter()
            .flat_map(|list| list.iter())
            .filter(|c| pred(c))
            .cloned()
            .collect()
    }
}
