use crate::arena::ArenaControl;
use crate::context::{GroupStateField, TaskGroupContext, ThreadContext};
use crate::dispatcher::Dispatcher;
use crate::market::PRIORITY_LEVELS;
use crate::market::client::Client;
use crate::market::demand::DemandState;
use crate::market::propagation::{PropagationHub, WorkerTable};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// The permit market: the process-wide arbiter deciding how many workers
/// each live arena is entitled to run.
///
/// Three lock domains, never nested: the singleton slot (owned by
/// [`GlobalMarket`](crate::market::GlobalMarket)), the arenas-list lock
/// (`demand`), and the propagation mutex. Dispatcher deltas are computed
/// under the arenas lock but always forwarded after it is dropped, so the
/// dispatcher's own locks can never join a cycle with ours.
#[derive(Debug)]
pub struct Market {
    /// Absolute worker ceiling, immutable after construction.
    hard_limit: usize,

    /// Worker thread stack size, fixed at construction.
    stack_size: usize,

    /// Current policy cap on running workers.
    soft_limit: AtomicUsize,

    /// Soft limit as last reported to users. The sentinel arms the
    /// one-shot "request ignored" warning for the current epoch.
    pub(crate) soft_limit_to_report: AtomicUsize,

    /// Bumped when a live arena is detached, so a stale destroy attempt
    /// against a reused slot can be rejected.
    arenas_aba_epoch: AtomicU64,

    /// Total handles. Mutated only under the singleton-slot lock.
    pub(crate) ref_count: AtomicUsize,

    /// Handles held by external API consumers. Same locking as above.
    pub(crate) public_ref_count: AtomicUsize,

    /// Single writer for demand accounting, priority lists, allotments
    /// and the mandatory set.
    demand: Mutex<DemandState>,

    propagation: PropagationHub,

    workers: WorkerTable,

    pub(crate) dispatcher: Arc<dyn Dispatcher>,
}

impl Market {
    pub(crate) fn new(
        soft_limit: usize,
        hard_limit: usize,
        stack_size: usize,
        dispatcher: Arc<dyn Dispatcher>,
        is_public: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            hard_limit,
            stack_size,
            soft_limit: AtomicUsize::new(soft_limit),
            soft_limit_to_report: AtomicUsize::new(soft_limit),
            arenas_aba_epoch: AtomicU64::new(0),
            ref_count: AtomicUsize::new(1),
            public_ref_count: AtomicUsize::new(is_public as usize),
            demand: Mutex::new(DemandState::default()),
            propagation: PropagationHub::default(),
            workers: WorkerTable::new(hard_limit),
            dispatcher,
        })
    }

    pub fn num_workers_hard_limit(&self) -> usize {
        self.hard_limit
    }

    pub fn num_workers_soft_limit(&self) -> usize {
        self.soft_limit.load(Ordering::Relaxed)
    }

    pub fn worker_stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn arenas_aba_epoch(&self) -> u64 {
        self.arenas_aba_epoch.load(Ordering::Relaxed)
    }

    /// Register a new arena and hand back its client record. The ticket
    /// goes to the dispatcher under the same lock, so workers can never
    /// observe a client without a ticket.
    pub fn create_client(&self, arena: Arc<dyn ArenaControl>) -> Arc<Client> {
        let client = Client::new(arena);
        let mut demand = self.demand.lock();
        demand.insert(Arc::clone(&client));
        self.dispatcher.insert_ticket(client.ticket());
        drop(demand);
        client
    }

    /// Drop an already-detached client handle.
    pub fn destroy_client(&self, client: Arc<Client>) {
        debug_assert!(
            !self.demand.lock().contains(&client),
            "destroying a client still in a priority list"
        );
        drop(client);
    }

    /// Reserved for a range-constrained demand API.
    pub fn request_demand(&self, _min: usize, _max: usize, _client: &Arc<Client>) {}

    /// Reserved for a range-constrained demand API.
    pub fn release_demand(&self, _client: &Arc<Client>) {}

    /// Move an arena's demand by `delta`. This is the single entry point
    /// through which arenas request or release workers.
    ///
    /// The accounting runs under the arenas lock; the dispatcher update
    /// happens outside it, serialized per client in FIFO order by the
    /// epoch gate so a later adjustment can never overtake an earlier one.
    pub fn adjust_demand(&self, client: &Arc<Client>, delta: i64, mandatory: bool) {
        if delta == 0 {
            return;
        }

        let (delta, target_epoch) = {
            let mut demand = self.demand.lock();

            let delta = client.update_request(delta, mandatory);
            if delta == 0 {
                return;
            }

            demand.total_demand += delta;
            demand.priority_demand[client.priority_level()] += delta;

            let soft_limit = self.soft_limit.load(Ordering::Relaxed);
            let effective_soft_limit = demand.effective_soft_limit(soft_limit);

            demand.update_allotment(effective_soft_limit, soft_limit == 0);

            let mut delta = delta;
            if delta > 0 {
                // A request can't overflow the soft limit, but the excess
                // stays recorded in total_demand so workers are not
                // released back to the pool prematurely.
                if demand.workers_requested + delta > effective_soft_limit {
                    delta = effective_soft_limit - demand.workers_requested;
                }
            } else if demand.workers_requested + delta < demand.total_demand {
                // Releases must not drop the request below what other
                // arenas still collectively demand.
                delta = demand.total_demand.min(effective_soft_limit) - demand.workers_requested;
            }
            demand.workers_requested += delta;
            debug_assert!(
                demand.workers_requested <= effective_soft_limit,
                "worker request beyond the effective soft limit"
            );

            (delta, client.next_target_epoch())
        };

        client.wait_for_epoch(target_epoch);
        self.dispatcher.adjust_job_count_estimate(delta);
        client.publish_epoch(target_epoch + 1);
    }

    /// Grant an arena one worker despite a zero soft limit, so enqueued
    /// work keeps making progress.
    pub fn enable_mandatory_concurrency(&self, client: &Arc<Client>) {
        // Fast path: nothing to do unless parallelism is pinned to zero
        // and this arena is not already in the override set.
        if self.soft_limit.load(Ordering::Acquire) != 0 || client.global_concurrency_mode() {
            return;
        }

        let delta = {
            let mut demand = self.demand.lock();
            if self.soft_limit.load(Ordering::Relaxed) != 0 || client.global_concurrency_mode() {
                return;
            }

            demand.enable_mandatory(client);
            demand.update_workers_request(0)
        };

        if delta != 0 {
            self.dispatcher.adjust_job_count_estimate(delta);
        }
    }

    /// Take an arena out of the mandatory override once its enqueued work
    /// has drained.
    pub fn mandatory_concurrency_disable(&self, client: &Arc<Client>) {
        if !client.global_concurrency_mode() {
            return;
        }

        let delta = {
            let mut demand = self.demand.lock();
            if !client.global_concurrency_mode() {
                return;
            }
            // advertise_new_work can race this request: enabling the
            // override and publishing the enqueued work are not one step.
            // Re-check under the lock; an arena with enqueued tasks keeps
            // its permit.
            if client.has_enqueued_tasks() {
                return;
            }

            let soft_limit = self.soft_limit.load(Ordering::Relaxed);
            debug_assert_eq!(soft_limit, 0, "mandatory mode implies a zero soft limit");
            demand.disable_mandatory(client);
            demand.update_workers_request(soft_limit)
        };

        if delta != 0 {
            self.dispatcher.adjust_job_count_estimate(delta);
        }
    }

    /// Apply a new soft limit and rebalance. Transitions in and out of
    /// zero also flip the mandatory override: leaving zero clears it on
    /// every client, entering zero arms it for every arena that still has
    /// enqueued work.
    pub(crate) fn set_active_num_workers(&self, soft_limit: usize) {
        debug_assert!(
            soft_limit <= self.hard_limit,
            "soft limit beyond the hard limit"
        );

        let delta = {
            let mut demand = self.demand.lock();

            if self.soft_limit.load(Ordering::Relaxed) == 0 && demand.mandatory_num_requested > 0 {
                for client in demand.collect_clients(|c| c.global_concurrency_mode()) {
                    demand.disable_mandatory(&client);
                }
            }
            debug_assert_eq!(demand.mandatory_num_requested, 0, "mandatory set not drained");

            self.soft_limit.store(soft_limit, Ordering::Release);
            // Report once per soft-limit epoch.
            self.soft_limit_to_report.store(soft_limit, Ordering::Relaxed);

            if soft_limit == 0 {
                for client in demand.collect_clients(|c| c.has_enqueued_tasks()) {
                    demand.enable_mandatory(&client);
                }
            }

            demand.update_workers_request(soft_limit)
        };

        if delta != 0 {
            self.dispatcher.adjust_job_count_estimate(delta);
        }
    }

    /// Race a destroy attempt against concurrent stealers. Succeeds only
    /// when the client is still the one the caller snapshot (same slot,
    /// same ABA epoch) and nothing references the arena anymore. On
    /// success the client is detached and the caller owns freeing the
    /// arena; the lock is released before returning.
    pub fn try_destroy_arena(
        &self,
        client: &Arc<Client>,
        aba_epoch: u64,
        priority_level: usize,
    ) -> bool {
        assert!(priority_level < PRIORITY_LEVELS, "priority level out of range");
        let mut demand = self.demand.lock();

        if !demand.arenas[priority_level].contains(client) {
            return false;
        }
        if client.aba_epoch() != aba_epoch {
            // The slot was freed and reused since the caller looked.
            return false;
        }
        if client.num_workers_requested() != 0 || client.references() != 0 {
            return false;
        }

        self.detach_arena(&mut demand, client);
        true
    }

    /// Must be called with the arenas lock held.
    fn detach_arena(&self, demand: &mut DemandState, client: &Arc<Client>) {
        if client.global_concurrency_mode() {
            demand.disable_mandatory(client);
        }

        demand.unlink(client);
        self.dispatcher.remove_ticket(client.ticket());

        if client.aba_epoch() == self.arenas_aba_epoch.load(Ordering::Relaxed) {
            self.arenas_aba_epoch.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Broadcast a task-group state change to every worker and external
    /// thread. Returns false when a concurrent state change won the race;
    /// the caller backs off.
    pub fn propagate_task_group_state(
        &self,
        field: GroupStateField,
        src: &TaskGroupContext,
        new_state: u32,
    ) -> bool {
        if !src.may_have_children.load(Ordering::Relaxed) {
            // Nobody can hold a stale copy yet.
            return true;
        }
        self.propagation.broadcast(&self.workers, field, src, new_state)
    }

    pub fn add_external_thread(&self, td: Arc<dyn ThreadContext>) {
        self.propagation.add_external_thread(td);
    }

    pub fn remove_external_thread(&self, td: &Arc<dyn ThreadContext>) {
        self.propagation.remove_external_thread(td);
    }

    /// Called by the dispatcher as a worker spins up and claims its slot.
    pub fn register_worker(&self, index: usize, td: Arc<dyn ThreadContext>) {
        self.workers.register(index, td);
    }

    pub fn unregister_worker(&self, index: usize) {
        self.workers.unregister(index);
    }
}

// Test-only introspection helpers.
#[cfg(test)]
impl Market {
    pub(crate) fn with_demand<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&DemandState) -> R,
    {
        f(&self.demand.lock())
    }

    pub(crate) fn worker_slot_count(&self) -> usize {
        self.workers.len()
    }
}
