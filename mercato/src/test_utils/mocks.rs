use crate::arena::ArenaControl;
use crate::context::{GroupStateField, TaskGroupContext, ThreadContext};
use crate::dispatcher::{Dispatcher, Ticket};
use crate::env::Environment;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    AdjustJobCount,
    SetJoinWorkers,
    CloseConnection,
    InsertTicket,
    RemoveTicket,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    AdjustJobCount { delta: i64 },
    SetJoinWorkers { join: bool },
    CloseConnection,
    InsertTicket { ticket: Ticket },
    RemoveTicket { ticket: Ticket },
}

/// Records every dispatcher call so tests can assert on exact sequences.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        map.insert(Method::AdjustJobCount, Vec::new());
        map.insert(Method::SetJoinWorkers, Vec::new());
        map.insert(Method::CloseConnection, Vec::new());
        map.insert(Method::InsertTicket, Vec::new());
        map.insert(Method::RemoveTicket, Vec::new());

        Self {
            calls: Arc::new(map),
        }
    }

    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls
            .get_mut(&method)
            .expect("method not found")
            .push(call)
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .expect("method not found")
            .value()
            .clone()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }

    /// Net worker count the dispatcher has been asked for so far.
    pub(crate) fn job_count(&self) -> i64 {
        self.get_calls(&Method::AdjustJobCount)
            .iter()
            .map(|call| match call {
                Call::AdjustJobCount { delta } => *delta,
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockDispatcher {
    default_concurrency: usize,
    pub(crate) tracker: Tracker,
}

impl MockDispatcher {
    pub(crate) fn new(default_concurrency: usize, tracker: Tracker) -> Self {
        Self {
            default_concurrency,
            tracker,
        }
    }
}

impl Dispatcher for MockDispatcher {
    fn default_concurrency(&self) -> usize {
        self.default_concurrency
    }

    fn adjust_job_count_estimate(&self, delta: i64) {
        self.tracker
            .record(Method::AdjustJobCount, Call::AdjustJobCount { delta });
    }

    fn set_join_workers(&self, join: bool) {
        self.tracker
            .record(Method::SetJoinWorkers, Call::SetJoinWorkers { join });
    }

    fn request_close_connection(&self) {
        self.tracker.record(Method::CloseConnection, Call::CloseConnection);
    }

    fn insert_ticket(&self, ticket: Ticket) {
        self.tracker
            .record(Method::InsertTicket, Call::InsertTicket { ticket });
    }

    fn remove_ticket(&self, ticket: Ticket) {
        self.tracker
            .record(Method::RemoveTicket, Call::RemoveTicket { ticket });
    }
}

/// Arena stand-in with settable state, so tests can steer the read-only
/// view the market consumes.
#[derive(Debug)]
pub(crate) struct MockArena {
    priority_level: usize,
    aba_epoch: AtomicU64,
    references: AtomicUsize,
    enqueued_tasks: AtomicBool,
    allotment: AtomicUsize,
}

impl MockArena {
    pub(crate) fn new(priority_level: usize) -> Arc<Self> {
        Arc::new(Self {
            priority_level,
            aba_epoch: AtomicU64::new(0),
            references: AtomicUsize::new(0),
            enqueued_tasks: AtomicBool::new(false),
            allotment: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_aba_epoch(&self, epoch: u64) {
        self.aba_epoch.store(epoch, Ordering::Relaxed);
    }

    pub(crate) fn set_references(&self, references: usize) {
        self.references.store(references, Ordering::Relaxed);
    }

    pub(crate) fn set_enqueued_tasks(&self, enqueued: bool) {
        self.enqueued_tasks.store(enqueued, Ordering::Relaxed);
    }

    pub(crate) fn published_allotment(&self) -> usize {
        self.allotment.load(Ordering::Relaxed)
    }
}

impl ArenaControl for MockArena {
    fn priority_level(&self) -> usize {
        self.priority_level
    }

    fn aba_epoch(&self) -> u64 {
        self.aba_epoch.load(Ordering::Relaxed)
    }

    fn references(&self) -> usize {
        self.references.load(Ordering::Relaxed)
    }

    fn has_enqueued_tasks(&self) -> bool {
        self.enqueued_tasks.load(Ordering::Relaxed)
    }

    fn exchange_allotment(&self, allotted: usize) -> usize {
        self.allotment.swap(allotted, Ordering::Relaxed)
    }
}

/// Broadcast recipient that logs every state it receives.
#[derive(Debug, Default)]
pub(crate) struct MockThreadContext {
    received: Mutex<Vec<u32>>,
}

impl MockThreadContext {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn received(&self) -> Vec<u32> {
        self.received.lock().clone()
    }
}

impl ThreadContext for MockThreadContext {
    fn propagate_group_state(
        &self,
        _field: GroupStateField,
        _src: &TaskGroupContext,
        new_state: u32,
    ) {
        self.received.lock().push(new_state);
    }
}

/// Deterministic environment so tests control every policy input.
#[derive(Debug, Clone)]
pub(crate) struct FixedEnvironment {
    default_num_threads: usize,
    app_parallelism_limit: Arc<AtomicUsize>,
    stack_size: usize,
}

impl FixedEnvironment {
    pub(crate) fn new(default_num_threads: usize) -> Self {
        Self {
            default_num_threads,
            app_parallelism_limit: Arc::new(AtomicUsize::new(0)),
            stack_size: 1 << 20,
        }
    }

    pub(crate) fn with_app_parallelism_limit(self, limit: usize) -> Self {
        self.app_parallelism_limit.store(limit, Ordering::Relaxed);
        self
    }
}

impl Environment for FixedEnvironment {
    fn default_num_threads(&self) -> usize {
        self.default_num_threads
    }

    fn app_parallelism_limit(&self) -> usize {
        self.app_parallelism_limit.load(Ordering::Relaxed)
    }

    fn default_thread_stack_size(&self) -> usize {
        self.stack_size
    }
}
