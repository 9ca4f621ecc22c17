use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

/// Opaque token identifying a client to the dispatcher. The market hands
/// one ticket per client to the dispatcher at registration; the dispatcher
/// uses it to distribute arriving workers across arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

impl Ticket {
    pub(crate) fn next() -> Ticket {
        Ticket(NEXT_TICKET.fetch_add(1, Ordering::Relaxed))
    }
}

/// Contract the market drives on the underlying worker pool.
///
/// Implementations must not call back into the market from any of these
/// methods. The market guarantees it never holds its arenas-list lock
/// across `adjust_job_count_estimate`, so a non-reentrant dispatcher
/// cannot deadlock against it.
pub trait Dispatcher: Send + Sync + fmt::Debug + 'static {
    /// Maximum concurrency the underlying pool can actually deliver.
    fn default_concurrency(&self) -> usize;

    /// Move the number of workers the pool should keep alive by `delta`.
    fn adjust_job_count_estimate(&self, delta: i64);

    /// Whether workers must be joined during connection close.
    fn set_join_workers(&self, join: bool);

    /// Tear down the pool connection. Called once, after the last market
    /// reference has been dropped. The dispatcher joins its workers (when
    /// asked to) and owns the rest of the teardown.
    fn request_close_connection(&self);

    /// Register a client ticket for worker distribution.
    fn insert_ticket(&self, ticket: Ticket);

    /// Deregister a client ticket. The client is being detached and will
    /// never receive workers again.
    fn remove_ticket(&self, ticket: Ticket);
}
