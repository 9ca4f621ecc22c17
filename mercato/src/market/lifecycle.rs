use crate::dispatcher::Dispatcher;
use crate::env::{Environment, OsEnvironment};
use crate::market::market::Market;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

/// The market guarantees that at least this many workers might be created,
/// however small the machine.
const HARD_LIMIT_FLOOR: usize = 256;

/// Sentinel stored in `soft_limit_to_report` once the "request ignored"
/// warning has fired for the current soft-limit epoch. Must be larger than
/// any valid worker request.
const SKIP_SOFT_LIMIT_WARNING: usize = usize::MAX;

/// Everything needed to build the dispatcher alongside the market.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherParams {
    pub hard_limit: usize,
    pub stack_size: usize,
}

pub type DispatcherFactory = Box<dyn Fn(&DispatcherParams) -> Arc<dyn Dispatcher> + Send + Sync>;

/// Builds a [`GlobalMarket`] controller.
///
/// The dispatcher factory is mandatory; the environment defaults to the
/// OS-backed one.
pub struct MarketBuilder {
    env: Arc<dyn Environment>,
    dispatcher_factory: Option<DispatcherFactory>,
}

impl MarketBuilder {
    fn new() -> Self {
        Self {
            env: Arc::new(OsEnvironment),
            dispatcher_factory: None,
        }
    }

    pub fn environment(mut self, env: impl Environment) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Sets the factory invoked once, when the first acquire creates the
    /// market, to build the worker-pool dispatcher.
    pub fn dispatcher_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&DispatcherParams) -> Arc<dyn Dispatcher> + Send + Sync + 'static,
    {
        self.dispatcher_factory = Some(Box::new(factory));
        self
    }

    pub fn try_build(self) -> Result<GlobalMarket> {
        let dispatcher_factory = self
            .dispatcher_factory
            .ok_or_else(|| anyhow!("a dispatcher factory is required to build a market"))?;

        Ok(GlobalMarket(Arc::new(GlobalMarketInner {
            env: self.env,
            dispatcher_factory,
            slot: Mutex::new(None),
        })))
    }
}

/// The singleton controller: owns the market slot and runs the
/// reference-counted lifecycle protocol. The embedding runtime holds
/// exactly one of these; clones share the same slot.
#[derive(Clone)]
pub struct GlobalMarket(Arc<GlobalMarketInner>);

struct GlobalMarketInner {
    env: Arc<dyn Environment>,
    dispatcher_factory: DispatcherFactory,

    /// Guards market creation/destruction and the reference counts.
    slot: Mutex<Option<Arc<Market>>>,
}

impl fmt::Debug for GlobalMarket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalMarket")
            .field("env", &self.0.env)
            .field("live", &self.0.slot.lock().is_some())
            .finish()
    }
}

impl GlobalMarket {
    pub fn builder() -> MarketBuilder {
        MarketBuilder::new()
    }

    /// Obtain the market, creating it on first acquire. Further acquires
    /// bump the reference counts; a public 0->1 transition re-derives the
    /// soft limit from the new request.
    ///
    /// `stack_size == 0` means "use the environment default". Once the
    /// market exists its stack size is fixed; larger requests only warn.
    pub fn acquire(
        &self,
        is_public: bool,
        workers_requested: usize,
        stack_size: usize,
    ) -> MarketHandle {
        let mut slot = self.0.slot.lock();

        if let Some(market) = &*slot {
            let market = Arc::clone(market);
            market.ref_count.fetch_add(1, Ordering::Relaxed);
            let old_public_count = if is_public {
                market.public_ref_count.fetch_add(1, Ordering::Relaxed)
            } else {
                1
            };
            drop(slot);

            if old_public_count == 0 {
                self.set_active_num_workers(
                    self.calc_soft_limit(workers_requested, market.num_workers_hard_limit()),
                );
            }

            // Do not warn when the default number of workers is requested.
            if workers_requested != self.0.env.default_num_threads().saturating_sub(1) {
                self.warn_soft_limit_once(&market, workers_requested);
            }
            if market.worker_stack_size() < stack_size {
                warn!(
                    fixed = market.worker_stack_size(),
                    requested = stack_size,
                    "thread stack size has already been set; larger request cannot be satisfied"
                );
            }

            return MarketHandle::new(self.clone(), market, is_public);
        }

        let stack_size = if stack_size == 0 {
            self.0.env.default_thread_stack_size()
        } else {
            stack_size
        };

        // 4P suits most applications; limit to 2P for large thread counts.
        // The requested worker count is intentionally left out of the hard
        // limit so that request policy and capacity stay separate concerns.
        let default_threads = self.0.env.default_num_threads();
        let factor = if default_threads <= 128 { 4 } else { 2 };
        let hard_limit = (factor * default_threads)
            .max(HARD_LIMIT_FLOOR)
            .max(self.0.env.app_parallelism_limit());
        let soft_limit = self.calc_soft_limit(workers_requested, hard_limit);

        let dispatcher = (self.0.dispatcher_factory)(&DispatcherParams {
            hard_limit,
            stack_size,
        });
        if dispatcher.default_concurrency() < soft_limit {
            warn!(
                available = dispatcher.default_concurrency(),
                requested = soft_limit,
                "the worker pool may limit the number of workers below the soft limit"
            );
        }

        debug!(soft_limit, hard_limit, stack_size, "market created");
        let market = Market::new(soft_limit, hard_limit, stack_size, dispatcher, is_public);
        *slot = Some(Arc::clone(&market));

        MarketHandle::new(self.clone(), market, is_public)
    }

    /// Drop one reference. The last reference clears the slot and hands
    /// teardown to the dispatcher.
    ///
    /// With `blocking_terminate` (public references only) the call first
    /// waits until this is the only reference left, so the closing thread
    /// is guaranteed to be the last external one.
    pub fn release(&self, is_public: bool, blocking_terminate: bool) -> bool {
        let mut slot = self.0.slot.lock();
        let market = Arc::clone(
            slot.as_ref()
                .expect("market released after it was destroyed"),
        );

        if blocking_terminate {
            assert!(
                is_public,
                "only a public reference can request blocking terminate"
            );
            while market.public_ref_count.load(Ordering::Relaxed) == 1
                && market.ref_count.load(Ordering::Relaxed) > 1
            {
                drop(slot);
                // Wait for private references to drain so the close request
                // is issued by the last external thread. Re-read the public
                // count to bound the wait if new external threads show up.
                while market.public_ref_count.load(Ordering::Acquire) == 1
                    && market.ref_count.load(Ordering::Acquire) > 1
                {
                    self.0.env.yield_now();
                }
                slot = self.0.slot.lock();
            }
        }

        if is_public {
            let prev = market.public_ref_count.fetch_sub(1, Ordering::Relaxed);
            debug_assert!(prev > 0, "public release without a public acquire");
        }

        let prev = market.ref_count.fetch_sub(1, Ordering::Relaxed);
        let teardown = prev == 1;
        if teardown {
            debug_assert_eq!(
                market.public_ref_count.load(Ordering::Relaxed),
                0,
                "no public references remain when the market is destroyed"
            );
            *slot = None;
        }
        drop(slot);

        if teardown {
            // The dispatcher joins its workers (when asked to) and owns the
            // rest of the teardown; the market storage goes away with the
            // last Arc.
            debug!(blocking_terminate, "closing worker pool connection");
            market.dispatcher.set_join_workers(blocking_terminate);
            market.dispatcher.request_close_connection();
            return blocking_terminate;
        }
        false
    }

    /// Change the soft limit of the live market. A no-op when no market
    /// exists (the value is derived again at creation) or when the limit
    /// is unchanged.
    pub fn set_active_num_workers(&self, soft_limit: usize) {
        let market = {
            let slot = self.0.slot.lock();
            match &*slot {
                None => return,
                Some(m) if m.num_workers_soft_limit() == soft_limit => return,
                Some(m) => {
                    // Hold an internal reference across the update.
                    m.ref_count.fetch_add(1, Ordering::Relaxed);
                    Arc::clone(m)
                }
            }
        };

        market.set_active_num_workers(soft_limit);
        self.release(false, false);
    }

    /// Hard limit of the live market, 0 when none exists.
    pub fn max_num_workers(&self) -> usize {
        self.0
            .slot
            .lock()
            .as_ref()
            .map_or(0, |m| m.num_workers_hard_limit())
    }

    /// The soft limit is one less than the controlling thread count: the
    /// requesting thread itself occupies a slot.
    fn calc_soft_limit(&self, workers_requested: usize, hard_limit: usize) -> usize {
        let soft_limit = match self.0.env.app_parallelism_limit() {
            0 => self
                .0
                .env
                .default_num_threads()
                .saturating_sub(1)
                .max(workers_requested),
            limit => limit - 1,
        };
        soft_limit.min(hard_limit - 1)
    }

    /// One-shot warning per soft-limit epoch: a request above the current
    /// soft limit is ignored, and so are all further ones until the limit
    /// changes.
    fn warn_soft_limit_once(&self, market: &Market, workers_requested: usize) {
        debug_assert!(
            workers_requested < SKIP_SOFT_LIMIT_WARNING,
            "sentinel must exceed any valid worker request"
        );
        let soft_limit_to_report = market.soft_limit_to_report.load(Ordering::Relaxed);
        if soft_limit_to_report < workers_requested {
            warn!(
                soft_limit = soft_limit_to_report,
                requested = workers_requested,
                "the number of workers is currently limited; further requests for more \
                 workers will be ignored silently until the limit changes"
            );
            // Concurrent reporters may race here; extra warnings are fine.
            let _ = market.soft_limit_to_report.compare_exchange(
                soft_limit_to_report,
                SKIP_SOFT_LIMIT_WARNING,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }
}

/// A counted reference to the market. Dropping it releases non-blockingly;
/// call [`MarketHandle::release`] to control blocking termination.
#[derive(Debug)]
pub struct MarketHandle {
    global: GlobalMarket,
    market: Arc<Market>,
    is_public: bool,
    released: bool,
}

impl MarketHandle {
    fn new(global: GlobalMarket, market: Arc<Market>, is_public: bool) -> Self {
        Self {
            global,
            market,
            is_public,
            released: false,
        }
    }

    pub fn market(&self) -> &Arc<Market> {
        &self.market
    }

    /// Run the release protocol. Returns true when this call destroyed the
    /// market with a blocking terminate.
    pub fn release(mut self, blocking_terminate: bool) -> bool {
        self.released = true;
        self.global.release(self.is_public, blocking_terminate)
    }
}

impl Deref for MarketHandle {
    type Target = Market;

    fn deref(&self) -> &Self::Target {
        &self.market
    }
}

impl Drop for MarketHandle {
    fn drop(&mut self) {
        if !self.released {
            self.global.release(self.is_public, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FixedEnvironment;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(GlobalMarket: Send, Sync, Clone);
    assert_impl_all!(MarketHandle: Send, Sync);

    #[rstest]
    #[case::follows_default_threads(8, 0, 3, 256, 7)]
    #[case::request_wins_over_default(8, 0, 12, 256, 12)]
    #[case::app_limit_overrides_all(8, 5, 12, 256, 4)]
    #[case::clamped_to_hard_limit(8, 0, 600, 256, 255)]
    #[case::app_limit_of_one_pins_to_zero(8, 1, 4, 256, 0)]
    fn test_calc_soft_limit(
        #[case] default_threads: usize,
        #[case] app_limit: usize,
        #[case] requested: usize,
        #[case] hard_limit: usize,
        #[case] expected: usize,
    ) {
        let env = FixedEnvironment::new(default_threads).with_app_parallelism_limit(app_limit);
        let global = crate::test_utils::build_global_market(env).0;
        assert_eq!(global.calc_soft_limit(requested, hard_limit), expected);
    }
}
