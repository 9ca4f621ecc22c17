use crate::dispatcher::Dispatcher;
use crate::market::{GlobalMarket, MarketHandle};
use std::sync::Arc;

// Exports
pub(crate) mod mocks;
pub(crate) use mocks::{
    Call, FixedEnvironment, Method, MockArena, MockDispatcher, MockThreadContext, Tracker,
};

/// Build a controller wired to a recording dispatcher. The tracker is
/// shared with every dispatcher the factory creates.
pub(crate) fn build_global_market(env: FixedEnvironment) -> (GlobalMarket, Tracker) {
    let tracker = Tracker::new();
    let factory_tracker = tracker.clone();

    let global = GlobalMarket::builder()
        .environment(env)
        .dispatcher_factory(move |params| {
            Arc::new(MockDispatcher::new(
                params.hard_limit,
                factory_tracker.clone(),
            )) as Arc<dyn Dispatcher>
        })
        .try_build()
        .expect("failed to build market controller");

    (global, tracker)
}

/// Controller plus a live public handle, the common test starting point.
pub(crate) fn acquire_market(
    env: FixedEnvironment,
    workers_requested: usize,
) -> (GlobalMarket, MarketHandle, Tracker) {
    let (global, tracker) = build_global_market(env);
    let handle = global.acquire(true, workers_requested, 0);
    (global, handle, tracker)
}
