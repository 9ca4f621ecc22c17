// Public API
pub mod lifecycle;
pub use lifecycle::{DispatcherParams, GlobalMarket, MarketBuilder, MarketHandle};

pub mod client;
pub use client::Client;

mod market;
pub use market::Market;

// Internals
mod allotment;

pub(crate) mod demand;

mod propagation;


/// Number of distinct arena priority levels, index 0 = highest.
pub const PRIORITY_LEVELS: usize = 3;

// Used wherever we rely on SmallVec to store entries on stack first.
// Prevents most heap allocations; the collections involved hold one entry
// per live arena, which rarely goes above a handful.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;
