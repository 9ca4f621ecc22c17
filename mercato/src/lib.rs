pub mod arena;
pub use arena::ArenaControl;

pub mod context;
pub use context::{GroupStateField, TaskGroupContext, ThreadContext};

pub mod dispatcher;
pub use dispatcher::{Dispatcher, Ticket};

pub mod env;
pub use env::{Environment, OsEnvironment};

pub mod market;
pub use market::{
    Client, DispatcherParams, GlobalMarket, Market, MarketBuilder, MarketHandle, PRIORITY_LEVELS,
};

#[cfg(test)]
pub mod test_utils;
