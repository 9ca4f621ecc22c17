use std::fmt;
use std::thread;

/// Default worker stack size, used when an acquire request passes 0.
pub const DEFAULT_THREAD_STACK_SIZE: usize = 4 << 20;

/// Host-environment hooks the market consumes.
///
/// The embedding runtime implements this to plug in its own parallelism
/// controls (e.g. a user-facing `global_control` knob). The OS-backed
/// default implementation is right for standalone use.
pub trait Environment: Send + Sync + fmt::Debug + 'static {
    /// Number of threads the host considers full concurrency.
    fn default_num_threads(&self) -> usize {
        thread::available_parallelism().map_or(1, |n| n.get())
    }

    /// Application-level parallelism cap. 0 means no cap has been set.
    fn app_parallelism_limit(&self) -> usize {
        0
    }

    /// Stack size for worker threads when the acquire request leaves it
    /// unspecified.
    fn default_thread_stack_size(&self) -> usize {
        DEFAULT_THREAD_STACK_SIZE
    }

    /// Yield primitive used by the blocking-terminate wait loop.
    fn yield_now(&self) {
        thread::yield_now();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsEnvironment;

impl Environment for OsEnvironment {}
