//! Fluent builder for Runtime construction.

use crate::bridge::PoolConfig;
use crate::runtime::Runtime;

use std::time::Duration;

/// Builder for constructing Runtime instances with fluent API.
///
/// Configures the helper pool that runs blocking calls for the runtime.
///
/// # Example
/// ```ignore
/// let rt = RuntimeBuilder::new()
///     .max_blocking_threads(8)
///     .thread_keep_alive(Duration::from_secs(1))
///     .build();
/// ```
pub struct RuntimeBuilder {
    pool: PoolConfig,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            pool: PoolConfig::default(),
        }
    }

    /// Caps the number of helper threads. Blocking calls beyond the cap
    /// queue until a helper frees up.
    ///
    /// Defaults to 512.
    ///
    /// # Panics
    /// Panics if `count` is zero.
    pub fn max_blocking_threads(mut self, count: usize) -> Self {
        assert!(count > 0, "max_blocking_threads must be at least 1");
        self.pool.max_threads = count;
        self
    }

    /// How long an idle helper thread lingers before exiting.
    ///
    /// Defaults to 10 seconds.
    pub fn thread_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.pool.keep_alive = keep_alive;
        self
    }

    /// Name prefix for helper threads; each gets a numeric suffix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.pool.thread_name = name.into();
        self
    }

    /// Builds and returns a configured Runtime instance.
    pub fn build(self) -> Runtime {
        Runtime::with_pool(self.pool)
    }
}
