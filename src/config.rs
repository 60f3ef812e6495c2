//! Fluent builders over [`crate::pool::PoolConfig`] and
//! [`crate::map::MapConfig`], so a caller who only wants to override
//! one or two fields is not forced to spell out every other field's
//! default by hand the way a raw struct literal would require.

use std::time::Duration;

use crate::error::Result;
use crate::policy::{AbortPolicy, RejectionPolicy};
use crate::pool::{DefaultThreadFactory, Job, NoopObserver, PoolConfig, PoolObserver, ThreadFactory};
use crate::queue::{Queue, TransferQueue};

pub use crate::map::MapConfig;

/// Defaults mirror a `newCachedThreadPool`-style convenience
/// constructor: no core threads, unbounded growth, a 60-second
/// keep-alive, and a plain [`AbortPolicy`] on saturation.
pub struct PoolConfigBuilder {
    core_pool_size: usize,
    max_pool_size: usize,
    keep_alive: Duration,
    work_queue: Option<Box<dyn Queue<Job>>>,
    thread_factory: Option<Box<dyn ThreadFactory>>,
    observer: Option<Box<dyn PoolObserver>>,
    rejection_policy: Option<Box<dyn RejectionPolicy<Job>>>,
    thread_name_prefix: String,
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self {
            core_pool_size: 0,
            max_pool_size: usize::MAX,
            keep_alive: Duration::from_secs(60),
            work_queue: None,
            thread_factory: None,
            observer: None,
            rejection_policy: None,
            thread_name_prefix: "juncture-pool".to_string(),
        }
    }
}

impl PoolConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn core_pool_size(mut self, size: usize) -> Self {
        self.core_pool_size = size;
        self
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Pins `core_pool_size` and `max_pool_size` to the same value: a
    /// fixed-size pool that never grows or shrinks.
    pub fn fixed_size(mut self, size: usize) -> Self {
        self.core_pool_size = size;
        self.max_pool_size = size;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn work_queue(mut self, queue: Box<dyn Queue<Job>>) -> Self {
        self.work_queue = Some(queue);
        self
    }

    pub fn thread_factory(mut self, factory: Box<dyn ThreadFactory>) -> Self {
        self.thread_factory = Some(factory);
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn observer(mut self, observer: Box<dyn PoolObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn rejection_policy(mut self, policy: Box<dyn RejectionPolicy<Job>>) -> Self {
        self.rejection_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<PoolConfig> {
        let config = PoolConfig {
            core_pool_size: self.core_pool_size,
            max_pool_size: self.max_pool_size,
            keep_alive: self.keep_alive,
            work_queue: self
                .work_queue
                .unwrap_or_else(|| Box::new(TransferQueue::new())),
            thread_factory: self
                .thread_factory
                .unwrap_or_else(|| Box::new(DefaultThreadFactory::new(self.thread_name_prefix))),
            observer: self.observer.unwrap_or_else(|| Box::new(NoopObserver)),
            rejection_policy: self
                .rejection_policy
                .unwrap_or_else(|| Box::new(AbortPolicy)),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_a_valid_config() {
        let config = PoolConfigBuilder::new().build().unwrap();
        assert_eq!(config.core_pool_size, 0);
        assert_eq!(config.max_pool_size, usize::MAX);
    }

    #[test]
    fn fixed_size_sets_both_bounds_equal() {
        let config = PoolConfigBuilder::new().fixed_size(8).build().unwrap();
        assert_eq!(config.core_pool_size, 8);
        assert_eq!(config.max_pool_size, 8);
    }

    #[test]
    fn invalid_override_is_rejected_at_build_time() {
        let result = PoolConfigBuilder::new()
            .core_pool_size(4)
            .max_pool_size(1)
            .build();
        assert!(result.is_err());
    }
}
