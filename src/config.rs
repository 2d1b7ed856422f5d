mod backoff;
mod file;
mod stack;

pub use self::backoff::BackoffConfig;
pub use self::file::{
    default_config_path, load_default_stack_config, load_stack_config, StackConfigError,
    CONFIG_PATH_ENV_VAR,
};
pub use self::stack::{
    AdminConfig, CacheConfig, ContainerConfig, NodePoolConfig, ServiceConfig, StackConfig,
};

use crate::resource::ResourceKind;

use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Configuration of a provisioning run. Environment specific values that end up in the
/// descriptors belong in `StackConfig` instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionConfig {
    /// The maximum number of resources that are applied at the same time
    pub concurrency_limit: usize,

    /// Bounds the time from the first apply call until the resource is ready, for any kind that
    /// doesn't have a more specific timeout
    pub default_timeout: Duration,

    /// Timeouts for specific kinds of resources
    pub timeouts: HashMap<ResourceKind, Duration>,

    /// Determines how often the status of a pending resource is polled
    pub poll_backoff: BackoffConfig,
}

impl Default for ProvisionConfig {
    fn default() -> ProvisionConfig {
        let mut timeouts = HashMap::new();
        timeouts.insert(ResourceKind::Cluster, Duration::from_secs(30 * 60));
        timeouts.insert(ResourceKind::NodePool, Duration::from_secs(20 * 60));
        timeouts.insert(ResourceKind::Cache, Duration::from_secs(30 * 60));
        ProvisionConfig {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            default_timeout: DEFAULT_TIMEOUT,
            timeouts,
            poll_backoff: BackoffConfig::default(),
        }
    }
}

impl ProvisionConfig {
    pub fn new() -> ProvisionConfig {
        ProvisionConfig::default()
    }

    /// Sets the maximum number of concurrent applies. A limit of 0 is treated as 1.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Sets the timeout used for every kind that has no specific timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_timeout(mut self, kind: ResourceKind, timeout: Duration) -> Self {
        self.timeouts.insert(kind, timeout);
        self
    }

    /// Applies the same timeout to every kind, removing all kind specific timeouts
    pub fn with_uniform_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.clear();
        self.default_timeout = timeout;
        self
    }

    pub fn with_poll_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.poll_backoff = backoff;
        self
    }

    pub fn timeout_for(&self, kind: ResourceKind) -> Duration {
        self.timeouts
            .get(&kind)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}
