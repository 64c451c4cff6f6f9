//! Engine configuration.

use std::time::Duration;

/// Default time to wait for the scope lock, in milliseconds.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

/// Default lease duration, in milliseconds.
pub const DEFAULT_LEASE_DURATION_MS: u64 = 60_000;

/// Default interval between lock store polls while waiting, in milliseconds.
pub const DEFAULT_LOCK_POLL_INTERVAL_MS: u64 = 50;

/// Default progress observer queue capacity.
pub const DEFAULT_OBSERVER_CAPACITY: usize = 1024;

/// How batches map onto database transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionScope {
    /// One transaction per batch.
    #[default]
    PerBatch,
    /// One transaction for the whole plan. Requires transactional DDL.
    WholePlan,
}

impl std::fmt::Display for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionScope::PerBatch => write!(f, "per_batch"),
            TransactionScope::WholePlan => write!(f, "whole_plan"),
        }
    }
}

impl std::str::FromStr for TransactionScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "per_batch" => Ok(TransactionScope::PerBatch),
            "whole_plan" => Ok(TransactionScope::WholePlan),
            other => Err(format!("unknown transaction scope: {}", other)),
        }
    }
}

fn default_holder_id() -> String {
    format!(
        "ddlshift-{}-{:x}",
        std::process::id(),
        crate::id::current_timestamp()
    )
}

/// Migration engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long `acquire` waits for the scope lock.
    pub lock_timeout: Duration,
    /// Lease length; a holder that does not renew within it loses the lock.
    pub lease_duration: Duration,
    /// How often waiters re-check the lock store.
    pub lock_poll_interval: Duration,
    /// Transaction granularity during execution.
    pub transaction_scope: TransactionScope,
    /// Maximum operations per batch (`None` = unbounded).
    pub max_batch_size: Option<usize>,
    /// Capacity of the progress event queue.
    pub observer_capacity: usize,
    /// Identity recorded as the lock holder.
    pub holder_id: String,
}

impl EngineConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self {
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            lease_duration: Duration::from_millis(DEFAULT_LEASE_DURATION_MS),
            lock_poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_INTERVAL_MS),
            transaction_scope: TransactionScope::PerBatch,
            max_batch_size: None,
            observer_capacity: DEFAULT_OBSERVER_CAPACITY,
            holder_id: default_holder_id(),
        }
    }

    /// Set the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the lease duration.
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    /// Set the lock poll interval.
    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set the transaction scope.
    pub fn with_transaction_scope(mut self, scope: TransactionScope) -> Self {
        self.transaction_scope = scope;
        self
    }

    /// Cap the number of operations per batch.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size.max(1));
        self
    }

    /// Set the observer queue capacity.
    pub fn with_observer_capacity(mut self, capacity: usize) -> Self {
        self.observer_capacity = capacity.max(1);
        self
    }

    /// Set the lock holder identity.
    pub fn with_holder_id(mut self, holder: impl Into<String>) -> Self {
        self.holder_id = holder.into();
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.lock_timeout, Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS));
        assert_eq!(config.lease_duration, Duration::from_millis(DEFAULT_LEASE_DURATION_MS));
        assert_eq!(config.transaction_scope, TransactionScope::PerBatch);
        assert!(config.max_batch_size.is_none());
        assert!(config.holder_id.starts_with("ddlshift-"));
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_lock_timeout(Duration::from_secs(5))
            .with_lease_duration(Duration::from_secs(10))
            .with_transaction_scope(TransactionScope::WholePlan)
            .with_max_batch_size(0)
            .with_observer_capacity(0)
            .with_holder_id("worker-1");

        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.lease_duration, Duration::from_secs(10));
        assert_eq!(config.transaction_scope, TransactionScope::WholePlan);
        assert_eq!(config.max_batch_size, Some(1));
        assert_eq!(config.observer_capacity, 1);
        assert_eq!(config.holder_id, "worker-1");
    }

    #[test]
    fn test_transaction_scope_parse() {
        assert_eq!("per-batch".parse::<TransactionScope>(), Ok(TransactionScope::PerBatch));
        assert_eq!("WHOLE_PLAN".parse::<TransactionScope>(), Ok(TransactionScope::WholePlan));
        assert!("nested".parse::<TransactionScope>().is_err());
    }
}
