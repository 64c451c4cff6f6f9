//! Scope locks with expiring leases.
//!
//! Mutual exclusion between engine instances comes from a [`LockStore`] with
//! atomic compare-and-swap. Inside one process, waiters for the same scope
//! queue by priority and arrival so only the head of the queue polls the
//! store.

use super::error::MigrationError;
use crate::id::current_timestamp;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rkyv::{Archive, Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Proof of holding the lock on a scope until `expires_at`.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct LockToken {
    /// Locked scope.
    pub scope: String,
    /// Holder identity.
    pub holder: String,
    /// Acquisition time (microseconds since epoch).
    pub acquired_at: u64,
    /// Lease end (microseconds since epoch). Zero marks a released lock.
    pub expires_at: u64,
    /// Fencing number, strictly increasing per scope.
    pub fence: u64,
}

impl LockToken {
    /// Check if the lease has ended at `now`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Check if the lease has ended.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp())
    }

    /// Check if the token was explicitly released.
    pub fn is_released(&self) -> bool {
        self.expires_at == 0
    }

    fn released(&self) -> Self {
        Self {
            expires_at: 0,
            ..self.clone()
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Shared store backing the scope locks.
pub trait LockStore: Send + Sync {
    /// Current token for a scope, if any.
    fn load(&self, scope: &str) -> Result<Option<LockToken>, MigrationError>;

    /// Atomically replace `expected` with `new`. Returns false if the stored
    /// value was not `expected`.
    fn compare_and_swap(
        &self,
        scope: &str,
        expected: Option<&LockToken>,
        new: Option<&LockToken>,
    ) -> Result<bool, MigrationError>;
}

/// In-process lock store.
#[derive(Default)]
pub struct MemoryLockStore {
    locks: DashMap<String, LockToken>,
}

impl MemoryLockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for MemoryLockStore {
    fn load(&self, scope: &str) -> Result<Option<LockToken>, MigrationError> {
        Ok(self.locks.get(scope).map(|t| t.value().clone()))
    }

    fn compare_and_swap(
        &self,
        scope: &str,
        expected: Option<&LockToken>,
        new: Option<&LockToken>,
    ) -> Result<bool, MigrationError> {
        match self.locks.entry(scope.to_string()) {
            Entry::Occupied(mut entry) => {
                if expected != Some(entry.get()) {
                    return Ok(false);
                }
                match new {
                    Some(token) => {
                        entry.insert(token.clone());
                    }
                    None => {
                        entry.remove();
                    }
                }
                Ok(true)
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    return Ok(false);
                }
                if let Some(token) = new {
                    entry.insert(token.clone());
                }
                Ok(true)
            }
        }
    }
}

/// Lock store persisted in sled.
pub struct SledLockStore {
    tree: sled::Tree,
}

impl SledLockStore {
    /// Tree name for lock tokens.
    pub const TREE_NAME: &'static str = "ddlshift:locks";

    /// Open or create the lock tree.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        Ok(Self {
            tree: db.open_tree(Self::TREE_NAME)?,
        })
    }
}

impl LockStore for SledLockStore {
    fn load(&self, scope: &str) -> Result<Option<LockToken>, MigrationError> {
        match self.tree.get(scope.as_bytes())? {
            Some(bytes) => Ok(Some(LockToken::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn compare_and_swap(
        &self,
        scope: &str,
        expected: Option<&LockToken>,
        new: Option<&LockToken>,
    ) -> Result<bool, MigrationError> {
        let current = self.tree.get(scope.as_bytes())?;
        let decoded = current
            .as_deref()
            .map(LockToken::from_bytes)
            .transpose()?;
        if decoded.as_ref() != expected {
            return Ok(false);
        }

        let new = new.map(LockToken::to_bytes).transpose()?;
        Ok(self
            .tree
            .compare_and_swap(scope.as_bytes(), current, new)?
            .is_ok())
    }
}

type Ticket = (Reverse<i32>, u64);

/// Serializes migrations per scope.
pub struct ConcurrencyGuard {
    store: Arc<dyn LockStore>,
    lease: Duration,
    poll_interval: Duration,
    queues: Mutex<HashMap<String, BTreeSet<Ticket>>>,
    wakeup: Condvar,
    arrivals: AtomicU64,
}

impl ConcurrencyGuard {
    /// Create a guard over a lock store.
    pub fn new(store: Arc<dyn LockStore>, lease: Duration, poll_interval: Duration) -> Self {
        Self {
            store,
            lease,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            queues: Mutex::new(HashMap::new()),
            wakeup: Condvar::new(),
            arrivals: AtomicU64::new(0),
        }
    }

    /// Lease duration granted on acquire and renew.
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Number of in-process callers waiting for a scope.
    pub fn waiting(&self, scope: &str) -> usize {
        self.queues.lock().get(scope).map_or(0, BTreeSet::len)
    }

    /// Acquire the scope lock, waiting up to `timeout`.
    pub fn acquire(
        &self,
        scope: &str,
        holder: &str,
        timeout: Duration,
    ) -> Result<LockToken, MigrationError> {
        self.acquire_with_priority(scope, holder, timeout, 0)
    }

    /// Acquire the scope lock; higher priorities are served first, then
    /// earlier arrivals.
    pub fn acquire_with_priority(
        &self,
        scope: &str,
        holder: &str,
        timeout: Duration,
        priority: i32,
    ) -> Result<LockToken, MigrationError> {
        let start = Instant::now();
        let ticket: Ticket = (Reverse(priority), self.arrivals.fetch_add(1, Ordering::Relaxed));

        let mut queues = self.queues.lock();
        queues.entry(scope.to_string()).or_default().insert(ticket);

        loop {
            let is_head = queues.get(scope).and_then(|q| q.first()) == Some(&ticket);
            if is_head {
                let attempt = MutexGuard::unlocked(&mut queues, || self.try_acquire(scope, holder));
                match attempt {
                    Ok(Some(token)) => {
                        self.dequeue(&mut queues, scope, &ticket);
                        debug!(
                            scope,
                            holder,
                            fence = token.fence,
                            waited_ms = start.elapsed().as_millis() as u64,
                            "Acquired scope lock"
                        );
                        return Ok(token);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.dequeue(&mut queues, scope, &ticket);
                        return Err(e);
                    }
                }
            }

            let waited = start.elapsed();
            if waited >= timeout {
                self.dequeue(&mut queues, scope, &ticket);
                debug!(scope, holder, waited_ms = waited.as_millis() as u64, "Lock wait timed out");
                return Err(MigrationError::LockTimeout {
                    scope: scope.to_string(),
                    waited,
                });
            }
            let wait = (timeout - waited).min(self.poll_interval);
            self.wakeup.wait_for(&mut queues, wait);
        }
    }

    /// Release a lock. Fails with `LockNotHeld` if the token is stale.
    pub fn release(&self, token: &LockToken) -> Result<(), MigrationError> {
        let released = self
            .store
            .compare_and_swap(&token.scope, Some(token), Some(&token.released()))?;
        self.wakeup.notify_all();
        if !released {
            return Err(MigrationError::LockNotHeld {
                scope: token.scope.clone(),
                holder: token.holder.clone(),
            });
        }
        debug!(scope = %token.scope, holder = %token.holder, fence = token.fence, "Released scope lock");
        Ok(())
    }

    /// Extend the lease. The returned token replaces the given one.
    pub fn renew(&self, token: &LockToken) -> Result<LockToken, MigrationError> {
        let now = current_timestamp();
        if token.is_expired_at(now) {
            return Err(self.lease_expired(token));
        }
        let renewed = LockToken {
            expires_at: now.saturating_add(self.lease.as_micros() as u64),
            ..token.clone()
        };
        if !self
            .store
            .compare_and_swap(&token.scope, Some(token), Some(&renewed))?
        {
            return Err(self.lease_expired(token));
        }
        Ok(renewed)
    }

    /// Check that the token is still the live holder of its scope.
    pub fn validate(&self, token: &LockToken) -> Result<(), MigrationError> {
        let current = self.store.load(&token.scope)?;
        match current {
            Some(current) if current == *token && !current.is_expired() => Ok(()),
            _ => Err(self.lease_expired(token)),
        }
    }

    fn lease_expired(&self, token: &LockToken) -> MigrationError {
        warn!(scope = %token.scope, holder = %token.holder, fence = token.fence, "Lease lost");
        MigrationError::LeaseExpired {
            scope: token.scope.clone(),
            holder: token.holder.clone(),
        }
    }

    fn try_acquire(&self, scope: &str, holder: &str) -> Result<Option<LockToken>, MigrationError> {
        let current = self.store.load(scope)?;
        let now = current_timestamp();

        if let Some(current) = &current {
            if !current.is_expired_at(now) {
                return Ok(None);
            }
            if !current.is_released() {
                warn!(
                    scope,
                    previous_holder = %current.holder,
                    fence = current.fence,
                    "Taking over expired lease"
                );
            }
        }

        let fence = current.as_ref().map_or(0, |t| t.fence + 1).max(now);
        let token = LockToken {
            scope: scope.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now.saturating_add(self.lease.as_micros() as u64),
            fence,
        };

        if self
            .store
            .compare_and_swap(scope, current.as_ref(), Some(&token))?
        {
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    fn dequeue(&self, queues: &mut HashMap<String, BTreeSet<Ticket>>, scope: &str, ticket: &Ticket) {
        if let Some(queue) = queues.get_mut(scope) {
            queue.remove(ticket);
            if queue.is_empty() {
                queues.remove(scope);
            }
        }
        self.wakeup.notify_all();
    }
}
