//! Registry of scope locks.
//!
//! Locks are created on demand and addressed by a typed key instead of ad hoc
//! string concatenation: one lock per key type, one per sender-key identity,
//! one per transaction scope token. `tokio::sync::Mutex` queues waiters FIFO,
//! which gives the total per-scope ordering the coordinator relies on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keyloom_core::KeyType;
use tokio::time::Instant;

/// Registry growth bound; pruning runs once the table exceeds this.
const MAX_TRACKED_LOCKS: usize = 1024;

/// Idle time after which an unused lock may be dropped from the registry.
const LOCK_IDLE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Identifies one mutual-exclusion scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Serializes operations on a whole key-type namespace.
    KeyType(KeyType),

    /// Serializes operations on one sender-key identity, so writes to
    /// different groups proceed in parallel.
    SenderKey(String),

    /// Serializes transactions sharing a scope token.
    Scope(String),
}

struct LockSlot {
    lock: Arc<tokio::sync::Mutex<()>>,
    last_used: Instant,
}

/// Lazily-populated table of scope locks with bounded lifetime.
///
/// A lock handle is an `Arc`; a slot is only pruned when nothing outside the
/// registry holds its handle, so an in-flight acquisition is never invalidated.
#[derive(Default)]
pub struct LockRegistry {
    slots: Mutex<HashMap<LockKey, LockSlot>>,
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for the lock guarding `key`, creating it on first use.
    #[allow(clippy::expect_used)]
    pub fn handle(&self, key: &LockKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().expect("lock table poisoned");
        let now = Instant::now();

        if slots.len() > MAX_TRACKED_LOCKS {
            slots.retain(|_, slot| {
                Arc::strong_count(&slot.lock) > 1 || now - slot.last_used < LOCK_IDLE_WINDOW
            });
        }

        let slot = slots.entry(key.clone()).or_insert_with(|| {
            tracing::trace!(?key, "created new scope lock");
            LockSlot { lock: Arc::new(tokio::sync::Mutex::new(())), last_used: now }
        });
        slot.last_used = now;
        Arc::clone(&slot.lock)
    }

    /// Number of tracked locks.
    #[allow(clippy::expect_used)]
    pub fn len(&self) -> usize {
        self.slots.lock().expect("lock table poisoned").len()
    }

    /// True if no locks are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_returns_same_lock() {
        let registry = LockRegistry::new();
        let a = registry.handle(&LockKey::KeyType(KeyType::PreKey));
        let b = registry.handle(&LockKey::KeyType(KeyType::PreKey));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn distinct_scopes_get_distinct_locks() {
        let registry = LockRegistry::new();
        let a = registry.handle(&LockKey::SenderKey("g1::alice.0".to_string()));
        let b = registry.handle(&LockKey::SenderKey("g2::alice.0".to_string()));
        let c = registry.handle(&LockKey::Scope("g1::alice.0".to_string()));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_locks_are_pruned_past_bound() {
        let registry = LockRegistry::new();
        for i in 0..=MAX_TRACKED_LOCKS {
            let _ = registry.handle(&LockKey::SenderKey(format!("g::{i}.0")));
        }
        assert!(registry.len() > MAX_TRACKED_LOCKS);

        tokio::time::advance(LOCK_IDLE_WINDOW + Duration::from_secs(1)).await;

        // Next acquisition triggers the sweep; everything else is idle.
        let _held = registry.handle(&LockKey::Scope("fresh".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn held_locks_survive_pruning() {
        let registry = LockRegistry::new();
        let held = registry.handle(&LockKey::Scope("busy".to_string()));
        let _guard = held.lock().await;

        for i in 0..=MAX_TRACKED_LOCKS {
            let _ = registry.handle(&LockKey::SenderKey(format!("g::{i}.0")));
        }
        tokio::time::advance(LOCK_IDLE_WINDOW + Duration::from_secs(1)).await;
        let _ = registry.handle(&LockKey::Scope("fresh".to_string()));

        let again = registry.handle(&LockKey::Scope("busy".to_string()));
        assert!(Arc::ptr_eq(&held, &again));
    }
}
