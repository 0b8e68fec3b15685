//! Keyloom Store
//!
//! The transactional, cached middle of the Keyloom session store. Two layers
//! compose over the persistent [`keyloom_core::KeyStore`]:
//!
//! - [`TieredCache`]: a hot tier for frequently accessed entries and a larger
//!   general tier with TTL expiry, write-through to the store.
//! - [`TransactionCoordinator`]: scoped, re-entrant batching of reads and
//!   writes with per-scope mutual exclusion and bounded-retry commit.
//!
//! # Concurrency
//!
//! Execution is single-threaded cooperative: no parallel mutation, but any
//! store fetch or engine call is a suspension point where other logical
//! operations interleave. Every shared structure here (tiers, the mutation
//! batch, the open-transaction counter) is therefore guarded by explicit
//! locks keyed by key type, sender-key identity, or transaction scope.
//! Multi-type lock acquisition is canonicalized by type name to rule out
//! circular waits.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod coordinator;
mod lock_registry;
mod tiered_cache;

pub use coordinator::{TransactionConfig, TransactionCoordinator};
pub use lock_registry::{LockKey, LockRegistry};
pub use tiered_cache::{CacheConfig, TieredCache};
