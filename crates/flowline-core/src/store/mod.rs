//! Store contract consumed by scheduling strategies.
//!
//! The engine only ever talks to three primitives: partitioned key-value
//! buckets with TTL, ordered lists scored by last update, and renewable
//! owner-checked locks. Any backend providing these (a networked key-value
//! store with TTL and conditional writes, typically) is interchangeable
//! without touching the engine.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend: {0}")]
    Backend(String),

    /// A lease-scoped mutation was attempted by a caller that no longer owns
    /// the lock.
    #[error("not the lock owner (held by {0:?})")]
    NotOwner(String),
}

/// Number of partitions bucket keys are hashed into for scans.
pub const PARTITIONS: u32 = 64;

/// Stable partition assignment for a bucket key (FNV-1a).
pub fn partition(key: &str) -> u32 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % u64::from(PARTITIONS)) as u32
}

/// Options for paged bucket scans.
#[derive(Debug, Clone, Copy)]
pub struct EnumOptions {
    pub page_size: usize,
    pub partition: u32,
}

impl Default for EnumOptions {
    fn default() -> Self {
        Self {
            page_size: 10,
            partition: 0,
        }
    }
}

/// A paged scan over store items.
#[async_trait]
pub trait Scan<T>: Send {
    /// Next page of items; `None` once the scan is exhausted.
    async fn next_page(&mut self) -> Result<Option<Vec<T>>, StoreError>;
}

/// Partitioned key-value bucket with per-key TTL.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Store a value; `ttl` of `None` means the entry never expires.
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove a key, returning the previous value if present.
    async fn remove(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Scan the values of one partition.
    fn enumerate(&self, opts: EnumOptions) -> Box<dyn Scan<Vec<u8>>>;
}

/// Membership list ordered by insertion/update time.
#[async_trait]
pub trait OrderedList: Send + Sync {
    /// Toggle membership. Inserting an id that is already present refreshes
    /// its order key (moves it to the back).
    async fn set(&self, id: &str, present: bool) -> Result<(), StoreError>;

    async fn has(&self, id: &str) -> Result<bool, StoreError>;

    /// Paged scan, oldest entry first.
    fn enumerate(&self, page_size: usize) -> Box<dyn Scan<String>>;
}

/// A renewable, owner-checked, TTL-bounded exclusive claim.
///
/// Returned even on contention: `acquired()` tells whether the caller is the
/// current owner. `release` is idempotent and a no-op for non-owners.
#[async_trait]
pub trait Acquisition: Send + Sync {
    fn acquired(&self) -> bool;

    /// The owner observed at acquisition time.
    fn owner(&self) -> String;

    fn ttl(&self) -> Duration;

    /// Extend the TTL, conditioned on still being the owner.
    async fn refresh(&self, ttl: Duration) -> Result<(), StoreError>;

    async fn release(&self) -> Result<(), StoreError>;
}

/// Persistent storage for jobs and tasks.
#[async_trait]
pub trait Store: Send + Sync {
    fn bucket(&self, name: &str) -> Arc<dyn Bucket>;

    fn ordered_list(&self, name: &str) -> Arc<dyn OrderedList>;

    /// Try to acquire the named lock for `owner`. Inspect
    /// [`Acquisition::acquired`] on the result; contention is not an error.
    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Box<dyn Acquisition>, StoreError>;
}
