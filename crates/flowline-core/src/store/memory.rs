//! In-memory store implementation, for tests and local development.
//!
//! Semantics mirror what a networked key-value backend provides: lazy TTL
//! expiry on buckets and locks, ordered lists scored by a monotonically
//! increasing update sequence, and owner-checked lock acquisition. Scans
//! snapshot the matching items on their first page so concurrent writers
//! cannot make a scan loop forever.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Acquisition, Bucket, EnumOptions, OrderedList, Scan, Store, StoreError, partition};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct ListEntries {
    /// seq -> id, iteration order is oldest-first.
    order: BTreeMap<u64, String>,
    index: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, HashMap<String, Entry>>,
    lists: HashMap<String, ListEntries>,
    locks: HashMap<String, LockEntry>,
    seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// In-process [`Store`] backed by maps behind one async mutex.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn bucket(&self, name: &str) -> Arc<dyn Bucket> {
        Arc::new(MemoryBucket {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }

    fn ordered_list(&self, name: &str) -> Arc<dyn OrderedList> {
        Arc::new(MemoryList {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }

    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Box<dyn Acquisition>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let free = match inner.locks.get(name) {
            None => true,
            Some(lock) => lock.expires_at <= now || lock.owner == owner,
        };
        if free {
            inner.locks.insert(
                name.to_string(),
                LockEntry {
                    owner: owner.to_string(),
                    expires_at: now + ttl,
                },
            );
        }
        let owned_by = inner
            .locks
            .get(name)
            .map(|lock| lock.owner.clone())
            .unwrap_or_default();
        Ok(Box::new(MemoryAcquisition {
            name: name.to_string(),
            owner: owner.to_string(),
            owned_by,
            ttl,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryBucket {
    name: String,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl Bucket for MemoryBucket {
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = Entry {
            value: value.to_vec(),
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        inner
            .buckets
            .entry(self.name.clone())
            .or_default()
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let Some(bucket) = inner.buckets.get_mut(&self.name) else {
            return Ok(None);
        };
        match bucket.get(key) {
            Some(entry) if entry.expired(now) => {
                bucket.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let previous = inner
            .buckets
            .get_mut(&self.name)
            .and_then(|bucket| bucket.remove(key))
            .filter(|entry| !entry.expired(now))
            .map(|entry| entry.value);
        Ok(previous)
    }

    fn enumerate(&self, opts: EnumOptions) -> Box<dyn Scan<Vec<u8>>> {
        Box::new(BucketScan {
            name: self.name.clone(),
            opts,
            inner: Arc::clone(&self.inner),
            snapshot: None,
            cursor: 0,
        })
    }
}

struct BucketScan {
    name: String,
    opts: EnumOptions,
    inner: Arc<Mutex<Inner>>,
    snapshot: Option<Vec<Vec<u8>>>,
    cursor: usize,
}

#[async_trait]
impl Scan<Vec<u8>> for BucketScan {
    async fn next_page(&mut self) -> Result<Option<Vec<Vec<u8>>>, StoreError> {
        if self.snapshot.is_none() {
            let inner = self.inner.lock().await;
            let now = Instant::now();
            let values = match inner.buckets.get(&self.name) {
                Some(bucket) => {
                    let mut keys: Vec<&String> = bucket
                        .iter()
                        .filter(|(key, entry)| {
                            !entry.expired(now) && partition(key) == self.opts.partition
                        })
                        .map(|(key, _)| key)
                        .collect();
                    keys.sort();
                    keys.iter().map(|key| bucket[*key].value.clone()).collect()
                }
                None => Vec::new(),
            };
            self.snapshot = Some(values);
        }
        let items = self.snapshot.as_ref().unwrap();
        if self.cursor >= items.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.opts.page_size.max(1)).min(items.len());
        let page = items[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Some(page))
    }
}

struct MemoryList {
    name: String,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl OrderedList for MemoryList {
    async fn set(&self, id: &str, present: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        let list = inner.lists.entry(self.name.clone()).or_default();
        if let Some(old) = list.index.remove(id) {
            list.order.remove(&old);
        }
        if present {
            list.order.insert(seq, id.to_string());
            list.index.insert(id.to_string(), seq);
        }
        Ok(())
    }

    async fn has(&self, id: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .lists
            .get(&self.name)
            .is_some_and(|list| list.index.contains_key(id)))
    }

    fn enumerate(&self, page_size: usize) -> Box<dyn Scan<String>> {
        Box::new(ListScan {
            name: self.name.clone(),
            page_size,
            inner: Arc::clone(&self.inner),
            snapshot: None,
            cursor: 0,
        })
    }
}

/// Like [`BucketScan`], materializes the member ids on the first page so a
/// concurrent writer cannot make the scan loop forever.
struct ListScan {
    name: String,
    page_size: usize,
    inner: Arc<Mutex<Inner>>,
    snapshot: Option<Vec<String>>,
    cursor: usize,
}

#[async_trait]
impl Scan<String> for ListScan {
    async fn next_page(&mut self) -> Result<Option<Vec<String>>, StoreError> {
        if self.snapshot.is_none() {
            let inner = self.inner.lock().await;
            let ids = inner
                .lists
                .get(&self.name)
                .map(|list| list.order.values().cloned().collect())
                .unwrap_or_default();
            self.snapshot = Some(ids);
        }
        let items = self.snapshot.as_ref().unwrap();
        if self.cursor >= items.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.page_size.max(1)).min(items.len());
        let page = items[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Some(page))
    }
}

struct MemoryAcquisition {
    name: String,
    owner: String,
    /// Owner observed when the acquisition was attempted.
    owned_by: String,
    ttl: Duration,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl Acquisition for MemoryAcquisition {
    fn acquired(&self) -> bool {
        self.owner == self.owned_by
    }

    fn owner(&self) -> String {
        self.owned_by.clone()
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn refresh(&self, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.locks.get_mut(&self.name) {
            Some(lock) if lock.owner == self.owner && lock.expires_at > now => {
                lock.expires_at = now + ttl;
                Ok(())
            }
            Some(lock) => Err(StoreError::NotOwner(lock.owner.clone())),
            None => Err(StoreError::NotOwner(String::new())),
        }
    }

    async fn release(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .locks
            .get(&self.name)
            .is_some_and(|lock| lock.owner == self.owner)
        {
            inner.locks.remove(&self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PARTITIONS;
    use tokio::time::sleep;

    #[tokio::test]
    async fn bucket_put_get_remove() {
        let store = MemoryStore::new();
        let bucket = store.bucket("tasks");

        bucket.put("t-1", b"one", None).await.unwrap();
        assert_eq!(bucket.get("t-1").await.unwrap(), Some(b"one".to_vec()));

        let previous = bucket.remove("t-1").await.unwrap();
        assert_eq!(previous, Some(b"one".to_vec()));
        assert_eq!(bucket.get("t-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn bucket_entries_expire() {
        let store = MemoryStore::new();
        let bucket = store.bucket("tasks");

        bucket
            .put("t-1", b"one", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(bucket.get("t-1").await.unwrap().is_some());

        sleep(Duration::from_millis(40)).await;
        assert_eq!(bucket.get("t-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn bucket_scan_sees_only_its_partition() {
        let store = MemoryStore::new();
        let bucket = store.bucket("tasks");
        bucket.put("a", b"a", None).await.unwrap();
        bucket.put("b", b"b", None).await.unwrap();

        let mut found = 0;
        for p in 0..PARTITIONS {
            let mut scan = bucket.enumerate(EnumOptions {
                page_size: 10,
                partition: p,
            });
            while let Some(page) = scan.next_page().await.unwrap() {
                found += page.len();
            }
        }
        assert_eq!(found, 2);
    }

    #[tokio::test]
    async fn ordered_list_is_oldest_first_and_insert_refreshes_order() {
        let store = MemoryStore::new();
        let list = store.ordered_list("pending");

        list.set("a", true).await.unwrap();
        list.set("b", true).await.unwrap();
        list.set("c", true).await.unwrap();
        // Re-inserting "a" moves it behind "c".
        list.set("a", true).await.unwrap();
        list.set("b", false).await.unwrap();

        assert!(list.has("a").await.unwrap());
        assert!(!list.has("b").await.unwrap());

        let mut scan = list.enumerate(10);
        let page = scan.next_page().await.unwrap().unwrap();
        assert_eq!(page, vec!["c".to_string(), "a".to_string()]);
        assert!(scan.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_scan_pages_by_size() {
        let store = MemoryStore::new();
        let list = store.ordered_list("pending");
        for id in ["a", "b", "c"] {
            list.set(id, true).await.unwrap();
        }

        let mut scan = list.enumerate(2);
        assert_eq!(scan.next_page().await.unwrap().unwrap().len(), 2);
        assert_eq!(scan.next_page().await.unwrap().unwrap().len(), 1);
        assert!(scan.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_is_exclusive_between_owners() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);

        let first = store.acquire("task:t-1", "worker-0", ttl).await.unwrap();
        let second = store.acquire("task:t-1", "worker-1", ttl).await.unwrap();

        assert!(first.acquired());
        assert!(!second.acquired());
        assert_eq!(second.owner(), "worker-0");

        // Losing contender cannot mutate the lock.
        assert!(second.refresh(ttl).await.is_err());
        second.release().await.unwrap();
        assert!(first.refresh(ttl).await.is_ok());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reclaimed_by_another_owner() {
        let store = MemoryStore::new();

        let first = store
            .acquire("task:t-1", "worker-0", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(first.acquired());

        sleep(Duration::from_millis(40)).await;

        let second = store
            .acquire("task:t-1", "worker-1", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(second.acquired());
        assert!(first.refresh(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = MemoryStore::new();
        let acq = store
            .acquire("task:t-1", "worker-0", Duration::from_secs(10))
            .await
            .unwrap();
        acq.release().await.unwrap();
        acq.release().await.unwrap();

        let again = store
            .acquire("task:t-1", "worker-1", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(again.acquired());
    }

    #[tokio::test]
    async fn reacquire_by_same_owner_succeeds() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        let first = store.acquire("task:t-1", "worker-0", ttl).await.unwrap();
        let second = store.acquire("task:t-1", "worker-0", ttl).await.unwrap();
        assert!(first.acquired());
        assert!(second.acquired());
    }
}
