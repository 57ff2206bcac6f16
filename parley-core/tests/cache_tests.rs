// ABOUTME: Entity cache tests against a storage backend that counts and can fail calls
// ABOUTME: Single in-flight fetch per key, field merging, change-only and retried flushes

use anyhow::{bail, Result};
use async_trait::async_trait;
use parley_core::{
    CacheLimits, EntityCache, EntityKey, EntityKind, MemoryStorage, Query, Row, Storage, Table,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wraps `MemoryStorage`, counting calls and slowing reads down
#[derive(Default)]
struct CountingStorage {
    inner: MemoryStorage,
    gets: AtomicUsize,
    sets: AtomicUsize,
    creates: AtomicUsize,
    fail_sets: AtomicBool,
    requested: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl Storage for CountingStorage {
    async fn get(&self, table: Table, query: &Query, fields: &[String]) -> Result<Vec<Row>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(fields.to_vec());
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.get(table, query, fields).await
    }

    async fn set(&self, table: Table, query: &Query, patch: &Row) -> Result<()> {
        if self.fail_sets.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(table, query, patch).await
    }

    async fn create(&self, table: Table, row: Row) -> Result<Row> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(table, row).await
    }
}

fn limits() -> CacheLimits {
    CacheLimits {
        max_age: Duration::from_secs(60),
        max_len: 100,
    }
}

fn cache(storage: Arc<CountingStorage>) -> Arc<EntityCache> {
    Arc::new(EntityCache::new(storage, limits(), limits(), 1))
}

fn alice() -> EntityKey {
    EntityKey::new(EntityKind::User, "console", "alice")
}

fn fields(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_concurrent_observers_share_one_fetch() {
    let storage = Arc::new(CountingStorage::default());
    let cache = cache(storage.clone());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache.observe(alice(), &fields(&["flag", "authority"])).await
        }));
    }
    let mut observed = Vec::new();
    for handle in handles {
        observed.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(storage.gets.load(Ordering::SeqCst), 1);
    assert_eq!(storage.creates.load(Ordering::SeqCst), 1);
    assert!(observed.iter().all(|e| Arc::ptr_eq(e, &observed[0])));
}

#[tokio::test]
async fn test_concurrent_observers_with_different_fields() {
    let storage = Arc::new(CountingStorage::default());
    let cache = cache(storage.clone());

    let a = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.observe(alice(), &fields(&["flag"])).await })
    };
    let b = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.observe(alice(), &fields(&["flag", "points"])).await })
    };
    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert!(a.missing_fields(&fields(&["flag", "points"])).is_empty());
    // Either one fetch covered both, or the second fetched only what was missing
    let requested = storage.requested.lock().unwrap().clone();
    assert!(requested.len() <= 2);
    if requested.len() == 2 {
        assert_eq!(requested[1], fields(&["points"]));
    }
}

#[tokio::test]
async fn test_refetch_merges_without_losing_writes() {
    let storage = Arc::new(CountingStorage::default());
    let mut row = Row::new();
    row.insert("platform".into(), json!("console"));
    row.insert("id".into(), json!("alice"));
    row.insert("flag".into(), json!(0));
    row.insert("points".into(), json!(10));
    row.insert("name".into(), json!("Alice"));
    storage.inner.create(Table::User, row).await.unwrap();
    let cache = cache(storage.clone());

    let user = cache.observe(alice(), &fields(&["flag"])).await.unwrap();
    user.set("flag", 2);
    let again = cache
        .observe(alice(), &fields(&["flag", "points"]))
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&user, &again));
    assert_eq!(again.get_u64("points"), 10);
    assert_eq!(again.flag(), 2);
    assert!(again.is_dirty());
    assert_eq!(storage.gets.load(Ordering::SeqCst), 2);
    assert_eq!(storage.requested.lock().unwrap()[1], fields(&["points"]));
}

#[tokio::test]
async fn test_flush_writes_only_changes_once() {
    let storage = Arc::new(CountingStorage::default());
    let cache = cache(storage.clone());
    let user = cache.observe(alice(), &fields(&["authority"])).await.unwrap();

    assert!(!cache.flush(&user).await.unwrap());
    assert_eq!(storage.sets.load(Ordering::SeqCst), 0);

    user.set("authority", 4);
    user.set("authority", 4);
    assert!(cache.flush(&user).await.unwrap());
    assert!(!cache.flush(&user).await.unwrap());
    assert_eq!(storage.sets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_flush_is_retried() {
    let storage = Arc::new(CountingStorage::default());
    let cache = cache(storage.clone());
    let user = cache.observe(alice(), &fields(&["authority"])).await.unwrap();
    user.set("authority", 3);

    storage.fail_sets.store(true, Ordering::SeqCst);
    assert!(cache.flush(&user).await.is_err());
    assert!(user.is_dirty());

    storage.fail_sets.store(false, Ordering::SeqCst);
    assert!(cache.flush(&user).await.unwrap());
    let rows = storage
        .inner
        .get(Table::User, &alice().query(), &fields(&["authority"]))
        .await
        .unwrap();
    assert_eq!(rows[0]["authority"], json!(3));
}

#[tokio::test]
async fn test_field_history_is_requested_after_eviction() {
    let storage = Arc::new(CountingStorage::default());
    let cache = cache(storage.clone());
    cache.observe(alice(), &fields(&["flag", "points"])).await.unwrap();
    cache.invalidate(&alice());

    cache.observe(alice(), &fields(&["flag"])).await.unwrap();

    let requested = storage.requested.lock().unwrap().clone();
    assert_eq!(requested.len(), 2);
    assert!(requested[1].contains(&"points".to_string()));
}
