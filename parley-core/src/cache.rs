// ABOUTME: Age- and size-bounded cache of observed users and channels
// ABOUTME: One in-flight fetch per key, field-set merging and change-only flushes

use crate::entity::{EntityKey, EntityKind, Observed};
use crate::error::DispatchError;
use crate::metrics;
use crate::sync::lock;
use crate::traits::Storage;
use lru::LruCache;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Eviction thresholds for one kind of entity
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_age: Duration,
    pub max_len: usize,
}

struct Entry {
    entity: Arc<Observed>,
    inserted_at: Instant,
}

/// LRU with an age bound
struct Shelf {
    entries: LruCache<EntityKey, Entry>,
    max_age: Duration,
    /// Every field ever requested for this kind; a refetch asks for all of them
    fields: BTreeSet<String>,
}

impl Shelf {
    fn new(limits: CacheLimits) -> Self {
        let capacity = NonZeroUsize::new(limits.max_len).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            max_age: limits.max_age,
            fields: BTreeSet::new(),
        }
    }

    fn get(&mut self, key: &EntityKey) -> Option<Arc<Observed>> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() >= self.max_age,
            None => return None,
        };
        if expired {
            self.entries.pop(key);
            return None;
        }
        self.entries.get(key).map(|e| e.entity.clone())
    }

    fn purge_expired(&mut self) -> usize {
        let max_age = self.max_age;
        let stale: Vec<EntityKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() >= max_age)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.entries.pop(key);
        }
        stale.len()
    }
}

/// Observed-entity cache in front of a storage backend.
///
/// Concurrent observers of the same key share one `Arc<Observed>`. Fetches
/// and flushes for a key are serialised by a per-key async lock, so N
/// concurrent misses cost one storage read.
pub struct EntityCache {
    storage: Arc<dyn Storage>,
    users: Mutex<Shelf>,
    channels: Mutex<Shelf>,
    key_locks: Mutex<HashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>>,
    auto_authorize: u32,
}

impl EntityCache {
    pub fn new(
        storage: Arc<dyn Storage>,
        users: CacheLimits,
        channels: CacheLimits,
        auto_authorize: u32,
    ) -> Self {
        Self {
            storage,
            users: Mutex::new(Shelf::new(users)),
            channels: Mutex::new(Shelf::new(channels)),
            key_locks: Mutex::new(HashMap::new()),
            auto_authorize,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn shelf(&self, kind: EntityKind) -> &Mutex<Shelf> {
        match kind {
            EntityKind::User => &self.users,
            EntityKind::Channel => &self.channels,
        }
    }

    fn key_lock(&self, key: &EntityKey) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.key_locks)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the per-key lock once nobody else is waiting on it
    fn release_key_lock(&self, key: &EntityKey, held: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = lock(&self.key_locks);
        // One reference in the map, one in `held`
        if Arc::strong_count(&held) <= 2 {
            locks.remove(key);
        }
    }

    /// Resident entity, if any. Does not touch storage.
    pub fn peek(&self, key: &EntityKey) -> Option<Arc<Observed>> {
        lock(self.shelf(key.kind)).get(key)
    }

    /// Get an entity with at least `fields` loaded.
    ///
    /// A miss fetches the requested fields unioned with every field asked
    /// for earlier; a missing row is created with defaults. A hit that lacks
    /// some of `fields` fetches just those and merges them in.
    pub async fn observe(
        &self,
        key: EntityKey,
        fields: &[String],
    ) -> Result<Arc<Observed>, DispatchError> {
        let key_lock = self.key_lock(&key);
        let result = {
            let _guard = key_lock.lock().await;
            self.observe_locked(&key, fields).await
        };
        self.release_key_lock(&key, key_lock);
        result
    }

    async fn observe_locked(
        &self,
        key: &EntityKey,
        fields: &[String],
    ) -> Result<Arc<Observed>, DispatchError> {
        let table = key.kind.table();

        if let Some(entity) = self.peek(key) {
            let missing = entity.missing_fields(fields);
            if missing.is_empty() {
                metrics::record_cache_hit(key.kind);
                return Ok(entity);
            }
            metrics::record_cache_miss(key.kind);
            tracing::debug!(entity = %key, fields = ?missing, "Fetching fields missing from cached entity");
            let rows = self
                .storage
                .get(table, &key.query(), &missing)
                .await
                .map_err(|e| DispatchError::storage("get", e))?;
            if let Some(row) = rows.into_iter().next() {
                entity.merge(row, &missing);
            } else {
                entity.merge(Default::default(), &missing);
            }
            lock(self.shelf(key.kind)).fields.extend(missing);
            return Ok(entity);
        }

        metrics::record_cache_miss(key.kind);
        let requested: Vec<String> = {
            let mut shelf = lock(self.shelf(key.kind));
            shelf.fields.extend(fields.iter().cloned());
            shelf.fields.iter().cloned().collect()
        };
        tracing::debug!(entity = %key, fields = ?requested, "Fetching entity");

        let rows = self
            .storage
            .get(table, &key.query(), &requested)
            .await
            .map_err(|e| DispatchError::storage("get", e))?;
        let row = match rows.into_iter().next() {
            Some(row) => row,
            None => {
                tracing::info!(entity = %key, "Creating entity record");
                self.storage
                    .create(table, key.default_row(self.auto_authorize))
                    .await
                    .map_err(|e| DispatchError::storage("create", e))?
            }
        };

        let entity = Arc::new(Observed::new(key.clone(), row, &requested));
        lock(self.shelf(key.kind)).entries.put(
            key.clone(),
            Entry {
                entity: entity.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(entity)
    }

    /// Persist changed fields. Returns whether a write happened.
    ///
    /// A failed write puts the changes back so a later flush retries them.
    pub async fn flush(&self, entity: &Observed) -> Result<bool, DispatchError> {
        let key = entity.key().clone();
        let key_lock = self.key_lock(&key);
        let result = {
            let _guard = key_lock.lock().await;
            match entity.take_changes() {
                None => Ok(false),
                Some(patch) => {
                    match self
                        .storage
                        .set(key.kind.table(), &key.query(), &patch)
                        .await
                    {
                        Ok(()) => {
                            metrics::record_flush(key.kind);
                            tracing::debug!(entity = %key, fields = patch.len(), "Flushed entity");
                            Ok(true)
                        }
                        Err(e) => {
                            entity.restore_changes(&patch);
                            Err(DispatchError::storage("set", e))
                        }
                    }
                }
            }
        };
        self.release_key_lock(&key, key_lock);
        result
    }

    /// Drop a resident entity so the next observe refetches it
    pub fn invalidate(&self, key: &EntityKey) -> bool {
        lock(self.shelf(key.kind)).entries.pop(key).is_some()
    }

    /// Evict entries older than their kind's max age
    pub fn purge_expired(&self) -> usize {
        let users = lock(&self.users).purge_expired();
        let channels = lock(&self.channels).purge_expired();
        if users + channels > 0 {
            tracing::debug!(users, channels, "Evicted expired entities");
        }
        users + channels
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        lock(self.shelf(kind)).entries.len()
    }

    pub fn is_empty(&self, kind: EntityKind) -> bool {
        self.len(kind) == 0
    }
}
