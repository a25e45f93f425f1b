use std::collections::HashMap;
use std::sync::Arc;

use fieldx::fxstruct;
use moka::future::Cache;
use tracing::debug;

use crate::types::CacheEntry;
use crate::types::CacheKey;
use crate::types::ResourceKind;
use crate::types::UserId;

/// Marker of how many times a (user, kind) prefix has been evicted. A fetch remembers the generation it started
/// with; its result is only worth caching if nothing was evicted in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation(pub(crate) u64);

#[derive(Debug, Default)]
pub(crate) struct Generations {
    counter:    u64,
    cleared_at: u64,
    stamps:     HashMap<(UserId, ResourceKind), u64>,
}

impl Generations {
    pub(crate) fn current(&self, user_id: &UserId, kind: ResourceKind) -> Generation {
        let stamp = self.stamps.get(&(user_id.clone(), kind)).copied().unwrap_or(0);
        Generation(stamp.max(self.cleared_at))
    }

    pub(crate) fn bump(&mut self, user_id: &UserId, kind: ResourceKind) {
        self.counter += 1;
        self.stamps.insert((user_id.clone(), kind), self.counter);
    }

    pub(crate) fn bump_all(&mut self) {
        self.counter += 1;
        self.cleared_at = self.counter;
        self.stamps.clear();
    }
}

/// Page-level record cache.
///
/// Maps (user, resource kind, filter, page) to the records of that page and the total count of the filtered set.
/// Nothing expires on its own: entries stay until evicted by a mutation, a change event, or [`RecordCache::clear`].
/// Lookups never touch the backend and never fail; a miss is just `None`.
///
/// ```ignore
/// let cache = RecordCache::builder().name("records").build()?;
/// cache.put(key.clone(), entry).await;
/// assert!(cache.get(&key).await.is_some());
/// cache.evict_resource(&key.user_id, key.kind).await;
/// assert!(cache.get(&key).await.is_none());
/// ```
#[fxstruct(
    sync,
    rc,
    no_new,
    default(off),
    builder(
        doc("Builder object of [`RecordCache`].", "", "See [`RecordCache::builder()`] method."),
        method_doc("Implement builder pattern for [`RecordCache`]."),
    )
)]
pub struct RecordCache {
    /// Cache name. Most useful for debugging and logging.
    #[fieldx(get(clone), builder(into), default(String::from("records")))]
    name: String,

    /// Maximum number of pages to keep; `0` means unbounded.
    #[fieldx(get(copy), default(0))]
    max_capacity: u64,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    store: Arc<Cache<CacheKey, CacheEntry>>,

    #[fieldx(private, lazy, lock, get_mut, builder(off))]
    generations: Generations,
}

impl RecordCache {
    fn build_store(&self) -> Arc<Cache<CacheKey, CacheEntry>> {
        let builder = Cache::<CacheKey, CacheEntry>::builder().name(&self.name());
        Arc::new(if self.max_capacity() > 0 {
            builder.max_capacity(self.max_capacity()).build()
        }
        else {
            builder.build()
        })
    }

    fn build_generations(&self) -> Generations {
        Generations::default()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.store().get(key).await;
        debug!("[{}] GET({key}) hit={}", self.name(), entry.is_some());
        entry
    }

    pub async fn put(&self, key: CacheKey, entry: CacheEntry) {
        debug!("[{}] PUT({key}) records={}", self.name(), entry.records.len());
        self.store().insert(key, entry).await;
    }

    pub fn generation(&self, user_id: &UserId, kind: ResourceKind) -> Generation {
        self.generations_mut().current(user_id, kind)
    }

    /// Store `entry` unless the key's prefix has been evicted since `generation` was taken. Returns whether the entry
    /// was kept.
    pub async fn put_if_current(&self, key: CacheKey, entry: CacheEntry, generation: Generation) -> bool {
        if self.generation(&key.user_id, key.kind) != generation {
            debug!("[{}] Dropping outdated result for {key}", self.name());
            return false;
        }

        self.put(key.clone(), entry).await;

        // An eviction may have slipped in between the check and the insert. Evictions bump the generation before
        // sweeping, so re-checking here closes the gap.
        if self.generation(&key.user_id, key.kind) != generation {
            self.store().invalidate(&key).await;
            return false;
        }
        true
    }

    /// Remove every entry whose key satisfies `predicate`. Returns how many were removed; removing nothing is fine.
    pub async fn evict_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheKey) -> bool,
    {
        let store = self.store();
        let keys: Vec<Arc<CacheKey>> = store
            .iter()
            .filter_map(|(key, _)| predicate(key.as_ref()).then_some(key))
            .collect();
        for key in &keys {
            store.invalidate(key.as_ref()).await;
        }
        keys.len()
    }

    /// Drop all pages of `kind` belonging to `user_id`, whatever their filter or page number.
    pub async fn evict_resource(&self, user_id: &UserId, kind: ResourceKind) -> usize {
        self.generations_mut().bump(user_id, kind);
        let evicted = self.evict_matching(|key| key.belongs_to(user_id, kind)).await;
        debug!("[{}] Evicted {evicted} page(s) of {user_id}/{kind}", self.name());
        evicted
    }

    pub async fn clear(&self) {
        self.generations_mut().bump_all();
        let evicted = self.evict_matching(|_| true).await;
        debug!("[{}] Cleared {evicted} page(s)", self.name());
    }
}
