//! # Shard Registry
//!
//! In-process, identity-keyed cache of shard metadata backed by two pluggable
//! collaborators: a keyed storage query (`ShardStore`) and an external
//! get-or-compute cache (`MetadataCache`). Owns the bootstrap default-shard
//! sentinel and the cache invalidation performed by persistence hooks.

use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context;
use crate::model::{Category, Shard, ShardId, ShardRecord, ShardRef};
use crate::server::{DatabaseServer, ServerMap};

/// External cache key for the default shard row.
pub const DEFAULT_SHARD_CACHE_KEY: &str = "default_shard";

/// Bounded size of the in-process shard cache.
const SHARD_CACHE_CAPACITY: usize = 16_384;

fn shard_cache_key(id: ShardId) -> String {
    format!("shard/{}", id.0)
}

/// Storage query collaborator: any keyed lookup over the persisted shard
/// rows.
pub trait ShardStore: Send + Sync {
    fn find_default(&self) -> Result<Option<ShardRecord>>;
    fn find_by_id(&self, id: ShardId) -> Result<Option<ShardRecord>>;
    fn all(&self) -> Result<Vec<ShardRecord>>;
    fn insert(&self, record: &ShardRecord) -> Result<()>;
    fn update(&self, record: &ShardRecord) -> Result<()>;
    fn delete(&self, id: ShardId) -> Result<()>;
}

/// External cache collaborator: get-or-compute by string key with explicit
/// delete, used to avoid repeated storage round-trips for shard metadata.
pub trait MetadataCache: Send + Sync {
    fn fetch(
        &self,
        key: &str,
        compute: &mut dyn FnMut() -> Result<Option<ShardRecord>>,
    ) -> Result<Option<ShardRecord>>;
    fn delete(&self, key: &str);
}

enum DefaultSlot {
    Unresolved,
    /// Resolution in flight; re-entrant callers observe the provisional
    /// sentinel instead of looping.
    Resolving(ShardRef),
    Cached {
        shard: ShardRef,
        /// False when the cached value is the sentinel rather than a
        /// persisted row.
        real: bool,
    },
}

struct RegistryState {
    shards: LruCache<ShardId, ShardRef>,
    default: DefaultSlot,
}

/// Identity-keyed registry of shards with bootstrap/caching semantics.
pub struct ShardRegistry {
    store: Arc<dyn ShardStore>,
    cache: Arc<dyn MetadataCache>,
    servers: ServerMap,
    state: Mutex<RegistryState>,
}

impl ShardRegistry {
    pub fn new(
        store: Arc<dyn ShardStore>,
        cache: Arc<dyn MetadataCache>,
        servers: ServerMap,
    ) -> Self {
        Self {
            store,
            cache,
            servers,
            state: Mutex::new(RegistryState {
                shards: LruCache::new(
                    NonZeroUsize::new(SHARD_CACHE_CAPACITY).expect("cache capacity"),
                ),
                default: DefaultSlot::Unresolved,
            }),
        }
    }

    pub fn servers(&self) -> &ServerMap {
        &self.servers
    }

    /// The cached default shard. Never fails: storage trouble degrades to
    /// the sentinel.
    pub fn default_shard(&self) -> ShardRef {
        self.resolve_default(false, false)
    }

    /// Resolve the default shard, optionally forcing a reload. With
    /// `with_fallback`, a previously resolved real shard is kept over
    /// regressing to the sentinel when storage is unreachable.
    pub fn resolve_default(&self, reload: bool, with_fallback: bool) -> ShardRef {
        let prior_real;
        {
            let mut state = self.state.lock();
            match &state.default {
                DefaultSlot::Resolving(provisional) => return provisional.clone(),
                DefaultSlot::Cached { shard, .. } if !reload => return shard.clone(),
                _ => {}
            }
            prior_real = match &state.default {
                DefaultSlot::Cached { shard, real: true } => Some(shard.clone()),
                _ => None,
            };
            state.default = DefaultSlot::Resolving(Arc::new(Shard::sentinel()));
        }

        if reload {
            self.cache.delete(DEFAULT_SHARD_CACHE_KEY);
        }
        let store = self.store.clone();
        let resolved = self.cache.fetch(DEFAULT_SHARD_CACHE_KEY, &mut || {
            store.find_default()
        });

        let mut state = self.state.lock();
        let slot = match resolved {
            Ok(Some(record)) => DefaultSlot::Cached {
                shard: Arc::new(Shard::from_record(record)),
                real: true,
            },
            Ok(None) => {
                debug!("no default shard row; using sentinel");
                DefaultSlot::Cached {
                    shard: Arc::new(Shard::sentinel()),
                    real: false,
                }
            }
            Err(err) => {
                if let (true, Some(stale)) = (with_fallback, prior_real) {
                    warn!(error = %err, "default shard reload failed; keeping stale value");
                    DefaultSlot::Cached {
                        shard: stale,
                        real: true,
                    }
                } else {
                    warn!(error = %err, "default shard unavailable; using sentinel");
                    DefaultSlot::Cached {
                        shard: Arc::new(Shard::sentinel()),
                        real: false,
                    }
                }
            }
        };
        state.default = slot;
        match &state.default {
            DefaultSlot::Cached { shard, .. } => shard.clone(),
            _ => unreachable!("default slot just cached"),
        }
    }

    /// Find a shard by selector. Returns `None` for unknown ids; negative
    /// results are not cached, so repeated misses keep costing one query.
    pub fn lookup(&self, selector: impl Into<ShardSelector>) -> Option<ShardRef> {
        let id = match selector.into() {
            ShardSelector::Id(id) => id,
            ShardSelector::SelfShard | ShardSelector::Default => {
                return Some(self.default_shard())
            }
            ShardSelector::Invalid => return None,
        };
        if id <= 0 {
            return None;
        }
        let id = ShardId(id);

        // Fast paths: the current and default shards skip the cache.
        let current = context::current(&Category::primary(), self);
        if !current.is_sentinel() && current.id() == id {
            return Some(current);
        }
        let default = self.default_shard();
        if !default.is_sentinel() && default.id() == id {
            return Some(default);
        }

        if let Some(hit) = self.state.lock().shards.get(&id) {
            return Some(hit.clone());
        }

        // Miss: consult the external cache-or-storage pair under the default
        // shard's routing context, materializing a detached value object.
        let fetched = context::activate(
            self,
            &[(Category::primary(), default)],
            || {
                let store = self.store.clone();
                self.cache
                    .fetch(&shard_cache_key(id), &mut || store.find_by_id(id))
            },
        );
        match fetched {
            Ok(Some(record)) => {
                let shard: ShardRef = Arc::new(Shard::from_record(record));
                self.state.lock().shards.put(id, shard.clone());
                Some(shard)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(shard = %id, error = %err, "shard lookup failed");
                None
            }
        }
    }

    /// Every persisted shard, as detached value objects. Populates the
    /// in-process cache as a side effect.
    pub fn all_shards(&self) -> Result<Vec<ShardRef>> {
        let records = self.store.all().context("enumerating shards")?;
        let mut state = self.state.lock();
        Ok(records
            .into_iter()
            .map(|record| {
                let id = record.id;
                let shard: ShardRef = Arc::new(Shard::from_record(record));
                state.shards.put(id, shard.clone());
                shard
            })
            .collect())
    }

    /// Drop the in-process cache and the memoized default, forcing
    /// recomputation on next access.
    pub fn clear_cache(&self) {
        let mut state = self.state.lock();
        state.shards.clear();
        state.default = DefaultSlot::Unresolved;
    }

    /// Persist a new shard row. Creating a second default shard is a hard
    /// error.
    pub fn create(&self, record: ShardRecord) -> Result<ShardRef> {
        if record.id.0 <= 0 {
            bail!("shard id must be positive, got {}", record.id);
        }
        if record.is_default {
            if let Some(existing) = self.store.find_default()? {
                if existing.id != record.id {
                    bail!(
                        "default shard already exists as {}; only one shard may be default",
                        existing.id
                    );
                }
            }
        }
        self.store.insert(&record).context("inserting shard row")?;
        self.invalidate(&record);
        Ok(Arc::new(Shard::from_record(record)))
    }

    /// Persist changes to an existing shard row, invalidating its cache
    /// entry and, for the default shard, the well-known default key.
    pub fn persist(&self, record: &ShardRecord) -> Result<()> {
        if record.is_default {
            if let Some(existing) = self.store.find_default()? {
                if existing.id != record.id {
                    bail!(
                        "default shard already exists as {}; only one shard may be default",
                        existing.id
                    );
                }
            }
        }
        self.store.update(record).context("updating shard row")?;
        self.invalidate(record);
        Ok(())
    }

    /// Remove a shard row. The default shard (and the sentinel) are never
    /// destroyable.
    pub fn destroy(&self, shard: &Shard) -> Result<()> {
        if shard.is_sentinel() {
            bail!("the sentinel default shard cannot be destroyed");
        }
        if shard.is_default() {
            bail!("cannot destroy the default shard {}", shard.id());
        }
        self.store
            .delete(shard.id())
            .with_context(|| format!("deleting shard {}", shard.id()))?;
        self.invalidate(shard.record());
        Ok(())
    }

    /// The server hosting a shard; shards without an explicit server (the
    /// sentinel included) live on the default server.
    pub fn server_for(&self, shard: &Shard) -> Option<Arc<DatabaseServer>> {
        match shard.database_server_id() {
            Some(id) => self.servers.get(id),
            None => self.servers.default_server(),
        }
    }

    fn invalidate(&self, record: &ShardRecord) {
        self.cache.delete(&shard_cache_key(record.id));
        let mut state = self.state.lock();
        state.shards.pop(&record.id);
        if record.is_default {
            self.cache.delete(DEFAULT_SHARD_CACHE_KEY);
            state.default = DefaultSlot::Unresolved;
        }
    }
}

/// How a caller may name a shard in `lookup`: a raw id, the literal tokens
/// `self`/`default`, or garbage that resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardSelector {
    Id(i64),
    SelfShard,
    Default,
    Invalid,
}

impl From<i64> for ShardSelector {
    fn from(id: i64) -> Self {
        ShardSelector::Id(id)
    }
}

impl From<ShardId> for ShardSelector {
    fn from(id: ShardId) -> Self {
        ShardSelector::Id(id.0)
    }
}

impl From<&str> for ShardSelector {
    fn from(token: &str) -> Self {
        match token {
            "self" => ShardSelector::SelfShard,
            "default" => ShardSelector::Default,
            other => other
                .parse::<i64>()
                .map(ShardSelector::Id)
                .unwrap_or(ShardSelector::Invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServerId;
    use crate::test_support::{failing_store, topology, MemoryCache, MemoryShardStore};

    fn registry_with(records: Vec<ShardRecord>) -> ShardRegistry {
        ShardRegistry::new(
            Arc::new(MemoryShardStore::with_records(records)),
            Arc::new(MemoryCache::default()),
            topology(&["primary"]),
        )
    }

    fn record(id: i64, is_default: bool) -> ShardRecord {
        ShardRecord::new(ShardId(id), Some(ServerId::new("primary")), is_default)
    }

    #[test]
    fn default_resolves_persisted_row() {
        let registry = registry_with(vec![record(1, true), record(2, false)]);
        let default = registry.default_shard();
        assert_eq!(default.id(), ShardId(1));
        assert!(!default.is_sentinel());
    }

    #[test]
    fn default_degrades_to_sentinel_without_storage() {
        let registry = ShardRegistry::new(
            failing_store(),
            Arc::new(MemoryCache::default()),
            topology(&["primary"]),
        );
        let default = registry.default_shard();
        assert!(default.is_sentinel());
    }

    #[test]
    fn default_with_fallback_keeps_stale_value() {
        let store = Arc::new(MemoryShardStore::with_records(vec![record(1, true)]));
        let registry = ShardRegistry::new(
            store.clone(),
            Arc::new(MemoryCache::default()),
            topology(&["primary"]),
        );
        assert_eq!(registry.default_shard().id(), ShardId(1));

        store.fail_everything();
        let kept = registry.resolve_default(true, true);
        assert_eq!(kept.id(), ShardId(1));
        assert!(!kept.is_sentinel());

        // Without the fallback flag the same failure regresses to the
        // sentinel.
        let regressed = registry.resolve_default(true, false);
        assert!(regressed.is_sentinel());
    }

    #[test]
    fn lookup_by_id_token_and_miss() {
        let registry = registry_with(vec![record(1, true), record(7, false)]);
        assert_eq!(registry.lookup(7).unwrap().id(), ShardId(7));
        assert_eq!(registry.lookup("7").unwrap().id(), ShardId(7));
        assert_eq!(registry.lookup("default").unwrap().id(), ShardId(1));
        assert_eq!(registry.lookup("self").unwrap().id(), ShardId(1));
        assert!(registry.lookup(99).is_none());
        assert!(registry.lookup("junk").is_none());
        assert!(registry.lookup(-7).is_none());
    }

    #[test]
    fn lookup_misses_are_not_cached() {
        let store = Arc::new(MemoryShardStore::with_records(vec![record(1, true)]));
        let registry = ShardRegistry::new(
            store.clone(),
            Arc::new(MemoryCache::default()),
            topology(&["primary"]),
        );
        assert!(registry.lookup(5).is_none());
        store.put(record(5, false));
        // A freshly created shard becomes visible immediately.
        assert_eq!(registry.lookup(5).unwrap().id(), ShardId(5));
    }

    #[test]
    fn lookup_layers_caches_over_storage() {
        let store = Arc::new(MemoryShardStore::with_records(vec![
            record(1, true),
            record(7, false),
        ]));
        let cache = Arc::new(MemoryCache::default());
        let registry = ShardRegistry::new(store.clone(), cache.clone(), topology(&["primary"]));
        assert!(registry.lookup(7).is_some());
        let computed = cache.compute_count();

        store.fail_everything();
        // In-process cache answers without touching the collaborators.
        assert!(registry.lookup(7).is_some());
        assert_eq!(cache.compute_count(), computed);

        // Dropping the in-process layer falls through to the external
        // cache, which still has the row despite storage being down.
        registry.clear_cache();
        assert!(registry.lookup(7).is_some());

        cache.delete("shard/7");
        registry.clear_cache();
        assert!(registry.lookup(7).is_none());
    }

    #[test]
    fn destroy_default_is_a_hard_error() {
        let registry = registry_with(vec![record(1, true), record(2, false)]);
        let default = registry.default_shard();
        assert!(registry.destroy(&default).is_err());
        assert!(registry.destroy(&Shard::sentinel()).is_err());

        let other = registry.lookup(2).unwrap();
        registry.destroy(&other).unwrap();
        assert!(registry.lookup(2).is_none());
    }

    #[test]
    fn second_default_is_rejected() {
        let registry = registry_with(vec![record(1, true)]);
        let err = registry.create(record(2, true)).unwrap_err();
        assert!(err.to_string().contains("default shard already exists"));
    }

    #[test]
    fn persisting_default_invalidates_memoized_default() {
        let store = Arc::new(MemoryShardStore::with_records(vec![record(1, true)]));
        let registry = ShardRegistry::new(
            store,
            Arc::new(MemoryCache::default()),
            topology(&["primary"]),
        );
        assert_eq!(registry.default_shard().id(), ShardId(1));

        let mut updated = record(1, true);
        updated.name = Some("renamed".to_string());
        registry.persist(&updated).unwrap();
        let fresh = registry.default_shard();
        assert_eq!(fresh.record().name.as_deref(), Some("renamed"));
    }

    #[test]
    fn selector_parses_tokens() {
        assert_eq!(ShardSelector::from("self"), ShardSelector::SelfShard);
        assert_eq!(ShardSelector::from("default"), ShardSelector::Default);
        assert_eq!(ShardSelector::from("12"), ShardSelector::Id(12));
        assert_eq!(ShardSelector::from("nope"), ShardSelector::Invalid);
    }
}
