//! Deterministic in-memory collaborators and topology builders shared by
//! the unit and integration test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::{Role, ServerId, ShardId, ShardRecord};
use crate::mux::{Backend, ConnectError, Connection};
use crate::registry::{MetadataCache, ShardRegistry, ShardStore};
use crate::server::{ConnectionConfig, DatabaseServer, Engine, ServerMap};

/// In-memory [`ShardStore`] with a kill switch to simulate storage loss.
#[derive(Default)]
pub struct MemoryShardStore {
    rows: Mutex<HashMap<ShardId, ShardRecord>>,
    failing: AtomicBool,
}

impl MemoryShardStore {
    pub fn with_records(records: Vec<ShardRecord>) -> Self {
        let rows = records.into_iter().map(|r| (r.id, r)).collect();
        Self {
            rows: Mutex::new(rows),
            failing: AtomicBool::new(false),
        }
    }

    pub fn put(&self, record: ShardRecord) {
        self.rows.lock().insert(record.id, record);
    }

    /// Every subsequent query fails, as if the backing table vanished.
    pub fn fail_everything(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("shard storage unreachable");
        }
        Ok(())
    }
}

impl ShardStore for MemoryShardStore {
    fn find_default(&self) -> Result<Option<ShardRecord>> {
        self.check()?;
        Ok(self.rows.lock().values().find(|r| r.is_default).cloned())
    }

    fn find_by_id(&self, id: ShardId) -> Result<Option<ShardRecord>> {
        self.check()?;
        Ok(self.rows.lock().get(&id).cloned())
    }

    fn all(&self) -> Result<Vec<ShardRecord>> {
        self.check()?;
        let mut records: Vec<ShardRecord> = self.rows.lock().values().cloned().collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    fn insert(&self, record: &ShardRecord) -> Result<()> {
        self.check()?;
        self.rows.lock().insert(record.id, record.clone());
        Ok(())
    }

    fn update(&self, record: &ShardRecord) -> Result<()> {
        self.check()?;
        self.rows.lock().insert(record.id, record.clone());
        Ok(())
    }

    fn delete(&self, id: ShardId) -> Result<()> {
        self.check()?;
        self.rows.lock().remove(&id);
        Ok(())
    }
}

/// A store that never answers; stands in for an unbootstrapped deployment.
pub fn failing_store() -> Arc<dyn ShardStore> {
    let store = MemoryShardStore::default();
    store.fail_everything();
    Arc::new(store)
}

/// In-memory get-or-compute [`MetadataCache`]. Entries are held as JSON
/// strings so rows genuinely cross the collaborator boundary serialized,
/// like they would with an external cache daemon.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
    computes: AtomicU64,
}

impl MemoryCache {
    /// How many times a compute closure actually ran (cache misses).
    pub fn compute_count(&self) -> u64 {
        self.computes.load(Ordering::SeqCst)
    }
}

impl MetadataCache for MemoryCache {
    fn fetch(
        &self,
        key: &str,
        compute: &mut dyn FnMut() -> Result<Option<ShardRecord>>,
    ) -> Result<Option<ShardRecord>> {
        if let Some(hit) = self.entries.lock().get(key) {
            return Ok(Some(serde_json::from_str(hit)?));
        }
        self.computes.fetch_add(1, Ordering::SeqCst);
        let computed = compute()?;
        if let Some(record) = &computed {
            self.entries
                .lock()
                .insert(key.to_string(), serde_json::to_string(record)?);
        }
        Ok(computed)
    }

    fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Scripted [`Backend`] that records every connect/switch/disconnect and
/// can be told to refuse individual endpoints.
pub struct RecordingBackend {
    events: Arc<Mutex<Vec<String>>>,
    failures: Mutex<HashMap<String, bool>>,
    connected: AtomicU64,
}

impl RecordingBackend {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Arc::new(Mutex::new(Vec::new())),
            failures: Mutex::new(HashMap::new()),
            connected: AtomicU64::new(0),
        })
    }

    pub fn fail_transient(&self, endpoint: &str) {
        self.failures.lock().insert(endpoint.to_string(), true);
    }

    pub fn fail_fatal(&self, endpoint: &str) {
        self.failures.lock().insert(endpoint.to_string(), false);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Successful physical connections established.
    pub fn connect_count(&self) -> u64 {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Backend for RecordingBackend {
    fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>, ConnectError> {
        let endpoint = config.endpoint();
        self.events.lock().push(format!("connect {endpoint}"));
        if let Some(transient) = self.failures.lock().get(&endpoint) {
            return Err(if *transient {
                ConnectError::transient(format!("{endpoint} refused"))
            } else {
                ConnectError::fatal(format!("{endpoint} rejected credentials"))
            });
        }
        self.connected.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingConnection {
            events: self.events.clone(),
            disconnected: false,
        }))
    }
}

struct RecordingConnection {
    events: Arc<Mutex<Vec<String>>>,
    disconnected: bool,
}

impl Connection for RecordingConnection {
    fn switch_database(&mut self, database: &str) -> Result<()> {
        self.events.lock().push(format!("switch {database}"));
        Ok(())
    }

    fn disconnect(&mut self) {
        if !self.disconnected {
            self.disconnected = true;
            self.events.lock().push("disconnect".to_string());
        }
    }
}

fn server(name: &str, shareable: bool) -> DatabaseServer {
    let id = ServerId::new(name);
    if shareable {
        let config = |suffix: &str| ConnectionConfig {
            host: Some(format!("{name}-{suffix}")),
            port: Some(5432),
            database: Some("app".to_string()),
            username: Some("app".to_string()),
            ..ConnectionConfig::default()
        };
        DatabaseServer::new(id, Engine::Postgres)
            .with_role(Role::Primary, vec![config("a"), config("b")])
    } else {
        DatabaseServer::new(id, Engine::Sqlite).with_role(
            Role::Primary,
            vec![ConnectionConfig {
                path: Some(format!("/var/lib/{name}.db").into()),
                database: Some("app".to_string()),
                ..ConnectionConfig::default()
            }],
        )
    }
}

/// Server map with uniformly shareable postgres-flavored servers; the first
/// name is the default server.
pub fn topology(names: &[&str]) -> ServerMap {
    let servers = names.iter().map(|name| server(name, true)).collect();
    let default_id = ServerId::new(names.first().copied().unwrap_or("primary"));
    ServerMap::new(servers, default_id)
}

/// Declarative test topology: `(server name, shareable)` plus
/// `(shard id, server name, is_default)`.
pub struct TopologySpec {
    pub servers: Vec<(&'static str, bool)>,
    pub shards: Vec<(i64, &'static str, bool)>,
}

/// Registry over an in-memory store/cache pair built from a
/// [`TopologySpec`].
pub fn registry_with_topology(spec: TopologySpec) -> Arc<ShardRegistry> {
    let servers: Vec<DatabaseServer> = spec
        .servers
        .iter()
        .map(|(name, shareable)| server(name, *shareable))
        .collect();
    let default_id = ServerId::new(spec.servers.first().map(|(n, _)| *n).unwrap_or("primary"));
    let records: Vec<ShardRecord> = spec
        .shards
        .iter()
        .map(|(id, server, is_default)| {
            ShardRecord::new(ShardId(*id), Some(ServerId::new(*server)), *is_default)
        })
        .collect();
    Arc::new(ShardRegistry::new(
        Arc::new(MemoryShardStore::with_records(records)),
        Arc::new(MemoryCache::default()),
        ServerMap::new(servers, default_id),
    ))
}

/// Seeded fleet generator for soak-style tests: shard 1 is the default,
/// the rest are spread randomly over `servers`.
pub fn generate_fleet(seed: u64, count: i64, servers: &[&str]) -> Vec<ShardRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (1..=count)
        .map(|id| {
            let server = servers[rng.random_range(0..servers.len())];
            ShardRecord::new(ShardId(id), Some(ServerId::new(server)), id == 1)
        })
        .collect()
}
