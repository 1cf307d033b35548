//! # Connection Multiplexer
//!
//! Maps (execution role, shard-or-server) to a concrete connection pool,
//! reusing one physical pool across shards that share a shareable backend by
//! switching the live connection's target database per checkout.
//!
//! The physical driver is a collaborator behind the [`Backend`] and
//! [`Connection`] traits; the pool bookkeeping (checkout/checkin, bound-shard
//! tracking, idle eviction, fallback promotion) lives here.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::context;
use crate::model::{now_epoch, Category, Role, ServerId, Shard, ShardId, ShardRef};
use crate::registry::ShardRegistry;
use crate::server::{ConnectionConfig, DatabaseServer};

/// Failure to establish a physical connection. The transient class triggers
/// the fallback-config walk; everything else surfaces immediately.
#[derive(Debug)]
pub struct ConnectError {
    transient: bool,
    message: String,
}

impl ConnectError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection failed: {}", self.message)
    }
}

impl std::error::Error for ConnectError {}

/// A live physical connection handed out by a [`Backend`].
pub trait Connection: Send {
    /// Re-point the live session at another logical database/schema.
    fn switch_database(&mut self, database: &str) -> Result<()>;
    /// Tear down the physical link. Idempotent.
    fn disconnect(&mut self);
}

/// Connection-establishment collaborator for one driver/engine.
pub trait Backend: Send + Sync {
    fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>, ConnectError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PoolShardTarget {
    shard: ShardId,
    database: String,
}

struct PooledEntry {
    conn: Box<dyn Connection>,
    /// Shard the connection's session is currently pointed at.
    bound: Option<ShardId>,
    last_used_at: i64,
}

struct PoolState {
    target: Option<PoolShardTarget>,
    idle: Vec<PooledEntry>,
    checked_out: usize,
    connected_total: u64,
}

/// Point-in-time pool observability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub checked_out: usize,
    pub connected_total: u64,
    pub last_used_at: Option<i64>,
}

/// A pool of physical connections to one backend config.
///
/// The pool owns the switch-on-checkout logic: when its current target shard
/// differs from the shard a pooled connection was last bound to, the live
/// connection is re-pointed before being handed out.
pub struct Pool {
    server: Arc<DatabaseServer>,
    role: Role,
    backend: Arc<dyn Backend>,
    config: ConnectionConfig,
    state: Mutex<PoolState>,
}

impl Pool {
    fn new(
        server: Arc<DatabaseServer>,
        role: Role,
        backend: Arc<dyn Backend>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            server,
            role,
            backend,
            config,
            state: Mutex::new(PoolState {
                target: None,
                idle: Vec::new(),
                checked_out: 0,
                connected_total: 0,
            }),
        }
    }

    pub fn server(&self) -> &Arc<DatabaseServer> {
        &self.server
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Re-point the pool at a shard. Live connections are switched lazily,
    /// one by one, as they are checked out.
    pub fn switch_target(&self, shard: &Shard) {
        let database = shard.database_name(Some(self.server.as_ref()));
        self.state.lock().target = Some(PoolShardTarget {
            shard: shard.id(),
            database,
        });
    }

    pub fn current_target(&self) -> Option<ShardId> {
        self.state.lock().target.as_ref().map(|t| t.shard)
    }

    /// Check a connection out, establishing a new one on demand and
    /// performing the database switch when the connection was last bound to
    /// a different shard.
    pub fn checkout(self: &Arc<Self>) -> Result<LeasedConnection, ConnectError> {
        let (reused, target) = {
            let mut state = self.state.lock();
            (state.idle.pop(), state.target.clone())
        };
        let mut entry = match reused {
            Some(entry) => entry,
            None => {
                let conn = self.backend.connect(&self.config)?;
                self.state.lock().connected_total += 1;
                PooledEntry {
                    conn,
                    bound: None,
                    last_used_at: now_epoch(),
                }
            }
        };
        if let Some(target) = &target {
            if entry.bound != Some(target.shard) {
                if let Err(err) = entry.conn.switch_database(&target.database) {
                    entry.conn.disconnect();
                    return Err(ConnectError::fatal(format!(
                        "switching connection on {} to {}: {err}",
                        self.server.id(),
                        target.database
                    )));
                }
                entry.bound = Some(target.shard);
            }
        }
        entry.last_used_at = now_epoch();
        self.state.lock().checked_out += 1;
        Ok(LeasedConnection {
            pool: self.clone(),
            entry: Some(entry),
        })
    }

    fn checkin(&self, mut entry: PooledEntry) {
        entry.last_used_at = now_epoch();
        let mut state = self.state.lock();
        state.checked_out -= 1;
        state.idle.push(entry);
    }

    /// Evict and disconnect idle connections last used before `since`.
    /// Checked-out connections are untouched.
    pub fn clear_idle(&self, since: i64) -> usize {
        let mut evicted = {
            let mut state = self.state.lock();
            let (stale, fresh): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|entry| entry.last_used_at < since);
            state.idle = fresh;
            stale
        };
        for entry in &mut evicted {
            entry.conn.disconnect();
        }
        evicted.len()
    }

    /// Disconnect every idle connection.
    pub fn disconnect(&self) {
        self.clear_idle(i64::MAX);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            checked_out: state.checked_out,
            connected_total: state.connected_total,
            last_used_at: state.idle.iter().map(|e| e.last_used_at).max(),
        }
    }
}

/// Checkout handle; returns the connection to its pool on drop.
pub struct LeasedConnection {
    pool: Arc<Pool>,
    entry: Option<PooledEntry>,
}

impl LeasedConnection {
    /// Shard this connection's session is currently bound to.
    pub fn bound_shard(&self) -> Option<ShardId> {
        self.entry.as_ref().and_then(|e| e.bound)
    }
}

impl Deref for LeasedConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        match &self.entry {
            Some(entry) => entry.conn.as_ref(),
            None => unreachable!("lease emptied before drop"),
        }
    }
}

impl DerefMut for LeasedConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.entry {
            Some(entry) => entry.conn.as_mut(),
            None => unreachable!("lease emptied before drop"),
        }
    }
}

impl Drop for LeasedConnection {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.checkin(entry);
        }
    }
}

/// Key into the multiplexed pool map: shareable servers are keyed by server
/// so many shards reuse one pool; everything else is keyed per shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub role: Role,
    pub target: PoolTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolTarget {
    Server(ServerId),
    Shard(ShardId),
}

/// The multiplexer: resolves "the current shard for the primary category"
/// through the activation context and hands back a pool for it.
pub struct ConnectionMultiplexer {
    registry: Arc<ShardRegistry>,
    backend: Arc<dyn Backend>,
    pools: Mutex<FxHashMap<PoolKey, Arc<Pool>>>,
}

impl ConnectionMultiplexer {
    pub fn new(registry: Arc<ShardRegistry>, backend: Arc<dyn Backend>) -> Self {
        Self {
            registry,
            backend,
            pools: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    /// An empty-pool-map sibling sharing registry and backend. Fan-out
    /// workers get one each so no physical connection crosses a worker
    /// boundary.
    pub fn isolated(&self) -> ConnectionMultiplexer {
        ConnectionMultiplexer::new(self.registry.clone(), self.backend.clone())
    }

    /// Pool for the calling context's current shard under `role`, created on
    /// first use and re-targeted at the shard on every call.
    pub fn current_pool(&self, role: Role) -> Result<Arc<Pool>> {
        let (pool, _, _) = self.resolve_pool(role)?;
        Ok(pool)
    }

    fn resolve_pool(&self, role: Role) -> Result<(Arc<Pool>, ShardRef, Arc<DatabaseServer>)> {
        let shard = context::current(&Category::primary(), &self.registry);
        let server = self
            .registry
            .server_for(&shard)
            .ok_or_else(|| anyhow!("no database server configured for shard {shard}"))?;
        let target = if server.shareable() {
            PoolTarget::Server(server.id().clone())
        } else {
            PoolTarget::Shard(shard.id())
        };
        let key = PoolKey { role, target };
        let config = server
            .config(role)
            .cloned()
            .ok_or_else(|| anyhow!("server {} has no config for role {role}", server.id()))?;

        let pool = {
            let mut pools = self.pools.lock();
            pools
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Pool::new(
                        server.clone(),
                        role,
                        self.backend.clone(),
                        config,
                    ))
                })
                .clone()
        };
        pool.switch_target(&shard);
        Ok((pool, shard, server))
    }

    /// Check out a connection for the current shard, walking the server's
    /// ordered fallback configs on transient failure. A fallback that
    /// succeeds replaces the cached pool for the key; the default server's
    /// base role never falls back.
    pub fn connection(&self, role: Role) -> Result<LeasedConnection> {
        let (pool, shard, server) = self.resolve_pool(role)?;
        let err = match pool.checkout() {
            Ok(lease) => return Ok(lease),
            Err(err) => err,
        };

        let on_default_base = self.registry.servers().is_default(server.id()) && role.is_base();
        let fallbacks = server.fallback_configs(role);
        if !err.is_transient() || on_default_base || fallbacks.is_empty() {
            return Err(err.into());
        }

        let mut last = err;
        for (idx, config) in fallbacks.iter().enumerate() {
            warn!(
                server = %server.id(),
                %role,
                fallback = idx,
                error = %last,
                "connection failed; trying fallback config"
            );
            let candidate = Arc::new(Pool::new(
                server.clone(),
                role,
                self.backend.clone(),
                config.clone(),
            ));
            candidate.switch_target(&shard);
            match candidate.checkout() {
                Ok(lease) => {
                    let target = if server.shareable() {
                        PoolTarget::Server(server.id().clone())
                    } else {
                        PoolTarget::Shard(shard.id())
                    };
                    self.pools
                        .lock()
                        .insert(PoolKey { role, target }, candidate);
                    debug!(server = %server.id(), fallback = idx, "fallback config promoted");
                    return Ok(lease);
                }
                Err(e) => last = e,
            }
        }
        Err(last.into())
    }

    /// Evict and disconnect pooled connections idle since before `since`.
    pub fn clear_idle_connections(&self, since: i64) -> usize {
        let pools: Vec<Arc<Pool>> = self.pools.lock().values().cloned().collect();
        let evicted: usize = pools.iter().map(|pool| pool.clear_idle(since)).sum();
        if evicted > 0 {
            debug!(evicted, "cleared idle connections");
        }
        evicted
    }

    /// Disconnect idle connections in every pool.
    pub fn disconnect_all(&self) {
        let pools: Vec<Arc<Pool>> = self.pools.lock().values().cloned().collect();
        for pool in pools {
            pool.disconnect();
        }
    }

    /// Disconnect the pools attached to one server.
    pub fn disconnect_server(&self, server: &ServerId) {
        let pools: Vec<Arc<Pool>> = self
            .pools
            .lock()
            .values()
            .filter(|pool| pool.server().id() == server)
            .cloned()
            .collect();
        for pool in pools {
            pool.disconnect();
        }
    }

    /// Decommission a shard: drop its dedicated pools and re-point any pool
    /// still targeting it at the default shard.
    pub fn remove_shard(&self, shard: &Shard) {
        let removed: Vec<Arc<Pool>> = {
            let mut pools = self.pools.lock();
            let keys: Vec<PoolKey> = pools
                .keys()
                .filter(|key| key.target == PoolTarget::Shard(shard.id()))
                .cloned()
                .collect();
            keys.iter().filter_map(|key| pools.remove(key)).collect()
        };
        for pool in removed {
            pool.disconnect();
        }

        let default = self.registry.default_shard();
        let remaining: Vec<Arc<Pool>> = self.pools.lock().values().cloned().collect();
        for pool in remaining {
            if pool.current_target() == Some(shard.id()) {
                pool.switch_target(&default);
            }
        }
    }

    /// Stats for every live pool.
    pub fn pool_stats(&self) -> Vec<(PoolKey, PoolStats)> {
        self.pools
            .lock()
            .iter()
            .map(|(key, pool)| (key.clone(), pool.stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServerId, ShardRecord};
    use crate::test_support::{
        registry_with_topology, RecordingBackend, TopologySpec,
    };

    fn shared_setup() -> (Arc<ShardRegistry>, Arc<RecordingBackend>, ConnectionMultiplexer) {
        let backend = RecordingBackend::new();
        let registry = registry_with_topology(TopologySpec {
            servers: vec![("primary", true), ("cluster2", true)],
            shards: vec![(1, "primary", true), (2, "primary", false), (3, "cluster2", false)],
        });
        let mux = ConnectionMultiplexer::new(registry.clone(), backend.clone());
        (registry, backend, mux)
    }

    fn activate_shard<R>(
        registry: &ShardRegistry,
        id: i64,
        body: impl FnOnce() -> R,
    ) -> R {
        let shard = registry.lookup(id).unwrap();
        context::activate(registry, &[(Category::primary(), shard)], body)
    }

    #[test]
    fn shareable_server_multiplexes_one_pool() {
        let (registry, backend, mux) = shared_setup();

        let pool1 = activate_shard(&registry, 1, || mux.current_pool(Role::Primary).unwrap());
        let pool2 = activate_shard(&registry, 2, || mux.current_pool(Role::Primary).unwrap());
        assert!(Arc::ptr_eq(&pool1, &pool2));

        // Checkout under shard 2 switches the live session.
        activate_shard(&registry, 2, || {
            let lease = mux.connection(Role::Primary).unwrap();
            assert_eq!(lease.bound_shard(), Some(ShardId(2)));
        });
        assert!(backend
            .events()
            .iter()
            .any(|e| e.contains("switch") && e.contains("shard_2")));

        // Same connection re-pointed when shard 1 uses it next.
        activate_shard(&registry, 1, || {
            let lease = mux.connection(Role::Primary).unwrap();
            assert_eq!(lease.bound_shard(), Some(ShardId(1)));
        });
        assert_eq!(backend.connect_count(), 1);
    }

    #[test]
    fn non_shareable_server_gets_per_shard_pools() {
        let backend = RecordingBackend::new();
        let registry = registry_with_topology(TopologySpec {
            servers: vec![("primary", true), ("files", false)],
            shards: vec![(1, "primary", true), (4, "files", false), (5, "files", false)],
        });
        let mux = ConnectionMultiplexer::new(registry.clone(), backend);

        let pool4 = activate_shard(&registry, 4, || mux.current_pool(Role::Primary).unwrap());
        let pool5 = activate_shard(&registry, 5, || mux.current_pool(Role::Primary).unwrap());
        assert!(!Arc::ptr_eq(&pool4, &pool5));
    }

    #[test]
    fn transient_failure_walks_fallbacks_and_promotes() {
        let backend = RecordingBackend::new();
        let registry = registry_with_topology(TopologySpec {
            servers: vec![("primary", true), ("cluster2", true)],
            shards: vec![(1, "primary", true), (3, "cluster2", false)],
        });
        // cluster2's canonical endpoint is down.
        backend.fail_transient("cluster2-a:5432");
        let mux = ConnectionMultiplexer::new(registry.clone(), backend.clone());

        activate_shard(&registry, 3, || {
            let lease = mux.connection(Role::Primary).unwrap();
            assert_eq!(lease.bound_shard(), Some(ShardId(3)));
        });
        // Promoted pool skips the dead endpoint on the next checkout.
        activate_shard(&registry, 3, || {
            mux.connection(Role::Primary).unwrap();
        });
        let attempts = backend
            .events()
            .iter()
            .filter(|e| e.contains("connect cluster2-a"))
            .count();
        assert_eq!(attempts, 1);
    }

    #[test]
    fn fatal_failure_does_not_fall_back() {
        let backend = RecordingBackend::new();
        let registry = registry_with_topology(TopologySpec {
            servers: vec![("primary", true), ("cluster2", true)],
            shards: vec![(1, "primary", true), (3, "cluster2", false)],
        });
        backend.fail_fatal("cluster2-a:5432");
        let mux = ConnectionMultiplexer::new(registry.clone(), backend.clone());

        activate_shard(&registry, 3, || {
            assert!(mux.connection(Role::Primary).is_err());
        });
        assert!(!backend.events().iter().any(|e| e.contains("cluster2-b")));
    }

    #[test]
    fn default_server_base_role_never_falls_back() {
        let backend = RecordingBackend::new();
        let registry = registry_with_topology(TopologySpec {
            servers: vec![("primary", true)],
            shards: vec![(1, "primary", true)],
        });
        backend.fail_transient("primary-a:5432");
        let mux = ConnectionMultiplexer::new(registry.clone(), backend.clone());

        activate_shard(&registry, 1, || {
            assert!(mux.connection(Role::Primary).is_err());
        });
        assert!(!backend.events().iter().any(|e| e.contains("primary-b")));
    }

    #[test]
    fn idle_eviction_spares_checked_out_connections() {
        let (registry, backend, mux) = shared_setup();

        activate_shard(&registry, 1, || {
            let held = mux.connection(Role::Primary).unwrap();
            // A second checkout creates a second physical connection; drop
            // it back into the idle set.
            drop(mux.connection(Role::Primary).unwrap());
            let evicted = mux.clear_idle_connections(now_epoch() + 10);
            assert_eq!(evicted, 1);
            drop(held);
        });
        assert_eq!(
            backend.events().iter().filter(|e| *e == "disconnect").count(),
            1
        );
    }

    #[test]
    fn remove_shard_repoints_to_default() {
        let backend = RecordingBackend::new();
        let registry = registry_with_topology(TopologySpec {
            servers: vec![("primary", true)],
            shards: vec![(1, "primary", true), (2, "primary", false)],
        });
        let mux = ConnectionMultiplexer::new(registry.clone(), backend);

        let pool = activate_shard(&registry, 2, || mux.current_pool(Role::Primary).unwrap());
        assert_eq!(pool.current_target(), Some(ShardId(2)));

        let two = registry.lookup(2).unwrap();
        mux.remove_shard(&two);
        assert_eq!(pool.current_target(), Some(ShardId(1)));
    }

    #[test]
    fn isolated_siblings_share_nothing_but_collaborators() {
        let (registry, _backend, mux) = shared_setup();
        let sibling = mux.isolated();

        let a = activate_shard(&registry, 1, || mux.current_pool(Role::Primary).unwrap());
        let b = activate_shard(&registry, 1, || sibling.current_pool(Role::Primary).unwrap());
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn missing_role_config_is_an_error() {
        let backend = RecordingBackend::new();
        let registry = registry_with_topology(TopologySpec {
            servers: vec![],
            shards: vec![],
        });
        let mux = ConnectionMultiplexer::new(registry, backend);
        assert!(mux.current_pool(Role::Primary).is_err());
    }

    #[test]
    fn bound_shard_survives_checkin() {
        let (registry, _backend, mux) = shared_setup();
        activate_shard(&registry, 2, || {
            drop(mux.connection(Role::Primary).unwrap());
            let lease = mux.connection(Role::Primary).unwrap();
            // Reused connection was already bound; no extra switch needed.
            assert_eq!(lease.bound_shard(), Some(ShardId(2)));
        });
    }

    #[test]
    fn shard_record_materializes_database_names() {
        let record = ShardRecord::new(ShardId(2), Some(ServerId::new("primary")), false);
        let shard = Shard::from_record(record);
        let server = DatabaseServer::new(ServerId::new("primary"), crate::server::Engine::Postgres)
            .with_role(
                Role::Primary,
                vec![ConnectionConfig {
                    host: Some("primary-a".into()),
                    port: Some(5432),
                    database: Some("app".into()),
                    ..ConnectionConfig::default()
                }],
            );
        assert_eq!(shard.database_name(Some(&server)), "app_shard_2");
    }
}
