//! # Database Servers
//!
//! Descriptors for the physical backends shards live on: per-role connection
//! configs with ordered fallbacks, placement region, and the shareability
//! derivation that decides whether one physical connection can serve many
//! shards by switching its target database per use.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::model::{Role, ServerId};

/// Storage engine behind a server. File-bound engines bake the connection
/// target into the session and therefore cannot be shared across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Postgres,
    Mysql,
    Sqlite,
}

impl Engine {
    pub fn is_file_bound(self) -> bool {
        matches!(self, Engine::Sqlite)
    }
}

/// Connection parameters for one backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// File path for file-bound engines.
    pub path: Option<PathBuf>,
}

impl ConnectionConfig {
    pub fn endpoint(&self) -> String {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.clone(),
            _ => self
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "localhost".to_string()),
        }
    }
}

/// Descriptor of a physical backend that may host one or more shards.
///
/// Not itself concurrent; consumed by the connection multiplexer. The first
/// config of a role is the canonical one, the rest are ordered fallbacks
/// tried on transient connection failure.
#[derive(Debug, Clone)]
pub struct DatabaseServer {
    id: ServerId,
    engine: Engine,
    region: Option<String>,
    roles: FxHashMap<Role, Vec<ConnectionConfig>>,
    shareable_override: Option<bool>,
}

impl DatabaseServer {
    pub fn new(id: ServerId, engine: Engine) -> Self {
        Self {
            id,
            engine,
            region: None,
            roles: FxHashMap::default(),
            shareable_override: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_role(mut self, role: Role, configs: Vec<ConnectionConfig>) -> Self {
        self.roles.insert(role, configs);
        self
    }

    pub fn with_shareable(mut self, shareable: bool) -> Self {
        self.shareable_override = Some(shareable);
        self
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Canonical config for a role, falling back to the base role's.
    pub fn config(&self, role: Role) -> Option<&ConnectionConfig> {
        self.roles
            .get(&role)
            .and_then(|c| c.first())
            .or_else(|| self.roles.get(&Role::Primary).and_then(|c| c.first()))
    }

    /// Ordered fallback configs for a role (everything after the canonical
    /// one). Empty for roles with a single endpoint.
    pub fn fallback_configs(&self, role: Role) -> &[ConnectionConfig] {
        self.roles
            .get(&role)
            .map(|c| c.get(1..).unwrap_or(&[]))
            .unwrap_or(&[])
    }

    /// Database name of the canonical base-role config; seeds derived shard
    /// names.
    pub fn base_database_name(&self) -> Option<String> {
        self.config(Role::Primary).and_then(|c| c.database.clone())
    }

    /// Whether multiple shards may reuse one physical connection by
    /// switching the target database per use. False for file-bound engines
    /// and when credentials vary across a role's configs.
    pub fn shareable(&self) -> bool {
        if let Some(explicit) = self.shareable_override {
            return explicit;
        }
        if self.engine.is_file_bound() {
            return false;
        }
        self.roles.values().all(|configs| {
            configs
                .windows(2)
                .all(|pair| pair[0].username == pair[1].username)
        })
    }
}

/// The configured server topology: servers keyed by id plus the designated
/// default server.
#[derive(Debug, Clone)]
pub struct ServerMap {
    servers: FxHashMap<ServerId, Arc<DatabaseServer>>,
    default_id: ServerId,
}

impl ServerMap {
    pub fn new(servers: Vec<DatabaseServer>, default_id: ServerId) -> Self {
        let servers = servers
            .into_iter()
            .map(|s| (s.id.clone(), Arc::new(s)))
            .collect();
        Self {
            servers,
            default_id,
        }
    }

    pub fn get(&self, id: &ServerId) -> Option<Arc<DatabaseServer>> {
        self.servers.get(id).cloned()
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.servers.contains_key(id)
    }

    pub fn default_server_id(&self) -> &ServerId {
        &self.default_id
    }

    pub fn default_server(&self) -> Option<Arc<DatabaseServer>> {
        self.servers.get(&self.default_id).cloned()
    }

    pub fn is_default(&self, id: &ServerId) -> bool {
        *id == self.default_id
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DatabaseServer>> {
        self.servers.values()
    }
}
