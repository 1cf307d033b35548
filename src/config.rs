//! Topology configuration for the routing layer.
//!
//! Loaded with precedence: Env vars > Config file > Defaults.
//!
//! # Example config file (shardroute.toml)
//! ```toml
//! default_server = "primary"
//!
//! [servers.primary]
//! engine = "postgres"
//! primary = [
//!   { host = "db1", port = 5432, database = "app", username = "app" },
//!   { host = "db1-standby", port = 5432, database = "app", username = "app" },
//! ]
//!
//! [servers.cluster2]
//! engine = "postgres"
//! region = "eu-west"
//! primary = [{ host = "db2", port = 5432, database = "app", username = "app" }]
//! ```

use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::model::{Role, ServerId};
use crate::server::{ConnectionConfig, DatabaseServer, Engine, ServerMap};

/// One server's entry in the topology file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEntry {
    pub engine: Engine,
    pub region: Option<String>,
    /// Overrides the derived shareability when set.
    pub shareable: Option<bool>,
    /// Ordered endpoints for the primary role; the head is canonical, the
    /// tail are fallbacks.
    pub primary: Vec<ConnectionConfig>,
    pub replica: Vec<ConnectionConfig>,
}

/// The configured server topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Server shards without an explicit placement live on.
    pub default_server: String,
    pub servers: BTreeMap<String, ServerEntry>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            default_server: "primary".to_string(),
            servers: BTreeMap::new(),
        }
    }
}

impl TopologyConfig {
    /// Load configuration with precedence: Env > File > Defaults.
    ///
    /// Environment variables use the `SHARDROUTE_` prefix with `__` as the
    /// nesting separator, e.g. `SHARDROUTE_SERVERS__PRIMARY__ENGINE`.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(TopologyConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("SHARDROUTE_").split("__"));
        figment.extract().map_err(ConfigError::from)
    }

    /// Materialize the runtime server map consumed by the registry and the
    /// multiplexer.
    pub fn into_server_map(self) -> Result<ServerMap, ConfigError> {
        if !self.servers.is_empty() && !self.servers.contains_key(&self.default_server) {
            return Err(ConfigError {
                message: format!(
                    "default server {:?} is not among the configured servers",
                    self.default_server
                ),
            });
        }
        let servers = self
            .servers
            .into_iter()
            .map(|(name, entry)| {
                let mut server = DatabaseServer::new(ServerId::new(name), entry.engine);
                if let Some(region) = entry.region {
                    server = server.with_region(region);
                }
                if let Some(shareable) = entry.shareable {
                    server = server.with_shareable(shareable);
                }
                if !entry.primary.is_empty() {
                    server = server.with_role(Role::Primary, entry.primary);
                }
                if !entry.replica.is_empty() {
                    server = server.with_role(Role::Replica, entry.replica);
                }
                server
            })
            .collect();
        Ok(ServerMap::new(servers, ServerId::new(self.default_server)))
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TopologyConfig::default();
        assert_eq!(config.default_server, "primary");
        assert!(config.servers.is_empty());
        assert!(config.into_server_map().is_ok());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
default_server = "primary"

[servers.primary]
engine = "postgres"
primary = [{{ host = "db1", port = 5432, database = "app", username = "app" }}]

[servers.files]
engine = "sqlite"
primary = [{{ path = "/var/lib/app.db" }}]
"#
        )
        .unwrap();

        let config = TopologyConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.servers.len(), 2);

        let map = config.into_server_map().unwrap();
        let primary = map.get(&ServerId::new("primary")).unwrap();
        assert!(primary.shareable());
        assert_eq!(primary.base_database_name().as_deref(), Some("app"));
        let files = map.get(&ServerId::new("files")).unwrap();
        assert!(!files.shareable());
    }

    #[test]
    fn test_unknown_default_server_is_rejected() {
        let mut config = TopologyConfig::default();
        config.servers.insert(
            "cluster2".to_string(),
            ServerEntry {
                engine: Engine::Postgres,
                ..ServerEntry::default()
            },
        );
        assert!(config.into_server_map().is_err());
    }

    #[test]
    fn test_engine_serde() {
        let json = serde_json::to_string(&Engine::Postgres).unwrap();
        assert_eq!(json, "\"postgres\"");
        let engine: Engine = serde_json::from_str("\"sqlite\"").unwrap();
        assert_eq!(engine, Engine::Sqlite);
    }
}
