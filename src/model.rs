//! # Data Model
//!
//! Core identifier newtypes and the `Shard` value object shared by the
//! registry, the activation stack, and the fan-out executor.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use time::OffsetDateTime;

use crate::server::DatabaseServer;

/// Compact identifier for shards. Persisted shards have positive ids; the
/// sentinel self-shard uses id 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub i64);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Symbolic identifier for a database server (e.g. `primary`, `cluster2`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A named partition of the data model that can be routed to a different
/// current shard independently of other categories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Category(Cow<'static, str>);

impl Category {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The category ordinary sharded data is routed through.
    pub fn primary() -> Self {
        Self::from_static("primary")
    }

    /// Pinned to the default shard; activation attempts are ignored.
    pub fn unsharded() -> Self {
        Self::from_static("unsharded")
    }

    pub fn is_unsharded(&self) -> bool {
        self.0 == "unsharded"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution role a connection is checked out for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Replica,
}

impl Role {
    /// The base role; default-server connections for it never fall back.
    pub fn is_base(self) -> bool {
        matches!(self, Role::Primary)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

/// Persisted shard row as it crosses the storage and cache collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub id: ShardId,
    /// Physical database/schema name; derived from the owning server when
    /// absent.
    pub name: Option<String>,
    pub database_server_id: Option<ServerId>,
    pub is_default: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ShardRecord {
    pub fn new(id: ShardId, database_server_id: Option<ServerId>, is_default: bool) -> Self {
        let now = now_epoch();
        Self {
            id,
            name: None,
            database_server_id,
            is_default,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A detached shard value object.
///
/// Handed out by the registry as `Arc<Shard>`; it is a snapshot of the
/// persisted row, not a live storage handle. The sentinel variant stands in
/// for the default shard before shard metadata is queryable.
#[derive(Debug, Clone)]
pub struct Shard {
    record: ShardRecord,
    resolved_name: OnceCell<String>,
    sentinel: bool,
}

impl Shard {
    pub fn from_record(record: ShardRecord) -> Self {
        Self {
            record,
            resolved_name: OnceCell::new(),
            sentinel: false,
        }
    }

    /// The stand-in default shard used before the shard table is queryable
    /// or when storage is unreachable. Its id is the routing layer's notion
    /// of "self"; activating it is a no-op; it is never destroyable.
    pub fn sentinel() -> Self {
        let now = now_epoch();
        Self {
            record: ShardRecord {
                id: ShardId(0),
                name: None,
                database_server_id: None,
                is_default: true,
                created_at: now,
                updated_at: now,
            },
            resolved_name: OnceCell::new(),
            sentinel: true,
        }
    }

    pub fn id(&self) -> ShardId {
        self.record.id
    }

    pub fn is_default(&self) -> bool {
        self.record.is_default
    }

    pub fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    pub fn database_server_id(&self) -> Option<&ServerId> {
        self.record.database_server_id.as_ref()
    }

    pub fn record(&self) -> &ShardRecord {
        &self.record
    }

    /// Physical database/schema name, lazily derived from the owning server
    /// and memoized when the row carries none.
    pub fn database_name(&self, server: Option<&DatabaseServer>) -> String {
        if let Some(name) = &self.record.name {
            return name.clone();
        }
        self.resolved_name
            .get_or_init(|| {
                let base = server
                    .and_then(|s| s.base_database_name())
                    .unwrap_or_else(|| {
                        server
                            .map(|s| s.id().to_string())
                            .unwrap_or_else(|| "shardroute".to_string())
                    });
                // The default shard lives in the server's base database;
                // only satellite shards get a suffixed schema.
                if self.sentinel || self.record.is_default {
                    base
                } else {
                    format!("{}_shard_{}", base, self.record.id.0)
                }
            })
            .clone()
    }

    /// Shard identity comparison. The sentinel compares equal to any
    /// persisted shard whose default flag is set, in both directions.
    pub fn same_shard(&self, other: &Shard) -> bool {
        if self.sentinel || other.sentinel {
            return (self.sentinel && other.record.is_default)
                || (other.sentinel && self.record.is_default);
        }
        self.record.id == other.record.id
    }
}

impl PartialEq for Shard {
    fn eq(&self, other: &Self) -> bool {
        self.same_shard(other)
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sentinel {
            write!(f, "S<default>")
        } else {
            write!(f, "{}", self.record.id)
        }
    }
}

/// Shared handle type used across the registry, activation stack and
/// executor.
pub type ShardRef = Arc<Shard>;

/// Current UTC time as epoch seconds.
pub fn now_epoch() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
