//! # Shardroute
//!
//! A shard-routing core for horizontally partitioned data models: one
//! unified identifier space and one unified connection-routing layer over
//! many physically independent databases.
//!
//! Four mechanisms make up the core:
//!
//! - a bidirectional codec between shard-local and globally unique ids
//!   ([`ids`]);
//! - a shard registry with bootstrap/caching semantics ([`registry`]);
//! - a per-execution-context activation stack tracking the current shard
//!   per routing category ([`context`]);
//! - a connection-pool multiplexer and a cross-shard fan-out executor with
//!   sequential/parallel modes and configurable failure policy ([`mux`],
//!   [`executor`]).
//!
//! Storage, caching, and the physical database driver are collaborators
//! behind narrow traits ([`registry::ShardStore`],
//! [`registry::MetadataCache`], [`mux::Backend`]); the crate defines no
//! query language and speaks no network protocol of its own.

pub mod config;
pub mod context;
pub mod executor;
pub mod ids;
pub mod model;
pub mod mux;
pub mod registry;
pub mod server;
pub mod test_support;

// Re-export main types for convenience
pub use config::{ConfigError, ServerEntry, TopologyConfig};
pub use context::{ActivationGuard, ActivationSnapshot};
pub use executor::{
    ExceptionPolicy, FanOutCtx, FanOutError, FanOutOptions, Parallelism, ShardExecutor,
    ShardResolution, WorkerFailure,
};
pub use ids::{EntityRef, IdCodec, IdInput, IDS_PER_SHARD};
pub use model::{Category, Role, ServerId, Shard, ShardId, ShardRecord, ShardRef};
pub use mux::{
    Backend, ConnectError, Connection, ConnectionMultiplexer, LeasedConnection, Pool, PoolKey,
    PoolStats, PoolTarget,
};
pub use registry::{MetadataCache, ShardRegistry, ShardSelector, ShardStore};
pub use server::{ConnectionConfig, DatabaseServer, Engine, ServerMap};
