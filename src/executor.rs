//! # Cross-Shard Fan-Out
//!
//! Runs one operation against many shards, sequentially or in parallel,
//! with a configurable failure policy. Parallel mode partitions the shard
//! set by owning database server and hands each partition to a worker with
//! isolated connection state; results and failures cross the worker
//! boundary only as envelopes.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use crossbeam_channel::bounded;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context;
use crate::ids::IdCodec;
use crate::model::{Category, Role, ShardId, ShardRef};
use crate::mux::{ConnectionMultiplexer, LeasedConnection, Pool};
use crate::registry::ShardRegistry;

/// What to do when `body` fails for one shard during fan-out.
#[derive(Clone)]
pub enum ExceptionPolicy {
    /// Propagate immediately, abandoning remaining shards.
    Raise,
    /// Swallow and continue.
    Ignore,
    /// Capture the first failure, continue all shards, re-raise at the end.
    Defer,
    /// Invoke the handler in place of raising.
    Handler(Arc<dyn Fn(&anyhow::Error, &ShardRef) + Send + Sync>),
}

impl fmt::Debug for ExceptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionPolicy::Raise => write!(f, "Raise"),
            ExceptionPolicy::Ignore => write!(f, "Ignore"),
            ExceptionPolicy::Defer => write!(f, "Defer"),
            ExceptionPolicy::Handler(_) => write!(f, "Handler(..)"),
        }
    }
}

/// Degree of parallelism for fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    Off,
    /// Detected CPU count.
    Auto,
    Degree(usize),
}

/// Fan-out tuning: categories to activate per shard, parallelism, failure
/// policy.
#[derive(Debug, Clone)]
pub struct FanOutOptions {
    pub categories: Vec<Category>,
    pub parallelism: Parallelism,
    pub policy: ExceptionPolicy,
}

impl Default for FanOutOptions {
    fn default() -> Self {
        Self {
            categories: vec![Category::primary()],
            parallelism: Parallelism::Off,
            policy: ExceptionPolicy::Raise,
        }
    }
}

impl FanOutOptions {
    pub fn parallel(mut self) -> Self {
        self.parallelism = Parallelism::Auto;
        self
    }

    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_categories(mut self, categories: Vec<Category>) -> Self {
        self.categories = categories;
        self
    }
}

/// Per-shard view handed to the fan-out body.
///
/// Connections checked out through it go to the execution context actually
/// running the body: the calling context in sequential mode, the worker's
/// isolated multiplexer in parallel mode.
pub struct FanOutCtx<'a> {
    shard: ShardRef,
    mux: &'a ConnectionMultiplexer,
}

impl FanOutCtx<'_> {
    /// The shard the body is currently running against.
    pub fn shard(&self) -> &ShardRef {
        &self.shard
    }

    pub fn connection(&self, role: Role) -> Result<LeasedConnection> {
        self.mux.connection(role)
    }

    pub fn pool(&self, role: Role) -> Result<Arc<Pool>> {
        self.mux.current_pool(role)
    }

    pub fn multiplexer(&self) -> &ConnectionMultiplexer {
        self.mux
    }
}

/// Minimal, boundary-safe copy of a worker failure: message, error chain,
/// and the worker's active-shard context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub server: String,
    pub shard: Option<i64>,
    pub message: String,
    pub chain: Vec<String>,
}

impl WorkerFailure {
    fn from_error(err: &anyhow::Error, server: &str, shard: Option<i64>) -> Self {
        Self {
            server: server.to_string(),
            shard,
            message: err.to_string(),
            chain: err.chain().map(|cause| cause.to_string()).collect(),
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shard {
            Some(shard) => write!(
                f,
                "server {} (shard S{}): {}",
                self.server, shard, self.message
            ),
            None => write!(f, "server {}: {}", self.server, self.message),
        }
    }
}

/// Aggregate failure raised when more than one parallel partition failed.
/// Names every failed partition; the first failure is the underlying cause.
#[derive(Debug)]
pub struct FanOutError {
    failures: Vec<WorkerFailure>,
    cause: Option<anyhow::Error>,
}

impl FanOutError {
    pub fn failures(&self) -> &[WorkerFailure] {
        &self.failures
    }
}

impl fmt::Display for FanOutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fan-out failed on {} partitions: ", self.failures.len())?;
        for (idx, failure) in self.failures.iter().enumerate() {
            if idx > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FanOutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|err| err.as_ref() as &(dyn std::error::Error + 'static))
    }
}

enum WorkerError {
    /// The original error crossed the boundary intact.
    Original(anyhow::Error, WorkerFailure),
    /// Only the minimal copy survived (panic payloads and the like).
    Downgraded(WorkerFailure),
}

impl WorkerError {
    fn failure(&self) -> &WorkerFailure {
        match self {
            WorkerError::Original(_, failure) => failure,
            WorkerError::Downgraded(failure) => failure,
        }
    }
}

struct WorkerEnvelope<T> {
    partition: usize,
    outcome: Result<Vec<T>, WorkerError>,
}

thread_local! {
    /// Shard the executor last activated on this thread, for failure
    /// envelopes when a body panics.
    static LAST_ACTIVE: Cell<Option<i64>> = const { Cell::new(None) };
}

/// How one item resolves to its owning shard(s) in
/// [`ShardExecutor::partition_by_shard`].
pub enum ShardResolution {
    Shard(ShardRef),
    /// Fan the item out to each shard.
    Shards(Vec<ShardRef>),
    /// Decode through the identifier codec.
    Id(i64),
    Current,
}

/// Sequential and parallel fan-out over a shard set.
pub struct ShardExecutor {
    registry: Arc<ShardRegistry>,
    mux: Arc<ConnectionMultiplexer>,
}

impl ShardExecutor {
    pub fn new(registry: Arc<ShardRegistry>, mux: Arc<ConnectionMultiplexer>) -> Self {
        Self { registry, mux }
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn multiplexer(&self) -> &Arc<ConnectionMultiplexer> {
        &self.mux
    }

    /// All shards ordered by (server presence, server id, shard id), so
    /// shards sharing a server are adjacent and reconnects are minimized.
    pub fn ordered_shards(&self) -> Result<Vec<ShardRef>> {
        let servers = self.registry.servers();
        let default_id = servers.default_server_id().clone();
        let mut shards = self.registry.all_shards()?;
        shards.sort_by_key(|shard| {
            let server_id = shard
                .database_server_id()
                .cloned()
                .unwrap_or_else(|| default_id.clone());
            (!servers.contains(&server_id), server_id, shard.id())
        });
        Ok(shards)
    }

    /// Run `body` once per shard.
    ///
    /// With no explicit shard list, fans out over [`ordered_shards`]. When
    /// sharding is not bootstrapped (the default is the sentinel), `body`
    /// runs exactly once, unscoped.
    ///
    /// [`ordered_shards`]: ShardExecutor::ordered_shards
    pub fn with_each_shard<T, F>(
        &self,
        shards: Option<Vec<ShardRef>>,
        options: &FanOutOptions,
        body: F,
    ) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&FanOutCtx<'_>) -> Result<Vec<T>> + Send + Sync,
    {
        let default = self.registry.default_shard();
        if default.is_sentinel() {
            return body(&FanOutCtx {
                shard: default,
                mux: &self.mux,
            });
        }
        let scope = match shards {
            Some(explicit) => explicit,
            None => self.ordered_shards()?,
        };
        let degree = match options.parallelism {
            Parallelism::Off => 1,
            Parallelism::Auto => detected_parallelism(),
            Parallelism::Degree(n) => n.max(1),
        };
        if degree <= 1 {
            return self.run_sequential(&self.mux, &scope, options, &body);
        }
        self.run_parallel(&scope, options, &body, degree)
    }

    /// Group `items` by owning shard, activate each group's shard, and run
    /// `body` per group, concatenating results in group-iteration order.
    pub fn partition_by_shard<I, T, C, F>(
        &self,
        items: Vec<I>,
        classify: C,
        body: F,
    ) -> Result<Vec<T>>
    where
        I: Clone,
        C: Fn(&I) -> ShardResolution,
        F: Fn(&FanOutCtx<'_>, &[I]) -> Result<Vec<T>>,
    {
        let codec = IdCodec::new(self.registry.clone());
        let current = context::current(&Category::primary(), &self.registry);
        let mut groups: Vec<(ShardId, ShardRef, Vec<I>)> = Vec::new();

        for item in items {
            let owners: Vec<ShardRef> = match classify(&item) {
                ShardResolution::Shard(shard) => vec![shard],
                ShardResolution::Shards(shards) => shards,
                ShardResolution::Id(id) => {
                    vec![codec.shard_for(id, None).unwrap_or_else(|| current.clone())]
                }
                ShardResolution::Current => vec![current.clone()],
            };
            for owner in owners {
                match groups.iter_mut().find(|(id, _, _)| *id == owner.id()) {
                    Some((_, _, group)) => group.push(item.clone()),
                    None => groups.push((owner.id(), owner, vec![item.clone()])),
                }
            }
        }

        let mut results = Vec::new();
        for (_, shard, group) in groups {
            let ctx = FanOutCtx {
                shard: shard.clone(),
                mux: &self.mux,
            };
            let mapping = [(Category::primary(), shard)];
            let mut items =
                context::activate(&self.registry, &mapping, || body(&ctx, &group))?;
            results.append(&mut items);
        }
        Ok(results)
    }

    fn run_sequential<T, F>(
        &self,
        mux: &ConnectionMultiplexer,
        shards: &[ShardRef],
        options: &FanOutOptions,
        body: &F,
    ) -> Result<Vec<T>>
    where
        F: Fn(&FanOutCtx<'_>) -> Result<Vec<T>>,
    {
        let servers = self.registry.servers();
        let mut results = Vec::new();
        let mut deferred: Option<anyhow::Error> = None;
        let mut prev_server = None;

        for shard in shards {
            let Some(server) = self.registry.server_for(shard) else {
                warn!(shard = %shard, "skipping shard on unconfigured server");
                continue;
            };
            // Crossing off a non-shareable server: force a disconnect so
            // idle connections do not accumulate behind us.
            if let Some(prev) = &prev_server {
                if *prev != *server.id() {
                    if let Some(prev_server) = servers.get(prev) {
                        if !prev_server.shareable() {
                            mux.disconnect_server(prev);
                        }
                    }
                }
            }
            LAST_ACTIVE.with(|cell| cell.set(Some(shard.id().0)));

            let ctx = FanOutCtx {
                shard: shard.clone(),
                mux,
            };
            let mapping: Vec<(Category, ShardRef)> = options
                .categories
                .iter()
                .map(|category| (category.clone(), shard.clone()))
                .collect();
            match context::activate(&self.registry, &mapping, || body(&ctx)) {
                Ok(mut items) => results.append(&mut items),
                Err(err) => match &options.policy {
                    ExceptionPolicy::Raise => return Err(err),
                    ExceptionPolicy::Ignore => {
                        debug!(shard = %shard, error = %err, "ignoring shard failure");
                    }
                    ExceptionPolicy::Defer => {
                        if deferred.is_none() {
                            deferred = Some(err);
                        }
                    }
                    ExceptionPolicy::Handler(handler) => handler(&err, shard),
                },
            }
            prev_server = Some(server.id().clone());
        }

        match deferred {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    fn run_parallel<T, F>(
        &self,
        shards: &[ShardRef],
        options: &FanOutOptions,
        body: &F,
        degree: usize,
    ) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&FanOutCtx<'_>) -> Result<Vec<T>> + Send + Sync,
    {
        // Physical connections cannot cross worker boundaries; partition by
        // owning server and give each worker its own connection state.
        let partitions = self.partition_by_server(shards);
        if partitions.len() <= 1 {
            return self.run_sequential(&self.mux, shards, options, body);
        }
        self.mux.disconnect_all();

        let workers = degree.min(partitions.len());
        let (task_tx, task_rx) = bounded(partitions.len());
        for task in partitions.into_iter().enumerate() {
            let _ = task_tx.send(task);
        }
        drop(task_tx);

        let (result_tx, result_rx) = bounded::<WorkerEnvelope<T>>(workers);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    while let Ok((partition, (server, shards))) = task_rx.recv() {
                        let mux = self.mux.isolated();
                        let attempt = catch_unwind(AssertUnwindSafe(|| {
                            self.run_sequential(&mux, &shards, options, body)
                        }));
                        mux.disconnect_all();
                        let active = LAST_ACTIVE.with(|cell| cell.get());
                        let outcome = match attempt {
                            Ok(Ok(items)) => Ok(items),
                            Ok(Err(err)) => {
                                let failure = WorkerFailure::from_error(&err, &server, active);
                                Err(WorkerError::Original(err, failure))
                            }
                            Err(payload) => Err(WorkerError::Downgraded(WorkerFailure {
                                server: server.clone(),
                                shard: active,
                                message: panic_message(payload),
                                chain: Vec::new(),
                            })),
                        };
                        if result_tx
                            .send(WorkerEnvelope { partition, outcome })
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            // Drain every envelope: sibling workers are never cancelled.
            let mut successes: Vec<(usize, Vec<T>)> = Vec::new();
            let mut failures: Vec<(usize, WorkerError)> = Vec::new();
            while let Ok(envelope) = result_rx.recv() {
                match envelope.outcome {
                    Ok(items) => successes.push((envelope.partition, items)),
                    Err(err) => failures.push((envelope.partition, err)),
                }
            }

            if failures.is_empty() {
                successes.sort_by_key(|(partition, _)| *partition);
                return Ok(successes.into_iter().flat_map(|(_, items)| items).collect());
            }
            failures.sort_by_key(|(partition, _)| *partition);
            if failures.len() == 1 {
                // Exactly one failed worker: its original error, unwrapped.
                return Err(match failures.remove(0).1 {
                    WorkerError::Original(err, _) => err,
                    WorkerError::Downgraded(failure) => anyhow!("{failure}"),
                });
            }
            let minimal: Vec<WorkerFailure> = failures
                .iter()
                .map(|(_, err)| err.failure().clone())
                .collect();
            let cause = failures.into_iter().find_map(|(_, err)| match err {
                WorkerError::Original(original, _) => Some(original),
                WorkerError::Downgraded(_) => None,
            });
            Err(anyhow::Error::new(FanOutError {
                failures: minimal,
                cause,
            }))
        })
    }

    /// Group shards by owning server, preserving first-encounter order.
    fn partition_by_server(&self, shards: &[ShardRef]) -> Vec<(String, Vec<ShardRef>)> {
        let default_id = self.registry.servers().default_server_id().clone();
        let mut order: Vec<String> = Vec::new();
        let mut by_server: FxHashMap<String, Vec<ShardRef>> = FxHashMap::default();
        for shard in shards {
            let server = shard
                .database_server_id()
                .cloned()
                .unwrap_or_else(|| default_id.clone());
            let key = server.to_string();
            if !by_server.contains_key(&key) {
                order.push(key.clone());
            }
            by_server.entry(key).or_default().push(shard.clone());
        }
        order
            .into_iter()
            .map(|key| {
                let shards = by_server.remove(&key).unwrap_or_default();
                (key, shards)
            })
            .collect()
    }
}

fn detected_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
