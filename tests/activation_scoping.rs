use std::sync::Arc;

use shardroute::test_support::{registry_with_topology, RecordingBackend, TopologySpec};
use shardroute::{
    context, Category, ConnectionMultiplexer, FanOutOptions, ShardExecutor, ShardId,
};

fn executor() -> ShardExecutor {
    let registry = registry_with_topology(TopologySpec {
        servers: vec![("primary", true), ("cluster2", true)],
        shards: vec![
            (1, "primary", true),
            (2, "primary", false),
            (3, "cluster2", false),
        ],
    });
    let mux = Arc::new(ConnectionMultiplexer::new(
        registry.clone(),
        RecordingBackend::new(),
    ));
    ShardExecutor::new(registry, mux)
}

#[test]
fn fan_out_restores_the_callers_activation() {
    let executor = executor();
    let registry = executor.registry().clone();
    let cat = Category::primary();
    let two = registry.lookup(2).unwrap();

    context::activate(&registry, &[(cat.clone(), two)], || {
        executor
            .with_each_shard(None, &FanOutOptions::default(), |ctx| {
                let ambient = context::current(&cat, &registry);
                assert!(ambient.same_shard(ctx.shard()));
                Ok(vec![()])
            })
            .unwrap();
        // Back to the caller's activation, not the last fan-out shard.
        assert_eq!(context::current(&cat, &registry).id(), ShardId(2));
    });
    assert_eq!(context::current(&cat, &registry).id(), ShardId(1));
}

#[test]
fn fan_out_activates_every_requested_category() {
    let executor = executor();
    let registry = executor.registry().clone();
    let jobs = Category::new("jobs");
    let options = FanOutOptions::default()
        .with_categories(vec![Category::primary(), jobs.clone()]);

    executor
        .with_each_shard(None, &options, |ctx| {
            assert!(context::current(&jobs, &registry).same_shard(ctx.shard()));
            assert!(context::current(&Category::primary(), &registry).same_shard(ctx.shard()));
            Ok(vec![()])
        })
        .unwrap();

    // Both categories fall back to the default afterwards.
    assert_eq!(context::current(&jobs, &registry).id(), ShardId(1));
}

#[test]
fn unsharded_category_never_leaves_the_default() {
    let executor = executor();
    let registry = executor.registry().clone();
    let unsharded = Category::unsharded();
    let options = FanOutOptions::default()
        .with_categories(vec![Category::primary(), unsharded.clone()]);

    executor
        .with_each_shard(None, &options, |_| {
            let pinned = context::current(&unsharded, &registry);
            assert!(pinned.same_shard(&registry.default_shard()));
            Ok(vec![()])
        })
        .unwrap();
}

#[test]
fn failing_bodies_still_restore_activation() {
    let executor = executor();
    let registry = executor.registry().clone();
    let cat = Category::primary();

    let _ = executor.with_each_shard::<(), _>(None, &FanOutOptions::default(), |_| {
        anyhow::bail!("nope")
    });
    assert_eq!(context::current(&cat, &registry).id(), ShardId(1));
}

#[test]
fn lookup_inside_fan_out_uses_the_fast_path() {
    let executor = executor();
    let registry = executor.registry().clone();

    executor
        .with_each_shard(None, &FanOutOptions::default(), |ctx| {
            // The current shard resolves through the fast path, not the
            // cache.
            let resolved = registry.lookup(ctx.shard().id()).unwrap();
            assert!(resolved.same_shard(ctx.shard()));
            Ok(vec![()])
        })
        .unwrap();
}
