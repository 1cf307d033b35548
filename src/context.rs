//! # Activation Context
//!
//! Per-execution-context stack of category→shard mappings. The stack is
//! strictly thread-local: reads and writes never need locks, and a spawned
//! worker does not inherit it unless an explicit snapshot is carried over.

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::model::{Category, ShardRef};
use crate::registry::ShardRegistry;

#[derive(Debug, Clone)]
struct Frame {
    category: Category,
    shard: ShardRef,
}

thread_local! {
    static STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// The shard currently active for a category, or the registry default when
/// none has been activated in this execution context.
pub fn current(category: &Category, registry: &ShardRegistry) -> ShardRef {
    let found = STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|frame| frame.category == *category)
            .map(|frame| frame.shard.clone())
    });
    found.unwrap_or_else(|| registry.default_shard())
}

/// Scoped activation: push the changed categories, run `body`, and restore
/// the prior mapping on every exit path, panics included. Nesting is legal;
/// independent scopes do not interfere.
pub fn activate<R>(
    registry: &ShardRegistry,
    mapping: &[(Category, ShardRef)],
    body: impl FnOnce() -> R,
) -> R {
    let _guard = ActivationGuard::acquire(registry, mapping);
    body()
}

/// Push without automatic pop, returning the categories that actually
/// changed. For console/manual use; the caller owes a matching
/// [`deactivate`].
pub fn activate_unguarded(
    registry: &ShardRegistry,
    mapping: &[(Category, ShardRef)],
) -> Vec<Category> {
    push_frames(registry, mapping)
}

/// Manual pop matching [`activate_unguarded`].
pub fn deactivate(categories: &[Category]) {
    pop_frames(categories);
}

/// RAII form of activation: frames pushed on acquire are popped on drop.
pub struct ActivationGuard {
    pushed: Vec<Category>,
    // Thread-local state; the guard must be dropped where it was acquired.
    _not_send: PhantomData<*const ()>,
}

impl ActivationGuard {
    pub fn acquire(registry: &ShardRegistry, mapping: &[(Category, ShardRef)]) -> Self {
        Self {
            pushed: push_frames(registry, mapping),
            _not_send: PhantomData,
        }
    }

    /// Categories this guard changed.
    pub fn changed(&self) -> &[Category] {
        &self.pushed
    }
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        pop_frames(&self.pushed);
    }
}

fn push_frames(registry: &ShardRegistry, mapping: &[(Category, ShardRef)]) -> Vec<Category> {
    let mut pushed = Vec::new();
    for (category, shard) in mapping {
        // The unsharded category is pinned to the default shard.
        if category.is_unsharded() {
            continue;
        }
        let active = current(category, registry);
        if active.same_shard(shard) {
            continue;
        }
        STACK.with(|stack| {
            stack.borrow_mut().push(Frame {
                category: category.clone(),
                shard: shard.clone(),
            });
        });
        pushed.push(category.clone());
    }
    pushed
}

fn pop_frames(categories: &[Category]) {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        for category in categories.iter().rev() {
            if let Some(pos) = stack.iter().rposition(|frame| frame.category == *category) {
                stack.remove(pos);
            }
        }
    });
}

/// A copy of this execution context's activation state, for explicit
/// propagation into another thread or task.
#[derive(Debug, Clone, Default)]
pub struct ActivationSnapshot {
    frames: Vec<Frame>,
}

/// Capture the current context's activation stack.
pub fn snapshot() -> ActivationSnapshot {
    ActivationSnapshot {
        frames: STACK.with(|stack| stack.borrow().clone()),
    }
}

/// Run `body` with a previously captured stack installed, restoring this
/// context's own stack afterwards.
pub fn with_snapshot<R>(snapshot: &ActivationSnapshot, body: impl FnOnce() -> R) -> R {
    struct Restore {
        saved: Vec<Frame>,
    }
    impl Drop for Restore {
        fn drop(&mut self) {
            STACK.with(|stack| *stack.borrow_mut() = std::mem::take(&mut self.saved));
        }
    }

    let saved = STACK.with(|stack| {
        std::mem::replace(&mut *stack.borrow_mut(), snapshot.frames.clone())
    });
    let _restore = Restore { saved };
    body()
}
