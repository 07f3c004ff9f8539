// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Continuation-local storage for the active logical execution context.
//!
//! When a store is enabled, the logical context set inside a [`ContextStore::scope`] follows
//! the task across every `.await` without any manual save/restore. When it is not, the
//! [`crate::thread::ThreadTracker`] falls back to its manually tracked value, which is only
//! correct across boundaries that the interception engine itself wraps.

use std::cell::Cell;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::info;

use crate::thread::ThreadId;

tokio::task_local! {
    static CURRENT_THREAD: Cell<Option<ThreadId>>;
}

pub trait ContextStore: Send + Sync {
    /// Whether values set through this store are carried across continuations.
    fn is_enabled(&self) -> bool;

    /// Value for the running continuation, if any was set in an enclosing scope.
    fn get(&self) -> Option<ThreadId>;

    /// Sets the value for the enclosing scope. Outside of a scope this is a no-op.
    fn set(&self, thread_id: Option<ThreadId>);

    /// Runs `fut` in a fresh scope with no active context.
    fn scope<'a>(&self, fut: BoxFuture<'a, ()>) -> BoxFuture<'a, ()>;

    /// Runs `fut` in a scope that starts with the caller's current context.
    fn bind<'a>(&self, fut: BoxFuture<'a, ()>) -> BoxFuture<'a, ()>;
}

/// Store backed by a tokio task-local cell.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskLocalStore;

impl TaskLocalStore {
    /// Generic form of [`ContextStore::scope`] for callers that need the future's output.
    pub fn scope_with<F: Future>(initial: Option<ThreadId>, fut: F) -> impl Future<Output = F::Output> {
        CURRENT_THREAD.scope(Cell::new(initial), fut)
    }

    fn current() -> Option<ThreadId> {
        CURRENT_THREAD.try_with(Cell::get).ok().flatten()
    }
}

impl ContextStore for TaskLocalStore {
    fn is_enabled(&self) -> bool {
        true
    }

    fn get(&self) -> Option<ThreadId> {
        Self::current()
    }

    fn set(&self, thread_id: Option<ThreadId>) {
        let _ = CURRENT_THREAD.try_with(|cell| cell.set(thread_id));
    }

    fn scope<'a>(&self, fut: BoxFuture<'a, ()>) -> BoxFuture<'a, ()> {
        CURRENT_THREAD.scope(Cell::new(None), fut).boxed()
    }

    fn bind<'a>(&self, fut: BoxFuture<'a, ()>) -> BoxFuture<'a, ()> {
        CURRENT_THREAD.scope(Cell::new(Self::current()), fut).boxed()
    }
}

/// Store used when continuation-local storage is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl ContextStore for NoopStore {
    fn is_enabled(&self) -> bool {
        false
    }

    fn get(&self) -> Option<ThreadId> {
        None
    }

    fn set(&self, _thread_id: Option<ThreadId>) {}

    fn scope<'a>(&self, fut: BoxFuture<'a, ()>) -> BoxFuture<'a, ()> {
        fut
    }

    fn bind<'a>(&self, fut: BoxFuture<'a, ()>) -> BoxFuture<'a, ()> {
        fut
    }
}

/// Picks the store for this process.
pub fn select_store(disabled: bool) -> Box<dyn ContextStore> {
    if disabled {
        info!("CLS disabled by configuration");
        Box::new(NoopStore)
    } else {
        Box::new(TaskLocalStore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_local_value_survives_await() {
        let store = TaskLocalStore;
        TaskLocalStore::scope_with(None, async move {
            store.set(Some(7));
            tokio::task::yield_now().await;
            assert_eq!(store.get(), Some(7));
        })
        .await;
        assert_eq!(store.get(), None);
    }

    #[tokio::test]
    async fn test_bind_carries_current_value_into_spawned_task() {
        let store = TaskLocalStore;
        let handle = TaskLocalStore::scope_with(Some(3), async move {
            tokio::spawn(store.bind(
                async move {
                    assert_eq!(TaskLocalStore.get(), Some(3));
                }
                .boxed(),
            ))
        })
        .await;
        handle.await.unwrap();
    }

    #[test]
    fn test_set_outside_scope_is_ignored() {
        let store = TaskLocalStore;
        store.set(Some(1));
        assert_eq!(store.get(), None);
    }

    #[test]
    fn test_noop_store_never_holds_a_value() {
        let store = select_store(true);
        store.set(Some(9));
        assert!(!store.is_enabled());
        assert_eq!(store.get(), None);
    }
}
