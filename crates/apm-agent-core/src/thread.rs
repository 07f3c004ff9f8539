// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Logical execution contexts ("threads").
//!
//! The runtime has no usable thread identity: every request runs on the same scheduler
//! thread and interleaves with others at suspension points. A [`ThreadId`] names one causal
//! chain of execution instead. Ids are allocated monotonically and never reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::{ContextStore, NoopStore};

pub type ThreadId = u64;

/// Sentinel for "no context" in the atomic slot. Real ids start at 1.
const NO_THREAD: u64 = 0;

pub struct ThreadTracker {
    next_id: AtomicU64,
    current: AtomicU64,
    store: Box<dyn ContextStore>,
}

impl Default for ThreadTracker {
    fn default() -> Self {
        Self::new(Box::new(NoopStore))
    }
}

impl std::fmt::Debug for ThreadTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadTracker")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("current", &self.manual_current())
            .field("store_enabled", &self.store.is_enabled())
            .finish()
    }
}

impl ThreadTracker {
    pub fn new(store: Box<dyn ContextStore>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            current: AtomicU64::new(NO_THREAD),
            store,
        }
    }

    /// Allocates a new logical context and makes it current.
    pub fn enter(&self) -> ThreadId {
        let thread_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.current.store(thread_id, Ordering::SeqCst);
        self.store.set(Some(thread_id));
        thread_id
    }

    pub fn exit(&self) {
        self.current.store(NO_THREAD, Ordering::SeqCst);
    }

    /// The propagated context when the store has one, else the manually tracked one.
    pub fn current(&self) -> Option<ThreadId> {
        self.store.get().or_else(|| self.manual_current())
    }

    /// Force-activates a previously saved context (or none).
    pub fn resume(&self, thread_id: Option<ThreadId>) {
        self.current
            .store(thread_id.unwrap_or(NO_THREAD), Ordering::SeqCst);
    }

    /// Id that the next call to [`ThreadTracker::enter`] will hand out.
    pub fn next_id(&self) -> ThreadId {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &dyn ContextStore {
        self.store.as_ref()
    }

    /// Saves the current context and optionally activates `invocation`. The saved context is
    /// restored when the guard drops, whether the guarded code returns, errors or unwinds.
    pub fn guard(self: &Arc<Self>, invocation: Option<ThreadId>) -> ContextGuard {
        let saved = self.current();
        if invocation.is_some() {
            self.resume(invocation);
        }
        ContextGuard {
            tracker: Arc::clone(self),
            saved,
        }
    }

    fn manual_current(&self) -> Option<ThreadId> {
        match self.current.load(Ordering::SeqCst) {
            NO_THREAD => None,
            thread_id => Some(thread_id),
        }
    }
}

#[must_use = "the saved context is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    tracker: Arc<ThreadTracker>,
    saved: Option<ThreadId>,
}

impl ContextGuard {
    pub fn saved(&self) -> Option<ThreadId> {
        self.saved
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.tracker.resume(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskLocalStore;

    #[test]
    fn test_enter_allocates_monotonic_ids() {
        let tracker = ThreadTracker::default();
        assert_eq!(tracker.current(), None);
        assert_eq!(tracker.enter(), 1);
        assert_eq!(tracker.enter(), 2);
        assert_eq!(tracker.current(), Some(2));
        assert_eq!(tracker.next_id(), 3);
        tracker.exit();
        assert_eq!(tracker.current(), None);
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let tracker = Arc::new(ThreadTracker::default());
        let outer = tracker.enter();
        {
            let guard = tracker.guard(Some(42));
            assert_eq!(guard.saved(), Some(outer));
            assert_eq!(tracker.current(), Some(42));
            tracker.resume(Some(77));
        }
        assert_eq!(tracker.current(), Some(outer));
    }

    #[test]
    fn test_guard_restores_on_unwind() {
        let tracker = Arc::new(ThreadTracker::default());
        tracker.resume(Some(5));
        let inner = Arc::clone(&tracker);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.guard(Some(6));
            panic!("original failed");
        }));
        assert!(result.is_err());
        assert_eq!(tracker.current(), Some(5));
    }

    #[tokio::test]
    async fn test_store_value_takes_precedence() {
        let tracker = Arc::new(ThreadTracker::new(Box::new(TaskLocalStore)));
        tracker.resume(Some(10));
        let inner = Arc::clone(&tracker);
        TaskLocalStore::scope_with(None, async move {
            let id = inner.enter();
            inner.resume(Some(10));
            tokio::task::yield_now().await;
            assert_eq!(inner.current(), Some(id));
        })
        .await;
        assert_eq!(tracker.current(), Some(10));
    }
}
