// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::thread::ThreadId;

struct TimeInner {
    id: u64,
    thread_id: Option<ThreadId>,
    begin: u64,
    is_transaction: bool,
    done: AtomicBool,
    recorded: AtomicBool,
    end: AtomicU64,
    clock: Arc<dyn Clock>,
}

/// A started timer bound to a logical context.
///
/// Clones share the timer. [`Time::done`] stops it exactly once, which is what guards exit
/// calls and transactions against double completion.
#[derive(Clone)]
pub struct Time(Arc<TimeInner>);

impl Time {
    pub(crate) fn start(
        id: u64,
        thread_id: Option<ThreadId>,
        is_transaction: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let begin = clock.now_millis();
        Time(Arc::new(TimeInner {
            id,
            thread_id,
            begin,
            is_transaction,
            done: AtomicBool::new(false),
            recorded: AtomicBool::new(false),
            end: AtomicU64::new(begin),
            clock,
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.0.thread_id
    }

    pub fn begin(&self) -> u64 {
        self.0.begin
    }

    pub fn is_transaction(&self) -> bool {
        self.0.is_transaction
    }

    /// Stops the timer. Returns true only for the first call; later calls change nothing.
    pub fn done(&self) -> bool {
        if self.0.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.0.end.store(self.0.clock.now_millis(), Ordering::SeqCst);
        true
    }

    /// Claims the measurement for recording. True only for the first claim, so whatever
    /// the timer measured is recorded once however many paths complete it.
    pub(crate) fn claim(&self) -> bool {
        !self.0.recorded.swap(true, Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.0.done.load(Ordering::SeqCst)
    }

    /// Elapsed milliseconds, or `None` while the timer is running.
    pub fn ms(&self) -> Option<u64> {
        self.is_done()
            .then(|| self.0.end.load(Ordering::SeqCst).saturating_sub(self.0.begin))
    }

    pub fn ptr_eq(&self, other: &Time) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Time")
            .field("id", &self.0.id)
            .field("thread_id", &self.0.thread_id)
            .field("begin", &self.0.begin)
            .field("ms", &self.ms())
            .finish()
    }
}
