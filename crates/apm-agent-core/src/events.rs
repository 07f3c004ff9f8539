// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synchronous event bus connecting the agent components.
//!
//! Listeners run in registration order on the emitting call stack. A listener that fails
//! or panics is logged and skipped; the emitter and the remaining listeners are never
//! affected. The listener table is not locked while listeners run, so listeners may emit
//! further events or register new listeners.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::HookError;
use crate::profiler::{ExitCall, Transaction};
use crate::thread::ThreadId;

/// Business transaction details reported by the backend for a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BtDetails {
    #[serde(rename = "btID")]
    pub bt_id: Option<i64>,
    #[serde(rename = "snapshotGUID")]
    pub snapshot_guid: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    TransactionStarted(Transaction),
    /// A transaction finished.
    Transaction(Transaction),
    ExitCallStarted {
        transaction: Transaction,
        exit_call: ExitCall,
    },
    ExitCallStopped {
        transaction: Transaction,
        exit_call: ExitCall,
    },
    /// The backend discarded the transaction with this guid.
    TransactionDropped { guid: String },
    BtDetails {
        details: BtDetails,
        thread_id: ThreadId,
    },
    UpdateCallContextMap {
        thread_id: ThreadId,
        bt_id: i64,
        guid: Option<String>,
    },
    NodeIndexComputed,
    /// Emitted once by [`crate::Agent::start`], with the node name and tags merged in.
    AgentStarted { metadata: serde_json::Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TransactionStarted,
    Transaction,
    ExitCallStarted,
    ExitCallStopped,
    TransactionDropped,
    BtDetails,
    UpdateCallContextMap,
    NodeIndexComputed,
    AgentStarted,
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AgentEvent::TransactionStarted(_) => EventKind::TransactionStarted,
            AgentEvent::Transaction(_) => EventKind::Transaction,
            AgentEvent::ExitCallStarted { .. } => EventKind::ExitCallStarted,
            AgentEvent::ExitCallStopped { .. } => EventKind::ExitCallStopped,
            AgentEvent::TransactionDropped { .. } => EventKind::TransactionDropped,
            AgentEvent::BtDetails { .. } => EventKind::BtDetails,
            AgentEvent::UpdateCallContextMap { .. } => EventKind::UpdateCallContextMap,
            AgentEvent::NodeIndexComputed => EventKind::NodeIndexComputed,
            AgentEvent::AgentStarted { .. } => EventKind::AgentStarted,
        }
    }
}

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&AgentEvent) -> Result<(), HookError> + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    entries: Vec<(ListenerId, EventKind, Listener)>,
}

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Listeners>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.lock().entries.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&AgentEvent) -> Result<(), HookError> + Send + Sync + 'static,
    {
        let mut listeners = self.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push((id, kind, Arc::new(listener)));
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry_id, _, _)| *entry_id != id);
        listeners.entries.len() != before
    }

    /// Delivers `event` to every listener registered for its kind. Returns how many
    /// listeners handled it without failing.
    pub fn emit(&self, event: &AgentEvent) -> usize {
        let kind = event.kind();
        let matching: Vec<Listener> = self
            .lock()
            .entries
            .iter()
            .filter(|(_, entry_kind, _)| *entry_kind == kind)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();

        let mut delivered = 0;
        for listener in matching {
            let result = match std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(result) => result,
                Err(payload) => Err(HookError::from_panic(payload)),
            };
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!("{kind:?} listener failed: {e}"),
            }
        }
        delivered
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|(_, entry_kind, _)| *entry_kind == kind)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Listeners> {
        #[allow(clippy::expect_used)]
        self.listeners.lock().expect("lock poisoned")
    }
}
