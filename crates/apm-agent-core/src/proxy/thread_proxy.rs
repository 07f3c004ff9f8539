// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded pool of marker functions used to correlate sampled frames with logical contexts.
//!
//! While call-context correlation is enabled, callbacks run inside a function named
//! `apm_proxy_<slot>`, where the slot is assigned once per logical context. A sampling
//! profiler that sees such a frame can look the name up in the call-context map to find the
//! business transaction that scheduled it.

use std::collections::HashMap;

use serde::Serialize;

use crate::thread::ThreadId;
use crate::value::Function;

pub const THREAD_PROXY_POOL_SIZE: usize = 250;

pub const THREAD_PROXY_PREFIX: &str = "apm_proxy_";

/// Name given to thread-proxy frames once their attribution has been captured.
pub const ANONYMOUS_PROXY_NAME: &str = "apm_proxy_x";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContextEntry {
    pub bt_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_guid: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct CallContextState {
    pub(crate) enabled: bool,
    slots: HashMap<ThreadId, usize>,
    next_slot: usize,
    pub(crate) map: HashMap<String, CallContextEntry>,
}

impl CallContextState {
    pub(crate) fn reset(&mut self) {
        self.enabled = false;
        self.slots.clear();
        self.next_slot = 0;
        self.map.clear();
    }

    /// Slot already assigned to `thread_id`.
    pub(crate) fn slot_of(&self, thread_id: ThreadId) -> Option<usize> {
        self.slots.get(&thread_id).copied()
    }

    /// Slot for `thread_id`, assigning the next free one on first use. `None` once the pool
    /// is exhausted.
    pub(crate) fn slot_for(&mut self, thread_id: ThreadId) -> Option<usize> {
        if let Some(slot) = self.slot_of(thread_id) {
            return Some(slot);
        }
        if self.next_slot >= THREAD_PROXY_POOL_SIZE {
            return None;
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.slots.insert(thread_id, slot);
        Some(slot)
    }

    /// Stamps the call-context entry for the slot of `thread_id`, if it has one.
    pub(crate) fn record(&mut self, thread_id: ThreadId, entry: CallContextEntry) {
        if let Some(slot) = self.slot_of(thread_id) {
            self.map.insert(proxy_name(slot), entry);
        }
    }
}

pub fn proxy_name(slot: usize) -> String {
    format!("{THREAD_PROXY_PREFIX}{slot}")
}

pub fn is_thread_proxy_name(name: &str) -> bool {
    name.contains(THREAD_PROXY_PREFIX)
}

/// Wraps `function` in the marker function for `slot`. The marker only delegates.
pub(crate) fn make_thread_proxy(function: &Function, slot: usize) -> Function {
    let inner = function.clone();
    Function::new(proxy_name(slot), function.arity(), move |this, args| {
        inner.call(this, args)
    })
}
