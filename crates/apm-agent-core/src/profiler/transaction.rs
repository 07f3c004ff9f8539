// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::correlation::CorrelationHeader;
use crate::profiler::time::Time;
use crate::thread::ThreadId;
use crate::value::{ErrorValue, Value};

pub type BeforeExitCallHook = dyn Fn(ExitCall) -> Option<ExitCall> + Send + Sync;
pub type ExitCallCompletedHook = dyn Fn(ExitCall) -> Option<ExitCall> + Send + Sync;

/// Hooks registered through the user transaction API.
#[derive(Clone, Default)]
pub struct ApiHooks {
    /// May rewrite an exit call before it starts, or cancel it by returning `None`.
    pub before_exit_call: Option<Arc<BeforeExitCallHook>>,
    /// May replace a completed exit call before it is recorded.
    pub exit_call_completed: Option<Arc<ExitCallCompletedHook>>,
}

impl fmt::Debug for ApiHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiHooks")
            .field("before_exit_call", &self.before_exit_call.is_some())
            .field("exit_call_completed", &self.exit_call_completed.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestData {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
}

/// Description of an exit call, as supplied by the library adapter that intercepted it.
#[derive(Debug, Clone, Default)]
pub struct ExitCallInfo {
    /// Exit point type, e.g. `EXIT_DB`. The `EXIT_` prefix is optional.
    pub exit_type: String,
    pub exit_sub_type: Option<String>,
    pub backend_name: Option<String>,
    pub category: Option<String>,
    pub command: Option<String>,
    pub command_args: Option<Vec<String>>,
    pub identifying_properties: BTreeMap<String, String>,
    pub use_backend_config: bool,
    pub stack_trace: Option<Vec<String>>,
}

/// One outbound operation performed within a transaction.
#[derive(Debug, Clone, Default)]
pub struct ExitCall {
    pub thread_id: Option<ThreadId>,
    pub exit_point_type: String,
    pub exit_point_sub_type: Option<String>,
    pub backend_name: Option<String>,
    pub category: Option<String>,
    pub command: Option<String>,
    pub command_args: Option<Vec<String>>,
    pub properties: BTreeMap<String, String>,
    pub use_backend_config: bool,
    /// Assigned by the backend connector when the call is started.
    pub guid: Option<String>,
    pub correlation_header: Option<String>,
    pub sequence_info: Option<String>,
    pub ms: Option<u64>,
    pub error: Option<ErrorValue>,
    pub time: Option<Time>,
    pub is_snapshot_enabled: bool,
    pub stack_trace: Option<Vec<String>>,
    pub status_code: Option<u16>,
}

impl ExitCall {
    pub(crate) fn from_info(time: &Time, info: ExitCallInfo) -> Self {
        let exit_point_type = info
            .exit_type
            .strip_prefix("EXIT_")
            .unwrap_or(&info.exit_type)
            .to_string();
        Self {
            thread_id: time.thread_id(),
            exit_point_type,
            exit_point_sub_type: info.exit_sub_type,
            backend_name: info.backend_name,
            category: info.category,
            command: info.command,
            command_args: info.command_args,
            properties: info.identifying_properties,
            use_backend_config: info.use_backend_config,
            stack_trace: info.stack_trace,
            time: Some(time.clone()),
            ..Default::default()
        }
    }
}

/// One business transaction, keyed by the logical context that started it.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub id: u64,
    pub guid: Option<String>,
    pub registration_id: Option<i64>,
    pub ts: u64,
    pub touched: u64,
    pub thread_id: ThreadId,
    pub entry_type: String,
    pub request: Option<RequestData>,
    pub time: Option<Time>,
    pub is_finished: bool,
    pub is_response_sent: bool,
    pub ms: Option<u64>,
    /// Guids of the exit calls the backend started for this transaction.
    pub started_exit_calls: Vec<String>,
    pub exit_calls: Vec<ExitCall>,
    pub exit_call_counter: u64,
    pub corr_header: Option<CorrelationHeader>,
    pub api: ApiHooks,
    pub error: Option<ErrorValue>,
    pub status_code: Option<u16>,
    pub stack_trace: Option<Vec<String>>,
    /// Set when the backend decided not to report this transaction.
    pub ignore: bool,
    pub skip: bool,
    pub process_snapshots: BTreeSet<String>,
    pub snapshot_data: Vec<(String, Value)>,
    pub analytics_data: Vec<(String, Value)>,
}

impl Transaction {
    /// Every started exit call has a completed counterpart.
    pub fn exit_calls_settled(&self) -> bool {
        self.started_exit_calls.iter().all(|guid| {
            self.exit_calls
                .iter()
                .any(|call| call.guid.as_deref() == Some(guid.as_str()))
        })
    }

    pub fn add_process_snapshot_guid(&mut self, guid: &str) {
        self.process_snapshots.insert(guid.to_string());
    }

    /// Next exit-call sequence number, chained after the caller's sequence info when the
    /// transaction continues a correlated (same-application) request.
    pub(crate) fn next_sequence_info(&mut self) -> String {
        self.exit_call_counter += 1;
        let count = self.exit_call_counter.to_string();
        match &self.corr_header {
            Some(header) if !header.cross_app_correlation => header
                .incoming_sequence_info()
                .map_or(count.clone(), |incoming| format!("{incoming}|{count}")),
            _ => count,
        }
    }
}
