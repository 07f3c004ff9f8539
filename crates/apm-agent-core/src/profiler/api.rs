// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Programmatic transactions for work the built-in entry points do not see.

use std::sync::Arc;

use crate::error::ApiError;
use crate::profiler::{ExitCall, ExitCallInfo, Profiler, RequestData, Time};
use crate::thread::ThreadId;
use crate::value::{ErrorValue, Value};

pub const API_ENTRY_TYPE: &str = "API";

const DEFAULT_ERROR_STATUS: u16 = 500;

/// Handle on a transaction driven by application code.
#[derive(Clone, Debug)]
pub struct TransactionApi {
    profiler: Arc<Profiler>,
    time: Time,
    thread_id: ThreadId,
}

impl TransactionApi {
    /// Starts a transaction on a new logical context.
    pub fn start(profiler: &Arc<Profiler>, info: RequestData) -> Self {
        let time = profiler.time(true);
        let stack_trace = profiler.stack_trace(None);
        let transaction = profiler.start_transaction(&time, Some(info), API_ENTRY_TYPE);
        profiler.with_transaction(transaction.thread_id, |transaction| {
            transaction.stack_trace = stack_trace;
        });
        Self {
            profiler: Arc::clone(profiler),
            time,
            thread_id: transaction.thread_id,
        }
    }

    /// Attaches to the transaction already open on `thread_id`.
    pub fn join(profiler: &Arc<Profiler>, thread_id: ThreadId) -> Result<Self, ApiError> {
        let time = profiler
            .transaction(thread_id)
            .and_then(|transaction| transaction.time)
            .ok_or(ApiError::NotStarted)?;
        Ok(Self {
            profiler: Arc::clone(profiler),
            time,
            thread_id,
        })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Makes the transaction's logical context current again, e.g. at the top of a
    /// continuation the agent could not bind automatically.
    pub fn resume(&self) -> Result<(), ApiError> {
        if self.profiler.transaction(self.thread_id).is_none() {
            return Err(ApiError::NotStarted);
        }
        self.profiler.thread().resume(Some(self.thread_id));
        self.profiler.touch(self.thread_id);
        Ok(())
    }

    /// Records an error on the transaction. The status code defaults to the error's own,
    /// then to 500.
    pub fn mark_error(&self, error: ErrorValue, status_code: Option<u16>) {
        let stack_trace = error
            .stack
            .as_deref()
            .and_then(|stack| self.profiler.format_stack_trace(stack));
        let status_code = status_code
            .or(error.status_code)
            .unwrap_or(DEFAULT_ERROR_STATUS);
        self.profiler
            .with_transaction(self.thread_id, move |transaction| {
                transaction.error = Some(error);
                transaction.stack_trace = stack_trace;
                transaction.status_code = Some(status_code);
            });
    }

    /// Ends the transaction. Only the first call has an effect; returns whether this was it.
    pub fn end(&self, error: Option<ErrorValue>, status_code: Option<u16>) -> bool {
        if !self.time.done() {
            return false;
        }
        if let Some(error) = error {
            self.mark_error(error, status_code);
        }
        self.profiler.end_transaction(&self.time);
        true
    }

    /// Starts an exit call. The `before_exit_call` hook is not consulted for calls the
    /// application creates itself.
    pub fn start_exit_call(&self, mut info: ExitCallInfo) -> Option<ExitCall> {
        let time = self.profiler.time_for(Some(self.thread_id));
        info.use_backend_config = false;
        self.profiler.create_exit_call_unhooked(&time, info)
    }

    /// Completes an exit call. Only the first call has an effect; returns whether this was it.
    pub fn end_exit_call(&self, exit_call: ExitCall, error: Option<ErrorValue>) -> bool {
        let Some(time) = exit_call.time.clone() else {
            return false;
        };
        if !time.done() {
            return false;
        }
        self.profiler.add_exit_call(&time, exit_call, error);
        true
    }

    pub fn on_before_exit_call<F>(&self, hook: F)
    where
        F: Fn(ExitCall) -> Option<ExitCall> + Send + Sync + 'static,
    {
        self.profiler.with_transaction(self.thread_id, |transaction| {
            transaction.api.before_exit_call = Some(Arc::new(hook));
        });
    }

    pub fn on_exit_call_completed<F>(&self, hook: F)
    where
        F: Fn(ExitCall) -> Option<ExitCall> + Send + Sync + 'static,
    {
        self.profiler.with_transaction(self.thread_id, |transaction| {
            transaction.api.exit_call_completed = Some(Arc::new(hook));
        });
    }

    pub fn add_snapshot_data(&self, key: &str, value: Value) {
        self.profiler.with_transaction(self.thread_id, |transaction| {
            transaction.snapshot_data.push((key.to_string(), value));
        });
    }

    pub fn add_analytics_data(&self, key: &str, value: Value) {
        self.profiler.with_transaction(self.thread_id, |transaction| {
            transaction.analytics_data.push((key.to_string(), value));
        });
    }
}
