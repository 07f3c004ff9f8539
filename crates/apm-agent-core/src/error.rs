// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Failure raised by instrumentation hook code.
///
/// Hook errors are always caught at the interception boundary and logged; they never reach
/// the instrumented call site.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{0}")]
    Message(String),

    #[error("hook panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HookError {
    pub fn msg(message: impl Into<String>) -> Self {
        HookError::Message(message.into())
    }

    /// Converts a payload caught by `catch_unwind` into an error.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        HookError::Panicked(message)
    }
}

/// Errors reported to the requester of a process snapshot.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SnapshotError {
    #[error("Process snapshot already in progress, not starting another one!")]
    AlreadyInProgress,

    #[error("Already did {count} process snapshots in {period_ms}ms.")]
    RateLimited { count: u32, period_ms: u64 },

    #[error("snapshotRequestID {0} was already processed, ignoring.")]
    DuplicateRequest(i64),

    #[error("CPU profiling is not supported by this runtime")]
    Unsupported,

    #[error("Profiler failure: {0}")]
    Profiler(String),
}

/// Errors returned by the user transaction API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("transaction not started")]
    NotStarted,
}
