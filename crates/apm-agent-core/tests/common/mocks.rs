// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock native profilers

use std::sync::Mutex;
use std::time::Duration;

use apm_agent_core::error::SnapshotError;
use apm_agent_core::snapshot::model::ProcessCallGraph;
use apm_agent_core::snapshot::CpuProfiler;
use apm_agent_core::ThreadId;
use tokio::sync::Notify;

/// CPU profiler that holds the capture open until released, then returns the graph the
/// test staged while it was running.
#[derive(Default)]
pub struct GatedCpuProfiler {
    gate: Notify,
    staged: Mutex<ProcessCallGraph>,
    newest_thread: Mutex<Option<ThreadId>>,
}

impl GatedCpuProfiler {
    pub fn stage(&self, graph: ProcessCallGraph) {
        *self.staged.lock().unwrap() = graph;
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn newest_thread(&self) -> Option<ThreadId> {
        *self.newest_thread.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl CpuProfiler for GatedCpuProfiler {
    async fn profile(
        &self,
        _duration: Duration,
        newest_thread: ThreadId,
    ) -> Result<ProcessCallGraph, SnapshotError> {
        *self.newest_thread.lock().unwrap() = Some(newest_thread);
        self.gate.notified().await;
        Ok(std::mem::take(&mut *self.staged.lock().unwrap()))
    }
}
