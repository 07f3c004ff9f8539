// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interface to the backend reporting pipeline.
//!
//! The wire transport, metric registration and correlation-header encoding live behind
//! [`BackendConnector`]. The core only calls into it.

use std::sync::Mutex;

use tracing::debug;

use crate::profiler::{ExitCall, Transaction};
use crate::snapshot::model::ProcessSnapshot;

pub trait BackendConnector: Send + Sync {
    /// Registers an exit call with the backend. Implementations assign `exit_call.guid`
    /// when the backend will track the call; calls left without a guid are not waited on.
    fn start_exit_call(&self, _transaction: &Transaction, exit_call: &mut ExitCall) {
        exit_call.guid = Some(uuid::Uuid::new_v4().to_string());
    }

    fn stop_exit_call(&self, _exit_call: &ExitCall) {}

    /// Outgoing correlation header for an exit call, already encoded.
    fn correlation_header(&self, exit_call: &ExitCall) -> Option<String> {
        exit_call.correlation_header.clone()
    }

    fn start_process_snapshot(&self) {}

    fn send_process_snapshot(&self, _snapshot: &ProcessSnapshot) {}

    fn add_metric(&self, _name: &str, _value: f64) {}
}

/// Connector that assigns exit-call guids and discards everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConnector;

impl BackendConnector for NoopConnector {}

/// Connector that keeps everything it is handed, for inspection.
#[derive(Debug, Default)]
pub struct InMemoryConnector {
    stopped_exit_calls: Mutex<Vec<ExitCall>>,
    snapshots: Mutex<Vec<ProcessSnapshot>>,
    metrics: Mutex<Vec<(String, f64)>>,
    snapshots_started: Mutex<usize>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stopped_exit_calls(&self) -> Vec<ExitCall> {
        #[allow(clippy::expect_used)]
        self.stopped_exit_calls.lock().expect("lock poisoned").clone()
    }

    pub fn snapshots(&self) -> Vec<ProcessSnapshot> {
        #[allow(clippy::expect_used)]
        self.snapshots.lock().expect("lock poisoned").clone()
    }

    pub fn metrics(&self) -> Vec<(String, f64)> {
        #[allow(clippy::expect_used)]
        self.metrics.lock().expect("lock poisoned").clone()
    }

    pub fn snapshots_started(&self) -> usize {
        #[allow(clippy::expect_used)]
        *self.snapshots_started.lock().expect("lock poisoned")
    }
}

impl BackendConnector for InMemoryConnector {
    fn stop_exit_call(&self, exit_call: &ExitCall) {
        #[allow(clippy::expect_used)]
        self.stopped_exit_calls
            .lock()
            .expect("lock poisoned")
            .push(exit_call.clone());
    }

    fn start_process_snapshot(&self) {
        #[allow(clippy::expect_used)]
        let mut started = self.snapshots_started.lock().expect("lock poisoned");
        *started += 1;
    }

    fn send_process_snapshot(&self, snapshot: &ProcessSnapshot) {
        debug!("storing process snapshot {}", snapshot.guid);
        #[allow(clippy::expect_used)]
        self.snapshots
            .lock()
            .expect("lock poisoned")
            .push(snapshot.clone());
    }

    fn add_metric(&self, name: &str, value: f64) {
        #[allow(clippy::expect_used)]
        self.metrics
            .lock()
            .expect("lock poisoned")
            .push((name.to_string(), value));
    }
}
