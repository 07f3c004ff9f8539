// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process snapshots: bounded CPU (and heap) captures attributed to business transactions.
//!
//! While a capture runs, call-context correlation is enabled on the proxy so callbacks
//! execute inside named thread-proxy frames. After the capture, the sampled graph is
//! post-processed with the resulting call-context map (see [`call_tree`]).

pub mod call_tree;
pub mod model;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::backend::BackendConnector;
use crate::error::SnapshotError;
use crate::profiler::{Profiler, Transaction};
use crate::proxy::Proxy;
use crate::thread::ThreadId;
use call_tree::{post_process_allocation_graph, post_process_call_graph, PostProcessOptions};
use model::{
    BtCallInfo, ProcessAllocationGraph, ProcessCallGraph, ProcessCallGraphRequest, ProcessSnapshot,
};

pub const DEFAULT_AUTO_SNAPSHOT_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_SNAPSHOTS_PER_PERIOD: u32 = 2;
pub const DEFAULT_COUNT_RESET_PERIOD: Duration = Duration::from_secs(60);

/// Request id carried by snapshots the agent starts on its own.
pub const AUTO_SNAPSHOT_REQUEST_ID: i64 = -1;

/// The last processed manual request id is forgotten after this long.
const REQUEST_ID_RESET_PERIOD_MS: u64 = 300_000;

/// Native CPU sampler.
#[async_trait]
pub trait CpuProfiler: Send + Sync {
    /// Samples the process for `duration` and returns the raw call graph. `newest_thread`
    /// is the most recently allocated logical context when the capture started.
    async fn profile(
        &self,
        duration: Duration,
        newest_thread: ThreadId,
    ) -> Result<ProcessCallGraph, SnapshotError>;
}

/// Native allocation tracker.
#[async_trait]
pub trait HeapProfiler: Send + Sync {
    fn is_object_tracking_supported(&self) -> bool;

    async fn track_allocations(
        &self,
        duration: Duration,
    ) -> Result<ProcessAllocationGraph, SnapshotError>;
}

#[derive(Debug, Clone)]
pub struct ScannerSettings {
    pub max_snapshots_per_period: u32,
    pub count_reset_period: Duration,
    pub auto_snapshot_duration: Duration,
    pub exclude_agent_from_call_graph: bool,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            max_snapshots_per_period: DEFAULT_MAX_SNAPSHOTS_PER_PERIOD,
            count_reset_period: DEFAULT_COUNT_RESET_PERIOD,
            auto_snapshot_duration: DEFAULT_AUTO_SNAPSHOT_DURATION,
            exclude_agent_from_call_graph: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BtCallTiming {
    start: Option<u64>,
    end: Option<u64>,
    registration_id: Option<i64>,
}

#[derive(Debug)]
struct Capture {
    snapshot: ProcessSnapshot,
    bt_calls: BTreeMap<ThreadId, BtCallTiming>,
}

#[derive(Debug, Default)]
struct ScannerState {
    capture: Option<Capture>,
    snapshot_count: u32,
    count_period_start: u64,
    last_request_id: i64,
    request_id_period_start: u64,
}

impl ScannerState {
    /// Applies the periodic resets that are due at `now`.
    fn refresh(&mut self, now: u64, count_reset_period_ms: u64) {
        if now.saturating_sub(self.count_period_start) >= count_reset_period_ms {
            self.snapshot_count = 0;
            self.count_period_start = now;
        }
        if now.saturating_sub(self.request_id_period_start) >= REQUEST_ID_RESET_PERIOD_MS {
            self.last_request_id = 0;
            self.request_id_period_start = now;
        }
    }
}

/// Aggregates per-context timings into per-registration call info. Contexts without a
/// start or a registration id are skipped; contexts still running count until `now`.
fn bt_call_info(bt_calls: &BTreeMap<ThreadId, BtCallTiming>, now: u64) -> Vec<BtCallInfo> {
    let mut infos: Vec<BtCallInfo> = Vec::new();
    for timing in bt_calls.values() {
        let (Some(start), Some(registration_id)) = (timing.start, timing.registration_id) else {
            continue;
        };
        let taken = timing.end.unwrap_or(now).saturating_sub(start);
        match infos.iter_mut().find(|info| info.bt_id == registration_id) {
            Some(info) => {
                info.count += 1;
                info.total_time_taken_ms += taken;
            }
            None => infos.push(BtCallInfo {
                bt_id: registration_id,
                count: 1,
                total_time_taken_ms: taken,
            }),
        }
    }
    infos
}

pub struct ProcessScanner {
    settings: ScannerSettings,
    proxy: Arc<Proxy>,
    profiler: Arc<Profiler>,
    backend: Arc<dyn BackendConnector>,
    cpu_profiler: Option<Arc<dyn CpuProfiler>>,
    heap_profiler: Option<Arc<dyn HeapProfiler>>,
    state: Mutex<ScannerState>,
}

impl std::fmt::Debug for ProcessScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessScanner")
            .field("settings", &self.settings)
            .field("cpu_profiler", &self.cpu_profiler.is_some())
            .field("heap_profiler", &self.heap_profiler.is_some())
            .field("state", &self.state)
            .finish()
    }
}

/// Clears the capture and turns call-context correlation off however the capture ends,
/// including when its future is dropped.
struct CaptureGuard<'a> {
    scanner: &'a ProcessScanner,
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        self.scanner.lock().capture = None;
        self.scanner.proxy.disable_call_context();
    }
}

impl ProcessScanner {
    pub fn new(
        settings: ScannerSettings,
        proxy: Arc<Proxy>,
        profiler: Arc<Profiler>,
        backend: Arc<dyn BackendConnector>,
        cpu_profiler: Option<Arc<dyn CpuProfiler>>,
        heap_profiler: Option<Arc<dyn HeapProfiler>>,
    ) -> Self {
        let now = profiler.clock().now_millis();
        Self {
            settings,
            proxy,
            profiler,
            backend,
            cpu_profiler,
            heap_profiler,
            state: Mutex::new(ScannerState {
                count_period_start: now,
                request_id_period_start: now,
                ..Default::default()
            }),
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.lock().capture.is_some()
    }

    /// Snapshots taken in the current rate-limit period.
    pub fn snapshot_count(&self) -> u32 {
        self.lock().snapshot_count
    }

    /// Starts a snapshot of the configured duration unless one is running or the
    /// per-period limit is reached.
    pub async fn start_auto_snapshot_if_possible(&self) -> Result<ProcessSnapshot, SnapshotError> {
        let now = self.profiler.clock().now_millis();
        let guid = {
            let mut state = self.lock();
            state.refresh(now, self.count_reset_period_ms());
            if state.capture.is_some() {
                let error = SnapshotError::AlreadyInProgress;
                info!("{error}");
                return Err(error);
            }
            if state.snapshot_count >= self.settings.max_snapshots_per_period {
                let error = SnapshotError::RateLimited {
                    count: state.snapshot_count,
                    period_ms: self.count_reset_period_ms(),
                };
                info!("{error}");
                return Err(error);
            }
            self.begin_capture(&mut state, AUTO_SNAPSHOT_REQUEST_ID, now)?
        };
        self.capture(guid, self.settings.auto_snapshot_duration, true)
            .await
    }

    /// Serves a backend snapshot request. Each request id is served at most once.
    pub async fn start_manual_snapshot(
        &self,
        request: ProcessCallGraphRequest,
    ) -> Result<ProcessSnapshot, SnapshotError> {
        let now = self.profiler.clock().now_millis();
        let guid = {
            let mut state = self.lock();
            state.refresh(now, self.count_reset_period_ms());
            if request.snapshot_request_id <= state.last_request_id {
                let error = SnapshotError::DuplicateRequest(request.snapshot_request_id);
                info!("{error}");
                return Err(error);
            }
            state.last_request_id = request.snapshot_request_id;
            if state.capture.is_some() {
                let error = SnapshotError::AlreadyInProgress;
                info!("{error}");
                return Err(error);
            }
            self.begin_capture(&mut state, request.snapshot_request_id, now)?
        };
        self.capture(guid, Duration::from_secs(request.capture_time), false)
            .await
    }

    /// Records the start of a business transaction observed during a capture.
    pub fn on_transaction_started(&self, transaction: &Transaction) {
        let now = self.profiler.clock().now_millis();
        let guid = {
            let mut state = self.lock();
            let Some(capture) = state.capture.as_mut() else {
                return;
            };
            let timing = capture.bt_calls.entry(transaction.thread_id).or_default();
            timing.start = Some(now);
            timing.registration_id = transaction.registration_id;
            capture.snapshot.guid.clone()
        };
        self.profiler
            .with_transaction(transaction.thread_id, |open| {
                open.add_process_snapshot_guid(&guid)
            });
    }

    /// Records the end of a business transaction observed during a capture.
    pub fn on_transaction(&self, transaction: &Transaction) {
        let now = self.profiler.clock().now_millis();
        let mut state = self.lock();
        let Some(capture) = state.capture.as_mut() else {
            return;
        };
        let timing = capture.bt_calls.entry(transaction.thread_id).or_default();
        timing.end = Some(now);
        if timing.registration_id.is_none() {
            timing.registration_id = transaction.registration_id;
        }
    }

    fn begin_capture(
        &self,
        state: &mut ScannerState,
        request_id: i64,
        now: u64,
    ) -> Result<String, SnapshotError> {
        if self.cpu_profiler.is_none() {
            return Err(SnapshotError::Unsupported);
        }

        let guid = uuid::Uuid::new_v4().to_string();
        // Transactions already running are only timed from the capture start.
        let bt_calls = self
            .profiler
            .transactions()
            .into_iter()
            .map(|transaction| {
                (
                    transaction.thread_id,
                    BtCallTiming {
                        start: Some(now),
                        end: None,
                        registration_id: transaction.registration_id,
                    },
                )
            })
            .collect();
        state.capture = Some(Capture {
            snapshot: ProcessSnapshot {
                snapshot_request_id: request_id,
                guid: guid.clone(),
                process_id: std::process::id(),
                ..Default::default()
            },
            bt_calls,
        });
        if state.snapshot_count == 0 {
            state.count_period_start = now;
        }
        state.snapshot_count += 1;
        Ok(guid)
    }

    async fn capture(
        &self,
        guid: String,
        duration: Duration,
        auto: bool,
    ) -> Result<ProcessSnapshot, SnapshotError> {
        let _guard = CaptureGuard { scanner: self };
        let cpu_profiler = self
            .cpu_profiler
            .clone()
            .ok_or(SnapshotError::Unsupported)?;

        self.backend.start_process_snapshot();
        self.proxy.enable_call_context();
        self.profiler.process_snapshot_started(&guid);
        info!(
            "starting process snapshot {guid} for {}s",
            duration.as_secs()
        );

        let newest_thread = self.proxy.thread().next_id().saturating_sub(1);
        let heap = async {
            if auto {
                return None;
            }
            match &self.heap_profiler {
                Some(heap_profiler) if heap_profiler.is_object_tracking_supported() => Some(
                    heap_profiler
                        .track_allocations(duration.saturating_sub(Duration::from_secs(1)))
                        .await,
                ),
                _ => {
                    warn!("Heap allocation tracking is not supported.");
                    None
                }
            }
        };
        let (call_graph, allocation_graph) =
            tokio::join!(cpu_profiler.profile(duration, newest_thread), heap);
        let mut call_graph = match call_graph {
            Ok(call_graph) => call_graph,
            Err(e) => {
                warn!("process snapshot {guid} failed: {e}");
                return Err(e);
            }
        };

        let call_context = self.proxy.call_context_map();
        let options = PostProcessOptions {
            exclude_agent_frames: self.settings.exclude_agent_from_call_graph,
        };
        let now = self.profiler.clock().now_millis();
        let (mut snapshot, bt_calls) = {
            let state = self.lock();
            let capture = state
                .capture
                .as_ref()
                .ok_or_else(|| SnapshotError::Profiler("capture state lost".to_string()))?;
            (capture.snapshot.clone(), capture.bt_calls.clone())
        };

        snapshot.timestamp = Some(now);
        snapshot.bt_calls = bt_call_info(&bt_calls, now);
        post_process_call_graph(&mut call_graph, &call_context, options);
        snapshot.process_call_graph = Some(call_graph);

        match allocation_graph {
            Some(Ok(mut allocation_graph)) => {
                post_process_allocation_graph(&mut allocation_graph, &call_context, options);
                snapshot.process_allocation_graph = Some(allocation_graph);
            }
            Some(Err(e)) => warn!("Heap allocation tracking failed: {e}"),
            None => {}
        }

        debug!(
            "process snapshot {} captured {} call elements",
            snapshot.guid,
            snapshot
                .process_call_graph
                .as_ref()
                .map_or(0, |graph| graph.call_elements.len())
        );
        self.backend.send_process_snapshot(&snapshot);
        Ok(snapshot)
    }

    fn count_reset_period_ms(&self) -> u64 {
        self.settings.count_reset_period.as_millis() as u64
    }

    fn lock(&self) -> MutexGuard<'_, ScannerState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }
}
