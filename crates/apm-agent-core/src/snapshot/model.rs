// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process snapshot payloads as handed to the backend connector.
//!
//! Call graphs travel as flat lists: each element is followed, level by level, by its
//! `num_children` children.

use serde::{Deserialize, Serialize};

/// One frame of a sampled CPU call graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallElement {
    pub klass: String,
    pub method: String,
    pub file_name: String,
    pub line_number: i64,
    pub num_children: usize,
    /// Raw sampler hits on this frame. Replaced by `time_taken` during post-processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_taken: Option<u64>,
    #[serde(
        rename = "procCallElemBTData",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub proc_call_elem_bt_data: Vec<CallBtData>,
}

/// Share of a call element attributed to one business transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallBtData {
    #[serde(rename = "btID")]
    pub bt_id: i64,
    #[serde(rename = "btSnapGUID", default, skip_serializing_if = "Option::is_none")]
    pub bt_snap_guid: Option<String>,
    pub total_time_taken: u64,
    pub count: u64,
}

/// One frame of a heap allocation graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationElement {
    pub klass: String,
    pub method: String,
    pub file_name: String,
    pub line_number: i64,
    pub num_children: usize,
    pub size: u64,
    pub count: u64,
    #[serde(
        rename = "procAllocationElemBTData",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub proc_allocation_elem_bt_data: Vec<AllocationBtData>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationBtData {
    #[serde(rename = "btID")]
    pub bt_id: i64,
    #[serde(rename = "btSnapGUID", default, skip_serializing_if = "Option::is_none")]
    pub bt_snap_guid: Option<String>,
    pub total_size: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessCallGraph {
    pub call_elements: Vec<CallElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_of_root_elements: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessAllocationGraph {
    pub allocation_elements: Vec<AllocationElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_of_root_elements: Option<usize>,
}

/// Business transaction calls observed while a snapshot was captured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BtCallInfo {
    #[serde(rename = "btID")]
    pub bt_id: i64,
    pub count: u64,
    #[serde(rename = "totalTimeTakenMS")]
    pub total_time_taken_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    /// `-1` for snapshots the agent started on its own.
    #[serde(rename = "snapshotRequestID")]
    pub snapshot_request_id: i64,
    pub guid: String,
    #[serde(rename = "processID")]
    pub process_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_call_graph: Option<ProcessCallGraph>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_allocation_graph: Option<ProcessAllocationGraph>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bt_calls: Vec<BtCallInfo>,
}

/// Backend request for a manual snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessCallGraphRequest {
    #[serde(rename = "snapshotRequestID")]
    pub snapshot_request_id: i64,
    /// Capture duration in seconds.
    pub capture_time: u64,
}
