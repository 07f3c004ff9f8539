// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parsed view of an incoming correlation header.
//!
//! Encoding and decoding the wire format belongs to the backend connector; the profiler
//! only reads sub-headers when it builds exit-call sequence info.

use std::collections::BTreeMap;

pub const HEADER_NAME: &str = "singularityheader";
pub const ACCOUNT_GUID: &str = "acctguid";
pub const CONTROLLER_GUID: &str = "ctrlguid";
pub const APP_ID: &str = "appId";
pub const BT_ID: &str = "btid";
pub const BT_NAME: &str = "btname";
pub const ENTRY_POINT_TYPE: &str = "bttype";
pub const EXIT_POINT_GUID: &str = "exitguid";
pub const UNRESOLVED_EXIT_ID: &str = "unresolvedexitid";
pub const COMPONENT_ID_FROM: &str = "cidfrom";
pub const COMPONENT_ID_TO: &str = "cidto";
pub const SNAPSHOT_ENABLE: &str = "snapenable";
pub const REQUEST_GUID: &str = "guid";
pub const DONOTRESOLVE: &str = "donotresolve";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationHeader {
    sub_headers: BTreeMap<String, String>,
    pub cross_app_correlation: bool,
}

impl CorrelationHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sub_header(&self, key: &str) -> Option<&str> {
        self.sub_headers.get(key).map(String::as_str)
    }

    pub fn set_sub_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.sub_headers.insert(key.into(), value.into());
    }

    /// Sequence info inherited from the caller, if the header carries one.
    pub fn incoming_sequence_info(&self) -> Option<&str> {
        self.sub_header(EXIT_POINT_GUID).filter(|s| !s.is_empty())
    }
}
