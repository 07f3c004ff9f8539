// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Core of an in-process APM agent for a single-threaded, cooperatively scheduled runtime.
//!
//! The crate correlates intercepted calls into business transactions that may span
//! asynchronous continuations, and post-processes sampled call graphs so that every frame
//! can be attributed to the business transactions that executed it.
//!
//! # Layout
//!
//! - [`thread`] / [`context`]: logical execution contexts ("threads") and their optional
//!   propagation across `.await` points.
//! - [`proxy`]: the interception engine (`before` / `after` / `around` / `callback` /
//!   `getter`) operating on [`target::Interceptable`] adapters.
//! - [`profiler`]: the transaction and exit-call state machine.
//! - [`snapshot`]: process snapshot capture and the call-graph post-processing pipeline.
//! - [`agent`]: the coordinator that owns all of the above and wires their events.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod backend;
pub mod clock;
pub mod config;
pub mod context;
pub mod correlation;
pub mod error;
pub mod events;
pub mod logging;
pub mod profiler;
pub mod proxy;
pub mod snapshot;
pub mod target;
pub mod thread;
pub mod value;

pub use agent::{Agent, Collaborators};
pub use thread::ThreadId;
pub use value::{Args, CallResult, ErrorValue, Function, Promise, Value};
