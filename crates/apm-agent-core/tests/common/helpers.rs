// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent fixtures and event recorders

use std::sync::{Arc, Mutex};

use apm_agent_core::backend::InMemoryConnector;
use apm_agent_core::clock::ManualClock;
use apm_agent_core::config::Config;
use apm_agent_core::events::{AgentEvent, EventBus, EventKind};
use apm_agent_core::profiler::ExitCallInfo;
use apm_agent_core::snapshot::CpuProfiler;
use apm_agent_core::target::Target;
use apm_agent_core::{Agent, Collaborators, Value};

pub const START_MILLIS: u64 = 1_700_000_000_000;

pub struct TestAgent {
    pub agent: Agent,
    pub clock: Arc<ManualClock>,
    pub backend: Arc<InMemoryConnector>,
}

pub fn test_agent() -> TestAgent {
    test_agent_with(Config::default(), None)
}

pub fn test_agent_with(config: Config, cpu_profiler: Option<Arc<dyn CpuProfiler>>) -> TestAgent {
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let backend = Arc::new(InMemoryConnector::new());
    let agent = Agent::new(
        config,
        Collaborators {
            backend: backend.clone(),
            clock: clock.clone(),
            cpu_profiler,
            heap_profiler: None,
        },
    );
    TestAgent {
        agent,
        clock,
        backend,
    }
}

/// Collects every event of `kind` emitted on `events`.
pub fn record(events: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<AgentEvent>>> {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&sink);
    events.on(kind, move |event| {
        recorder.lock().unwrap().push(event.clone());
        Ok(())
    });
    sink
}

pub fn http_call() -> ExitCallInfo {
    ExitCallInfo {
        exit_type: "EXIT_HTTP".to_string(),
        backend_name: Some("payments".to_string()),
        ..Default::default()
    }
}

/// A target with one method of each arity from 0 to `max_arity`, named `m<arity>`, each
/// returning the number of arguments it received.
pub fn target_with_arities(max_arity: usize) -> Target {
    (0..=max_arity).fold(Target::new("wide"), |target, arity| {
        target.define(&format!("m{arity}"), arity, |_, args| {
            Ok(Value::from(args.len() as f64))
        })
    })
}
