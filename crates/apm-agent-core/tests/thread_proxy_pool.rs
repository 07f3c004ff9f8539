// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use apm_agent_core::events::AgentEvent;
use apm_agent_core::proxy::thread_proxy::{proxy_name, THREAD_PROXY_POOL_SIZE};
use apm_agent_core::proxy::CallbackHooks;
use apm_agent_core::{Function, Value};

mod common;
use common::helpers::test_agent;

fn wrap_callback(agent: &apm_agent_core::Agent) -> Function {
    let mut args = vec![Value::Function(Function::new("cb", 1, |_, _| {
        Ok(Value::Undefined)
    }))];
    assert!(agent.proxy().callback(&mut args, 0, CallbackHooks::new()));
    args[0].as_function().unwrap().clone()
}

#[test]
fn test_pool_is_exhausted_after_250_contexts() {
    let agent = test_agent().agent;
    agent.proxy().enable_call_context();

    for slot in 0..THREAD_PROXY_POOL_SIZE {
        agent.thread().enter();
        assert_eq!(wrap_callback(&agent).name(), proxy_name(slot));
    }

    agent.thread().enter();
    let overflow = wrap_callback(&agent);
    assert_eq!(overflow.name(), "apm_proxy");
    assert_eq!(overflow.arity(), 1);
    overflow.call(&Value::Undefined, vec![]).unwrap();
}

#[test]
fn test_same_context_reuses_its_slot() {
    let agent = test_agent().agent;
    agent.proxy().enable_call_context();

    let first = agent.thread().enter();
    assert_eq!(wrap_callback(&agent).name(), "apm_proxy_0");
    agent.thread().enter();
    assert_eq!(wrap_callback(&agent).name(), "apm_proxy_1");

    agent.thread().resume(Some(first));
    assert_eq!(wrap_callback(&agent).name(), "apm_proxy_0");
}

#[test]
fn test_disable_resets_pool_and_map() {
    let agent = test_agent().agent;
    agent.proxy().enable_call_context();
    let thread_id = agent.thread().enter();
    wrap_callback(&agent);
    agent.events().emit(&AgentEvent::UpdateCallContextMap {
        thread_id,
        bt_id: 5,
        guid: None,
    });
    assert_eq!(agent.proxy().call_context_map().len(), 1);

    agent.proxy().disable_call_context();
    assert!(agent.proxy().call_context_map().is_empty());
    assert_eq!(wrap_callback(&agent).name(), "apm_proxy");

    agent.proxy().enable_call_context();
    agent.thread().enter();
    assert_eq!(wrap_callback(&agent).name(), "apm_proxy_0");
}

#[test]
fn test_updates_ignore_unassigned_contexts_and_invalid_ids() {
    let agent = test_agent().agent;
    agent.proxy().enable_call_context();
    let thread_id = agent.thread().enter();

    agent.proxy().update_call_context_map(thread_id, 7, None);
    assert!(agent.proxy().call_context_map().is_empty());

    wrap_callback(&agent);
    agent.proxy().update_call_context_map(thread_id, 0, None);
    assert!(agent.proxy().call_context_map().is_empty());

    agent
        .proxy()
        .update_call_context_map(thread_id, 7, Some("snap".to_string()));
    let map = agent.proxy().call_context_map();
    assert_eq!(map["apm_proxy_0"].bt_id, 7);
    assert_eq!(map["apm_proxy_0"].snapshot_guid.as_deref(), Some("snap"));
}
