// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use apm_agent_core::clock::Clock;
use apm_agent_core::events::{AgentEvent, EventKind};
use apm_agent_core::profiler::{ExitCall, Time, DEFAULT_TRANSACTION_TIMEOUT, SWEEP_INTERVAL};
use apm_agent_core::ErrorValue;
use duplicate::duplicate_item;

mod common;
use common::helpers::{http_call, record, test_agent, TestAgent};

#[derive(Debug, Clone, Copy)]
enum Step {
    End,
    First,
    Second,
}

struct Flight {
    transaction_time: Time,
    calls: [(Time, ExitCall); 2],
}

fn start_with_two_exit_calls(test: &TestAgent) -> Flight {
    let profiler = test.agent.profiler();
    let transaction_time = profiler.time(true);
    profiler.start_transaction(&transaction_time, None, "HTTP");

    let start_call = || {
        let time = profiler.time(false);
        let exit_call = profiler.create_exit_call(&time, http_call()).unwrap();
        (time, exit_call)
    };
    let calls = [start_call(), start_call()];
    Flight {
        transaction_time,
        calls,
    }
}

fn run(test: &TestAgent, flight: &Flight, step: Step) {
    let profiler = test.agent.profiler();
    match step {
        Step::End => {
            flight.transaction_time.done();
            profiler.end_transaction(&flight.transaction_time);
        }
        Step::First | Step::Second => {
            let (time, exit_call) = &flight.calls[matches!(step, Step::Second) as usize];
            time.done();
            profiler.add_exit_call(time, exit_call.clone(), None);
        }
    }
}

fn reported(test: &TestAgent, order: [Step; 3]) {
    let finished = record(test.agent.events(), EventKind::Transaction);
    let flight = start_with_two_exit_calls(test);

    for (position, step) in order.into_iter().enumerate() {
        test.clock.advance(10);
        run(test, &flight, step);
        let expected = usize::from(position == order.len() - 1);
        assert_eq!(
            finished.lock().unwrap().len(),
            expected,
            "after {step:?} at position {position}"
        );
    }

    // Completing anything a second time must not report again.
    for step in order {
        run(test, &flight, step);
    }
    let finished = finished.lock().unwrap();
    assert_eq!(finished.len(), 1);
    let AgentEvent::Transaction(transaction) = &finished[0] else {
        panic!("unexpected event {:?}", finished[0]);
    };
    assert!(transaction.is_finished);
    assert!(transaction.is_response_sent);
    assert_eq!(transaction.exit_calls.len(), 2);
    assert!(test.agent.profiler().is_empty());
}

#[duplicate_item(
    test_name                          order;
    [test_end_first_second]            [[Step::End, Step::First, Step::Second]];
    [test_end_second_first]            [[Step::End, Step::Second, Step::First]];
    [test_first_end_second]            [[Step::First, Step::End, Step::Second]];
    [test_second_end_first]            [[Step::Second, Step::End, Step::First]];
    [test_first_second_end]            [[Step::First, Step::Second, Step::End]];
    [test_second_first_end]            [[Step::Second, Step::First, Step::End]];
)]
#[test]
fn test_name() {
    reported(&test_agent(), order);
}

#[test]
fn test_exit_call_durations_and_sequence_numbers() {
    let test = test_agent();
    let profiler = test.agent.profiler();
    let transaction_time = profiler.time(true);
    profiler.start_transaction(&transaction_time, None, "HTTP");

    for (ms, error) in [(15, None), (40, Some(ErrorValue::new("503")))] {
        let time = profiler.time(false);
        let exit_call = profiler.create_exit_call(&time, http_call()).unwrap();
        test.clock.advance(ms);
        time.done();
        profiler.add_exit_call(&time, exit_call, error);
    }

    let stopped = test.backend.stopped_exit_calls();
    assert_eq!(stopped.len(), 2);
    assert_eq!(stopped[0].ms, Some(15));
    assert!(stopped[0].error.is_none());
    assert_eq!(stopped[1].ms, Some(40));
    assert_eq!(stopped[1].error.as_ref().unwrap().message, "503");

    let open = profiler
        .transaction(transaction_time.thread_id().unwrap())
        .unwrap();
    let sequence: Vec<_> = open
        .exit_calls
        .iter()
        .map(|call| call.sequence_info.clone().unwrap())
        .collect();
    assert_eq!(sequence, vec!["1", "2"]);
}

#[test]
fn test_exit_call_without_transaction_is_not_created() {
    let test = test_agent();
    let profiler = test.agent.profiler();
    let time = profiler.time(false);
    assert!(profiler.create_exit_call(&time, http_call()).is_none());
}

#[test]
fn test_stale_transaction_is_dropped_without_report() {
    let test = test_agent();
    let finished = record(test.agent.events(), EventKind::Transaction);
    let profiler = test.agent.profiler();
    let time = profiler.time(true);
    profiler.start_transaction(&time, None, "HTTP");

    let timeout = DEFAULT_TRANSACTION_TIMEOUT.as_millis() as u64;
    test.clock.advance(timeout);
    assert_eq!(profiler.sweep_stale(test.clock.now_millis()), 0);

    test.clock.advance(1);
    assert_eq!(profiler.sweep_stale(test.clock.now_millis()), 1);
    assert!(profiler.is_empty());

    time.done();
    profiler.end_transaction(&time);
    assert!(finished.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_runs_in_background_until_stopped() {
    let test = test_agent();
    test.agent.start(serde_json::json!({}));
    let profiler = test.agent.profiler();
    let time = profiler.time(true);
    profiler.start_transaction(&time, None, "HTTP");

    test.clock
        .advance(DEFAULT_TRANSACTION_TIMEOUT.as_millis() as u64 + 1);
    tokio::time::sleep(SWEEP_INTERVAL + Duration::from_millis(1)).await;
    assert!(profiler.is_empty());

    test.agent.stop().await;
}
