// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction and exit-call state machine.
//!
//! A transaction is keyed by the logical context that started it and moves through
//! `OPEN -> RESPONSE_SENT -> FINISHED`: it is finished, reported and removed once its
//! response was sent and every exit call the backend started for it has completed,
//! whichever of those happens last. Transactions nobody touches for the configured timeout
//! are dropped by the sweeper without being reported.

pub mod api;
mod time;
mod transaction;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendConnector;
use crate::clock::Clock;
use crate::events::{AgentEvent, EventBus};
use crate::thread::{ThreadId, ThreadTracker};
use crate::value::{ErrorValue, Value};

pub use self::time::Time;
pub use self::transaction::{
    ApiHooks, BeforeExitCallHook, ExitCall, ExitCallCompletedHook, ExitCallInfo, RequestData,
    Transaction,
};

pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(300);

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

const MAX_SANITIZED_ARGS: usize = 50;

/// Frames from the agent itself, hidden from captured stack traces.
const AGENT_FRAME_PATTERN: &str = r"apm[-_]agent";

fn stack_trace_filter() -> &'static Regex {
    static FILTER: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    FILTER.get_or_init(|| Regex::new(AGENT_FRAME_PATTERN).expect("failed creating regex"))
}

/// Runs a user hook on a copy of an exit call. `None` when the hook panicked.
fn run_exit_call_hook(
    what: &str,
    hook: &(dyn Fn(ExitCall) -> Option<ExitCall> + Send + Sync),
    exit_call: &ExitCall,
) -> Option<Option<ExitCall>> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| hook(exit_call.clone()))) {
        Ok(result) => Some(result),
        Err(_) => {
            warn!("{what} hook panicked, keeping the exit call unchanged");
            None
        }
    }
}

pub struct Profiler {
    thread: Arc<ThreadTracker>,
    events: Arc<EventBus>,
    backend: Arc<dyn BackendConnector>,
    clock: Arc<dyn Clock>,
    transactions: Mutex<HashMap<ThreadId, Transaction>>,
    transaction_timeout: Duration,
    next_time_id: AtomicU64,
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler")
            .field("transactions", &self.len())
            .field("transaction_timeout", &self.transaction_timeout)
            .finish()
    }
}

impl Profiler {
    pub fn new(
        thread: Arc<ThreadTracker>,
        events: Arc<EventBus>,
        backend: Arc<dyn BackendConnector>,
        clock: Arc<dyn Clock>,
        transaction_timeout: Duration,
    ) -> Self {
        Self {
            thread,
            events,
            backend,
            clock,
            transactions: Mutex::new(HashMap::new()),
            transaction_timeout,
            next_time_id: AtomicU64::new(1),
        }
    }

    pub fn thread(&self) -> &Arc<ThreadTracker> {
        &self.thread
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Starts a timer. Transaction timers enter a new logical context; all others are
    /// bound to the current one.
    pub fn time(&self, is_transaction: bool) -> Time {
        let thread_id = if is_transaction {
            Some(self.thread.enter())
        } else {
            self.thread.current()
        };
        self.start_time(thread_id, is_transaction)
    }

    /// Starts a non-transaction timer bound to `thread_id`.
    pub fn time_for(&self, thread_id: Option<ThreadId>) -> Time {
        self.start_time(thread_id, false)
    }

    fn start_time(&self, thread_id: Option<ThreadId>, is_transaction: bool) -> Time {
        let id = self.next_time_id.fetch_add(1, Ordering::SeqCst);
        Time::start(id, thread_id, is_transaction, Arc::clone(&self.clock))
    }

    /// Opens a transaction on the timer's logical context and announces it.
    pub fn start_transaction(
        &self,
        time: &Time,
        request: Option<RequestData>,
        entry_type: &str,
    ) -> Transaction {
        let thread_id = match time.thread_id() {
            Some(thread_id) => thread_id,
            None => self.thread.enter(),
        };
        let transaction = Transaction {
            id: time.id(),
            ts: time.begin(),
            touched: time.begin(),
            thread_id,
            entry_type: entry_type.to_string(),
            request,
            time: Some(time.clone()),
            ..Default::default()
        };
        self.lock().insert(thread_id, transaction.clone());
        debug!("transaction {} started on thread {thread_id}", transaction.id);

        self.events
            .emit(&AgentEvent::TransactionStarted(transaction.clone()));
        transaction
    }

    /// Copy of the open transaction on `thread_id`.
    pub fn transaction(&self, thread_id: ThreadId) -> Option<Transaction> {
        self.lock().get(&thread_id).cloned()
    }

    /// Runs `f` on the open transaction of `thread_id`. Never call back into the profiler
    /// from `f`.
    pub fn with_transaction<R>(
        &self,
        thread_id: ThreadId,
        f: impl FnOnce(&mut Transaction) -> R,
    ) -> Option<R> {
        self.lock().get_mut(&thread_id).map(f)
    }

    /// Copies of all open transactions.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.lock().values().cloned().collect()
    }

    pub fn touch(&self, thread_id: ThreadId) {
        let now = self.clock.now_millis();
        self.with_transaction(thread_id, |transaction| transaction.touched = now);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Creates an exit call for the transaction on the timer's context.
    ///
    /// Returns `None` when there is no open transaction, when the transaction is ignored,
    /// or when its `before_exit_call` hook cancels the call.
    pub fn create_exit_call(&self, time: &Time, info: ExitCallInfo) -> Option<ExitCall> {
        self.create_exit_call_with(time, info, true)
    }

    /// Same as [`Profiler::create_exit_call`] without running the `before_exit_call` hook.
    pub(crate) fn create_exit_call_unhooked(
        &self,
        time: &Time,
        info: ExitCallInfo,
    ) -> Option<ExitCall> {
        self.create_exit_call_with(time, info, false)
    }

    fn create_exit_call_with(
        &self,
        time: &Time,
        info: ExitCallInfo,
        run_hook: bool,
    ) -> Option<ExitCall> {
        let thread_id = time.thread_id()?;
        let transaction = self.transaction(thread_id)?;
        if transaction.ignore {
            return None;
        }

        let mut exit_call = ExitCall::from_info(time, info);
        if let Some(hook) = transaction.api.before_exit_call.as_deref().filter(|_| run_hook) {
            match run_exit_call_hook("before_exit_call", hook, &exit_call) {
                Some(Some(rewritten)) => exit_call = rewritten,
                Some(None) => {
                    debug!("exit call cancelled by before_exit_call hook");
                    return None;
                }
                None => {}
            }
        }

        self.backend.start_exit_call(&transaction, &mut exit_call);
        if exit_call.correlation_header.is_none() {
            exit_call.correlation_header = self.backend.correlation_header(&exit_call);
        }

        let transaction = self.with_transaction(thread_id, |transaction| {
            if let Some(guid) = &exit_call.guid {
                transaction.started_exit_calls.push(guid.clone());
            }
            transaction.clone()
        })?;

        self.events.emit(&AgentEvent::ExitCallStarted {
            transaction,
            exit_call: exit_call.clone(),
        });
        Some(exit_call)
    }

    /// Records a completed exit call and finishes its transaction if that was the last
    /// thing it was waiting for. Completing the same call twice has no effect.
    pub fn add_exit_call(&self, time: &Time, mut exit_call: ExitCall, error: Option<ErrorValue>) {
        time.done();
        if !time.claim() {
            debug!("exit call {:?} already completed", exit_call.guid);
            return;
        }
        exit_call.ms = time.ms();
        exit_call.error = error;
        self.backend.stop_exit_call(&exit_call);

        let Some(thread_id) = exit_call.thread_id else {
            return;
        };

        let completed_hook = {
            let mut transactions = self.lock();
            let Some(transaction) = transactions.get_mut(&thread_id) else {
                return;
            };
            if transaction.ignore {
                return;
            }
            let already_completed = exit_call.guid.is_some()
                && transaction
                    .exit_calls
                    .iter()
                    .any(|completed| completed.guid == exit_call.guid);
            if already_completed {
                debug!("exit call {:?} already completed", exit_call.guid);
                return;
            }
            if exit_call.sequence_info.is_none() {
                exit_call.sequence_info = Some(transaction.next_sequence_info());
            }
            transaction.api.exit_call_completed.clone()
        };

        if let Some(hook) = completed_hook {
            if let Some(Some(replaced)) =
                run_exit_call_hook("exit_call_completed", hook.as_ref(), &exit_call)
            {
                exit_call = replaced;
            }
        }

        let now = self.clock.now_millis();
        let (transaction, finished) = {
            let mut transactions = self.lock();
            let Some(transaction) = transactions.get_mut(&thread_id) else {
                return;
            };
            transaction.touched = now;
            transaction.exit_calls.push(exit_call.clone());
            let snapshot = transaction.clone();
            (snapshot, Self::try_finish(&mut transactions, thread_id))
        };

        self.events.emit(&AgentEvent::ExitCallStopped {
            transaction,
            exit_call,
        });
        if let Some(finished) = finished {
            self.report(finished);
        }
    }

    /// Marks the response of the timer's transaction as sent. The transaction finishes now
    /// if none of its exit calls are outstanding, otherwise when the last one completes.
    pub fn end_transaction(&self, time: &Time) {
        let Some(thread_id) = time.thread_id() else {
            return;
        };
        let now = self.clock.now_millis();
        let finished = {
            let mut transactions = self.lock();
            let Some(transaction) = transactions.get_mut(&thread_id) else {
                return;
            };
            if transaction.is_response_sent {
                return;
            }
            transaction.is_response_sent = true;
            transaction.ms = time.ms();
            transaction.touched = now;
            Self::try_finish(&mut transactions, thread_id)
        };
        if let Some(finished) = finished {
            self.report(finished);
        }
    }

    fn try_finish(
        transactions: &mut HashMap<ThreadId, Transaction>,
        thread_id: ThreadId,
    ) -> Option<Transaction> {
        let ready = transactions.get(&thread_id).is_some_and(|transaction| {
            !transaction.is_finished
                && transaction.is_response_sent
                && transaction.exit_calls_settled()
        });
        if !ready {
            return None;
        }
        let mut transaction = transactions.remove(&thread_id)?;
        transaction.is_finished = true;
        Some(transaction)
    }

    fn report(&self, transaction: Transaction) {
        debug!(
            "transaction {} finished with {} exit calls",
            transaction.id,
            transaction.exit_calls.len()
        );
        self.events.emit(&AgentEvent::Transaction(transaction));
    }

    /// Forgets the transaction the backend discarded, without reporting it.
    pub fn transaction_dropped(&self, guid: &str) -> bool {
        let mut transactions = self.lock();
        let thread_id = transactions
            .iter()
            .find(|(_, transaction)| transaction.guid.as_deref() == Some(guid))
            .map(|(thread_id, _)| *thread_id);
        match thread_id.and_then(|thread_id| transactions.remove(&thread_id)) {
            Some(transaction) => {
                info!("transaction {} dropped", transaction.id);
                true
            }
            None => false,
        }
    }

    /// Drops transactions not touched within the timeout. Returns how many were dropped.
    pub fn sweep_stale(&self, now: u64) -> usize {
        let timeout = self.transaction_timeout.as_millis() as u64;
        let mut transactions = self.lock();
        let before = transactions.len();
        transactions.retain(|_, transaction| {
            let stale = transaction.touched + timeout < now;
            if stale {
                info!("transaction {} dropped", transaction.id);
            }
            !stale
        });
        before - transactions.len()
    }

    /// Runs [`Profiler::sweep_stale`] every [`SWEEP_INTERVAL`] until `cancel_token` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let profiler = Arc::clone(self);
        tokio::spawn(async move {
            let mut sweep_interval = interval(SWEEP_INTERVAL);
            sweep_interval.tick().await; // discard first tick

            loop {
                tokio::select! {
                    _ = sweep_interval.tick() => {
                        let dropped = profiler.sweep_stale(profiler.clock.now_millis());
                        if dropped > 0 {
                            debug!("swept {dropped} stale transactions");
                        }
                    }
                    _ = cancel_token.cancelled() => {
                        debug!("transaction sweeper stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Tags every open transaction with the guid of a process snapshot being captured.
    pub fn process_snapshot_started(&self, guid: &str) {
        for transaction in self.lock().values_mut() {
            transaction.add_process_snapshot_guid(guid);
        }
    }

    /// Stack trace for an exit call that has snapshots enabled, without agent frames.
    pub fn stack_trace(&self, exit_call: Option<&ExitCall>) -> Option<Vec<String>> {
        if !exit_call.is_some_and(|exit_call| exit_call.is_snapshot_enabled) {
            return None;
        }
        let backtrace = std::backtrace::Backtrace::force_capture().to_string();
        self.format_stack_trace(&backtrace)
    }

    /// Splits a rendered stack into frames, dropping the header line and agent frames.
    pub fn format_stack_trace(&self, stack: &str) -> Option<Vec<String>> {
        if stack.trim().is_empty() {
            return None;
        }
        let filter = stack_trace_filter();
        Some(
            stack
                .lines()
                .skip(1)
                .filter(|line| !filter.is_match(line))
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect(),
        )
    }

    /// Renders call arguments for reporting. At most the first 50 are kept.
    pub fn sanitize(&self, args: &[Value]) -> Option<Vec<String>> {
        if args.is_empty() {
            return None;
        }
        Some(
            args.iter()
                .take(MAX_SANITIZED_ARGS)
                .map(|arg| match arg {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    Value::Undefined => "[undefined]".to_string(),
                    Value::Null => "[null]".to_string(),
                    Value::Function(_) => "[function]".to_string(),
                    Value::Json(_)
                    | Value::Error(_)
                    | Value::Object(_)
                    | Value::Promise(_) => "[object]".to_string(),
                })
                .collect(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, Transaction>> {
        #[allow(clippy::expect_used)]
        self.transactions.lock().expect("lock poisoned")
    }
}
