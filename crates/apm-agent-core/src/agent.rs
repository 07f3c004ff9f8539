// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The coordinator that owns every agent component and wires their events together.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{BackendConnector, NoopConnector};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::context::select_store;
use crate::events::{AgentEvent, EventBus, EventKind};
use crate::logging;
use crate::profiler::Profiler;
use crate::proxy::Proxy;
use crate::snapshot::{CpuProfiler, HeapProfiler, ProcessScanner};
use crate::thread::ThreadTracker;

/// Implementations the agent delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn BackendConnector>,
    pub clock: Arc<dyn Clock>,
    /// Without a CPU profiler, process snapshots are reported as unsupported.
    pub cpu_profiler: Option<Arc<dyn CpuProfiler>>,
    pub heap_profiler: Option<Arc<dyn HeapProfiler>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            backend: Arc::new(NoopConnector),
            clock: Arc::new(SystemClock),
            cpu_profiler: None,
            heap_profiler: None,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("clock", &self.clock)
            .field("cpu_profiler", &self.cpu_profiler.is_some())
            .field("heap_profiler", &self.heap_profiler.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Agent {
    config: Config,
    thread: Arc<ThreadTracker>,
    events: Arc<EventBus>,
    proxy: Arc<Proxy>,
    profiler: Arc<Profiler>,
    scanner: Arc<ProcessScanner>,
    cancel_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let thread = Arc::new(ThreadTracker::new(select_store(config.cls_disabled)));
        let events = Arc::new(EventBus::new());
        let proxy = Arc::new(Proxy::new(Arc::clone(&thread)));
        let profiler = Arc::new(Profiler::new(
            Arc::clone(&thread),
            Arc::clone(&events),
            Arc::clone(&collaborators.backend),
            collaborators.clock,
            config.transaction_timeout,
        ));
        let scanner = Arc::new(ProcessScanner::new(
            config.scanner_settings(),
            Arc::clone(&proxy),
            Arc::clone(&profiler),
            collaborators.backend,
            collaborators.cpu_profiler,
            collaborators.heap_profiler,
        ));

        wire_events(&events, &proxy, &profiler, &scanner);

        Self {
            config,
            thread,
            events,
            proxy,
            profiler,
            scanner,
            cancel_token: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Installs the global `tracing` subscriber at the configured log level.
    pub fn init_logging(&self) -> Result<(), anyhow::Error> {
        logging::init(&self.config.log_level)
    }

    /// Starts the stale-transaction sweeper and announces the agent. Must be called from
    /// within a tokio runtime.
    ///
    /// Object metadata gains `nodeName` and, when tags are configured, `tags`. Keys the
    /// caller already set are left alone.
    pub fn start(&self, mut metadata: serde_json::Value) {
        {
            #[allow(clippy::expect_used)]
            let mut sweeper = self.sweeper.lock().expect("lock poisoned");
            if sweeper.is_some() {
                debug!("agent already started");
                return;
            }
            *sweeper = Some(self.profiler.spawn_sweeper(self.cancel_token.child_token()));
        }

        let tags = &self.config.tags;
        if let Some(fields) = metadata.as_object_mut() {
            fields
                .entry("nodeName")
                .or_insert_with(|| self.config.node_name.clone().into());
            if !tags.tags().is_empty() {
                fields.entry("tags").or_insert_with(|| {
                    tags.tags()
                        .iter()
                        .map(|(key, value)| (key.clone(), value.clone().into()))
                        .collect::<serde_json::Map<_, _>>()
                        .into()
                });
            }
        }

        info!(
            "APM agent started on node {} with tags [{}] (context propagation {})",
            self.config.node_name,
            tags.tags_string().unwrap_or_default(),
            if self.thread.store().is_enabled() {
                "enabled"
            } else {
                "disabled"
            }
        );
        self.events.emit(&AgentEvent::AgentStarted { metadata });
    }

    /// Stops background work and waits for it to finish.
    pub async fn stop(&self) {
        self.cancel_token.cancel();
        #[allow(clippy::expect_used)]
        let sweeper = self.sweeper.lock().expect("lock poisoned").take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        info!("APM agent stopped");
    }

    /// Runs `fut` in a fresh context-propagation scope.
    pub fn scope<'a>(&self, fut: BoxFuture<'a, ()>) -> BoxFuture<'a, ()> {
        self.thread.store().scope(fut)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn thread(&self) -> &Arc<ThreadTracker> {
        &self.thread
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub fn profiler(&self) -> &Arc<Profiler> {
        &self.profiler
    }

    pub fn scanner(&self) -> &Arc<ProcessScanner> {
        &self.scanner
    }
}

/// Listeners only hold weak references, so the bus never keeps a component alive.
fn wire_events(
    events: &EventBus,
    proxy: &Arc<Proxy>,
    profiler: &Arc<Profiler>,
    scanner: &Arc<ProcessScanner>,
) {
    let weak_proxy = Arc::downgrade(proxy);
    events.on(EventKind::BtDetails, move |event| {
        if let (Some(proxy), AgentEvent::BtDetails { details, thread_id }) =
            (weak_proxy.upgrade(), event)
        {
            proxy.on_bt_details(details, *thread_id);
        }
        Ok(())
    });

    let weak_proxy = Arc::downgrade(proxy);
    events.on(EventKind::UpdateCallContextMap, move |event| {
        if let (
            Some(proxy),
            AgentEvent::UpdateCallContextMap {
                thread_id,
                bt_id,
                guid,
            },
        ) = (weak_proxy.upgrade(), event)
        {
            proxy.update_call_context_map(*thread_id, *bt_id, guid.clone());
        }
        Ok(())
    });

    let weak_profiler = Arc::downgrade(profiler);
    events.on(EventKind::TransactionDropped, move |event| {
        if let (Some(profiler), AgentEvent::TransactionDropped { guid }) =
            (weak_profiler.upgrade(), event)
        {
            profiler.transaction_dropped(guid);
        }
        Ok(())
    });

    let weak_scanner = Arc::downgrade(scanner);
    events.on(EventKind::TransactionStarted, move |event| {
        if let (Some(scanner), AgentEvent::TransactionStarted(transaction)) =
            (weak_scanner.upgrade(), event)
        {
            scanner.on_transaction_started(transaction);
        }
        Ok(())
    });

    let weak_scanner = Arc::downgrade(scanner);
    events.on(EventKind::Transaction, move |event| {
        if let (Some(scanner), AgentEvent::Transaction(transaction)) =
            (weak_scanner.upgrade(), event)
        {
            scanner.on_transaction(transaction);
        }
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tracing_test::traced_test;

    use super::*;
    use crate::config::Tags;
    use crate::events::BtDetails;
    use crate::value::{Function, Value};

    fn agent() -> Agent {
        Agent::new(Config::default(), Collaborators::default())
    }

    fn announced(agent: &Agent, metadata: serde_json::Value) -> serde_json::Value {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        agent.events().on(EventKind::AgentStarted, move |event| {
            if let AgentEvent::AgentStarted { metadata } = event {
                *sink.lock().unwrap() = Some(metadata.clone());
            }
            Ok(())
        });
        agent.start(metadata);
        let metadata = seen.lock().unwrap().take();
        metadata.unwrap()
    }

    #[test]
    fn test_bt_details_reach_call_context_map() {
        let agent = agent();
        agent.proxy().enable_call_context();
        let thread_id = agent.thread().enter();
        let noop = Function::new("noop", 0, |_, _| Ok(Value::Undefined));
        let marker = agent.proxy().get_thread_proxy(&noop).unwrap();

        agent.events().emit(&AgentEvent::BtDetails {
            details: BtDetails {
                bt_id: Some(9),
                snapshot_guid: Some("snap".to_string()),
            },
            thread_id,
        });

        let map = agent.proxy().call_context_map();
        let entry = map.get(marker.name()).unwrap();
        assert_eq!(entry.bt_id, 9);
        assert_eq!(entry.snapshot_guid.as_deref(), Some("snap"));
    }

    #[test]
    fn test_dropped_transaction_is_forgotten() {
        let agent = agent();
        let time = agent.profiler().time(true);
        let transaction = agent.profiler().start_transaction(&time, None, "HTTP");
        agent
            .profiler()
            .with_transaction(transaction.thread_id, |open| {
                open.guid = Some("abc".to_string())
            });

        agent.events().emit(&AgentEvent::TransactionDropped {
            guid: "abc".to_string(),
        });
        assert!(agent.profiler().is_empty());
    }

    #[tokio::test]
    async fn test_start_announces_and_stop_joins_sweeper() {
        let agent = agent();
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        agent.events().on(EventKind::AgentStarted, move |event| {
            if let AgentEvent::AgentStarted { metadata } = event {
                assert_eq!(metadata["version"], "1.0");
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        agent.start(serde_json::json!({"version": "1.0"}));
        agent.start(serde_json::json!({"version": "1.0"}));
        assert_eq!(started.load(Ordering::SeqCst), 1);

        agent.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_start_announces_node_and_tags() {
        let agent = Agent::new(
            Config {
                node_name: "checkout-1".to_string(),
                tags: Tags::from_env_string("env:prod,team:payments"),
                ..Config::default()
            },
            Collaborators::default(),
        );

        let metadata = announced(&agent, serde_json::json!({"version": "1.0"}));
        assert_eq!(
            metadata,
            serde_json::json!({
                "version": "1.0",
                "nodeName": "checkout-1",
                "tags": {"env": "prod", "team": "payments"},
            })
        );
        assert!(logs_contain("with tags [env:prod,team:payments]"));
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_start_keeps_caller_metadata() {
        let named = agent();
        let metadata = announced(&named, serde_json::json!({"nodeName": "from-host"}));
        assert_eq!(metadata, serde_json::json!({"nodeName": "from-host"}));
        named.stop().await;

        let bare = agent();
        assert_eq!(announced(&bare, serde_json::Value::Null), serde_json::Value::Null);
        bare.stop().await;
    }

    #[test]
    fn test_init_logging_rejects_bad_level() {
        let agent = Agent::new(
            Config {
                log_level: "apm=verbose".to_string(),
                ..Config::default()
            },
            Collaborators::default(),
        );
        let err = agent.init_logging().unwrap_err();
        assert!(err
            .to_string()
            .starts_with("could not parse log level in configuration"));
    }
}
