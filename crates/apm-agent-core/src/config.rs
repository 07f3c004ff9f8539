// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::profiler::DEFAULT_TRANSACTION_TIMEOUT;
use crate::snapshot::{
    ScannerSettings, DEFAULT_AUTO_SNAPSHOT_DURATION, DEFAULT_COUNT_RESET_PERIOD,
    DEFAULT_MAX_SNAPSHOTS_PER_PERIOD,
};

/// Auto snapshots must be shorter than this.
const MAX_AUTO_SNAPSHOT_DURATION_SECS: u64 = 300;

const DEFAULT_NODE_NAME: &str = "node";

#[derive(Debug)]
pub struct Tags {
    tags: HashMap<String, String>,
    tags_string: OnceLock<String>,
}

impl Tags {
    pub fn from_env_string(env_tags: &str) -> Self {
        let mut tags = HashMap::new();

        // Space-separated key:value pairs, comma-separated accepted too.
        let normalized = env_tags.replace(',', " ");

        for kv in normalized.split_whitespace() {
            let parts = kv.split(':').collect::<Vec<&str>>();
            if parts.len() == 2 {
                tags.insert(parts[0].to_string(), parts[1].to_string());
            }
        }
        Self {
            tags,
            tags_string: OnceLock::new(),
        }
    }

    pub fn new() -> Self {
        Self {
            tags: HashMap::new(),
            tags_string: OnceLock::new(),
        }
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    /// Sorted `key:value` pairs joined by commas, or `None` when there are no tags.
    pub fn tags_string(&self) -> Option<&str> {
        if self.tags.is_empty() {
            return None;
        }
        Some(self.tags_string.get_or_init(|| {
            let mut kvs = self
                .tags
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect::<Vec<String>>();
            kvs.sort();
            kvs.join(",")
        }))
    }
}

impl Default for Tags {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Config {
    pub log_level: String,
    /// Run without task-local context propagation.
    pub cls_disabled: bool,
    pub exclude_agent_from_call_graph: bool,
    pub max_process_snapshots_per_period: u32,
    pub process_snapshot_count_reset_period: Duration,
    pub auto_snapshot_duration: Duration,
    pub transaction_timeout: Duration,
    pub node_name: String,
    pub tags: Tags,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            cls_disabled: false,
            exclude_agent_from_call_graph: false,
            max_process_snapshots_per_period: DEFAULT_MAX_SNAPSHOTS_PER_PERIOD,
            process_snapshot_count_reset_period: DEFAULT_COUNT_RESET_PERIOD,
            auto_snapshot_duration: DEFAULT_AUTO_SNAPSHOT_DURATION,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            node_name: DEFAULT_NODE_NAME.to_string(),
            tags: Tags::new(),
        }
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|val| val.to_lowercase() == "true")
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

impl Config {
    pub fn new() -> Result<Config, anyhow::Error> {
        let log_level = env::var("APM_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());
        EnvFilter::try_new(&log_level)
            .map_err(|err| anyhow::anyhow!("Invalid APM_LOG_LEVEL '{log_level}': {err}"))?;

        let max_process_snapshots_per_period =
            env_parse::<u32>("APM_MAX_PROCESS_SNAPSHOTS_PER_PERIOD")
                .unwrap_or(DEFAULT_MAX_SNAPSHOTS_PER_PERIOD);

        let process_snapshot_count_reset_period =
            env_parse::<u64>("APM_PROCESS_SNAPSHOT_COUNT_RESET_PERIOD_SECONDS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_COUNT_RESET_PERIOD);

        let auto_snapshot_duration = env_parse::<u64>("APM_AUTO_SNAPSHOT_DURATION_SECONDS")
            .filter(|secs| *secs > 0 && *secs < MAX_AUTO_SNAPSHOT_DURATION_SECS)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_AUTO_SNAPSHOT_DURATION);

        let transaction_timeout = env_parse::<u64>("APM_TRANSACTION_TIMEOUT_SECONDS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TRANSACTION_TIMEOUT);

        let node_name = env::var("APM_NODE_NAME")
            .ok()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| env::var("HOSTNAME").ok())
            .unwrap_or_else(|| DEFAULT_NODE_NAME.to_string());

        let tags = if let Ok(env_tags) = env::var("APM_TAGS") {
            Tags::from_env_string(&env_tags)
        } else {
            Tags::new()
        };

        Ok(Config {
            log_level,
            cls_disabled: env_flag("APM_CLS_DISABLED"),
            exclude_agent_from_call_graph: env_flag("APM_EXCLUDE_AGENT_FROM_CALL_GRAPH"),
            max_process_snapshots_per_period,
            process_snapshot_count_reset_period,
            auto_snapshot_duration,
            transaction_timeout,
            node_name,
            tags,
        })
    }

    pub fn scanner_settings(&self) -> ScannerSettings {
        ScannerSettings {
            max_snapshots_per_period: self.max_process_snapshots_per_period,
            count_reset_period: self.process_snapshot_count_reset_period,
            auto_snapshot_duration: self.auto_snapshot_duration,
            exclude_agent_from_call_graph: self.exclude_agent_from_call_graph,
        }
    }
}

#[cfg(test)]
mod tests {
    use duplicate::duplicate_item;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::env;
    use std::time::Duration;

    use crate::config;

    const ALL_VARS: [&str; 9] = [
        "APM_LOG_LEVEL",
        "APM_CLS_DISABLED",
        "APM_EXCLUDE_AGENT_FROM_CALL_GRAPH",
        "APM_MAX_PROCESS_SNAPSHOTS_PER_PERIOD",
        "APM_PROCESS_SNAPSHOT_COUNT_RESET_PERIOD_SECONDS",
        "APM_AUTO_SNAPSHOT_DURATION_SECONDS",
        "APM_TRANSACTION_TIMEOUT_SECONDS",
        "APM_NODE_NAME",
        "APM_TAGS",
    ];

    fn clear_env() {
        for var in ALL_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = config::Config::new().unwrap();
        assert_eq!(config.log_level, "info");
        assert!(!config.cls_disabled);
        assert!(!config.exclude_agent_from_call_graph);
        assert_eq!(config.max_process_snapshots_per_period, 2);
        assert_eq!(
            config.process_snapshot_count_reset_period,
            Duration::from_secs(60)
        );
        assert_eq!(config.auto_snapshot_duration, Duration::from_secs(10));
        assert_eq!(config.transaction_timeout, Duration::from_secs(300));
        assert!(config.tags.tags_string().is_none());
    }

    #[test]
    #[serial]
    fn test_error_if_log_level_does_not_parse() {
        clear_env();
        env::set_var("APM_LOG_LEVEL", "apm=verbose");
        let config = config::Config::new();
        assert!(config.is_err());
        assert!(config
            .unwrap_err()
            .to_string()
            .starts_with("Invalid APM_LOG_LEVEL 'apm=verbose'"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_flags_and_node_name() {
        clear_env();
        env::set_var("APM_CLS_DISABLED", "TRUE");
        env::set_var("APM_EXCLUDE_AGENT_FROM_CALL_GRAPH", "true");
        env::set_var("APM_NODE_NAME", "checkout-1");
        let config = config::Config::new().unwrap();
        assert!(config.cls_disabled);
        assert!(config.exclude_agent_from_call_graph);
        assert_eq!(config.node_name, "checkout-1");
        assert!(config.scanner_settings().exclude_agent_from_call_graph);
        clear_env();
    }

    #[duplicate_item(
        test_name                          value     expected_secs;
        [test_auto_snapshot_duration_ok]   ["30"]    [30];
        [test_auto_snapshot_duration_zero] ["0"]     [10];
        [test_auto_snapshot_duration_max]  ["300"]   [10];
        [test_auto_snapshot_duration_nan]  ["soon"]  [10];
    )]
    #[test]
    #[serial]
    fn test_name() {
        clear_env();
        env::set_var("APM_AUTO_SNAPSHOT_DURATION_SECONDS", value);
        let config = config::Config::new().unwrap();
        assert_eq!(
            config.auto_snapshot_duration,
            Duration::from_secs(expected_secs)
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_snapshot_limits() {
        clear_env();
        env::set_var("APM_MAX_PROCESS_SNAPSHOTS_PER_PERIOD", "0");
        env::set_var("APM_PROCESS_SNAPSHOT_COUNT_RESET_PERIOD_SECONDS", "0");
        let config = config::Config::new().unwrap();
        assert_eq!(config.max_process_snapshots_per_period, 0);
        assert_eq!(
            config.process_snapshot_count_reset_period,
            Duration::from_secs(60)
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_parse_tags() {
        clear_env();
        env::set_var("APM_TAGS", "env:prod team:payments,region:eu bogus");
        let config = config::Config::new().unwrap();
        assert_eq!(
            config.tags.tags(),
            &HashMap::from([
                ("env".to_string(), "prod".to_string()),
                ("team".to_string(), "payments".to_string()),
                ("region".to_string(), "eu".to_string()),
            ])
        );
        assert_eq!(
            config.tags.tags_string(),
            Some("env:prod,region:eu,team:payments")
        );
        clear_env();
    }
}
