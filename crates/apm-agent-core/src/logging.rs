// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Builds the filter for `log_level`, silencing the runtime's own chatter.
pub fn env_filter(log_level: &str) -> Result<EnvFilter, anyhow::Error> {
    EnvFilter::try_new(format!("tokio=off,runtime=off,{log_level}"))
        .map_err(|err| anyhow::anyhow!("could not parse log level in configuration: {err}"))
}

/// Installs the global `tracing` subscriber. Fails when `log_level` is not a valid filter or
/// a subscriber is already installed.
pub fn init(log_level: &str) -> Result<(), anyhow::Error> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(log_level)?)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| anyhow::anyhow!("setting default subscriber failed: {err}"))?;

    debug!("Logging subsystem enabled");
    Ok(())
}
