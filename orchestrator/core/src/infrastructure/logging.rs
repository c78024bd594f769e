// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output format of the worker's log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Install the global subscriber for a process hosting unit manager workers.
///
/// `RUST_LOG` takes precedence over `level`. Returns `false` when another
/// subscriber was installed first; that one is left in place.
pub fn init_logging(level: &str, format: LogFormat) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("Invalid log level '{}'", level))?,
    };

    let compact = (format == LogFormat::Compact)
        .then(|| tracing_subscriber::fmt::layer().with_target(false).compact());
    let json = (format == LogFormat::Json)
        .then(|| tracing_subscriber::fmt::layer().json().with_current_span(false));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(compact)
        .with(json)
        .try_init()
        .is_ok();
    if !installed {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(installed)
}
