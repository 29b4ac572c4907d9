pub mod drill;
pub mod serve;

use std::time::Duration;

use anyhow::Result;
use graceful_core::{Switch, SwitchBuilder};

use crate::config::ShutdownConfig;

/// Switch builder from `[shutdown]` config; `timeout_ms` overrides the file.
pub fn switch_builder(config: &ShutdownConfig, timeout_ms: Option<u64>) -> Result<SwitchBuilder> {
    let timeout = timeout_ms.map_or_else(|| config.timeout(), Duration::from_millis);
    Ok(Switch::builder(timeout)
        .signals(config.signal_numbers()?)
        .force_exit_on_repeat(config.force_exit_on_repeat))
}
