//! `From` implementations bridging `poolwatch_config` types to `poolwatch_core` types.

use crate::config::{Timings, TopicScheme};
use crate::types::Device;
use std::time::Duration;

// ── Timings ──────────────────────────────────────────────────────────────────

impl From<&poolwatch_config::Config> for Timings {
    fn from(c: &poolwatch_config::Config) -> Self {
        Self {
            connect_timeout: Duration::from_millis(c.timeouts.connect_ms),
            session_timeout: Duration::from_millis(c.timeouts.session_ms),
            grace_period: Duration::from_millis(c.timeouts.grace_ms),
            remote_call_timeout: Duration::from_millis(c.timeouts.remote_call_ms),
            drain_timeout: Duration::from_millis(c.shutdown.drain_ms),
        }
    }
}

// ── TopicScheme ──────────────────────────────────────────────────────────────

impl From<&poolwatch_config::Telemetry> for TopicScheme {
    fn from(c: &poolwatch_config::Telemetry) -> Self {
        TopicScheme::new(c.topic_prefix.trim())
    }
}

// ── Device ───────────────────────────────────────────────────────────────────

impl From<&poolwatch_config::DeviceEntry> for Device {
    fn from(c: &poolwatch_config::DeviceEntry) -> Self {
        let name = c.name.clone().unwrap_or_else(|| c.id.clone());
        let device = Device::new(c.id.as_str(), name);
        match &c.topic_key {
            Some(key) => device.with_topic_key(key.as_str()),
            None => device,
        }
    }
}
