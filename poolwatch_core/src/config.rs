//! Runtime configuration types for the monitor.
//!
//! These are separate from the TOML-deserialized config in `poolwatch_config`;
//! see `conversions` for the mapping.

use crate::error::BuildError;
use poolwatch_traits::DeviceId;
use std::time::Duration;

/// Timer lengths. All are one-shot, wall-clock and cancellable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// A Connecting subscription with no message for this long shows as Disconnected.
    pub connect_timeout: Duration,
    /// A test session ends this long after it was started.
    pub session_timeout: Duration,
    /// Completed/Failed sessions stay visible for this long.
    pub grace_period: Duration,
    /// Start/stop recording calls that take longer than this are given up on.
    pub remote_call_timeout: Duration,
    /// Upper bound for a device worker to drain queued events on teardown.
    pub drain_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
            remote_call_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl Timings {
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.connect_timeout.is_zero() {
            return Err(BuildError::InvalidConfig("connect_timeout must be > 0"));
        }
        if self.session_timeout.is_zero() {
            return Err(BuildError::InvalidConfig("session_timeout must be > 0"));
        }
        if self.remote_call_timeout.is_zero() {
            return Err(BuildError::InvalidConfig("remote_call_timeout must be > 0"));
        }
        if self.drain_timeout.is_zero() {
            return Err(BuildError::InvalidConfig("drain_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Derives a device's telemetry topic: `<prefix>/<key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("pool")
    }
}

impl TopicScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn topic_for(&self, device: &DeviceId) -> String {
        self.topic_for_key(device.as_str())
    }

    pub fn topic_for_key(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}
