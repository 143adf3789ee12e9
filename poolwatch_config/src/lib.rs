#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas for the pool monitor.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - Every section has defaults so an empty file is a valid config.
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Telemetry {
    /// Topic prefix; a device subscribes to "<prefix>/<topic_key>".
    pub topic_prefix: String,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            topic_prefix: "pool".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// No message within this window downgrades a connection to Disconnected.
    pub connect_ms: u64,
    /// Length of a test session.
    pub session_ms: u64,
    /// How long a finished session stays visible.
    pub grace_ms: u64,
    /// Bound on start/stop recording calls. Also accepts alias "call_ms".
    #[serde(alias = "call_ms")]
    pub remote_call_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            session_ms: 30_000,
            grace_ms: 5_000,
            remote_call_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Shutdown {
    /// Max time to wait for each device worker to drain on teardown.
    pub drain_ms: u64,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self { drain_ms: 2_000 }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Overrides the id part of the telemetry topic.
    #[serde(default)]
    pub topic_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub telemetry: Telemetry,
    pub timeouts: Timeouts,
    pub shutdown: Shutdown,
    pub logging: Logging,
    pub devices: Vec<DeviceEntry>,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Read, parse and validate a config file.
pub fn load_file(path: &Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("read config {:?}: {}", path, e))?;
    let cfg = load_toml(&text).map_err(|e| eyre::eyre!("parse config {:?}: {}", path, e))?;
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Telemetry
        let prefix = self.telemetry.topic_prefix.trim();
        if prefix.is_empty() {
            eyre::bail!("telemetry.topic_prefix must not be empty");
        }
        if prefix.contains(['#', '+']) {
            eyre::bail!("telemetry.topic_prefix must not contain wildcards ('#' or '+')");
        }

        // Timeouts
        if self.timeouts.connect_ms == 0 {
            eyre::bail!("timeouts.connect_ms must be >= 1");
        }
        if self.timeouts.session_ms == 0 {
            eyre::bail!("timeouts.session_ms must be >= 1");
        }
        if self.timeouts.remote_call_ms == 0 {
            eyre::bail!("timeouts.remote_call_ms must be >= 1");
        }
        const DAY_MS: u64 = 24 * 60 * 60 * 1000;
        for (name, ms) in [
            ("connect_ms", self.timeouts.connect_ms),
            ("session_ms", self.timeouts.session_ms),
            ("grace_ms", self.timeouts.grace_ms),
            ("remote_call_ms", self.timeouts.remote_call_ms),
        ] {
            if ms > DAY_MS {
                eyre::bail!("timeouts.{name} is unreasonably large (>24h)");
            }
        }

        // Shutdown
        if self.shutdown.drain_ms == 0 {
            eyre::bail!("shutdown.drain_ms must be >= 1");
        }
        if self.shutdown.drain_ms > 60_000 {
            eyre::bail!("shutdown.drain_ms must be <= 60000");
        }

        // Logging
        if let Some(rotation) = self.logging.rotation.as_deref()
            && !matches!(rotation, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never, daily, hourly (got {rotation:?})");
        }

        // Devices
        let mut seen = HashSet::new();
        let mut topics = HashSet::new();
        for d in &self.devices {
            if d.id.trim().is_empty() {
                eyre::bail!("devices[].id must not be empty");
            }
            if !seen.insert(d.id.as_str()) {
                eyre::bail!("duplicate device id {:?}", d.id);
            }
            // Without a topic_key the id becomes the last topic level.
            let key = d.topic_key.as_deref().unwrap_or(d.id.as_str());
            if key.is_empty() || key.contains(['#', '+', '/']) {
                eyre::bail!(
                    "devices[{}].topic_key must be a single non-wildcard level",
                    d.id
                );
            }
            if !topics.insert(key) {
                eyre::bail!("devices[{}] reuses topic level {key:?}", d.id);
            }
        }

        Ok(())
    }
}
