//! Subcommand bodies: simulate and check-config.

use crate::sim::{SimChannel, SimRecorder};
use eyre::WrapErr;
use poolwatch_config::Config;
use poolwatch_core::{
    Device, DeviceId, Monitor, SessionOutcome, SessionView, StatusSnapshot, Timings, TopicScheme,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub struct SimParams {
    pub devices: u16,
    pub seconds: u64,
    pub test: Vec<String>,
    pub silent: Vec<String>,
    pub fail_every: Option<u32>,
    pub tick: Duration,
    pub session_ms: Option<u64>,
    pub connect_ms: Option<u64>,
}

pub fn load_config(path: Option<&Path>) -> eyre::Result<Config> {
    match path {
        Some(p) => poolwatch_config::load_file(p).wrap_err("invalid configuration"),
        None => Ok(Config::default()),
    }
}

/// Configured devices, or pool1..poolN when the config lists none.
fn device_list(cfg: &Config, n: u16) -> Vec<Device> {
    if cfg.devices.is_empty() {
        (1..=n)
            .map(|i| Device::new(format!("pool{i}"), format!("Pool {i}")))
            .collect()
    } else {
        cfg.devices.iter().map(Device::from).collect()
    }
}

fn outcome_str(o: &SessionOutcome) -> String {
    match o {
        SessionOutcome::DataSaved { samples } => format!("data_saved({samples})"),
        SessionOutcome::NoDataReceived => "no_data_received".to_string(),
        SessionOutcome::Failed(e) => format!("failed({e})"),
        SessionOutcome::Cancelled => "cancelled".to_string(),
    }
}

fn print_snapshot(s: &StatusSnapshot, json: bool) {
    if json {
        println!(
            "{}",
            json!({
                "event": "status",
                "device": s.device.as_str(),
                "connection": s.connection.as_str(),
                "session": s.session.map(|v| v.as_str()),
            })
        );
    } else {
        let session = s.session.map_or("-", |v| v.as_str());
        println!(
            "{:<12} connection={:<12} session={}",
            s.device, s.connection, session
        );
    }
}

fn print_session(device: &DeviceId, v: &SessionView, json: bool) {
    let outcome = v.outcome.as_ref().map(outcome_str);
    if json {
        println!(
            "{}",
            json!({
                "event": "session",
                "device": device.as_str(),
                "status": v.status.as_str(),
                "samples_saved": v.samples_saved,
                "outcome": outcome,
                "error": v.error,
            })
        );
    } else {
        println!(
            "{:<12} session {} samples={} outcome={}{}",
            device,
            v.status,
            v.samples_saved,
            outcome.as_deref().unwrap_or("-"),
            v.error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        );
    }
}

pub fn simulate(cfg: &Config, p: &SimParams, json: bool) -> eyre::Result<()> {
    let mut timings = Timings::from(cfg);
    if let Some(ms) = p.session_ms {
        timings.session_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = p.connect_ms {
        timings.connect_timeout = Duration::from_millis(ms);
    }
    let topics = TopicScheme::from(&cfg.telemetry);
    let devices = device_list(cfg, p.devices);

    for id in p.test.iter().chain(&p.silent) {
        if !devices.iter().any(|d| d.id.as_str() == id) {
            eyre::bail!("unknown device {id:?}; known: {}", names(&devices));
        }
    }
    let silent_topics = devices
        .iter()
        .filter(|d| p.silent.iter().any(|s| s == d.id.as_str()))
        .map(|d| topics.topic_for_key(&d.topic_key));

    let (builder, events) = Monitor::builder().with_events();
    let monitor = builder
        .with_channel(SimChannel::new(p.tick, silent_topics))
        .with_recorder(SimRecorder::new(Duration::from_millis(20), p.fail_every))
        .with_timings(timings)
        .with_topics(topics)
        .build()?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst)) {
            tracing::warn!(error = %e, "Ctrl-C handler not installed");
        }
    }

    tracing::info!(devices = devices.len(), seconds = p.seconds, "simulation starting");
    if let Err(e) = monitor.sync_devices(&devices) {
        tracing::warn!(error = %e, "some devices failed to subscribe");
    }
    for id in &p.test {
        let id = DeviceId::new(id);
        let session = monitor.start_session(&id)?;
        tracing::info!(device = %id, session, "test session requested");
    }

    let deadline = Instant::now() + Duration::from_secs(p.seconds);
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wait = (deadline - now).min(Duration::from_millis(100));
        if let Ok(snap) = events.recv_timeout(wait) {
            print_snapshot(&snap, json);
            // Session detail is printed once a session reaches a terminal state.
            if snap.session.is_some_and(|s| s.is_terminal())
                && let Some(v) = monitor.session_of(&snap.device)
            {
                print_session(&snap.device, &v, json);
            }
        }
    }

    summary(&monitor, json);
    monitor.shutdown();
    tracing::info!("simulation finished");
    Ok(())
}

fn names(devices: &[Device]) -> String {
    devices
        .iter()
        .map(|d| d.id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn summary(monitor: &Monitor, json: bool) {
    let all = monitor.snapshot_all();
    if json {
        let rows: Vec<_> = all
            .iter()
            .map(|s| {
                let conn = monitor.connection_of(&s.device);
                json!({
                    "device": s.device.as_str(),
                    "connection": s.connection.as_str(),
                    "session": s.session.map(|v| v.as_str()),
                    "messages": conn.map_or(0, |c| c.messages),
                })
            })
            .collect();
        println!("{}", json!({ "event": "summary", "devices": rows }));
        return;
    }
    println!("--- summary ---");
    println!("{:<12} {:<12} {:>8}  session", "device", "connection", "messages");
    for s in &all {
        let messages = monitor.connection_of(&s.device).map_or(0, |c| c.messages);
        println!(
            "{:<12} {:<12} {:>8}  {}",
            s.device,
            s.connection,
            messages,
            s.session.map_or("-", |v| v.as_str())
        );
    }
}

/// The file was already loaded and validated by the time this runs.
pub fn check_config(cfg: &Config, path: Option<&Path>, json: bool) -> eyre::Result<()> {
    if path.is_none() {
        eyre::bail!("check-config needs --config <FILE>");
    }
    let timings = Timings::from(cfg);
    if json {
        println!(
            "{}",
            json!({
                "ok": true,
                "topic_prefix": cfg.telemetry.topic_prefix.trim(),
                "devices": cfg.devices.len(),
                "connect_ms": cfg.timeouts.connect_ms,
                "session_ms": cfg.timeouts.session_ms,
            })
        );
    } else {
        println!(
            "config ok: {} device(s), topic prefix {:?}, session {} ms",
            cfg.devices.len(),
            cfg.telemetry.topic_prefix.trim(),
            timings.session_timeout.as_millis()
        );
    }
    Ok(())
}
