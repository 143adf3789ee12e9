//! Human-readable error descriptions and structured JSON error formatting.

use poolwatch_core::error::{BuildError, MonitorError};

fn is_config_error(err: &eyre::Report) -> bool {
    err.chain()
        .any(|e| e.to_string().contains("invalid configuration"))
}

/// Stable short name for the JSON `reason` field.
pub fn reason_name(err: &eyre::Report) -> &'static str {
    if let Some(me) = err.downcast_ref::<MonitorError>() {
        return match me {
            MonitorError::Subscribe { .. } => "Subscribe",
            MonitorError::SessionActive(_) => "SessionActive",
            MonitorError::NoActiveSession(_) => "NoActiveSession",
            MonitorError::UnknownDevice(_) => "UnknownDevice",
            MonitorError::ShutDown => "ShutDown",
            MonitorError::WorkerGone(_) => "WorkerGone",
        };
    }
    if err.downcast_ref::<BuildError>().is_some() || is_config_error(err) {
        return "Config";
    }
    "Error"
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingChannel => {
                "What happened: No telemetry channel was provided to the monitor.\nHow to fix: Pass a channel via with_channel(...).".to_string()
            }
            BuildError::MissingRecorder => {
                "What happened: No recording service was provided to the monitor.\nHow to fix: Pass a recorder via with_recorder(...).".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid timing configuration ({msg}).\nLikely causes: A zero value in [timeouts] or [shutdown], or a zero command-line override.\nHow to fix: Use positive millisecond values."
            ),
        };
    }

    if let Some(me) = err.downcast_ref::<MonitorError>() {
        return match me {
            MonitorError::Subscribe { device, reason } => format!(
                "What happened: Subscribing to telemetry for {device} failed ({reason}).\nLikely causes: Broker unreachable or topic rejected.\nHow to fix: Check [telemetry] topic_prefix and the broker, then retry."
            ),
            MonitorError::SessionActive(device) => format!(
                "What happened: A test session is already running for {device}.\nHow to fix: Wait for it to complete or cancel it first."
            ),
            _ => format!(
                "What happened: {me}.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    let msg = err.to_string();
    if is_config_error(err) {
        let cause = err
            .chain()
            .last()
            .map(ToString::to_string)
            .unwrap_or_default();
        return format!(
            "What happened: Configuration is invalid ({cause}).\nHow to fix: Edit the TOML config and try again, or validate it with `poolwatch check-config --config <FILE>`."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes: 1 generic, 3 configuration, 4 subscription, 5 other monitor errors.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if err.downcast_ref::<BuildError>().is_some() || is_config_error(err) {
        return 3;
    }
    match err.downcast_ref::<MonitorError>() {
        Some(MonitorError::Subscribe { .. }) => 4,
        Some(_) => 5,
        None => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    serde_json::json!({
        "reason": reason_name(err),
        "message": humanize(err),
    })
    .to_string()
}
