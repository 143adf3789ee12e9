use poolwatch_traits::DeviceId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("subscribe failed for {device}: {reason}")]
    Subscribe { device: DeviceId, reason: String },
    #[error("a test session is already active for {0}")]
    SessionActive(DeviceId),
    #[error("no active test session for {0}")]
    NoActiveSession(DeviceId),
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("monitor is shut down")]
    ShutDown,
    #[error("device worker for {0} is gone")]
    WorkerGone(DeviceId),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing telemetry channel")]
    MissingChannel,
    #[error("missing recording service")]
    MissingRecorder,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
