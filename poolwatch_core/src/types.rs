//! Status enums and the device record shared by the registry and the orchestrator.

use poolwatch_traits::DeviceId;
use std::fmt;

/// Health of a device's live-data subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    /// No subscription (never ensured, or released).
    #[default]
    Idle,
    /// Subscribed, no message seen since.
    Connecting,
    Connected,
    /// Connect-timeout elapsed without a message. The subscription stays open.
    Disconnected,
    /// Subscribe or transport failure; needs an explicit ensure to retry.
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Status of a test session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Start-recording call in flight.
    Recording,
    WaitingForData,
    /// At least one sample saved; still collecting until the session timeout.
    DataReceived,
    Completed,
    Failed,
}

impl SessionStatus {
    /// True while the session claims the device's telemetry.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Recording | Self::WaitingForData | Self::DataReceived
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::WaitingForData => "waiting_for_data",
            Self::DataReceived => "data_received",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// How a finished session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    DataSaved { samples: u32 },
    NoDataReceived,
    Failed(String),
    Cancelled,
}

/// A monitored pool. Supplied by the application and never mutated here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Last topic level; defaults to the id.
    pub topic_key: String,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>) -> Self {
        let id = id.into();
        let topic_key = id.as_str().to_string();
        Self {
            id,
            name: name.into(),
            topic_key,
        }
    }

    pub fn with_topic_key(mut self, key: impl Into<String>) -> Self {
        self.topic_key = key.into();
        self
    }
}
