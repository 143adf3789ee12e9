//! Capabilities consumed by the pool monitoring core.
//!
//! The live-telemetry bus and the recording backend are provided by the
//! surrounding application; the core only talks to them through the traits
//! in this crate.
pub mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};

use std::fmt;
use std::sync::Arc;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stable identifier of a monitored pool / testing unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// One message of sensor data as delivered by the bus. The payload is opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySample {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl TelemetrySample {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// What a subscription handler can receive.
#[derive(Debug, Clone)]
pub enum Delivery {
    Sample(TelemetrySample),
    /// Asynchronous transport failure on an otherwise live subscription.
    TransportError(String),
}

/// Callback invoked by the bus for every delivery on a topic. May be called
/// from any thread.
pub type DeliveryHandler = Box<dyn Fn(Delivery) + Send + Sync + 'static>;

/// Opaque token identifying one live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Publish/subscribe client for the telemetry bus.
pub trait TelemetryChannel: Send + Sync {
    /// Open a subscription. Returns once the subscribe request has been
    /// issued; deliveries arrive later through `handler`.
    fn subscribe(
        &self,
        topic: &str,
        handler: DeliveryHandler,
    ) -> Result<SubscriptionHandle, BoxError>;

    /// Tear a subscription down. No deliveries for `handle` may start after
    /// this returns.
    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BoxError>;
}

/// Request/response client for the recording backend. Calls may block; the
/// core never invokes them on a thread that dispatches telemetry.
pub trait RecordingService: Send + Sync {
    fn start_recording(&self, device: &DeviceId) -> Result<(), BoxError>;
    fn stop_recording(&self, device: &DeviceId) -> Result<(), BoxError>;
    fn save_sample(&self, device: &DeviceId, sample: &TelemetrySample) -> Result<(), BoxError>;
}

impl<T: TelemetryChannel + ?Sized> TelemetryChannel for Arc<T> {
    fn subscribe(
        &self,
        topic: &str,
        handler: DeliveryHandler,
    ) -> Result<SubscriptionHandle, BoxError> {
        (**self).subscribe(topic, handler)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BoxError> {
        (**self).unsubscribe(handle)
    }
}

impl<T: RecordingService + ?Sized> RecordingService for Arc<T> {
    fn start_recording(&self, device: &DeviceId) -> Result<(), BoxError> {
        (**self).start_recording(device)
    }

    fn stop_recording(&self, device: &DeviceId) -> Result<(), BoxError> {
        (**self).stop_recording(device)
    }

    fn save_sample(&self, device: &DeviceId, sample: &TelemetrySample) -> Result<(), BoxError> {
        (**self).save_sample(device, sample)
    }
}
