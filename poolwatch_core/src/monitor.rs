//! Type-state builder for `Monitor` and the `Monitor` facade.
//!
//! The builder enforces at compile time that a telemetry channel and a
//! recording service are provided before `build()` is available.
//! `try_build()` is always available for dynamic checks.

use std::marker::PhantomData;
use std::sync::Arc;

use crossbeam_channel as xch;
use poolwatch_traits::clock::{Clock, MonotonicClock};
use poolwatch_traits::{DeviceId, RecordingService, TelemetryChannel};

use crate::config::{Timings, TopicScheme};
use crate::device::DeviceContext;
use crate::error::{BuildError, Result};
use crate::orchestrator::TestSessionOrchestrator;
use crate::registry::SubscriptionRegistry;
use crate::session::SessionView;
use crate::status::{ConnectionView, StatusSnapshot};
use crate::types::{ConnectionStatus, Device};

// ── Facade ───────────────────────────────────────────────────────────────────

/// Live-telemetry monitor for a set of devices.
///
/// Dropping the monitor shuts every device worker down, like `shutdown()`.
pub struct Monitor {
    registry: SubscriptionRegistry,
    sessions: TestSessionOrchestrator,
}

impl core::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Monitor")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Start building a Monitor.
    pub fn builder() -> MonitorBuilder<Missing, Missing> {
        MonitorBuilder::default()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &TestSessionOrchestrator {
        &self.sessions
    }

    /// See `SubscriptionRegistry::ensure`.
    pub fn ensure(&self, device: &DeviceId) -> Result<()> {
        self.registry.ensure(device)
    }

    pub fn ensure_device(&self, device: &Device) -> Result<()> {
        self.registry.ensure_device(device)
    }

    pub fn release(&self, device: &DeviceId) {
        self.registry.release(device);
    }

    /// Reconcile the monitored set with `devices`.
    pub fn sync_devices(&self, devices: &[Device]) -> Result<()> {
        self.registry.sync_devices(devices)
    }

    pub fn status_of(&self, device: &DeviceId) -> ConnectionStatus {
        self.registry.status_of(device)
    }

    pub fn connection_of(&self, device: &DeviceId) -> Option<ConnectionView> {
        self.registry.connection_of(device)
    }

    /// See `TestSessionOrchestrator::start`.
    pub fn start_session(&self, device: &DeviceId) -> Result<u64> {
        self.sessions.start(device)
    }

    pub fn cancel_session(&self, device: &DeviceId) -> Result<()> {
        self.sessions.cancel(device)
    }

    pub fn session_of(&self, device: &DeviceId) -> Option<SessionView> {
        self.sessions.session_of(device)
    }

    /// Status for one device. Unknown devices read as Idle with no session.
    pub fn snapshot(&self, device: &DeviceId) -> StatusSnapshot {
        self.registry
            .view_of(device)
            .unwrap_or_default()
            .snapshot(device)
    }

    /// Status for every known device, sorted by id.
    pub fn snapshot_all(&self) -> Vec<StatusSnapshot> {
        self.registry
            .views()
            .into_iter()
            .map(|(id, v)| v.snapshot(&id))
            .collect()
    }

    /// Release every device, draining queued events within the configured
    /// bound. Idempotent.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.registry.shutdown();
    }
}

// ── Type-state markers ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

/// Builder for `Monitor`. Timings are validated on `build()`.
pub struct MonitorBuilder<C, R> {
    channel: Option<Arc<dyn TelemetryChannel>>,
    recorder: Option<Arc<dyn RecordingService>>,
    timings: Option<Timings>,
    topics: Option<TopicScheme>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    events: Option<xch::Sender<StatusSnapshot>>,
    _c: PhantomData<C>,
    _r: PhantomData<R>,
}

impl Default for MonitorBuilder<Missing, Missing> {
    fn default() -> Self {
        Self {
            channel: None,
            recorder: None,
            timings: None,
            topics: None,
            clock: None,
            events: None,
            _c: PhantomData,
            _r: PhantomData,
        }
    }
}

impl<C, R> MonitorBuilder<C, R> {
    /// Build without compile-time guarantees; returns `BuildError` if a
    /// collaborator is missing or the timings are invalid.
    pub fn try_build(self) -> Result<Monitor> {
        let channel = self
            .channel
            .ok_or_else(|| eyre::Report::new(BuildError::MissingChannel))?;
        let recorder = self
            .recorder
            .ok_or_else(|| eyre::Report::new(BuildError::MissingRecorder))?;
        let timings = self.timings.unwrap_or_default();
        timings.validate()?;
        let topics = self.topics.unwrap_or_default();

        let ctx = DeviceContext {
            channel,
            recorder,
            timings,
            clock: self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::new())),
            timers: Arc::new(MonotonicClock::new()),
            events: self.events,
        };
        let registry = SubscriptionRegistry::new(ctx, topics);
        tracing::debug!(?timings, "monitor built");
        Ok(Monitor {
            sessions: TestSessionOrchestrator::new(registry.clone()),
            registry,
        })
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = Some(timings);
        self
    }

    pub fn with_topics(mut self, topics: TopicScheme) -> Self {
        self.topics = Some(topics);
        self
    }

    /// Clock used for timestamps: sample times, session starts and
    /// `last_message_at`. Timer deadlines always follow real time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Push interface: every change of a device's snapshot is sent here.
    /// A disconnected receiver is ignored.
    pub fn with_event_sink(mut self, sink: xch::Sender<StatusSnapshot>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Convenience: create an unbounded event channel, keep its sender and
    /// return the receiver.
    pub fn with_events(self) -> (Self, xch::Receiver<StatusSnapshot>) {
        let (tx, rx) = xch::unbounded();
        (self.with_event_sink(tx), rx)
    }

    fn retype<C2, R2>(self) -> MonitorBuilder<C2, R2> {
        MonitorBuilder {
            channel: self.channel,
            recorder: self.recorder,
            timings: self.timings,
            topics: self.topics,
            clock: self.clock,
            events: self.events,
            _c: PhantomData,
            _r: PhantomData,
        }
    }
}

// Setters that advance type-state
impl<R> MonitorBuilder<Missing, R> {
    pub fn with_channel(
        mut self,
        channel: impl TelemetryChannel + 'static,
    ) -> MonitorBuilder<Set, R> {
        self.channel = Some(Arc::new(channel));
        self.retype()
    }
}

impl<C> MonitorBuilder<C, Missing> {
    pub fn with_recorder(
        mut self,
        recorder: impl RecordingService + 'static,
    ) -> MonitorBuilder<C, Set> {
        self.recorder = Some(Arc::new(recorder));
        self.retype()
    }
}

impl MonitorBuilder<Set, Set> {
    /// Build with compile-time guarantees that both collaborators are set.
    pub fn build(self) -> Result<Monitor> {
        self.try_build()
    }
}
