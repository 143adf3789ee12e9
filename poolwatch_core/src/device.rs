//! Per-device serialized event handler.
//!
//! `DeviceState` owns one device's `Connection`, its optional `TestSession`
//! and the subscription handle. Every input for the device (deliveries,
//! ensure/start/cancel requests, recording-call completions, timer expiry)
//! goes through it on one thread, so a sample and a session timeout can never
//! interleave. Remote calls are not executed here; they are queued in an
//! outbox that the worker hands to the device's recording lane.

use crate::config::Timings;
use crate::connection::Connection;
use crate::error::MonitorError;
use crate::lane::{CallKind, Job, RemoteCall};
use crate::session::{Cancelled, TestSession, TimerAction};
use crate::status::{ConnectionView, DeviceView, StatusSnapshot, ViewCell};
use crate::timer::earliest;
use crossbeam_channel as xch;
use poolwatch_traits::{Clock, Delivery, DeviceId, TelemetryChannel};
use std::sync::Arc;
use std::time::Instant;

pub(crate) type Reply<T> = xch::Sender<Result<T, MonitorError>>;

pub(crate) enum DeviceEvent {
    /// Delivery from the subscription opened in `epoch`.
    Delivery { epoch: u64, delivery: Delivery },
    Ensure { reply: Reply<()> },
    StartSession { reply: Reply<u64> },
    CancelSession { reply: Reply<()> },
    CallDone {
        session: u64,
        call: CallKind,
        result: Result<(), String>,
    },
    Shutdown,
}

/// Collaborators shared by every device worker.
#[derive(Clone)]
pub(crate) struct DeviceContext {
    pub(crate) channel: Arc<dyn TelemetryChannel>,
    pub(crate) recorder: Arc<dyn poolwatch_traits::RecordingService>,
    pub(crate) timings: Timings,
    /// Stamps samples, session starts and `last_message_at`.
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    /// Drives deadlines. Real time outside of unit tests.
    pub(crate) timers: Arc<dyn Clock + Send + Sync>,
    pub(crate) events: Option<xch::Sender<StatusSnapshot>>,
}

pub(crate) struct DeviceState {
    device: DeviceId,
    topic: String,
    ctx: DeviceContext,
    connection: Connection,
    session: Option<TestSession>,
    /// Bumped on every subscribe; deliveries from older subscriptions are dropped.
    epoch: u64,
    next_session: u64,
    inbox: xch::Sender<DeviceEvent>,
    outbox: Vec<Job>,
    view: ViewCell,
    last_published: Option<StatusSnapshot>,
}

impl DeviceState {
    pub(crate) fn new(
        device: DeviceId,
        topic: String,
        ctx: DeviceContext,
        inbox: xch::Sender<DeviceEvent>,
        view: ViewCell,
    ) -> Self {
        // A fresh worker starts out Idle; only changes from there are pushed.
        let initial = DeviceView::default().snapshot(&device);
        Self {
            connection: Connection::new(device.clone()),
            device,
            topic,
            ctx,
            session: None,
            epoch: 0,
            next_session: 0,
            inbox,
            outbox: Vec::new(),
            view,
            last_published: Some(initial),
        }
    }

    /// Timer time.
    pub(crate) fn now(&self) -> Instant {
        self.ctx.timers.now()
    }

    fn stamp(&self) -> Instant {
        self.ctx.clock.now()
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> Option<&TestSession> {
        self.session.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.connection.connect_deadline(),
            self.session.as_ref().and_then(TestSession::next_deadline),
        ])
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.outbox)
    }

    /// Apply one event. Shutdown is handled by the worker loop, not here.
    pub(crate) fn handle(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Delivery { epoch, delivery } => self.on_delivery(epoch, delivery),
            // Requests publish before replying so the caller reads its own write.
            DeviceEvent::Ensure { reply } => {
                let result = self.ensure();
                self.publish();
                let _ = reply.send(result);
            }
            DeviceEvent::StartSession { reply } => {
                let result = self.start_session();
                self.publish();
                let _ = reply.send(result);
            }
            DeviceEvent::CancelSession { reply } => {
                let result = self.cancel_session();
                self.publish();
                let _ = reply.send(result);
            }
            DeviceEvent::CallDone {
                session,
                call,
                result,
            } => self.on_call_done(session, call, result),
            DeviceEvent::Shutdown => {}
        }
    }

    /// Open a subscription unless one is already Connecting/Connected.
    pub(crate) fn ensure(&mut self) -> Result<(), MonitorError> {
        if !self.connection.needs_subscribe() {
            return Ok(());
        }
        self.release_handle();

        self.epoch += 1;
        let epoch = self.epoch;
        let inbox = self.inbox.clone();
        let handler = Box::new(move |delivery: Delivery| {
            // Fails only once the worker is gone; late deliveries are dropped.
            let _ = inbox.send(DeviceEvent::Delivery { epoch, delivery });
        });

        match self.ctx.channel.subscribe(&self.topic, handler) {
            Ok(handle) => {
                let now = self.now();
                self.connection
                    .subscribed(handle, now, self.ctx.timings.connect_timeout);
                tracing::info!(device = %self.device, topic = %self.topic, "subscribed");
                Ok(())
            }
            Err(e) => {
                self.connection.subscribe_failed();
                tracing::warn!(device = %self.device, topic = %self.topic, error = %e, "subscribe failed");
                Err(MonitorError::Subscribe {
                    device: self.device.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn on_delivery(&mut self, epoch: u64, delivery: Delivery) {
        if epoch != self.epoch || self.connection.handle().is_none() {
            tracing::trace!(device = %self.device, epoch, "stale delivery dropped");
            return;
        }
        match delivery {
            Delivery::Sample(sample) => {
                let stamp = self.stamp();
                if self.connection.on_message(stamp) {
                    tracing::info!(device = %self.device, "connected");
                }
                if let Some(session) = self.session.as_ref()
                    && session.accepts_samples()
                {
                    tracing::debug!(device = %self.device, session = session.id(), "sample routed to session");
                    self.outbox.push(Job {
                        session: session.id(),
                        call: RemoteCall::Save(sample),
                    });
                }
            }
            Delivery::TransportError(reason) => {
                if self.connection.on_transport_error() {
                    tracing::warn!(device = %self.device, error = %reason, "transport error");
                }
            }
        }
    }

    pub(crate) fn start_session(&mut self) -> Result<u64, MonitorError> {
        if self.session.as_ref().is_some_and(TestSession::is_active) {
            return Err(MonitorError::SessionActive(self.device.clone()));
        }
        self.next_session += 1;
        let id = self.next_session;
        self.session = Some(TestSession::start(
            id,
            self.device.clone(),
            self.stamp(),
            self.now(),
            &self.ctx.timings,
        ));
        self.outbox.push(Job {
            session: id,
            call: RemoteCall::Start,
        });
        tracing::info!(device = %self.device, session = id, "test session started");
        Ok(id)
    }

    pub(crate) fn cancel_session(&mut self) -> Result<(), MonitorError> {
        let Some(session) = self.session.as_mut() else {
            return Err(MonitorError::NoActiveSession(self.device.clone()));
        };
        let Some(cancelled) = session.cancel() else {
            return Err(MonitorError::NoActiveSession(self.device.clone()));
        };
        let id = session.id();
        if cancelled == Cancelled::IssueStop {
            self.outbox.push(Job {
                session: id,
                call: RemoteCall::Stop,
            });
        }
        self.session = None;
        tracing::info!(device = %self.device, session = id, "test session cancelled");
        Ok(())
    }

    fn on_call_done(&mut self, id: u64, call: CallKind, result: Result<(), String>) {
        let now = self.now();
        let stamp = self.stamp();
        let timings = self.ctx.timings;
        let Some(session) = self.session.as_mut().filter(|s| s.id() == id) else {
            tracing::trace!(device = %self.device, session = id, call = ?call, "completion for finished session ignored");
            return;
        };
        match (call, result) {
            (CallKind::Start, Ok(())) => {
                if session.on_recording_started(&timings) {
                    tracing::info!(device = %self.device, session = id, "recording, waiting for data");
                }
            }
            (CallKind::Start, Err(e)) => {
                if session.on_recording_failed(e.clone(), now, &timings) {
                    tracing::warn!(device = %self.device, session = id, error = %e, "start recording failed");
                }
            }
            (CallKind::Save, Ok(())) => {
                session.on_sample_saved(stamp);
            }
            (CallKind::Save, Err(e)) => {
                tracing::warn!(device = %self.device, session = id, error = %e, "save sample failed");
                session.on_save_failed(e);
            }
            (CallKind::Stop, result) => {
                if let Err(e) = &result {
                    tracing::warn!(device = %self.device, session = id, error = %e, "stop recording failed");
                }
                if session.on_recording_stopped(result, now, &timings) {
                    tracing::info!(device = %self.device, session = id, outcome = ?session.outcome(), "test session completed");
                }
            }
        }
    }

    /// Fire every due timer.
    pub(crate) fn poll_timers(&mut self) {
        let now = self.now();
        if self.connection.poll_connect_timeout(now) {
            tracing::warn!(device = %self.device, "no telemetry within connect timeout");
        }
        let timings = self.ctx.timings;
        while let Some(session) = self.session.as_mut() {
            match session.poll(now, &timings) {
                None => break,
                Some(TimerAction::Changed) => {
                    tracing::warn!(device = %self.device, session = session.id(), status = %session.status(), error = ?session.error(), "recording call timed out");
                }
                Some(TimerAction::IssueStop) => {
                    tracing::debug!(device = %self.device, session = session.id(), "session timeout, stopping");
                    self.outbox.push(Job {
                        session: session.id(),
                        call: RemoteCall::Stop,
                    });
                }
                Some(TimerAction::Expired) => {
                    tracing::debug!(device = %self.device, session = session.id(), "session removed after grace");
                    self.session = None;
                }
            }
        }
    }

    /// Release everything: best-effort stop of an active session, then unsubscribe.
    pub(crate) fn teardown(&mut self) {
        if let Some(mut session) = self.session.take()
            && session.cancel() == Some(Cancelled::IssueStop)
        {
            self.outbox.push(Job {
                session: session.id(),
                call: RemoteCall::Stop,
            });
        }
        self.release_handle();
        self.connection.reset();
    }

    fn release_handle(&mut self) {
        if let Some(handle) = self.connection.take_handle() {
            if let Err(e) = self.ctx.channel.unsubscribe(handle) {
                tracing::warn!(device = %self.device, error = %e, "unsubscribe failed");
            } else {
                tracing::debug!(device = %self.device, "unsubscribed");
            }
        }
    }

    /// Store the current view and emit a status event if the snapshot changed.
    pub(crate) fn publish(&mut self) {
        let view = DeviceView {
            connection: ConnectionView {
                status: self.connection.status(),
                last_message_at: self.connection.last_message_at(),
                messages: self.connection.messages(),
            },
            session: self.session.as_ref().map(TestSession::view),
        };
        let snapshot = view.snapshot(&self.device);
        self.view.store(view);
        if self.last_published.as_ref() != Some(&snapshot) {
            if let Some(events) = &self.ctx.events {
                let _ = events.send(snapshot.clone());
            }
            self.last_published = Some(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockChannel, MockRecorder};
    use crate::types::{ConnectionStatus, SessionOutcome, SessionStatus};
    use poolwatch_traits::{ManualClock, TelemetrySample};
    use std::time::Duration;

    struct Harness {
        state: DeviceState,
        channel: MockChannel,
        clock: ManualClock,
        _inbox: xch::Receiver<DeviceEvent>,
    }

    fn harness() -> Harness {
        let channel = MockChannel::new();
        let clock = ManualClock::new();
        let (tx, rx) = xch::unbounded();
        let ctx = DeviceContext {
            channel: Arc::new(channel.clone()),
            recorder: Arc::new(MockRecorder::new()),
            timings: Timings::default(),
            clock: Arc::new(clock.clone()),
            timers: Arc::new(clock.clone()),
            events: None,
        };
        let state = DeviceState::new(
            DeviceId::new("poolA"),
            "pool/poolA".to_string(),
            ctx,
            tx,
            ViewCell::default(),
        );
        Harness {
            state,
            channel,
            clock,
            _inbox: rx,
        }
    }

    fn sample(h: &mut Harness, payload: &str) {
        let epoch = h.state.epoch();
        h.state.handle(DeviceEvent::Delivery {
            epoch,
            delivery: Delivery::Sample(TelemetrySample::new("pool/poolA", payload)),
        });
    }

    fn done(h: &mut Harness, call: CallKind, result: Result<(), String>) {
        let session = h.state.session().map(TestSession::id).unwrap_or(0);
        h.state.handle(DeviceEvent::CallDone {
            session,
            call,
            result,
        });
    }

    fn calls(jobs: &[Job]) -> Vec<CallKind> {
        jobs.iter().map(|j| j.call.kind()).collect()
    }

    #[test]
    fn repeated_ensure_subscribes_once() {
        let mut h = harness();
        h.state.ensure().unwrap();
        h.state.ensure().unwrap();
        assert_eq!(h.channel.subscribe_count("pool/poolA"), 1);
        assert_eq!(h.channel.live_count("pool/poolA"), 1);
    }

    #[test]
    fn ensure_after_timeout_replaces_handle() {
        let mut h = harness();
        h.state.ensure().unwrap();
        h.clock.advance(Duration::from_secs(10));
        h.state.poll_timers();
        assert_eq!(h.state.connection().status(), ConnectionStatus::Disconnected);
        h.state.ensure().unwrap();
        assert_eq!(h.channel.subscribe_count("pool/poolA"), 2);
        assert_eq!(h.channel.live_count("pool/poolA"), 1);
        assert_eq!(h.state.connection().status(), ConnectionStatus::Connecting);
    }

    #[test]
    fn stale_epoch_delivery_is_ignored() {
        let mut h = harness();
        h.state.ensure().unwrap();
        h.state.handle(DeviceEvent::Delivery {
            epoch: 0,
            delivery: Delivery::Sample(TelemetrySample::new("pool/poolA", "x")),
        });
        assert_eq!(h.state.connection().status(), ConnectionStatus::Connecting);
    }

    #[test]
    fn second_start_is_rejected() {
        let mut h = harness();
        h.state.ensure().unwrap();
        h.state.start_session().unwrap();
        assert_eq!(
            h.state.start_session(),
            Err(MonitorError::SessionActive(DeviceId::new("poolA")))
        );
        assert_eq!(calls(&h.state.take_outbox()), vec![CallKind::Start]);
    }

    #[test]
    fn samples_are_saved_only_while_waiting() {
        let mut h = harness();
        h.state.ensure().unwrap();
        h.state.start_session().unwrap();
        h.state.take_outbox();

        // still Recording: not claimed yet
        sample(&mut h, "early");
        assert!(h.state.take_outbox().is_empty());

        done(&mut h, CallKind::Start, Ok(()));
        sample(&mut h, "a");
        sample(&mut h, "b");
        assert_eq!(
            calls(&h.state.take_outbox()),
            vec![CallKind::Save, CallKind::Save]
        );
    }

    #[test]
    fn timeout_stops_once_and_blocks_later_samples() {
        let mut h = harness();
        h.state.ensure().unwrap();
        h.state.start_session().unwrap();
        done(&mut h, CallKind::Start, Ok(()));
        h.state.take_outbox();

        h.clock.advance(Duration::from_secs(30));
        h.state.poll_timers();
        sample(&mut h, "too late");
        h.state.poll_timers();
        assert_eq!(calls(&h.state.take_outbox()), vec![CallKind::Stop]);

        done(&mut h, CallKind::Stop, Ok(()));
        let s = h.state.session().unwrap();
        assert_eq!(s.status(), SessionStatus::Completed);
        assert_eq!(s.outcome(), Some(&SessionOutcome::NoDataReceived));

        h.clock.advance(Duration::from_secs(5));
        h.state.poll_timers();
        assert!(h.state.session().is_none());
    }

    #[test]
    fn cancel_discards_immediately_and_stops() {
        let mut h = harness();
        h.state.ensure().unwrap();
        h.state.start_session().unwrap();
        done(&mut h, CallKind::Start, Ok(()));
        h.state.take_outbox();
        h.state.cancel_session().unwrap();
        assert!(h.state.session().is_none());
        assert_eq!(calls(&h.state.take_outbox()), vec![CallKind::Stop]);
        assert!(matches!(
            h.state.cancel_session(),
            Err(MonitorError::NoActiveSession(_))
        ));
    }

    #[test]
    fn teardown_releases_handle_and_stops_session() {
        let mut h = harness();
        h.state.ensure().unwrap();
        h.state.start_session().unwrap();
        h.state.take_outbox();
        h.state.teardown();
        assert_eq!(h.channel.live_count("pool/poolA"), 0);
        assert_eq!(h.state.connection().status(), ConnectionStatus::Idle);
        assert_eq!(calls(&h.state.take_outbox()), vec![CallKind::Stop]);
    }

    #[test]
    fn cancel_during_stop_does_not_stop_twice() {
        let mut h = harness();
        h.state.ensure().unwrap();
        h.state.start_session().unwrap();
        done(&mut h, CallKind::Start, Ok(()));
        h.state.take_outbox();
        h.clock.advance(Duration::from_secs(30));
        h.state.poll_timers();
        assert_eq!(calls(&h.state.take_outbox()), vec![CallKind::Stop]);

        h.state.cancel_session().unwrap();
        assert!(h.state.session().is_none());
        assert!(h.state.take_outbox().is_empty());
    }

    #[test]
    fn teardown_during_stop_does_not_stop_twice() {
        let mut h = harness();
        h.state.ensure().unwrap();
        h.state.start_session().unwrap();
        done(&mut h, CallKind::Start, Ok(()));
        h.clock.advance(Duration::from_secs(30));
        h.state.poll_timers();
        assert_eq!(
            calls(&h.state.take_outbox()),
            vec![CallKind::Start, CallKind::Stop]
        );

        h.state.teardown();
        assert!(h.state.take_outbox().is_empty());
        assert_eq!(h.channel.live_count("pool/poolA"), 0);
    }

    #[test]
    fn subscribe_failure_returns_error_and_allows_retry() {
        let mut h = harness();
        h.channel.fail_next_subscribes(1);
        let err = h.state.ensure().unwrap_err();
        assert!(matches!(err, MonitorError::Subscribe { .. }));
        assert_eq!(h.state.connection().status(), ConnectionStatus::Error);
        h.state.ensure().unwrap();
        assert_eq!(h.state.connection().status(), ConnectionStatus::Connecting);
        assert_eq!(h.channel.live_count("pool/poolA"), 1);
    }
}
