//! Test session state machine.
//!
//! ```text
//! (none) --start--> Recording --recording started--> WaitingForData
//! Recording --start failed / timed out--> Failed
//! WaitingForData --sample saved--> DataReceived
//! WaitingForData/DataReceived --session timeout, stop returned--> Completed
//! Completed/Failed --grace elapsed--> (removed)
//! ```
//!
//! The session timer is measured from `start`. When it fires the session
//! stops accepting samples and a stop-recording call is issued; the session
//! becomes `Completed` once that call returns (or its own bound elapses), so
//! saves queued ahead of the stop are still accounted for.
//!
//! Two kinds of instants flow in: `stamp` values from the injected clock end
//! up in the view, `now` values from real time drive the timers.

use crate::config::Timings;
use crate::timer::{OneShot, earliest};
use crate::types::{SessionOutcome, SessionStatus};
use poolwatch_traits::DeviceId;
use std::time::Instant;

/// Read-only copy of a session for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub id: u64,
    pub status: SessionStatus,
    pub started_at: Instant,
    pub last_sample_at: Option<Instant>,
    pub error: Option<String>,
    pub samples_saved: u32,
    pub outcome: Option<SessionOutcome>,
}

/// What a timer poll asks the owner to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Status changed; publish.
    Changed,
    /// Session timeout fired; issue stop-recording.
    IssueStop,
    /// Grace period over; drop the session.
    Expired,
}

/// Result of a successful `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancelled {
    /// No stop-recording has been issued yet; the owner issues one.
    IssueStop,
    /// The session timeout already issued the stop.
    StopInFlight,
}

#[derive(Debug)]
pub struct TestSession {
    id: u64,
    device: DeviceId,
    status: SessionStatus,
    started_at: Instant,
    /// Real-time start; the session timer counts from here.
    begun: Instant,
    last_sample_at: Option<Instant>,
    error: Option<String>,
    samples_saved: u32,
    outcome: Option<SessionOutcome>,
    stopping: bool,
    session_timer: OneShot,
    call_timer: OneShot,
    grace_timer: OneShot,
}

impl TestSession {
    /// New session in `Recording`; the start-recording call is bounded by
    /// `remote_call_timeout`.
    pub fn start(
        id: u64,
        device: DeviceId,
        stamp: Instant,
        now: Instant,
        timings: &Timings,
    ) -> Self {
        let mut call_timer = OneShot::default();
        call_timer.arm(now, timings.remote_call_timeout);
        Self {
            id,
            device,
            status: SessionStatus::Recording,
            started_at: stamp,
            begun: now,
            last_sample_at: None,
            error: None,
            samples_saved: 0,
            outcome: None,
            stopping: false,
            session_timer: OneShot::default(),
            call_timer,
            grace_timer: OneShot::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn last_sample_at(&self) -> Option<Instant> {
        self.last_sample_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Whether an incoming sample should be saved against this session.
    pub fn accepts_samples(&self) -> bool {
        !self.stopping
            && matches!(
                self.status,
                SessionStatus::WaitingForData | SessionStatus::DataReceived
            )
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.session_timer.deadline(),
            self.call_timer.deadline(),
            self.grace_timer.deadline(),
        ])
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id,
            status: self.status,
            started_at: self.started_at,
            last_sample_at: self.last_sample_at,
            error: self.error.clone(),
            samples_saved: self.samples_saved,
            outcome: self.outcome.clone(),
        }
    }

    /// Start-recording returned ok. Returns whether the status changed.
    pub fn on_recording_started(&mut self, timings: &Timings) -> bool {
        if self.status != SessionStatus::Recording {
            return false;
        }
        self.call_timer.cancel();
        self.status = SessionStatus::WaitingForData;
        // Measured from start, not from when recording began.
        self.session_timer.arm(self.begun, timings.session_timeout);
        true
    }

    /// Start-recording failed. Terminal; no session timer is armed.
    pub fn on_recording_failed(&mut self, reason: String, now: Instant, timings: &Timings) -> bool {
        if self.status != SessionStatus::Recording {
            return false;
        }
        self.fail(reason, now, timings);
        true
    }

    /// A save returned ok. Saves queued before the session timeout still count.
    pub fn on_sample_saved(&mut self, stamp: Instant) -> bool {
        if !matches!(
            self.status,
            SessionStatus::WaitingForData | SessionStatus::DataReceived
        ) {
            return false;
        }
        self.samples_saved = self.samples_saved.saturating_add(1);
        self.last_sample_at = Some(stamp);
        let changed = self.status != SessionStatus::DataReceived;
        self.status = SessionStatus::DataReceived;
        changed
    }

    /// A save failed. Recorded for display; the session keeps going.
    pub fn on_save_failed(&mut self, reason: String) {
        if self.status.is_active() {
            self.error = Some(reason);
        }
    }

    /// Stop-recording returned. A failed stop is recorded but still completes.
    pub fn on_recording_stopped(
        &mut self,
        result: Result<(), String>,
        now: Instant,
        timings: &Timings,
    ) -> bool {
        if !self.stopping || self.status.is_terminal() {
            return false;
        }
        self.complete(result.err(), now, timings);
        true
    }

    /// Poll the session's timers. Call repeatedly until it returns `None`.
    pub fn poll(&mut self, now: Instant, timings: &Timings) -> Option<TimerAction> {
        if self.grace_timer.fire(now) {
            return Some(TimerAction::Expired);
        }
        if self.call_timer.fire(now) {
            if self.status == SessionStatus::Recording {
                self.fail("start recording timed out".to_string(), now, timings);
                return Some(TimerAction::Changed);
            }
            if self.stopping && !self.status.is_terminal() {
                self.complete(Some("stop recording timed out".to_string()), now, timings);
                return Some(TimerAction::Changed);
            }
        }
        if self.session_timer.fire(now) && self.accepts_samples() {
            self.stopping = true;
            self.call_timer.arm(now, timings.remote_call_timeout);
            return Some(TimerAction::IssueStop);
        }
        None
    }

    /// Abort an active session. `None` when there was nothing to cancel.
    /// Stop-recording is issued at most once across timeout and cancel.
    pub fn cancel(&mut self) -> Option<Cancelled> {
        if !self.status.is_active() {
            return None;
        }
        let action = if self.stopping {
            Cancelled::StopInFlight
        } else {
            Cancelled::IssueStop
        };
        self.session_timer.cancel();
        self.call_timer.cancel();
        self.grace_timer.cancel();
        self.stopping = true;
        self.outcome = Some(SessionOutcome::Cancelled);
        Some(action)
    }

    fn fail(&mut self, reason: String, now: Instant, timings: &Timings) {
        self.session_timer.cancel();
        self.call_timer.cancel();
        self.status = SessionStatus::Failed;
        self.outcome = Some(SessionOutcome::Failed(reason.clone()));
        self.error = Some(reason);
        self.grace_timer.arm(now, timings.grace_period);
    }

    fn complete(&mut self, stop_error: Option<String>, now: Instant, timings: &Timings) {
        self.call_timer.cancel();
        self.session_timer.cancel();
        self.status = SessionStatus::Completed;
        self.outcome = Some(if self.last_sample_at.is_some() {
            SessionOutcome::DataSaved {
                samples: self.samples_saved,
            }
        } else {
            SessionOutcome::NoDataReceived
        });
        if let Some(e) = stop_error {
            self.error = Some(e);
        }
        self.grace_timer.arm(now, timings.grace_period);
    }
}
