//! Test-session front end.
//!
//! Sessions live inside each device's worker so the "is a session active"
//! check, sample routing and the session timeout all happen on one thread.
//! This type only forwards requests and reads the published views.

use crate::device::DeviceEvent;
use crate::error::{MonitorError, Result};
use crate::registry::SubscriptionRegistry;
use crate::session::SessionView;
use poolwatch_traits::DeviceId;

#[derive(Debug, Clone)]
pub struct TestSessionOrchestrator {
    registry: SubscriptionRegistry,
}

impl TestSessionOrchestrator {
    pub fn new(registry: SubscriptionRegistry) -> Self {
        Self { registry }
    }

    /// Start a test session and return its id.
    ///
    /// A device without a Connection is ensured first. A failed subscribe is
    /// logged and the session starts anyway; recording does not depend on the
    /// subscription being healthy. Rejected with `MonitorError::SessionActive`
    /// while a session is Recording or WaitingForData.
    pub fn start(&self, device: &DeviceId) -> Result<u64> {
        if !self.registry.contains(device)
            && let Err(e) = self.registry.ensure(device)
        {
            match e.downcast_ref::<MonitorError>() {
                Some(MonitorError::Subscribe { .. }) => {
                    tracing::warn!(device = %device, error = %e, "starting session without subscription");
                }
                _ => return Err(e),
            }
        }
        let rx = self
            .registry
            .request(device, |reply| DeviceEvent::StartSession { reply })?;
        let id = rx
            .recv()
            .map_err(|_| MonitorError::WorkerGone(device.clone()))??;
        Ok(id)
    }

    /// Cancel the device's active session. The session is discarded at once
    /// and a best-effort stop is issued.
    pub fn cancel(&self, device: &DeviceId) -> Result<()> {
        let rx = match self
            .registry
            .request(device, |reply| DeviceEvent::CancelSession { reply })
        {
            Ok(rx) => rx,
            Err(MonitorError::UnknownDevice(d)) => {
                return Err(MonitorError::NoActiveSession(d).into());
            }
            Err(e) => return Err(e.into()),
        };
        rx.recv()
            .map_err(|_| MonitorError::WorkerGone(device.clone()))??;
        Ok(())
    }

    /// Current session for the device, including terminal sessions still in
    /// their grace period.
    pub fn session_of(&self, device: &DeviceId) -> Option<SessionView> {
        self.registry.view_of(device).and_then(|v| v.session)
    }

    /// Devices whose session is Recording, WaitingForData or DataReceived.
    pub fn active_sessions(&self) -> Vec<(DeviceId, SessionView)> {
        self.registry
            .views()
            .into_iter()
            .filter_map(|(id, v)| v.session.filter(|s| s.status.is_active()).map(|s| (id, s)))
            .collect()
    }
}
