//! Read path: per-device views published by device workers and the
//! aggregated `StatusSnapshot` handed to displays.

use crate::session::SessionView;
use crate::types::{ConnectionStatus, SessionStatus};
use poolwatch_traits::DeviceId;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Read-only copy of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionView {
    pub status: ConnectionStatus,
    pub last_message_at: Option<Instant>,
    pub messages: u64,
}

/// Everything known about one device, as last published by its worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceView {
    pub connection: ConnectionView,
    pub session: Option<SessionView>,
}

/// Derived status for display; never authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub device: DeviceId,
    pub connection: ConnectionStatus,
    pub session: Option<SessionStatus>,
}

/// Combine a connection status and an optional session into a snapshot.
pub fn aggregate(
    device: &DeviceId,
    connection: ConnectionStatus,
    session: Option<&SessionView>,
) -> StatusSnapshot {
    StatusSnapshot {
        device: device.clone(),
        connection,
        session: session.map(|s| s.status),
    }
}

impl DeviceView {
    pub fn snapshot(&self, device: &DeviceId) -> StatusSnapshot {
        aggregate(device, self.connection.status, self.session.as_ref())
    }
}

/// Single-writer cell: only the owning device worker stores into it.
#[derive(Debug, Clone, Default)]
pub(crate) struct ViewCell(Arc<RwLock<DeviceView>>);

impl ViewCell {
    pub(crate) fn load(&self) -> DeviceView {
        match self.0.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn store(&self, view: DeviceView) {
        match self.0.write() {
            Ok(mut g) => *g = view,
            Err(poisoned) => *poisoned.into_inner() = view,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionOutcome;

    #[test]
    fn aggregate_without_session() {
        let snap = aggregate(&DeviceId::new("p1"), ConnectionStatus::Connected, None);
        assert_eq!(snap.connection, ConnectionStatus::Connected);
        assert_eq!(snap.session, None);
    }

    #[test]
    fn aggregate_with_session() {
        let view = SessionView {
            id: 3,
            status: SessionStatus::Completed,
            started_at: Instant::now(),
            last_sample_at: None,
            error: None,
            samples_saved: 0,
            outcome: Some(SessionOutcome::NoDataReceived),
        };
        let snap = aggregate(
            &DeviceId::new("p1"),
            ConnectionStatus::Disconnected,
            Some(&view),
        );
        assert_eq!(snap.session, Some(SessionStatus::Completed));
        assert_eq!(snap.connection, ConnectionStatus::Disconnected);
    }

    #[test]
    fn empty_cell_reads_idle() {
        let cell = ViewCell::default();
        let v = cell.load();
        assert_eq!(v.connection.status, ConnectionStatus::Idle);
        assert!(v.session.is_none());
    }
}
