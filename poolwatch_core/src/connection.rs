//! Per-device connection state machine.
//!
//! ```text
//! Idle --begin--> Connecting --message--> Connected
//! Connecting --connect timeout--> Disconnected
//! Connected/Connecting/Disconnected --transport error--> Error
//! Disconnected/Error --begin--> Connecting
//! ```
//!
//! Any message re-asserts `Connected` from every state except `Idle`. The
//! connect timeout only downgrades what is displayed; it never closes the
//! subscription.

use crate::timer::OneShot;
use crate::types::ConnectionStatus;
use poolwatch_traits::{DeviceId, SubscriptionHandle};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Connection {
    device: DeviceId,
    status: ConnectionStatus,
    last_message_at: Option<Instant>,
    messages: u64,
    handle: Option<SubscriptionHandle>,
    connect_timer: OneShot,
}

impl Connection {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            status: ConnectionStatus::Idle,
            last_message_at: None,
            messages: 0,
            handle: None,
            connect_timer: OneShot::default(),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn last_message_at(&self) -> Option<Instant> {
        self.last_message_at
    }

    pub fn messages(&self) -> u64 {
        self.messages
    }

    pub fn handle(&self) -> Option<SubscriptionHandle> {
        self.handle
    }

    pub fn connect_deadline(&self) -> Option<Instant> {
        self.connect_timer.deadline()
    }

    /// Whether an ensure request must (re)subscribe. Connecting and Connected
    /// subscriptions are reused as-is.
    pub fn needs_subscribe(&self) -> bool {
        matches!(
            self.status,
            ConnectionStatus::Idle | ConnectionStatus::Disconnected | ConnectionStatus::Error
        )
    }

    /// Take the current handle so it can be released before subscribing again.
    pub fn take_handle(&mut self) -> Option<SubscriptionHandle> {
        self.handle.take()
    }

    /// A fresh subscription was opened: enter Connecting and arm the connect timeout.
    ///
    /// The previous handle, if any, must have been taken and released first.
    pub fn subscribed(&mut self, handle: SubscriptionHandle, now: Instant, connect_timeout: Duration) {
        debug_assert!(self.handle.is_none(), "old handle must be released first");
        self.handle = Some(handle);
        self.status = ConnectionStatus::Connecting;
        self.connect_timer.arm(now, connect_timeout);
    }

    /// Synchronous subscribe failure.
    pub fn subscribe_failed(&mut self) {
        self.connect_timer.cancel();
        self.status = ConnectionStatus::Error;
    }

    /// A message arrived. Returns whether the status changed.
    pub fn on_message(&mut self, now: Instant) -> bool {
        if self.status == ConnectionStatus::Idle {
            return false;
        }
        self.connect_timer.cancel();
        self.last_message_at = Some(now);
        self.messages = self.messages.saturating_add(1);
        let changed = self.status != ConnectionStatus::Connected;
        self.status = ConnectionStatus::Connected;
        changed
    }

    /// Poll the connect timeout. Returns whether the status changed.
    pub fn poll_connect_timeout(&mut self, now: Instant) -> bool {
        if !self.connect_timer.fire(now) {
            return false;
        }
        if self.status == ConnectionStatus::Connecting {
            self.status = ConnectionStatus::Disconnected;
            true
        } else {
            false
        }
    }

    /// Asynchronous transport failure. Returns whether the status changed.
    pub fn on_transport_error(&mut self) -> bool {
        if matches!(self.status, ConnectionStatus::Idle | ConnectionStatus::Error) {
            return false;
        }
        self.connect_timer.cancel();
        self.status = ConnectionStatus::Error;
        true
    }

    /// Back to Idle; returns the handle that must be released.
    pub fn reset(&mut self) -> Option<SubscriptionHandle> {
        self.connect_timer.cancel();
        self.status = ConnectionStatus::Idle;
        self.handle.take()
    }
}
