//! Device worker thread.
//!
//! Spawns one thread per device that owns the device's `DeviceState` and
//! processes its events in arrival order, waking up early for the nearest
//! timer deadline. A second, per-device lane thread runs recording calls.
//!
//! Safety: each `DeviceWorker` spawns exactly one event thread, which is shut
//! down and joined when the worker is dropped, preventing thread leaks.
use crate::device::{DeviceContext, DeviceEvent, DeviceState};
use crate::error::MonitorError;
use crate::lane::RecordingLane;
use crate::status::ViewCell;
use crossbeam_channel as xch;
use poolwatch_traits::DeviceId;
use std::time::Duration;

pub(crate) struct DeviceWorker {
    device: DeviceId,
    tx: xch::Sender<DeviceEvent>,
    /// Join handle for graceful thread cleanup
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl DeviceWorker {
    pub(crate) fn spawn(
        device: DeviceId,
        topic: String,
        ctx: DeviceContext,
        view: ViewCell,
    ) -> Result<Self, MonitorError> {
        let (tx, rx) = xch::unbounded::<DeviceEvent>();
        let lane = RecordingLane::spawn(device.clone(), ctx.recorder.clone(), tx.clone())
            .map_err(|_| MonitorError::WorkerGone(device.clone()))?;
        let drain = ctx.timings.drain_timeout;
        let state = DeviceState::new(device.clone(), topic, ctx, tx.clone(), view);

        let join_handle = std::thread::Builder::new()
            .name(format!("device-{device}"))
            .spawn(move || run(state, &rx, &lane, drain))
            .map_err(|_| MonitorError::WorkerGone(device.clone()))?;

        Ok(Self {
            device,
            tx,
            join_handle: Some(join_handle),
        })
    }

    /// Send a request built around a fresh reply channel; the caller waits on
    /// the returned receiver.
    pub(crate) fn request<T>(
        &self,
        make: impl FnOnce(xch::Sender<Result<T, MonitorError>>) -> DeviceEvent,
    ) -> Result<xch::Receiver<Result<T, MonitorError>>, MonitorError> {
        let (reply, rx) = xch::bounded(1);
        self.tx
            .send(make(reply))
            .map_err(|_| MonitorError::WorkerGone(self.device.clone()))?;
        Ok(rx)
    }

    pub(crate) fn signal_shutdown(&self) {
        let _ = self.tx.send(DeviceEvent::Shutdown);
    }

    /// Signal shutdown and wait for the thread to release its subscription.
    pub(crate) fn shutdown(mut self) {
        self.signal_shutdown();
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => {
                    tracing::trace!(device = %self.device, "device worker joined");
                }
                Err(e) => {
                    // Thread panicked; log but don't propagate (may be in Drop)
                    tracing::warn!(device = %self.device, ?e, "device worker panicked during shutdown");
                }
            }
        }
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        if self.join_handle.is_some() {
            self.signal_shutdown();
            self.join();
        }
    }
}

fn run(
    mut state: DeviceState,
    rx: &xch::Receiver<DeviceEvent>,
    lane: &RecordingLane,
    drain: Duration,
) {
    loop {
        state.poll_timers();
        lane.submit_all(state.take_outbox());
        state.publish();

        let event = match state.next_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(state.now());
                match rx.recv_timeout(wait) {
                    Ok(ev) => ev,
                    Err(xch::RecvTimeoutError::Timeout) => continue,
                    Err(xch::RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(ev) => ev,
                Err(_) => break,
            },
        };

        if matches!(event, DeviceEvent::Shutdown) {
            drain_queue(&mut state, rx, lane, drain);
            break;
        }
        // A sample queued behind an elapsed session deadline must see the timeout first.
        state.poll_timers();
        state.handle(event);
    }

    state.teardown();
    lane.submit_all(state.take_outbox());
    state.publish();
    tracing::trace!("device worker exiting cleanly");
}

/// Process what is already queued, bounded by `drain`. New requests are refused.
fn drain_queue(
    state: &mut DeviceState,
    rx: &xch::Receiver<DeviceEvent>,
    lane: &RecordingLane,
    drain: Duration,
) {
    let start = state.now();
    while state.now().saturating_duration_since(start) < drain {
        let Ok(event) = rx.try_recv() else {
            break;
        };
        match event {
            DeviceEvent::Shutdown => {}
            DeviceEvent::Ensure { reply } | DeviceEvent::CancelSession { reply } => {
                let _ = reply.send(Err(MonitorError::ShutDown));
            }
            DeviceEvent::StartSession { reply } => {
                let _ = reply.send(Err(MonitorError::ShutDown));
            }
            other => {
                state.poll_timers();
                state.handle(other);
                lane.submit_all(state.take_outbox());
            }
        }
    }
}
