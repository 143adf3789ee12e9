//! Per-device FIFO executor for recording-service calls.
//!
//! Remote calls may block for a long time, so they never run on the device
//! worker. Each device gets one lane thread that executes calls strictly in
//! submission order (start, saves, stop) and reports every completion back to
//! the worker as an ordinary event.
//!
//! Dropping the lane closes its queue without joining: calls already queued
//! (e.g. a best-effort stop issued during teardown) still run, then the thread
//! exits.
use crate::device::DeviceEvent;
use crossbeam_channel as xch;
use poolwatch_traits::{DeviceId, RecordingService, TelemetrySample};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Start,
    Save,
    Stop,
}

#[derive(Debug, Clone)]
pub(crate) enum RemoteCall {
    Start,
    Save(TelemetrySample),
    Stop,
}

impl RemoteCall {
    pub(crate) fn kind(&self) -> CallKind {
        match self {
            Self::Start => CallKind::Start,
            Self::Save(_) => CallKind::Save,
            Self::Stop => CallKind::Stop,
        }
    }
}

/// A call tagged with the session it belongs to.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub(crate) session: u64,
    pub(crate) call: RemoteCall,
}

pub(crate) struct RecordingLane {
    tx: Option<xch::Sender<Job>>,
}

impl RecordingLane {
    pub(crate) fn spawn(
        device: DeviceId,
        service: Arc<dyn RecordingService>,
        completions: xch::Sender<DeviceEvent>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = xch::unbounded::<Job>();
        std::thread::Builder::new()
            .name(format!("lane-{device}"))
            .spawn(move || {
                for job in rx {
                    let kind = job.call.kind();
                    let result = match &job.call {
                        RemoteCall::Start => service.start_recording(&device),
                        RemoteCall::Save(sample) => service.save_sample(&device, sample),
                        RemoteCall::Stop => service.stop_recording(&device),
                    }
                    .map_err(|e| e.to_string());
                    if let Err(e) = &result {
                        tracing::debug!(device = %device, call = ?kind, error = %e, "recording call failed");
                    }
                    // The worker may already be gone (teardown); the call still ran.
                    let _ = completions.send(DeviceEvent::CallDone {
                        session: job.session,
                        call: kind,
                        result,
                    });
                }
                tracing::trace!(device = %device, "recording lane exiting");
            })?;
        Ok(Self { tx: Some(tx) })
    }

    pub(crate) fn submit(&self, job: Job) {
        if let Some(tx) = &self.tx
            && tx.send(job).is_err()
        {
            tracing::warn!("recording lane closed; call dropped");
        }
    }

    pub(crate) fn submit_all(&self, jobs: Vec<Job>) {
        for job in jobs {
            self.submit(job);
        }
    }
}

impl Drop for RecordingLane {
    fn drop(&mut self) {
        // Closing the queue lets the thread finish outstanding calls and exit.
        self.tx.take();
    }
}
