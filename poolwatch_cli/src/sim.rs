//! Simulated telemetry bus and recording service.
//!
//! Every subscription gets its own feed thread that publishes a synthetic
//! water reading each tick until it is unsubscribed. Topics marked silent
//! accept the subscription but never publish.

use crossbeam_channel as xch;
use poolwatch_traits::{
    BoxError, Delivery, DeliveryHandler, DeviceId, RecordingService, SubscriptionHandle,
    TelemetryChannel, TelemetrySample,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Feed {
    // Dropping the sender stops the feed thread.
    stop: Option<xch::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl Feed {
    fn stop(mut self) {
        self.stop.take();
        if let Some(j) = self.join.take()
            && j.join().is_err()
        {
            tracing::warn!("feed thread panicked");
        }
    }
}

pub struct SimChannel {
    tick: Duration,
    silent: HashSet<String>,
    next: AtomicU64,
    feeds: Mutex<HashMap<u64, Feed>>,
}

impl SimChannel {
    pub fn new(tick: Duration, silent_topics: impl IntoIterator<Item = String>) -> Self {
        Self {
            tick,
            silent: silent_topics.into_iter().collect(),
            next: AtomicU64::new(0),
            feeds: Mutex::new(HashMap::new()),
        }
    }
}

/// Slowly drifting pH and free chlorine, as a small JSON object.
fn reading(topic: &str, seq: u64) -> TelemetrySample {
    let phase = (seq % 40) as f64 / 40.0 * std::f64::consts::TAU;
    let ph = 7.4 + 0.15 * phase.sin();
    let chlorine = 1.5 + 0.3 * phase.cos();
    let payload = serde_json::json!({ "seq": seq, "ph": ph, "chlorine_ppm": chlorine });
    TelemetrySample::new(topic, payload.to_string())
}

impl TelemetryChannel for SimChannel {
    fn subscribe(
        &self,
        topic: &str,
        handler: DeliveryHandler,
    ) -> Result<SubscriptionHandle, BoxError> {
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let (stop_tx, stop_rx) = xch::bounded::<()>(0);
        let join = if self.silent.contains(topic) {
            tracing::debug!(topic, "silent feed");
            None
        } else {
            let tick = self.tick;
            let topic = topic.to_string();
            let j = std::thread::Builder::new()
                .name(format!("feed-{id}"))
                .spawn(move || {
                    let mut seq = 0u64;
                    loop {
                        match stop_rx.recv_timeout(tick) {
                            Err(xch::RecvTimeoutError::Timeout) => {
                                seq += 1;
                                handler(Delivery::Sample(reading(&topic, seq)));
                            }
                            _ => break,
                        }
                    }
                })?;
            Some(j)
        };
        lock(&self.feeds).insert(
            id,
            Feed {
                stop: Some(stop_tx),
                join,
            },
        );
        Ok(SubscriptionHandle(id))
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BoxError> {
        let feed = lock(&self.feeds).remove(&handle.0);
        match feed {
            Some(f) => {
                f.stop();
                Ok(())
            }
            None => Err(format!("unknown subscription {}", handle.0).into()),
        }
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        let feeds: Vec<Feed> = lock(&self.feeds).drain().map(|(_, f)| f).collect();
        for f in feeds {
            f.stop();
        }
    }
}

/// Recording service that answers after a fixed latency.
pub struct SimRecorder {
    latency: Duration,
    fail_every: Option<u32>,
    saves: AtomicU64,
}

impl SimRecorder {
    pub fn new(latency: Duration, fail_every: Option<u32>) -> Self {
        Self {
            latency,
            fail_every,
            saves: AtomicU64::new(0),
        }
    }

    pub fn save_attempts(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }
}

impl RecordingService for SimRecorder {
    fn start_recording(&self, device: &DeviceId) -> Result<(), BoxError> {
        std::thread::sleep(self.latency);
        tracing::info!(device = %device, "recording started");
        Ok(())
    }

    fn stop_recording(&self, device: &DeviceId) -> Result<(), BoxError> {
        std::thread::sleep(self.latency);
        tracing::info!(device = %device, "recording stopped");
        Ok(())
    }

    fn save_sample(&self, device: &DeviceId, sample: &TelemetrySample) -> Result<(), BoxError> {
        std::thread::sleep(self.latency);
        let n = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(every) = self.fail_every
            && n % u64::from(every) == 0
        {
            return Err(format!("save #{n} rejected").into());
        }
        tracing::debug!(device = %device, bytes = sample.payload.len(), "sample saved");
        Ok(())
    }
}
