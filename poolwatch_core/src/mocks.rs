//! In-memory collaborators for tests, benches and the simulator.
//!
//! `MockChannel` keeps subscriptions in a table and delivers whatever is
//! `publish`ed to every live handler on that topic, on the caller's thread.
//! `MockRecorder` logs every call attempt and can be told to fail or stall.

use poolwatch_traits::{
    BoxError, Delivery, DeliveryHandler, DeviceId, RecordingService, SubscriptionHandle,
    TelemetryChannel, TelemetrySample,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

type SharedHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

#[derive(Default)]
struct ChannelState {
    live: HashMap<u64, (String, SharedHandler)>,
    subscribes: HashMap<String, usize>,
    unsubscribes: usize,
}

/// Cloning shares the same subscription table.
#[derive(Clone, Default)]
pub struct MockChannel {
    state: Arc<Mutex<ChannelState>>,
    next_handle: Arc<AtomicU64>,
    fail_subscribes: Arc<AtomicUsize>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a sample to every live subscriber of `topic`; returns how many
    /// handlers were called.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let sample = TelemetrySample::new(topic, payload);
        self.deliver(topic, &Delivery::Sample(sample))
    }

    pub fn transport_error(&self, topic: &str, reason: &str) -> usize {
        self.deliver(topic, &Delivery::TransportError(reason.to_string()))
    }

    fn deliver(&self, topic: &str, delivery: &Delivery) -> usize {
        // Handlers run outside the lock so they may subscribe or unsubscribe.
        let handlers: Vec<SharedHandler> = lock(&self.state)
            .live
            .values()
            .filter(|(t, _)| t == topic)
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for h in &handlers {
            h(delivery.clone());
        }
        handlers.len()
    }

    /// Make the next `n` subscribe calls fail.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.fail_subscribes.store(n, Ordering::SeqCst);
    }

    /// Live handles on `topic`.
    pub fn live_count(&self, topic: &str) -> usize {
        lock(&self.state)
            .live
            .values()
            .filter(|(t, _)| t == topic)
            .count()
    }

    pub fn total_live(&self) -> usize {
        lock(&self.state).live.len()
    }

    /// Successful subscribe calls on `topic` so far.
    pub fn subscribe_count(&self, topic: &str) -> usize {
        lock(&self.state)
            .subscribes
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    pub fn unsubscribe_count(&self) -> usize {
        lock(&self.state).unsubscribes
    }
}

impl TelemetryChannel for MockChannel {
    fn subscribe(
        &self,
        topic: &str,
        handler: DeliveryHandler,
    ) -> Result<SubscriptionHandle, BoxError> {
        let failing = self
            .fail_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(format!("subscribe to {topic} refused").into());
        }
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        let mut st = lock(&self.state);
        st.live.insert(id, (topic.to_string(), Arc::from(handler)));
        *st.subscribes.entry(topic.to_string()).or_default() += 1;
        Ok(SubscriptionHandle(id))
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BoxError> {
        let mut st = lock(&self.state);
        match st.live.remove(&handle.0) {
            Some(_) => {
                st.unsubscribes += 1;
                Ok(())
            }
            None => Err(format!("unknown subscription handle {}", handle.0).into()),
        }
    }
}

/// One attempted recording-service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderCall {
    Start(DeviceId),
    Save(DeviceId, TelemetrySample),
    Stop(DeviceId),
}

#[derive(Clone, Default)]
pub struct MockRecorder {
    calls: Arc<Mutex<Vec<RecorderCall>>>,
    fail_start: Arc<AtomicBool>,
    fail_stop: Arc<AtomicBool>,
    /// 1-based index of the save call that fails; 0 disables.
    fail_save_number: Arc<AtomicUsize>,
    saves_seen: Arc<AtomicUsize>,
    delay_ms: Arc<AtomicU64>,
}

impl MockRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Fail the `n`th save call (counted across all devices, 1-based).
    pub fn fail_save_number(&self, n: usize) {
        self.fail_save_number.store(n, Ordering::SeqCst);
    }

    /// Stall every call by `d` before answering.
    pub fn set_delay(&self, d: Duration) {
        let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RecorderCall> {
        lock(&self.calls).clone()
    }

    pub fn starts(&self, device: &DeviceId) -> usize {
        self.count(|c| matches!(c, RecorderCall::Start(d) if d == device))
    }

    pub fn stops(&self, device: &DeviceId) -> usize {
        self.count(|c| matches!(c, RecorderCall::Stop(d) if d == device))
    }

    /// Payloads of every attempted save for `device`, in call order.
    pub fn saves(&self, device: &DeviceId) -> Vec<Vec<u8>> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                RecorderCall::Save(d, s) if d == device => Some(s.payload.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, f: impl Fn(&RecorderCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| f(c)).count()
    }

    fn record(&self, call: RecorderCall) {
        lock(&self.calls).push(call);
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}

impl RecordingService for MockRecorder {
    fn start_recording(&self, device: &DeviceId) -> Result<(), BoxError> {
        self.record(RecorderCall::Start(device.clone()));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(format!("start recording refused for {device}").into());
        }
        Ok(())
    }

    fn stop_recording(&self, device: &DeviceId) -> Result<(), BoxError> {
        self.record(RecorderCall::Stop(device.clone()));
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(format!("stop recording refused for {device}").into());
        }
        Ok(())
    }

    fn save_sample(&self, device: &DeviceId, sample: &TelemetrySample) -> Result<(), BoxError> {
        self.record(RecorderCall::Save(device.clone(), sample.clone()));
        let n = self.saves_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_save_number.load(Ordering::SeqCst) {
            return Err(format!("save #{n} rejected").into());
        }
        Ok(())
    }
}
