//! Subscription registry: exactly one device worker, and therefore at most one
//! live subscription handle, per device.
//!
//! The map is sharded (`DashMap`) and only guards slot lookup; each slot has
//! its own lock that serializes creating and retiring that device's worker.
//! Status reads go straight to the slot's view and never wait on either.

use crate::config::TopicScheme;
use crate::device::{DeviceContext, DeviceEvent};
use crate::error::{MonitorError, Result};
use crate::status::{ConnectionView, DeviceView, ViewCell};
use crate::types::{ConnectionStatus, Device};
use crate::worker::DeviceWorker;
use crossbeam_channel as xch;
use dashmap::DashMap;
use poolwatch_traits::DeviceId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct SlotInner {
    worker: Option<DeviceWorker>,
    /// Set once the slot has been removed from the map; a new slot must be made.
    retired: bool,
}

#[derive(Default)]
struct DeviceSlot {
    view: ViewCell,
    inner: Mutex<SlotInner>,
}

impl DeviceSlot {
    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct RegistryInner {
    ctx: DeviceContext,
    topics: TopicScheme,
    slots: DashMap<DeviceId, Arc<DeviceSlot>>,
    closed: AtomicBool,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            if let Some(w) = slot.lock().worker.as_ref() {
                w.signal_shutdown();
            }
        }
        // Dropping the slots joins the workers.
    }
}

/// Cloning shares the same registry.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.inner.topics)
            .field("devices", &self.inner.slots.len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl SubscriptionRegistry {
    pub(crate) fn new(ctx: DeviceContext, topics: TopicScheme) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                topics,
                slots: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.inner.topics
    }

    /// Open a subscription for `device` on `<prefix>/<device id>` unless one is
    /// already Connecting or Connected. Disconnected and Error connections
    /// release their old handle and subscribe again.
    pub fn ensure(&self, device: &DeviceId) -> Result<()> {
        let topic = self.inner.topics.topic_for(device);
        self.ensure_topic(device, topic)
    }

    /// Like `ensure`, using the device's own topic key.
    pub fn ensure_device(&self, device: &Device) -> Result<()> {
        let topic = self.inner.topics.topic_for_key(&device.topic_key);
        self.ensure_topic(&device.id, topic)
    }

    fn ensure_topic(&self, device: &DeviceId, topic: String) -> Result<()> {
        let rx = self.with_worker(device, Some(topic), |w| {
            w.request(|reply| DeviceEvent::Ensure { reply })
        })?;
        rx.recv()
            .map_err(|_| MonitorError::WorkerGone(device.clone()))??;
        Ok(())
    }

    /// Unsubscribe and forget the device. Idempotent.
    pub fn release(&self, device: &DeviceId) {
        let Some(slot) = self.inner.slots.get(device).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let worker = {
            let mut inner = slot.lock();
            inner.retired = true;
            self.inner
                .slots
                .remove_if(device, |_, s| Arc::ptr_eq(s, &slot));
            inner.worker.take()
        };
        if let Some(worker) = worker {
            worker.shutdown();
            tracing::info!(device = %device, "released");
        }
    }

    /// Current connection status; `Idle` for unknown or released devices.
    pub fn status_of(&self, device: &DeviceId) -> ConnectionStatus {
        self.connection_of(device)
            .map(|c| c.status)
            .unwrap_or(ConnectionStatus::Idle)
    }

    pub fn connection_of(&self, device: &DeviceId) -> Option<ConnectionView> {
        self.view_of(device).map(|v| v.connection)
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.inner.slots.contains_key(device)
    }

    /// Known device ids, sorted.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.inner.slots.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Ensure every listed device and release every other one. All devices
    /// are attempted; the first ensure error is returned.
    pub fn sync_devices(&self, devices: &[Device]) -> Result<()> {
        let wanted: HashSet<&DeviceId> = devices.iter().map(|d| &d.id).collect();
        for id in self.devices() {
            if !wanted.contains(&id) {
                self.release(&id);
            }
        }
        let mut first_err = None;
        for d in devices {
            if let Err(e) = self.ensure_device(d) {
                tracing::warn!(device = %d.id, error = %e, "ensure failed during sync");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Release every device. Workers are signalled together and then joined,
    /// each draining its queue within the configured bound. Later calls to
    /// `ensure` fail with `MonitorError::ShutDown`.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slots: Vec<(DeviceId, Arc<DeviceSlot>)> = self
            .inner
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut workers = Vec::with_capacity(slots.len());
        for (id, slot) in &slots {
            let mut inner = slot.lock();
            inner.retired = true;
            if let Some(w) = inner.worker.take() {
                w.signal_shutdown();
                workers.push(w);
            }
            drop(inner);
            self.inner.slots.remove(id);
        }
        let n = workers.len();
        for w in workers {
            w.shutdown();
        }
        tracing::info!(devices = n, "registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn view_of(&self, device: &DeviceId) -> Option<DeviceView> {
        self.inner.slots.get(device).map(|s| s.view.load())
    }

    pub(crate) fn views(&self) -> Vec<(DeviceId, DeviceView)> {
        let mut out: Vec<(DeviceId, DeviceView)> = self
            .inner
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().view.load()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Send a request to an existing device worker.
    pub(crate) fn request<T>(
        &self,
        device: &DeviceId,
        make: impl FnOnce(xch::Sender<std::result::Result<T, MonitorError>>) -> DeviceEvent,
    ) -> std::result::Result<xch::Receiver<std::result::Result<T, MonitorError>>, MonitorError>
    {
        self.with_worker(device, None, |w| w.request(make))
    }

    /// Run `f` against the device's worker under its slot lock. With a topic,
    /// a missing worker is spawned; without one, a missing device is an error.
    fn with_worker<R>(
        &self,
        device: &DeviceId,
        topic: Option<String>,
        f: impl FnOnce(&DeviceWorker) -> std::result::Result<R, MonitorError>,
    ) -> std::result::Result<R, MonitorError> {
        loop {
            if self.is_shut_down() {
                return Err(MonitorError::ShutDown);
            }
            let slot = match &topic {
                Some(_) => Arc::clone(self.inner.slots.entry(device.clone()).or_default().value()),
                None => match self.inner.slots.get(device) {
                    Some(s) => Arc::clone(s.value()),
                    None => return Err(MonitorError::UnknownDevice(device.clone())),
                },
            };
            let mut inner = slot.lock();
            if inner.retired {
                // Raced with release; retry against a fresh slot.
                continue;
            }
            if self.is_shut_down() {
                // Shutdown may have snapshotted the slots before this one was inserted.
                inner.retired = true;
                self.inner
                    .slots
                    .remove_if(device, |_, s| Arc::ptr_eq(s, &slot));
                return Err(MonitorError::ShutDown);
            }
            if inner.worker.is_none() {
                let Some(topic) = topic.clone() else {
                    return Err(MonitorError::UnknownDevice(device.clone()));
                };
                let worker = DeviceWorker::spawn(
                    device.clone(),
                    topic,
                    self.inner.ctx.clone(),
                    slot.view.clone(),
                )?;
                inner.worker = Some(worker);
            }
            return match inner.worker.as_ref() {
                Some(w) => f(w),
                None => Err(MonitorError::WorkerGone(device.clone())),
            };
        }
    }
}
