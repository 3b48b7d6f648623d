//! In-memory transport for tests.
//!
//! `FakeTransport` is cheaply cloneable; clones share state, so a test can
//! keep one copy to script advertisements, push notifications and inspect
//! recorded calls while the gateway owns another.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::ble::transport::{
    DiscoveryStream, Link, NotificationSink, PeripheralHandle, ServiceFilter, Subscription,
    SubscriptionHandle, SubscriptionTarget, Transport,
};
use crate::ble::uuids::{FALL_CHARACTERISTIC_UUID, FALL_SERVICE_UUID};
use crate::error::{Error, Result};
use crate::protocol::RawNotification;

#[derive(Debug, Clone)]
struct Advertisement {
    handle: PeripheralHandle,
    services: Vec<Uuid>,
}

#[derive(Default)]
struct FakeState {
    advertisements: Vec<Advertisement>,
    discover_error: Option<String>,
    scan_error: Option<String>,
    scan_ends: bool,
    connect_error: Option<String>,
    gatt: Option<(Uuid, Uuid)>,
    subscribe_error: Option<String>,
    discover_delays: VecDeque<Duration>,
    connect_gate: Option<Arc<Notify>>,
    subscribe_gate: Option<Arc<Notify>>,
    disconnect_gate: Option<Arc<Notify>>,
    scanning: bool,

    sinks: HashMap<u64, NotificationSink>,
    next_subscription: u64,

    discover_filters: Vec<ServiceFilter>,
    stop_discovery_calls: usize,
    connects: Vec<PeripheralHandle>,
    subscribe_calls: usize,
    subscribes: usize,
    unsubscribes: Vec<u64>,
    disconnects: Vec<Link>,
}

/// Scriptable in-memory [`Transport`].
#[derive(Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// A transport whose peripherals expose the fall service and characteristic.
    pub fn new() -> Self {
        let state = FakeState {
            gatt: Some((FALL_SERVICE_UUID, FALL_CHARACTERISTIC_UUID)),
            next_subscription: 1,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Add a peripheral reported by every subsequent scan.
    pub fn advertise(&self, id: &str, name: &str, services: &[Uuid]) {
        self.state.lock().advertisements.push(Advertisement {
            handle: PeripheralHandle::new(id, Some(name.to_string())),
            services: services.to_vec(),
        });
    }

    /// Make `discover` itself fail.
    pub fn fail_discover(&self, reason: &str) {
        self.state.lock().discover_error = Some(reason.to_string());
    }

    /// Emit a scan error after the advertisements.
    pub fn fail_scan(&self, reason: &str) {
        self.state.lock().scan_error = Some(reason.to_string());
    }

    /// End the discovery stream after the advertisements instead of idling.
    pub fn end_scan(&self) {
        self.state.lock().scan_ends = true;
    }

    /// Make `connect` fail.
    pub fn fail_connect(&self, reason: &str) {
        self.state.lock().connect_error = Some(reason.to_string());
    }

    /// Expose a different service/characteristic pair (or none).
    pub fn set_gatt(&self, gatt: Option<(Uuid, Uuid)>) {
        self.state.lock().gatt = gatt;
    }

    /// Make `subscribe` fail.
    pub fn fail_subscribe(&self, reason: &str) {
        self.state.lock().subscribe_error = Some(reason.to_string());
    }

    /// Delay successive `discover` calls before the scan starts, one
    /// entry per call.
    pub fn delay_discover(&self, delays: &[Duration]) {
        self.state.lock().discover_delays = delays.iter().copied().collect();
    }

    /// Hold `connect` until the returned gate is notified.
    pub fn gate_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().connect_gate = Some(gate.clone());
        gate
    }

    /// Hold `subscribe` until the returned gate is notified.
    pub fn gate_subscribe(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().subscribe_gate = Some(gate.clone());
        gate
    }

    /// Hold `disconnect` (after recording it) until the returned gate is
    /// notified.
    pub fn gate_disconnect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().disconnect_gate = Some(gate.clone());
        gate
    }

    /// Deliver a notification on every subscription the fake still feeds.
    /// Returns how many consumers accepted it.
    pub fn notify(&self, data: &[u8]) -> usize {
        let mut state = self.state.lock();
        state
            .sinks
            .values_mut()
            .map(|sink| sink.deliver(RawNotification::new(data.to_vec())))
            .filter(|accepted| *accepted)
            .count()
    }

    /// Simulate link loss on every live subscription.
    ///
    /// The sinks are kept, so later `notify` calls model a stale handle.
    pub fn drop_link(&self) {
        for sink in self.state.lock().sinks.values_mut() {
            sink.signal_disconnect();
        }
    }

    /// Subscriptions armed and not yet released.
    pub fn live_subscriptions(&self) -> usize {
        let state = self.state.lock();
        state.sinks.values().filter(|s| !s.is_disconnected()).count()
    }

    /// Filters passed to `discover`, in call order.
    pub fn discover_filters(&self) -> Vec<ServiceFilter> {
        self.state.lock().discover_filters.clone()
    }

    /// Number of `stop_discovery` calls.
    pub fn stop_discovery_calls(&self) -> usize {
        self.state.lock().stop_discovery_calls
    }

    /// Check if a scan is running on the simulated adapter.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    /// Peripherals passed to `connect`.
    pub fn connects(&self) -> Vec<PeripheralHandle> {
        self.state.lock().connects.clone()
    }

    /// Number of `subscribe` calls, including held and failed ones.
    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    /// Number of successful `subscribe` calls.
    pub fn subscribes(&self) -> usize {
        self.state.lock().subscribes
    }

    /// Subscription ids passed to `unsubscribe`.
    pub fn unsubscribes(&self) -> Vec<u64> {
        self.state.lock().unsubscribes.clone()
    }

    /// Links passed to `disconnect`.
    pub fn disconnects(&self) -> Vec<Link> {
        self.state.lock().disconnects.clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn platform(&self) -> String {
        "fake".to_string()
    }

    async fn discover(&self, filter: ServiceFilter) -> Result<DiscoveryStream> {
        let delay = {
            let mut state = self.state.lock();
            state.discover_filters.push(filter.clone());
            state.discover_delays.pop_front()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(reason) = state.discover_error.clone() {
            return Err(Error::Scan { reason });
        }
        // One adapter-wide scan, as on a real radio.
        state.scanning = true;

        let mut items: Vec<Result<PeripheralHandle>> = state
            .advertisements
            .iter()
            .filter(|ad| filter.matches(&ad.services))
            .map(|ad| Ok(ad.handle.clone()))
            .collect();
        if let Some(reason) = state.scan_error.clone() {
            items.push(Err(Error::Scan { reason }));
        }

        let found = stream::iter(items);
        if state.scan_ends {
            Ok(Box::pin(found))
        } else {
            Ok(Box::pin(found.chain(stream::pending())))
        }
    }

    async fn stop_discovery(&self) {
        let mut state = self.state.lock();
        state.stop_discovery_calls += 1;
        state.scanning = false;
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Link> {
        let gate = {
            let mut state = self.state.lock();
            state.connects.push(peripheral.clone());
            state.connect_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let state = self.state.lock();
        match state.connect_error.clone() {
            Some(reason) => Err(Error::Link { reason }),
            None => Ok(Link {
                peripheral: peripheral.clone(),
            }),
        }
    }

    async fn discover_service_and_characteristic(
        &self,
        link: &Link,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<SubscriptionTarget> {
        let gatt = self.state.lock().gatt;
        match gatt {
            Some((s, _)) if s != service => Err(Error::ServiceNotFound {
                uuid: service.to_string(),
            }),
            Some((_, c)) if c != characteristic => Err(Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            }),
            Some(_) => Ok(SubscriptionTarget {
                link: link.clone(),
                service,
                characteristic,
            }),
            None => Err(Error::ServiceNotFound {
                uuid: service.to_string(),
            }),
        }
    }

    async fn subscribe(
        &self,
        target: &SubscriptionTarget,
        capacity: usize,
    ) -> Result<Subscription> {
        let gate = {
            let mut state = self.state.lock();
            state.subscribe_calls += 1;
            state.subscribe_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state.lock();
        if let Some(reason) = state.subscribe_error.clone() {
            return Err(Error::Subscribe { reason });
        }

        let handle = SubscriptionHandle {
            id: state.next_subscription,
            target: target.clone(),
        };
        state.next_subscription += 1;
        state.subscribes += 1;

        let (subscription, sink) = Subscription::channel(handle.clone(), capacity);
        state.sinks.insert(handle.id, sink);
        Ok(subscription)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut state = self.state.lock();
        state.unsubscribes.push(handle.id);
        state.sinks.remove(&handle.id);
    }

    async fn disconnect(&self, link: &Link) {
        let gate = {
            let mut state = self.state.lock();
            state.disconnects.push(link.clone());
            state.disconnect_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }
}
