//! Native central-role transport built on btleplug.
//!
//! Scans with the adapter, keeps the `Peripheral` objects it has seen keyed
//! by identifier, and pumps notifications for a subscribed characteristic
//! into the subscription's bounded channel.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{
    DiscoveryStream, Link, NotificationSink, PeripheralHandle, ServiceFilter, Subscription,
    SubscriptionHandle, SubscriptionTarget, Transport,
};
use crate::error::{Error, Result};
use crate::protocol::RawNotification;

/// Discovery results buffered between the scan task and the consumer.
const DISCOVERY_BUFFER: usize = 32;

/// How often the scan loop re-checks its stop flag.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ScanTask {
    is_scanning: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct PumpTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Transport backed by the host's central-role BLE manager.
pub struct CentralTransport {
    /// The BLE adapter to use.
    adapter: Adapter,
    /// Peripherals seen while scanning, by identifier.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// The running scan, if any.
    scan: Mutex<Option<ScanTask>>,
    /// Notification pumps by subscription id.
    pumps: Mutex<HashMap<u64, PumpTask>>,
    /// Subscription id counter.
    next_subscription: AtomicU64,
}

impl CentralTransport {
    /// Create a transport on the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a transport on a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            scan: Mutex::new(None),
            pumps: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn peripheral(&self, id: &str) -> Result<Peripheral> {
        self.peripherals
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::PeripheralNotFound {
                identifier: id.to_string(),
            })
    }

    fn find_characteristic(peripheral: &Peripheral, target: &SubscriptionTarget) -> Option<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == target.characteristic && c.service_uuid == target.service)
    }

    /// Handle one adapter event during a scan. Returns `false` to end the scan.
    async fn handle_scan_event(
        event: CentralEvent,
        adapter: &Adapter,
        filter: &ServiceFilter,
        peripherals: &Arc<RwLock<HashMap<String, Peripheral>>>,
        tx: &mut mpsc::Sender<Result<PeripheralHandle>>,
    ) -> bool {
        let id = match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. } => id,
            CentralEvent::StateUpdate(CentralState::PoweredOff) => {
                let _ = tx
                    .send(Err(Error::Scan {
                        reason: "Bluetooth adapter powered off".to_string(),
                    }))
                    .await;
                return false;
            }
            _ => return true,
        };

        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return true;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return true,
        };

        // Not every platform honours the scan filter.
        if !filter.matches(&properties.services) {
            return true;
        }

        let handle = PeripheralHandle::new(id.to_string(), properties.local_name);
        trace!("Discovered {} ({})", handle.display_name(), handle.id);
        peripherals.write().insert(handle.id.clone(), peripheral);

        tx.send(Ok(handle)).await.is_ok()
    }

    /// Forward notifications for one characteristic until stopped or the link drops.
    async fn pump(
        peripheral_id: PeripheralId,
        characteristic: Uuid,
        mut notifications: std::pin::Pin<
            Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>,
        >,
        mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
        mut sink: NotificationSink,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut stop => break,
                notification = notifications.next() => match notification {
                    Some(n) if n.uuid == characteristic => {
                        trace!("Notification: {} bytes", n.value.len());
                        if !sink.deliver(RawNotification::new(n.value)) {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => {
                        debug!("Notification stream ended");
                        sink.signal_disconnect();
                        break;
                    }
                },
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                        debug!("Device disconnected: {:?}", id);
                        sink.signal_disconnect();
                        break;
                    }
                    Some(CentralEvent::StateUpdate(CentralState::PoweredOff)) => {
                        sink.signal_disconnect();
                        break;
                    }
                    Some(_) => {}
                    None => {
                        // Adapter event stream ended; notifications may still flow.
                        events = Box::pin(futures::stream::pending());
                    }
                },
            }
        }
        debug!("Notification pump stopped");
    }
}

#[async_trait]
impl Transport for CentralTransport {
    fn platform(&self) -> String {
        std::env::consts::OS.to_string()
    }

    async fn discover(&self, filter: ServiceFilter) -> Result<DiscoveryStream> {
        self.stop_discovery().await;

        info!("Starting BLE scan with filter {:?}", filter.services);

        let mut events = self.adapter.events().await.map_err(|e| Error::Scan {
            reason: e.to_string(),
        })?;

        self.adapter
            .start_scan(ScanFilter {
                services: filter.services.clone(),
            })
            .await
            .map_err(|e| Error::Scan {
                reason: e.to_string(),
            })?;

        let (mut tx, rx) = mpsc::channel(DISCOVERY_BUFFER);
        let is_scanning = Arc::new(AtomicBool::new(true));

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let running = is_scanning.clone();

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                tokio::select! {
                    event = events.next() => {
                        let Some(event) = event else {
                            let _ = tx.send(Err(Error::Scan {
                                reason: "adapter event stream ended".to_string(),
                            })).await;
                            break;
                        };
                        if !Self::handle_scan_event(event, &adapter, &filter, &peripherals, &mut tx).await {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(SCAN_POLL_INTERVAL) => {}
                }
            }

            debug!("Scan event loop ended");
        });

        *self.scan.lock() = Some(ScanTask {
            is_scanning,
            handle,
        });

        Ok(Box::pin(rx))
    }

    async fn stop_discovery(&self) {
        let Some(task) = self.scan.lock().take() else {
            return;
        };

        info!("Stopping BLE scan");

        task.is_scanning.store(false, Ordering::SeqCst);
        task.handle.abort();

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Link> {
        let device = self.peripheral(&peripheral.id)?;

        if device.is_connected().await.unwrap_or(false) {
            info!("Peripheral already connected at BLE level");
        } else {
            device.connect().await.map_err(|e| Error::Link {
                reason: e.to_string(),
            })?;
            info!("Connected to {}", peripheral.display_name());
        }

        Ok(Link {
            peripheral: peripheral.clone(),
        })
    }

    async fn discover_service_and_characteristic(
        &self,
        link: &Link,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<SubscriptionTarget> {
        let device = self.peripheral(&link.peripheral.id)?;

        device.discover_services().await.map_err(|e| Error::Link {
            reason: e.to_string(),
        })?;

        let found = device
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: service.to_string(),
            })?;

        for c in &found.characteristics {
            debug!("Found characteristic: {} in service {}", c.uuid, found.uuid);
        }

        if !found.characteristics.iter().any(|c| c.uuid == characteristic) {
            return Err(Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            });
        }

        Ok(SubscriptionTarget {
            link: link.clone(),
            service,
            characteristic,
        })
    }

    async fn subscribe(
        &self,
        target: &SubscriptionTarget,
        capacity: usize,
    ) -> Result<Subscription> {
        let device = self.peripheral(&target.link.peripheral.id)?;
        let characteristic =
            Self::find_characteristic(&device, target).ok_or_else(|| Error::CharacteristicNotFound {
                uuid: target.characteristic.to_string(),
            })?;

        let subscribe_error = |e: btleplug::Error| Error::Subscribe {
            reason: e.to_string(),
        };

        // Open the streams before arming so no early notification is missed.
        let notifications = device.notifications().await.map_err(subscribe_error)?;
        let events = self.adapter.events().await.map_err(subscribe_error)?;
        device.subscribe(&characteristic).await.map_err(subscribe_error)?;

        debug!(
            "Subscribed to notifications from {}, properties: {:?}",
            characteristic.uuid, characteristic.properties
        );

        let handle = SubscriptionHandle {
            id: self.next_subscription.fetch_add(1, Ordering::SeqCst),
            target: target.clone(),
        };
        let (subscription, sink) = Subscription::channel(handle.clone(), capacity);
        let (stop_tx, stop_rx) = oneshot::channel();

        let pump = tokio::spawn(Self::pump(
            device.id(),
            characteristic.uuid,
            notifications,
            events,
            sink,
            stop_rx,
        ));

        self.pumps.lock().insert(
            handle.id,
            PumpTask {
                stop: stop_tx,
                handle: pump,
            },
        );

        Ok(subscription)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if let Some(task) = self.pumps.lock().remove(&handle.id) {
            let _ = task.stop.send(());
            task.handle.abort();
        }

        let device = match self.peripheral(&handle.target.link.peripheral.id) {
            Ok(d) => d,
            Err(e) => {
                warn!("Unsubscribe skipped: {}", e);
                return;
            }
        };

        let Some(characteristic) = Self::find_characteristic(&device, &handle.target) else {
            return;
        };

        match device.unsubscribe(&characteristic).await {
            Ok(()) => debug!("Unsubscribed from notifications from {}", characteristic.uuid),
            Err(e) => warn!("Failed to unsubscribe from {}: {}", characteristic.uuid, e),
        }
    }

    async fn disconnect(&self, link: &Link) {
        let device = match self.peripheral(&link.peripheral.id) {
            Ok(d) => d,
            Err(e) => {
                warn!("Disconnect skipped: {}", e);
                return;
            }
        };

        if !device.is_connected().await.unwrap_or(false) {
            debug!("Peripheral {} already disconnected", link.peripheral.display_name());
            return;
        }

        match device.disconnect().await {
            Ok(()) => info!("Disconnected from {}", link.peripheral.display_name()),
            Err(e) => error!("Failed to disconnect: {}", e),
        }
    }
}

impl Drop for CentralTransport {
    fn drop(&mut self) {
        if let Some(task) = self.scan.get_mut().take() {
            task.is_scanning.store(false, Ordering::SeqCst);
            task.handle.abort();
        }
        for (_, task) in self.pumps.get_mut().drain() {
            task.handle.abort();
        }
    }
}
