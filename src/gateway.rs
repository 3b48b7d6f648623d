//! The gateway connection state machine.
//!
//! A [`Gateway`] owns at most one connection attempt at a time:
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Discovering -> Subscribed -> Disconnected
//!            \            \              \
//!             `------------`--------------`----> Error
//! ```
//!
//! `connect()` and `disconnect()` return as soon as the state change is
//! recorded; the attempt itself runs on a background task. Each attempt is
//! tagged with a generation number, and any step that finds the generation
//! has moved on (because `disconnect()` or a newer `connect()` ran) releases
//! what it acquired and stops.
//!
//! The scan is adapter-wide, so only the caller that supersedes an attempt
//! stops it. Starting and stopping a scan both happen under the radio lock,
//! and a superseded attempt never touches the scan again.

use futures::channel::oneshot;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ble::connection::ConnectionState;
use crate::ble::transport::{
    DiscoveryStream, Link, PeripheralHandle, ServiceFilter, Subscription, SubscriptionHandle,
    Transport,
};
use crate::config::{ConfigHandle, GatewayOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::event_log::{EventLog, LogEntry};
use crate::forwarder::{Forward, HttpForwarder};
use crate::pipeline::NotificationPipeline;
use crate::protocol::RawNotification;

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// The failure that moved the gateway to [`ConnectionState::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttemptFailure {
    /// Failure class.
    pub kind: ErrorKind,
    /// The originating message, verbatim.
    pub message: String,
}

impl From<&Error> for AttemptFailure {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Snapshot of what the UI displays.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GatewayStatus {
    /// Current connection state.
    pub state: ConnectionState,
    /// Name of the matched peripheral, if any.
    pub device_name: Option<String>,
    /// Why the last attempt failed, while in `Error`.
    pub last_error: Option<AttemptFailure>,
}

#[derive(Default)]
struct Session {
    device_name: Option<String>,
    last_error: Option<AttemptFailure>,
    link: Option<Link>,
    subscription: Option<SubscriptionHandle>,
    stop_consumer: Option<oneshot::Sender<()>>,
    attempt: Option<JoinHandle<()>>,
}

/// Resources released by a teardown.
#[derive(Default)]
struct Released {
    scanning: bool,
    link: Option<Link>,
    subscription: Option<SubscriptionHandle>,
    attempt: Option<JoinHandle<()>>,
}

struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    generation_tx: watch::Sender<u64>,
    session: Mutex<Session>,
    radio: tokio::sync::Mutex<()>,
    log: Arc<EventLog>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn generation(&self) -> u64 {
        *self.generation_tx.borrow()
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = self.state_tx.send_replace(new_state);
        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);
        }
    }

    /// Start a new generation, taking everything the previous one held.
    ///
    /// Must be called with the session lock held.
    fn bump(&self, session: &mut Session) -> (u64, Released) {
        let mut next = 0;
        self.generation_tx.send_modify(|g| {
            *g += 1;
            next = *g;
        });

        if let Some(stop) = session.stop_consumer.take() {
            let _ = stop.send(());
        }
        session.device_name = None;
        session.last_error = None;

        let released = Released {
            scanning: self.state() == ConnectionState::Scanning,
            link: session.link.take(),
            subscription: session.subscription.take(),
            attempt: session.attempt.take(),
        };
        (next, released)
    }

    /// Run `update` and enter `state` if `generation` is still current.
    fn advance(
        &self,
        generation: u64,
        state: ConnectionState,
        update: impl FnOnce(&mut Session),
    ) -> bool {
        let mut session = self.session.lock();
        if self.generation() != generation {
            return false;
        }
        update(&mut session);
        self.set_state(state);
        true
    }

    /// Check if notifications for `generation` should still be processed.
    fn is_live(&self, generation: u64) -> bool {
        self.generation() == generation && self.state().is_subscribed()
    }

    /// Stop the scan on behalf of `generation`, unless it has been superseded.
    async fn stop_scan(&self, transport: &dyn Transport, generation: u64) {
        let _radio = self.radio.lock().await;
        if self.generation() == generation {
            transport.stop_discovery().await;
        }
    }
}

/// Release what a teardown took. Every call is best-effort.
async fn release(transport: &dyn Transport, shared: &Shared, released: &Released) {
    if released.scanning {
        let _radio = shared.radio.lock().await;
        transport.stop_discovery().await;
    }
    if let Some(subscription) = &released.subscription {
        transport.unsubscribe(subscription).await;
    }
    if let Some(link) = &released.link {
        transport.disconnect(link).await;
    }
}

/// Bridges notifications from one wearable to an HTTP backend.
///
/// Dropping the gateway releases its scan, subscription and link on the
/// current runtime without waiting. Call [`Gateway::shutdown`] to wait.
pub struct Gateway {
    transport: Arc<dyn Transport>,
    pipeline: Arc<NotificationPipeline>,
    config: ConfigHandle,
    options: GatewayOptions,
    shared: Arc<Shared>,
    callback_counter: AtomicU64,
}

impl Gateway {
    /// Create a gateway from its parts.
    ///
    /// # Errors
    ///
    /// Returns an error if `options` are invalid.
    pub fn new(
        transport: Arc<dyn Transport>,
        forwarder: Arc<dyn Forward>,
        config: ConfigHandle,
        options: GatewayOptions,
    ) -> Result<Self> {
        options.validate()?;

        let log = Arc::new(EventLog::new(options.log_capacity));
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (generation_tx, _) = watch::channel(0);

        Ok(Self {
            transport,
            pipeline: Arc::new(NotificationPipeline::new(forwarder, log.clone())),
            config,
            options,
            shared: Arc::new(Shared {
                state_tx,
                generation_tx,
                session: Mutex::new(Session::default()),
                radio: tokio::sync::Mutex::new(()),
                log,
            }),
            callback_counter: AtomicU64::new(0),
        })
    }

    /// Create a gateway that forwards over HTTP, tagging events with the
    /// transport's platform.
    pub fn with_http(
        transport: Arc<dyn Transport>,
        config: ConfigHandle,
        options: GatewayOptions,
    ) -> Result<Self> {
        let forwarder = HttpForwarder::new(config.clone(), transport.platform(), &options)?;
        Self::new(transport, Arc::new(forwarder), config, options)
    }

    /// Start a connection attempt.
    ///
    /// Any existing subscription and link are torn down first. Returns once
    /// the gateway is `Scanning`; progress is reported through the state and
    /// the event log.
    pub async fn connect(&self) {
        let (generation, released) = {
            let mut session = self.shared.session.lock();
            let (generation, released) = self.shared.bump(&mut session);
            self.shared.set_state(ConnectionState::Scanning);
            (generation, released)
        };
        release(self.transport.as_ref(), &self.shared, &released).await;
        if self.shared.generation() != generation {
            debug!("Connect superseded during teardown");
            return;
        }

        let selector = self.config.load().device_selector.clone();
        self.shared.log.info(format!("Scanning for {selector}..."));

        let attempt = Attempt {
            transport: self.transport.clone(),
            pipeline: self.pipeline.clone(),
            config: self.config.clone(),
            options: self.options.clone(),
            shared: self.shared.clone(),
            generation,
        };
        let handle = tokio::spawn(attempt.run());

        let mut session = self.shared.session.lock();
        if self.shared.generation() == generation {
            session.attempt = Some(handle);
        }
    }

    /// Stop everything and return to `Idle`.
    ///
    /// Unsubscribe and link teardown are best-effort; the state is reset
    /// whatever they do. In-flight forwards are left to finish.
    pub async fn disconnect(&self) {
        self.stop().await;
    }

    /// Disconnect and wait for the background attempt to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down gateway");
        if let Some(attempt) = self.stop().await {
            let _ = attempt.await;
        }
    }

    async fn stop(&self) -> Option<JoinHandle<()>> {
        let released = {
            let mut session = self.shared.session.lock();
            let (_, released) = self.shared.bump(&mut session);
            self.shared.set_state(ConnectionState::Idle);
            released
        };

        release(self.transport.as_ref(), &self.shared, &released).await;
        if released.link.is_some() {
            self.shared.log.info("Disconnected");
        }
        released.attempt
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Snapshot for display.
    pub fn status(&self) -> GatewayStatus {
        let session = self.shared.session.lock();
        GatewayStatus {
            state: self.shared.state(),
            device_name: session.device_name.clone(),
            last_error: session.last_error.clone(),
        }
    }

    /// The event log.
    pub fn log(&self) -> &EventLog {
        &self.shared.log
    }

    /// The configuration handle.
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// The options the gateway was built with.
    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Register a callback for state changes.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.shared.state_tx.subscribe();

        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                callback(state);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for new log lines.
    pub fn on_log<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(LogEntry) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.shared.log.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(entry) => callback(entry),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        trace!("Log callback lagged by {} entries", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        let released = {
            let mut session = self.shared.session.lock();
            let (_, released) = self.shared.bump(&mut session);
            self.shared.set_state(ConnectionState::Idle);
            released
        };

        let nothing_held =
            !released.scanning && released.link.is_none() && released.subscription.is_none();
        if nothing_held {
            return;
        }

        // Teardown is async; hand it to the runtime if there is one.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let transport = self.transport.clone();
                let shared = self.shared.clone();
                runtime.spawn(async move {
                    release(transport.as_ref(), &shared, &released).await;
                    debug!("Released gateway resources on drop");
                });
            }
            Err(_) => warn!("Gateway dropped outside a runtime; link left to the transport"),
        }
    }
}

/// One connection attempt, run on its own task.
struct Attempt {
    transport: Arc<dyn Transport>,
    pipeline: Arc<NotificationPipeline>,
    config: ConfigHandle,
    options: GatewayOptions,
    shared: Arc<Shared>,
    generation: u64,
}

impl Attempt {
    async fn run(self) {
        if let Err(e) = self.drive().await {
            self.fail(e);
        }
    }

    fn is_current(&self) -> bool {
        self.shared.generation() == self.generation
    }

    /// Resolves once this attempt has been superseded.
    async fn cancelled(&self) {
        let mut rx = self.shared.generation_tx.subscribe();
        let generation = self.generation;
        let _ = rx.wait_for(|g| *g != generation).await;
    }

    fn fail(&self, err: Error) {
        let failure = AttemptFailure::from(&err);
        let log = &self.shared.log;
        let recorded = self.shared.advance(self.generation, ConnectionState::Error, |s| {
            log.error(failure.message.clone());
            s.last_error = Some(failure);
        });
        if recorded {
            error!("Connection attempt failed: {}", err);
        } else {
            debug!("Superseded attempt failed: {}", err);
        }
    }

    async fn drive(&self) -> Result<()> {
        let filter = ServiceFilter::service(self.options.service_uuid);
        let discovered = {
            let _radio = self.shared.radio.lock().await;
            if !self.is_current() {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = self.cancelled() => return Ok(()),
                result = self.transport.discover(filter) => result,
            }
        };
        let stream = match discovered {
            Ok(stream) => stream,
            Err(e) => {
                self.shared
                    .stop_scan(self.transport.as_ref(), self.generation)
                    .await;
                return Err(e);
            }
        };

        let Some(peripheral) = self.await_match(stream).await? else {
            return Ok(());
        };

        let name = peripheral.display_name().to_string();
        self.shared
            .log
            .info(format!("Found {} ({}), connecting...", name, peripheral.id));
        if !self.shared.advance(self.generation, ConnectionState::Connecting, |s| {
            s.device_name = Some(name.clone());
        }) {
            return Ok(());
        }

        let link = self.transport.connect(&peripheral).await?;
        if !self.shared.advance(self.generation, ConnectionState::Discovering, |s| {
            s.link = Some(link.clone());
        }) {
            self.transport.disconnect(&link).await;
            return Ok(());
        }

        // On failure the link stays up; disconnect() releases it.
        let target = self
            .transport
            .discover_service_and_characteristic(
                &link,
                self.options.service_uuid,
                self.options.characteristic_uuid,
            )
            .await?;
        if !self.is_current() {
            return Ok(());
        }
        self.shared
            .log
            .info("Connected and discovered, subscribing to notifications...");

        let subscription = self
            .transport
            .subscribe(&target, self.options.notification_capacity)
            .await?;
        self.arm(subscription, &name).await;
        Ok(())
    }

    /// Wait for the configured peripheral. `Ok(None)` means cancelled; the
    /// scan then belongs to whoever cancelled.
    async fn await_match(&self, mut stream: DiscoveryStream) -> Result<Option<PeripheralHandle>> {
        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancelled() => return Ok(None),
                item = stream.next() => match item {
                    Some(Ok(peripheral)) => {
                        let config = self.config.load();
                        if peripheral.name.as_deref() == Some(config.device_selector.as_str()) {
                            break Ok(Some(peripheral));
                        }
                        trace!("Ignoring {} ({})", peripheral.display_name(), peripheral.id);
                    }
                    Some(Err(e)) => break Err(e),
                    None => {
                        break Err(Error::Scan {
                            reason: format!(
                                "scan ended without finding {}",
                                self.config.load().device_selector
                            ),
                        })
                    }
                },
            }
        };

        drop(stream);
        self.shared
            .stop_scan(self.transport.as_ref(), self.generation)
            .await;
        outcome
    }

    /// Record the subscription and start consuming it.
    async fn arm(&self, subscription: Subscription, name: &str) {
        let Subscription {
            handle,
            notifications,
            disconnected,
        } = subscription;
        let (stop_tx, stop_rx) = oneshot::channel();

        let log = &self.shared.log;
        let armed = self.shared.advance(self.generation, ConnectionState::Subscribed, |s| {
            s.subscription = Some(handle.clone());
            s.stop_consumer = Some(stop_tx);
            log.info("Subscribed.");
        });
        if !armed {
            self.transport.unsubscribe(&handle).await;
            return;
        }

        info!("Connected to {}", name);

        let pipeline = self.pipeline.clone();
        let shared = self.shared.clone();
        let generation = self.generation;
        let concurrency = self.options.forward_concurrency;
        tokio::spawn(async move {
            notifications
                .take_until(stop_rx)
                .for_each_concurrent(concurrency, |raw: RawNotification| {
                    let pipeline = pipeline.clone();
                    let shared = shared.clone();
                    async move {
                        if !shared.is_live(generation) {
                            trace!("Ignoring notification from stale subscription");
                            return;
                        }
                        // Outcomes are already in the event log.
                        let _ = pipeline.handle(raw).await;
                    }
                })
                .await;
            debug!("Notification consumer stopped");
        });

        let transport = self.transport.clone();
        let shared = self.shared.clone();
        tokio::spawn(watch_link(
            disconnected,
            transport,
            shared,
            self.generation,
        ));
    }
}

/// Move to `Disconnected` when the transport reports link loss.
async fn watch_link(
    disconnected: oneshot::Receiver<()>,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    generation: u64,
) {
    if disconnected.await.is_err() {
        // Released by us before any link loss.
        return;
    }

    let subscription = {
        let mut session = shared.session.lock();
        if shared.generation() != generation || !shared.state().is_subscribed() {
            return;
        }
        if let Some(stop) = session.stop_consumer.take() {
            let _ = stop.send(());
        }
        session.link = None;
        shared.set_state(ConnectionState::Disconnected);
        session.subscription.take()
    };

    shared.log.warn("Disconnected");

    if let Some(subscription) = subscription {
        transport.unsubscribe(&subscription).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::fake::FakeTransport;
    use crate::ble::transport::MockTransport;
    use crate::ble::uuids::{FALL_CHARACTERISTIC_UUID, FALL_SERVICE_UUID};
    use crate::config::GatewayConfig;
    use crate::forwarder::{ForwardError, ForwardResult, MockForward};
    use crate::protocol::{DecodedEvent, EventKind};
    use futures::stream;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> ConfigHandle {
        ConfigHandle::new(GatewayConfig::new(
            "http://127.0.0.1:9/api/fall",
            "Target-X",
        ))
    }

    fn gateway(fake: &FakeTransport, forwarder: MockForward) -> Gateway {
        Gateway::new(
            Arc::new(fake.clone()),
            Arc::new(forwarder),
            config(),
            GatewayOptions::default(),
        )
        .unwrap()
    }

    fn target_x() -> FakeTransport {
        let fake = FakeTransport::new();
        fake.advertise("AA:01", "Target-X", &[FALL_SERVICE_UUID]);
        fake
    }

    fn idle_forwarder() -> MockForward {
        let mut forwarder = MockForward::new();
        forwarder.expect_forward().times(0);
        forwarder
    }

    fn recording_forwarder(
        result: ForwardResult,
    ) -> (MockForward, mpsc::UnboundedReceiver<DecodedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut forwarder = MockForward::new();
        forwarder.expect_forward().returning(move |event| {
            let _ = tx.send(event);
            result.clone()
        });
        (forwarder, rx)
    }

    async fn wait_for_state(gateway: &Gateway, state: ConnectionState) {
        let mut rx = gateway.subscribe_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {state}, at {}", gateway.state()))
            .unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn test_matching_peripheral_reaches_subscribed() {
        let fake = target_x();
        fake.advertise("AA:01", "Target-X", &[FALL_SERVICE_UUID]);
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Subscribed).await;

        assert_eq!(fake.connects().len(), 1);
        assert_eq!(fake.subscribes(), 1);
        assert!(fake.stop_discovery_calls() >= 1);
        assert_eq!(
            fake.discover_filters(),
            vec![ServiceFilter::service(FALL_SERVICE_UUID)]
        );
        assert_eq!(gateway.status().device_name.as_deref(), Some("Target-X"));
        assert_eq!(
            gateway.log().messages(),
            vec![
                "Subscribed.",
                "Connected and discovered, subscribing to notifications...",
                "Found Target-X (AA:01), connecting...",
                "Scanning for Target-X...",
            ]
        );
    }

    #[tokio::test]
    async fn test_other_peripheral_is_ignored() {
        let fake = FakeTransport::new();
        fake.advertise("BB:02", "Other", &[FALL_SERVICE_UUID]);
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(gateway.state(), ConnectionState::Scanning);
        assert!(fake.connects().is_empty());
    }

    #[tokio::test]
    async fn test_selector_change_applies_to_running_scan() {
        let fake = FakeTransport::new();
        fake.advertise("BB:02", "Other", &[FALL_SERVICE_UUID]);
        fake.end_scan();
        let gateway = gateway(&fake, idle_forwarder());
        gateway.config().set_device_selector("Other");

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Subscribed).await;

        assert_eq!(fake.connects()[0].id, "BB:02");
    }

    #[tokio::test]
    async fn test_missing_characteristic_leaves_link_up() {
        let fake = target_x();
        fake.set_gatt(Some((FALL_SERVICE_UUID, Uuid::nil())));
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Error).await;

        let failure = gateway.status().last_error.unwrap();
        assert_eq!(failure.kind, ErrorKind::NotFound);
        assert_eq!(
            failure.message,
            format!("Characteristic not found: {FALL_CHARACTERISTIC_UUID}")
        );
        assert!(fake.disconnects().is_empty());

        gateway.disconnect().await;
        assert_eq!(gateway.state(), ConnectionState::Idle);
        assert_eq!(fake.disconnects().len(), 1);
        assert_eq!(gateway.status().last_error, None);
    }

    #[tokio::test]
    async fn test_notification_is_forwarded() {
        let fake = target_x();
        let (forwarder, mut events) = recording_forwarder(ForwardResult::Success { status: 201 });
        let gateway = gateway(&fake, forwarder);

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Subscribed).await;
        assert_eq!(fake.notify(br#"{"type":"fall","severity":3}"#), 1);

        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event.kind(), EventKind::Fall);
        assert_eq!(event.get("severity"), Some(&serde_json::json!(3)));

        wait_until(|| gateway.log().contains("Forwarded to API.")).await;
        assert!(gateway.log().contains(r#"BLE: {"type":"fall","severity":3}"#));
    }

    #[tokio::test]
    async fn test_http_failure_keeps_subscription() {
        let fake = target_x();
        let (forwarder, _events) = recording_forwarder(ForwardResult::Failure(ForwardError::Status {
            status: 500,
            body: "Internal Server Error".to_string(),
        }));
        let gateway = gateway(&fake, forwarder);

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Subscribed).await;
        fake.notify(br#"{"type":"proximity"}"#);

        wait_until(|| gateway.log().contains("POST error: 500 Internal Server Error")).await;
        assert_eq!(gateway.state(), ConnectionState::Subscribed);
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_subscription() {
        let fake = target_x();
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Subscribed).await;
        fake.notify(b"{bad");

        wait_until(|| gateway.log().contains("Decode error: ")).await;
        assert_eq!(gateway.state(), ConnectionState::Subscribed);
    }

    #[tokio::test]
    async fn test_link_loss_moves_to_disconnected() {
        let fake = target_x();
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Subscribed).await;
        fake.drop_link();
        wait_for_state(&gateway, ConnectionState::Disconnected).await;

        wait_until(|| fake.unsubscribes() == vec![1]).await;
        assert_eq!(fake.notify(br#"{"type":"fall"}"#), 0);
        assert_eq!(gateway.log().messages()[0], "Disconnected");
    }

    #[tokio::test]
    async fn test_disconnect_releases_subscription() {
        let fake = target_x();
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Subscribed).await;
        gateway.disconnect().await;

        assert_eq!(gateway.state(), ConnectionState::Idle);
        assert_eq!(fake.live_subscriptions(), 0);
        assert_eq!(fake.disconnects().len(), 1);
        assert_eq!(
            gateway.status(),
            GatewayStatus {
                state: ConnectionState::Idle,
                device_name: None,
                last_error: None,
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_cancels_scan() {
        let fake = FakeTransport::new();
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_until(|| fake.discover_filters().len() == 1).await;
        gateway.disconnect().await;

        assert_eq!(gateway.state(), ConnectionState::Idle);
        wait_until(|| fake.stop_discovery_calls() == 1).await;

        // A peripheral appearing later must not revive the attempt.
        fake.advertise("AA:01", "Target-X", &[FALL_SERVICE_UUID]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fake.connects().is_empty());
    }

    #[tokio::test]
    async fn test_discover_failure_is_scan_error() {
        let fake = FakeTransport::new();
        fake.fail_discover("adapter powered off");
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Error).await;

        let failure = gateway.status().last_error.unwrap();
        assert_eq!(failure.kind, ErrorKind::Scan);
        assert_eq!(failure.message, "Scan error: adapter powered off");
        assert!(gateway.log().contains("Scan error: adapter powered off"));
        assert_eq!(fake.stop_discovery_calls(), 1);
    }

    #[tokio::test]
    async fn test_scan_stream_failure_is_scan_error() {
        let fake = FakeTransport::new();
        fake.advertise("BB:02", "Other", &[FALL_SERVICE_UUID]);
        fake.fail_scan("radio reset");
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Error).await;

        assert_eq!(gateway.status().last_error.unwrap().kind, ErrorKind::Scan);
    }

    #[tokio::test]
    async fn test_scan_ending_without_match_is_scan_error() {
        let fake = FakeTransport::new();
        fake.end_scan();
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Error).await;

        assert_eq!(
            gateway.status().last_error.unwrap().message,
            "Scan error: scan ended without finding Target-X"
        );
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_message() {
        let mut transport = MockTransport::new();
        transport.expect_discover().times(1).returning(|_| {
            let found: Vec<Result<PeripheralHandle>> = vec![Ok(PeripheralHandle::new(
                "AA:01",
                Some("Target-X".to_string()),
            ))];
            let discovered: DiscoveryStream =
                Box::pin(stream::iter(found).chain(stream::pending()));
            Ok(discovered)
        });
        transport.expect_stop_discovery().returning(|| ());
        transport.expect_connect().times(1).returning(|_| {
            Err(Error::Link {
                reason: "GATT status 133".to_string(),
            })
        });
        transport.expect_subscribe().times(0);

        let gateway = Gateway::new(
            Arc::new(transport),
            Arc::new(idle_forwarder()),
            config(),
            GatewayOptions::default(),
        )
        .unwrap();

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Error).await;

        let failure = gateway.status().last_error.unwrap();
        assert_eq!(failure.kind, ErrorKind::Link);
        assert_eq!(failure.message, "Connect error: GATT status 133");
        assert_eq!(gateway.status().device_name.as_deref(), Some("Target-X"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_link_error() {
        let fake = target_x();
        fake.fail_connect("peer refused");
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Error).await;

        let failure = gateway.status().last_error.unwrap();
        assert_eq!(failure.kind, ErrorKind::Link);
        assert_eq!(failure.message, "Connect error: peer refused");
        assert!(gateway.log().contains("Connect error: peer refused"));
        assert_eq!(fake.subscribe_calls(), 0);
        assert!(fake.disconnects().is_empty());
    }

    #[tokio::test]
    async fn test_superseded_scan_leaves_new_scan_running() {
        let fake = FakeTransport::new();
        fake.delay_discover(&[Duration::from_millis(100)]);
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        gateway.connect().await;
        wait_until(|| fake.discover_filters().len() == 2).await;

        // Well past the point where the first scan would have started.
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(gateway.state(), ConnectionState::Scanning);
        assert!(fake.is_scanning());

        gateway.disconnect().await;
        assert!(!fake.is_scanning());
    }

    #[tokio::test]
    async fn test_reconnect_during_slow_scan_reaches_subscribed() {
        let fake = target_x();
        fake.delay_discover(&[Duration::from_millis(100)]);
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Subscribed).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(gateway.state(), ConnectionState::Subscribed);
        assert_eq!(fake.connects().len(), 1);
        assert_eq!(fake.live_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_releases_late_link() {
        let fake = target_x();
        let gate = fake.gate_connect();
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_until(|| fake.connects().len() == 1).await;
        gateway.disconnect().await;

        assert_eq!(gateway.state(), ConnectionState::Idle);
        assert!(fake.disconnects().is_empty());

        gate.notify_one();
        wait_until(|| fake.disconnects().len() == 1).await;

        assert_eq!(gateway.state(), ConnectionState::Idle);
        assert_eq!(fake.subscribe_calls(), 0);
        assert_eq!(gateway.status().device_name, None);
    }

    #[tokio::test]
    async fn test_disconnect_during_subscribe_releases_late_subscription() {
        let fake = target_x();
        let gate = fake.gate_subscribe();
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_until(|| fake.subscribe_calls() == 1).await;
        gateway.disconnect().await;

        assert_eq!(gateway.state(), ConnectionState::Idle);
        assert_eq!(fake.disconnects().len(), 1);

        gate.notify_one();
        wait_until(|| fake.unsubscribes() == vec![1]).await;

        assert_eq!(fake.subscribes(), 1);
        assert_eq!(fake.live_subscriptions(), 0);
        assert_eq!(gateway.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_during_teardown_skips_new_attempt() {
        let fake = target_x();
        let gateway = Arc::new(gateway(&fake, idle_forwarder()));

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Subscribed).await;

        let gate = fake.gate_disconnect();
        let reconnect = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.connect().await })
        };
        wait_until(|| fake.disconnects().len() == 1).await;

        gateway.disconnect().await;
        gate.notify_one();
        reconnect.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(gateway.state(), ConnectionState::Idle);
        assert_eq!(fake.discover_filters().len(), 1);
        assert_eq!(
            gateway
                .log()
                .messages()
                .iter()
                .filter(|m| m.starts_with("Scanning for"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_drop_releases_subscription_and_link() {
        let fake = target_x();
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Subscribed).await;
        drop(gateway);

        wait_until(|| fake.unsubscribes() == vec![1] && fake.disconnects().len() == 1).await;
        assert_eq!(fake.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_error() {
        let fake = target_x();
        fake.fail_subscribe("notify not permitted");
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Error).await;

        assert_eq!(gateway.status().last_error.unwrap().kind, ErrorKind::Subscribe);
    }

    #[tokio::test]
    async fn test_reconnect_tears_down_previous_session() {
        let fake = target_x();
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Subscribed).await;

        gateway.connect().await;
        assert_eq!(fake.unsubscribes(), vec![1]);
        assert_eq!(fake.disconnects().len(), 1);
        wait_for_state(&gateway, ConnectionState::Subscribed).await;

        assert_eq!(fake.subscribes(), 2);
        assert_eq!(fake.live_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_attempt() {
        let fake = FakeTransport::new();
        let gateway = gateway(&fake, idle_forwarder());

        gateway.connect().await;
        tokio::time::timeout(WAIT, gateway.shutdown()).await.unwrap();

        assert_eq!(gateway.state(), ConnectionState::Idle);
        assert_eq!(fake.stop_discovery_calls(), 1);
    }

    #[tokio::test]
    async fn test_state_callback_sees_subscribed() {
        let fake = target_x();
        let gateway = gateway(&fake, idle_forwarder());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _handle = gateway.on_state_changed(move |state| sink.lock().push(state));

        gateway.connect().await;
        wait_for_state(&gateway, ConnectionState::Subscribed).await;
        wait_until(|| seen.lock().last() == Some(&ConnectionState::Subscribed)).await;
    }

    #[tokio::test]
    async fn test_log_callback_receives_lines() {
        let fake = FakeTransport::new();
        let gateway = gateway(&fake, idle_forwarder());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handle = gateway.on_log(move |entry| sink.lock().push(entry.message));
        assert_eq!(handle.id(), 0);

        gateway.connect().await;
        wait_until(|| !seen.lock().is_empty()).await;
        assert_eq!(seen.lock()[0], "Scanning for Target-X...");
    }

    #[test]
    fn test_invalid_options_rejected() {
        let result = Gateway::new(
            Arc::new(FakeTransport::new()),
            Arc::new(MockForward::new()),
            config(),
            GatewayOptions::default().with_forward_concurrency(0),
        );

        assert!(matches!(result, Err(Error::InvalidParameter { .. })));
    }
}
