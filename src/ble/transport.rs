//! Transport capability interface.
//!
//! The gateway drives the radio exclusively through [`Transport`], so the
//! same state machine runs on top of a native central manager
//! ([`CentralTransport`](super::central::CentralTransport)) or a single-shot
//! pairing-prompt requester
//! ([`RequesterTransport`](super::requester::RequesterTransport)).

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::stream::Stream;
use std::pin::Pin;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::RawNotification;

/// Peripherals reported by an active scan.
///
/// The stream is unordered and may repeat the same peripheral. It runs until
/// [`Transport::stop_discovery`] is called; adapter failures arrive in-band
/// as `Err` items.
pub type DiscoveryStream = Pin<Box<dyn Stream<Item = Result<PeripheralHandle>> + Send>>;

/// Which advertised services a scan is interested in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceFilter {
    /// Required services. Empty accepts every peripheral.
    pub services: Vec<Uuid>,
}

impl ServiceFilter {
    /// Accept peripherals advertising `uuid`.
    pub fn service(uuid: Uuid) -> Self {
        Self {
            services: vec![uuid],
        }
    }

    /// Accept every peripheral.
    pub fn any() -> Self {
        Self::default()
    }

    /// Check if the filter accepts every peripheral.
    pub fn accepts_all(&self) -> bool {
        self.services.is_empty()
    }

    /// Check if a peripheral advertising `advertised` passes the filter.
    pub fn matches(&self, advertised: &[Uuid]) -> bool {
        self.services.iter().all(|uuid| advertised.contains(uuid))
    }
}

/// A discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralHandle {
    /// Transport-specific identifier.
    pub id: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
}

impl PeripheralHandle {
    /// Create a handle.
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// The advertised name, falling back to the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// An established link to a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    /// The peripheral this link belongs to.
    pub peripheral: PeripheralHandle,
}

/// A located service/characteristic pair that can be subscribed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionTarget {
    /// The link the pair lives on.
    pub link: Link,
    /// Service UUID.
    pub service: Uuid,
    /// Characteristic UUID.
    pub characteristic: Uuid,
}

/// An armed notification registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    /// Transport-assigned identifier, unique per transport instance.
    pub id: u64,
    /// What is subscribed.
    pub target: SubscriptionTarget,
}

/// The consumer half of an armed subscription.
#[derive(Debug)]
pub struct Subscription {
    /// Handle used to release the subscription.
    pub handle: SubscriptionHandle,
    /// Notifications in arrival order.
    pub notifications: mpsc::Receiver<RawNotification>,
    /// Resolves once if the link is lost. Cancelled if the subscription is
    /// released first.
    pub disconnected: oneshot::Receiver<()>,
}

impl Subscription {
    /// Create a subscription and the sink a transport feeds it from.
    pub fn channel(handle: SubscriptionHandle, capacity: usize) -> (Self, NotificationSink) {
        let (notify_tx, notify_rx) = mpsc::channel(capacity);
        let (disconnect_tx, disconnect_rx) = oneshot::channel();

        let subscription = Self {
            handle,
            notifications: notify_rx,
            disconnected: disconnect_rx,
        };
        let sink = NotificationSink {
            notifications: notify_tx,
            disconnect: Some(disconnect_tx),
        };
        (subscription, sink)
    }
}

/// Producer half of a [`Subscription`], held by the transport.
#[derive(Debug)]
pub struct NotificationSink {
    notifications: mpsc::Sender<RawNotification>,
    disconnect: Option<oneshot::Sender<()>>,
}

impl NotificationSink {
    /// Hand a notification to the consumer without waiting.
    ///
    /// Returns `false` if the consumer has gone away. A full buffer drops the
    /// notification.
    pub fn deliver(&mut self, notification: RawNotification) -> bool {
        match self.notifications.try_send(notification) {
            Ok(()) => true,
            Err(e) if e.is_full() => {
                warn!("Notification buffer full, dropping notification");
                true
            }
            Err(_) => {
                trace!("Notification consumer gone");
                false
            }
        }
    }

    /// Signal link loss. Only the first call has any effect.
    pub fn signal_disconnect(&mut self) {
        if let Some(tx) = self.disconnect.take() {
            let _ = tx.send(());
        }
    }

    /// Check if the link-loss signal has already fired.
    pub fn is_disconnected(&self) -> bool {
        self.disconnect.is_none()
    }
}

/// BLE capability surface the gateway is written against.
///
/// `unsubscribe` and `disconnect` are best-effort: failures are logged by the
/// implementation and never reach the caller.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Platform tag attached to forwarded events.
    fn platform(&self) -> String;

    /// Start scanning for peripherals matching `filter`.
    async fn discover(&self, filter: ServiceFilter) -> Result<DiscoveryStream>;

    /// Stop any active scan.
    async fn stop_discovery(&self);

    /// Establish a link to a discovered peripheral.
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Link>;

    /// Locate a service and one of its characteristics on a connected peripheral.
    async fn discover_service_and_characteristic(
        &self,
        link: &Link,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<SubscriptionTarget>;

    /// Arm notifications on `target`, buffering up to `capacity` of them.
    async fn subscribe(&self, target: &SubscriptionTarget, capacity: usize)
        -> Result<Subscription>;

    /// Release a subscription.
    async fn unsubscribe(&self, handle: &SubscriptionHandle);

    /// Tear down a link.
    async fn disconnect(&self, link: &Link);
}
