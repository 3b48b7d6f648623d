//! Single-shot pairing-prompt transport.
//!
//! Mirrors the browser-style "request a device" flow: candidates advertising
//! the service are collected for a prompt window, one is chosen, and the
//! discovery stream yields exactly that one before ending. If nothing
//! advertises the service the prompt is repeated once accepting every
//! device. Everything after discovery is delegated to the inner transport.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ble::transport::{
    DiscoveryStream, Link, PeripheralHandle, ServiceFilter, Subscription, SubscriptionHandle,
    SubscriptionTarget, Transport,
};
use crate::config::ConfigHandle;
use crate::error::{Error, Result};

/// Platform tag reported by [`RequesterTransport`].
pub const REQUESTER_PLATFORM: &str = "requester";

/// Picks one peripheral from the prompt's candidates.
pub trait DeviceChooser: Send + Sync {
    /// Choose a candidate, or `None` to cancel the prompt.
    fn choose(&self, selector: &str, candidates: &[PeripheralHandle]) -> Option<PeripheralHandle>;
}

impl<F> DeviceChooser for F
where
    F: Fn(&str, &[PeripheralHandle]) -> Option<PeripheralHandle> + Send + Sync,
{
    fn choose(&self, selector: &str, candidates: &[PeripheralHandle]) -> Option<PeripheralHandle> {
        self(selector, candidates)
    }
}

/// Chooses the candidate named like the selector, else the first one seen.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferSelector;

impl DeviceChooser for PreferSelector {
    fn choose(&self, selector: &str, candidates: &[PeripheralHandle]) -> Option<PeripheralHandle> {
        candidates
            .iter()
            .find(|c| c.name.as_deref() == Some(selector))
            .or_else(|| candidates.first())
            .cloned()
    }
}

/// Transport that resolves discovery through a single prompt.
pub struct RequesterTransport<T> {
    inner: T,
    config: ConfigHandle,
    prompt_window: Duration,
    chooser: Arc<dyn DeviceChooser>,
}

impl<T: Transport> RequesterTransport<T> {
    /// Default time candidates are collected for.
    pub const DEFAULT_PROMPT_WINDOW: Duration = Duration::from_secs(5);

    /// Wrap `inner`, reading the selector from `config` at prompt time.
    pub fn new(inner: T, config: ConfigHandle) -> Self {
        Self {
            inner,
            config,
            prompt_window: Self::DEFAULT_PROMPT_WINDOW,
            chooser: Arc::new(PreferSelector),
        }
    }

    /// Set how long each prompt collects candidates.
    pub fn with_prompt_window(mut self, window: Duration) -> Self {
        self.prompt_window = window;
        self
    }

    /// Replace the chooser.
    pub fn with_chooser(mut self, chooser: impl DeviceChooser + 'static) -> Self {
        self.chooser = Arc::new(chooser);
        self
    }

    /// Get the wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    async fn collect_candidates(&self, filter: ServiceFilter) -> Result<Vec<PeripheralHandle>> {
        let mut stream = self.inner.discover(filter).await?;
        let mut candidates: Vec<PeripheralHandle> = Vec::new();

        let window = tokio::time::sleep(self.prompt_window);
        tokio::pin!(window);

        let outcome = loop {
            tokio::select! {
                _ = &mut window => break Ok(()),
                item = stream.next() => match item {
                    Some(Ok(handle)) => {
                        if !candidates.iter().any(|c| c.id == handle.id) {
                            debug!("Prompt candidate: {} ({})", handle.display_name(), handle.id);
                            candidates.push(handle);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
            }
        };

        drop(stream);
        self.inner.stop_discovery().await;

        outcome.map(|()| candidates)
    }
}

#[async_trait]
impl<T: Transport> Transport for RequesterTransport<T> {
    fn platform(&self) -> String {
        REQUESTER_PLATFORM.to_string()
    }

    async fn discover(&self, filter: ServiceFilter) -> Result<DiscoveryStream> {
        let mut candidates = self.collect_candidates(filter.clone()).await?;

        if candidates.is_empty() && !filter.accepts_all() {
            info!("No device advertised the service, prompting for any device");
            candidates = self.collect_candidates(ServiceFilter::any()).await?;
        }

        let selector = self.config.load().device_selector.clone();
        let chosen = self
            .chooser
            .choose(&selector, &candidates)
            .ok_or_else(|| Error::Scan {
                reason: "no device selected".to_string(),
            });

        Ok(Box::pin(futures::stream::once(async move { chosen })))
    }

    async fn stop_discovery(&self) {
        // The prompt has already stopped the inner scan.
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Link> {
        self.inner.connect(peripheral).await
    }

    async fn discover_service_and_characteristic(
        &self,
        link: &Link,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<SubscriptionTarget> {
        self.inner
            .discover_service_and_characteristic(link, service, characteristic)
            .await
    }

    async fn subscribe(
        &self,
        target: &SubscriptionTarget,
        capacity: usize,
    ) -> Result<Subscription> {
        self.inner.subscribe(target, capacity).await
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.inner.unsubscribe(handle).await
    }

    async fn disconnect(&self, link: &Link) {
        self.inner.disconnect(link).await
    }
}
