//! Proxy manager: provider registries, proxy table, event demux and the
//! status broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tsdproxy_model::{ProxyConfig, ProxyEvent, ProxyStatus};
use tsdproxy_proxyproviders::ProxyProvider;
use tsdproxy_targetproviders::{TargetAction, TargetEvent, TargetProvider};

use crate::proxy::Proxy;

/// Upper bound on concurrently running event handlers.
pub const MAX_CONCURRENT_EVENT_HANDLERS: usize = 50;
/// Buffer of each per-provider event channel.
pub const EVENT_CHANNEL_BUFFER: usize = 100;
/// Buffer of each per-provider error channel.
pub const ERROR_CHANNEL_BUFFER: usize = 1;
/// Buffer of each status subscriber channel.
pub const STATUS_EVENT_CHANNEL_BUFFER: usize = 100;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("proxy provider not found")]
    ProxyProviderNotFound,

    #[error("target provider not found")]
    TargetProviderNotFound,
}

struct Subscriber {
    tx: mpsc::Sender<ProxyEvent>,
    last_seen: DateTime<Utc>,
}

/// A live status subscription. Dropping the handle unsubscribes.
pub struct StatusEvents {
    id: u64,
    rx: mpsc::Receiver<ProxyEvent>,
    inner: Weak<Inner>,
}

impl StatusEvents {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ProxyEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<ProxyEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Poll for the next event; lets callers adapt the subscription into a
    /// stream (the SSE endpoint does).
    pub fn poll_recv(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<ProxyEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for StatusEvents {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_subscriber(self.id);
        }
    }
}

/// Registry of providers and proxies plus the status broker.
#[derive(Clone)]
pub struct ProxyManager {
    inner: Arc<Inner>,
}

/// Everything the manager tracks, guarded by one reader-writer lock.
/// Readers copy what they need and release; nothing is held across a call
/// into a proxy or a provider.
#[derive(Default)]
struct Registry {
    proxies: HashMap<String, Arc<Proxy>>,
    target_providers: HashMap<String, Arc<dyn TargetProvider>>,
    proxy_providers: HashMap<String, Arc<dyn ProxyProvider>>,
    subscribers: HashMap<u64, Subscriber>,
}

struct Inner {
    registry: RwLock<Registry>,
    next_subscriber_id: AtomicU64,
    /// Limits concurrent event handler tasks.
    event_slots: Arc<Semaphore>,
    default_proxy_provider: String,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProxyManager {
    pub fn new(default_proxy_provider: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Registry::default()),
                next_subscriber_id: AtomicU64::new(1),
                event_slots: Arc::new(Semaphore::new(MAX_CONCURRENT_EVENT_HANDLERS)),
                default_proxy_provider: default_proxy_provider.into(),
            }),
        }
    }

    pub fn add_target_provider(&self, name: impl Into<String>, provider: Arc<dyn TargetProvider>) {
        self.inner
            .write()
            .target_providers
            .insert(name.into(), provider);
    }

    pub fn add_proxy_provider(&self, name: impl Into<String>, provider: Arc<dyn ProxyProvider>) {
        self.inner
            .write()
            .proxy_providers
            .insert(name.into(), provider);
    }

    /// Check the registries are usable. Without at least one provider of
    /// each class no proxy can ever be built; that is logged, not fatal.
    pub fn start(&self) {
        let registry = self.inner.read();
        if registry.proxy_providers.is_empty() {
            error!("no proxy providers found");
            return;
        }
        if registry.target_providers.is_empty() {
            error!("no target providers found");
        }
    }

    /// Launch one watcher per target provider plus a join task that
    /// reports watcher panics. Returns immediately.
    pub fn watch_events(&self, cancel: CancellationToken) {
        let providers: Vec<(String, Arc<dyn TargetProvider>)> = self
            .inner
            .read()
            .target_providers
            .iter()
            .map(|(name, provider)| (name.clone(), provider.clone()))
            .collect();

        let mut handles = Vec::with_capacity(providers.len());
        for (name, provider) in providers {
            let inner = self.inner.clone();
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                inner.watch_provider(name, provider, token).await;
            }));
        }

        // A watcher that panics must not take the manager down; the join
        // task surfaces it and the other watchers keep running.
        tokio::spawn(async move {
            for handle in handles {
                if let Err(err) = handle.await {
                    if err.is_panic() {
                        error!(error = %err, "event watcher panicked");
                    }
                }
            }
            debug!("all watchers finished");
        });
    }

    /// Register a new status subscriber with a buffered channel.
    pub fn subscribe_status_events(&self) -> StatusEvents {
        let (tx, rx) = mpsc::channel(STATUS_EVENT_CHANNEL_BUFFER);
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        self.inner.write().subscribers.insert(
            id,
            Subscriber {
                tx,
                last_seen: Utc::now(),
            },
        );

        StatusEvents {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber; its channel closes once the sender is dropped.
    /// Safe to call with an unknown id.
    pub fn unsubscribe_status_events(&self, id: u64) {
        self.inner.remove_subscriber(id);
    }

    pub fn get_proxy(&self, hostname: &str) -> Option<Arc<Proxy>> {
        self.inner.read().proxies.get(hostname).cloned()
    }

    /// Snapshot of the proxy table.
    pub fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.inner.read().proxies.values().cloned().collect()
    }

    /// Concurrently close every proxy and wait for all of them.
    pub async fn stop_all_proxies(&self) {
        info!("shutdown all proxies");

        let hostnames: Vec<String> = self.inner.read().proxies.keys().cloned().collect();

        let mut teardown = JoinSet::new();
        for hostname in hostnames {
            let inner = self.inner.clone();
            teardown.spawn(async move { inner.remove_proxy(&hostname).await });
        }
        while let Some(result) = teardown.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    error!(error = %err, "proxy teardown panicked");
                }
            }
        }
    }
}

impl Inner {
    /// One watcher: wire the provider to fresh channels and demux its
    /// events through the worker pool until cancellation or until the
    /// provider closes its channels.
    async fn watch_provider(
        self: Arc<Self>,
        name: String,
        provider: Arc<dyn TargetProvider>,
        cancel: CancellationToken,
    ) {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let (errors_tx, mut errors_rx) = mpsc::channel(ERROR_CHANNEL_BUFFER);

        provider
            .clone()
            .watch_events(cancel.clone(), events_tx, errors_tx)
            .await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,

                event = events_rx.recv() => {
                    let Some(event) = event else {
                        debug!(provider = %name, "events channel closed, stopping watcher");
                        return;
                    };

                    // Acquire a slot before dispatching; an event storm
                    // queues here instead of growing tasks without bound.
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => return,
                        permit = self.event_slots.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return,
                        },
                    };

                    let inner = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        inner.handle_target_event(event).await;
                    });
                }

                error = errors_rx.recv() => {
                    match error {
                        Some(err) => error!(provider = %name, error = %err, "error watching events"),
                        None => {
                            debug!(provider = %name, "error channel closed, stopping watcher");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_target_event(self: Arc<Self>, event: TargetEvent) {
        match event.action {
            TargetAction::StartProxy => self.event_start(&event).await,
            TargetAction::StopProxy => self.event_stop(&event).await,
            TargetAction::RestartProxy => {
                // Not atomic by contract; a concurrent stop between the two
                // phases may leave no proxy behind.
                self.event_stop(&event).await;
                self.event_start(&event).await;
            }
            TargetAction::StartPort | TargetAction::StopPort | TargetAction::RestartPort => {
                debug!(target = %event.id, action = ?event.action, "port actions are not handled");
            }
        }
    }

    async fn event_start(self: &Arc<Self>, event: &TargetEvent) {
        debug!(target = %event.id, "adding target");

        let config = match event.provider.add_target(&event.id).await {
            Ok(config) => config,
            Err(err) => {
                error!(target = %event.id, error = %err, "error adding target");
                return;
            }
        };

        self.new_and_start_proxy(config).await;
    }

    async fn event_stop(&self, event: &TargetEvent) {
        debug!(target = %event.id, "stopping target");

        let Some(proxy) = self.get_proxy_by_target_id(&event.id) else {
            error!(target = %event.id, action = ?event.action, "no proxy found for target");
            return;
        };

        if let Err(err) = event.provider.delete_proxy(&event.id).await {
            error!(target = %event.id, error = %err, "target provider failed to delete target");
            return;
        }

        self.remove_proxy(&proxy.config.hostname).await;
    }

    async fn new_and_start_proxy(self: &Arc<Self>, config: ProxyConfig) {
        let hostname = config.hostname.clone();
        debug!(proxy = %hostname, "creating proxy");

        let provider = match self.resolve_proxy_provider(&config) {
            Ok(provider) => provider,
            Err(err) => {
                error!(proxy = %hostname, error = %err, "error resolving proxy provider");
                return;
            }
        };

        // Status transitions flow straight into the broker. The proxy only
        // holds a weak capability, so no ownership cycle forms.
        let weak = Arc::downgrade(self);
        let proxy = Proxy::new(config, provider, move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.broadcast_status_event(event);
            }
        });

        // Broadcast before insert: a subscriber that sees the table entry
        // must already have the Initializing event in its queue.
        self.broadcast_status_event(ProxyEvent::new(&hostname, ProxyStatus::Initializing));

        self.write().proxies.insert(hostname, proxy.clone());

        tokio::spawn(proxy.start());
    }

    /// Resolution order: explicit name in the config, the target
    /// provider's default, the global default.
    fn resolve_proxy_provider(
        &self,
        config: &ProxyConfig,
    ) -> Result<Arc<dyn ProxyProvider>, ManagerError> {
        let registry = self.read();

        if !config.proxy_provider.is_empty() {
            return registry
                .proxy_providers
                .get(&config.proxy_provider)
                .cloned()
                .ok_or(ManagerError::ProxyProviderNotFound);
        }

        let target_provider = registry
            .target_providers
            .get(&config.target_provider)
            .ok_or(ManagerError::TargetProviderNotFound)?;
        if let Some(provider) = registry
            .proxy_providers
            .get(target_provider.default_proxy_provider_name())
        {
            return Ok(provider.clone());
        }

        registry
            .proxy_providers
            .get(&self.default_proxy_provider)
            .cloned()
            .ok_or(ManagerError::ProxyProviderNotFound)
    }

    fn get_proxy_by_target_id(&self, target_id: &str) -> Option<Arc<Proxy>> {
        // Linear scan; the table is small.
        self.read()
            .proxies
            .values()
            .find(|proxy| proxy.config.target_id == target_id)
            .cloned()
    }

    /// Close a proxy and drop it from the table. The close path emits
    /// `Stopped` before the entry disappears.
    async fn remove_proxy(&self, hostname: &str) {
        let proxy = self.read().proxies.get(hostname).cloned();
        let Some(proxy) = proxy else { return };

        // No lock is held across the call into the proxy.
        proxy.close().await;

        self.write().proxies.remove(hostname);

        let target_provider = self
            .read()
            .target_providers
            .get(&proxy.config.target_provider)
            .cloned();
        if let Some(provider) = target_provider {
            provider.remove_target(&proxy.config.target_id).await;
        }

        debug!(proxy = %hostname, "removed proxy");
    }

    /// Best-effort fan-out: snapshot the subscriber list, send without any
    /// lock held, drop events for subscribers whose buffer is full.
    fn broadcast_status_event(&self, event: ProxyEvent) {
        let snapshot: Vec<(u64, mpsc::Sender<ProxyEvent>)> = self
            .read()
            .subscribers
            .iter()
            .map(|(id, subscriber)| (*id, subscriber.tx.clone()))
            .collect();

        for (id, tx) in snapshot {
            match tx.try_send(event.clone()) {
                Ok(()) => {
                    if let Some(subscriber) = self.write().subscribers.get_mut(&id) {
                        subscriber.last_seen = Utc::now();
                    }
                }
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, "subscriber channel full, skipping event broadcast");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    fn remove_subscriber(&self, id: u64) {
        self.write().subscribers.remove(&id);
    }
}
