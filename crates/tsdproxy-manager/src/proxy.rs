//! One proxy: an overlay node plus its port listeners, with a serialized
//! status stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tsdproxy_model::{ProxyConfig, ProxyEvent, ProxyStatus};
use tsdproxy_proxyproviders::{ProxyNode, ProxyProvider, ProxyProviderError};

use crate::port::PortListener;

/// First auth-poll delay; doubles up to [`AUTH_POLL_MAX`].
const AUTH_POLL_INITIAL: Duration = Duration::from_millis(500);
const AUTH_POLL_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum ProxyError {
    #[error(transparent)]
    Provider(#[from] ProxyProviderError),

    #[error("canceled")]
    Canceled,
}

type UpdateCallback = Box<dyn Fn(ProxyEvent) + Send + Sync>;

pub struct Proxy {
    pub config: ProxyConfig,
    provider: Arc<dyn ProxyProvider>,
    node: tokio::sync::RwLock<Option<Arc<dyn ProxyNode>>>,
    ports: tokio::sync::Mutex<Vec<PortListener>>,
    status: std::sync::Mutex<ProxyStatus>,
    last_error: std::sync::Mutex<Option<String>>,
    auth_url: std::sync::Mutex<Option<String>>,
    on_update: std::sync::Mutex<Option<UpdateCallback>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Proxy {
    /// Build a proxy in `Initializing` state. `on_update` receives every
    /// status transition; the manager points it at the status broker.
    pub fn new(
        config: ProxyConfig,
        provider: Arc<dyn ProxyProvider>,
        on_update: impl Fn(ProxyEvent) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            provider,
            node: tokio::sync::RwLock::new(None),
            ports: tokio::sync::Mutex::new(Vec::new()),
            status: std::sync::Mutex::new(ProxyStatus::Initializing),
            last_error: std::sync::Mutex::new(None),
            auth_url: std::sync::Mutex::new(None),
            on_update: std::sync::Mutex::new(Some(Box::new(on_update))),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> ProxyStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Message of the failure that drove the proxy into `Error`, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Login URL while the proxy is `Authenticating`.
    pub fn auth_url(&self) -> Option<String> {
        self.auth_url
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Join the overlay, bind every port and go `Running`. Any fatal error
    /// leaves the proxy in the table with status `Error`; there is no
    /// automatic retry.
    pub async fn start(self: Arc<Self>) {
        match self.run().await {
            Ok(()) => {}
            Err(ProxyError::Canceled) | Err(ProxyError::Provider(ProxyProviderError::Canceled)) => {
                debug!(proxy = %self.config.hostname, "start interrupted by shutdown");
            }
            Err(err) => {
                error!(proxy = %self.config.hostname, error = %err, "proxy failed to start");
                *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(err.to_string());
                self.set_status(ProxyStatus::Error);
            }
        }
    }

    async fn run(&self) -> Result<(), ProxyError> {
        self.set_status(ProxyStatus::Starting);

        let node = self.provider.new_proxy(&self.config).await?;
        *self.node.write().await = Some(node.clone());

        // The node may block on interactive auth. While it starts, poll
        // for the login URL with exponential backoff and surface it once.
        let start = node.start(self.cancel.clone());
        tokio::pin!(start);
        let mut backoff = AUTH_POLL_INITIAL;
        loop {
            tokio::select! {
                result = &mut start => {
                    result?;
                    break;
                }
                _ = tokio::time::sleep(backoff) => {
                    if let Some(url) = node.auth_url().await {
                        if self.status() != ProxyStatus::Authenticating {
                            info!(proxy = %self.config.hostname, url = %url, "waiting for overlay authentication");
                            *self.auth_url.lock().unwrap_or_else(|e| e.into_inner()) =
                                Some(url.clone());
                            *self.status.lock().unwrap_or_else(|e| e.into_inner()) =
                                ProxyStatus::Authenticating;
                            self.emit(
                                ProxyEvent::new(&self.config.hostname, ProxyStatus::Authenticating)
                                    .with_auth_url(url),
                            );
                        }
                    }
                    backoff = (backoff * 2).min(AUTH_POLL_MAX);
                }
                _ = self.cancel.cancelled() => return Err(ProxyError::Canceled),
            }
        }
        *self.auth_url.lock().unwrap_or_else(|e| e.into_inner()) = None;

        {
            let mut ports = self.ports.lock().await;
            for (label, port_config) in &self.config.ports {
                // A port that cannot bind fails the whole proxy.
                let listener = node.listen(port_config).await?;
                ports.push(PortListener::spawn(
                    label.clone(),
                    port_config.clone(),
                    listener,
                    node.clone(),
                    self.config.proxy_access_log,
                    self.cancel.child_token(),
                ));
            }
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(ProxyError::Canceled);
        }
        self.set_status(ProxyStatus::Running);
        info!(proxy = %self.config.hostname, ports = self.config.ports.len(), "proxy running");

        Ok(())
    }

    /// Tear the proxy down: listeners first, then the node. Idempotent;
    /// emits `Stopping` and `Stopped` exactly once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.set_status(ProxyStatus::Stopping);
        self.cancel.cancel();

        let mut ports = self.ports.lock().await;
        for port in ports.drain(..) {
            port.shutdown().await;
        }
        drop(ports);

        if let Some(node) = self.node.write().await.take() {
            if let Err(err) = node.close().await {
                error!(proxy = %self.config.hostname, error = %err, "error closing node");
            }
        }

        self.set_status(ProxyStatus::Stopped);

        // The callback is a capability, not an owning reference; release
        // it once the final event is out.
        *self.on_update.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn set_status(&self, status: ProxyStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
        self.emit(ProxyEvent::new(&self.config.hostname, status));
    }

    fn emit(&self, event: ProxyEvent) {
        let callback = self.on_update.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(callback) = callback.as_ref() {
            callback(event);
        }
    }
}
