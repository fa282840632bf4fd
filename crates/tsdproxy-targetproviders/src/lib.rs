//! Target providers discover backends and tell the proxy manager about
//! their lifecycle.
//!
//! A provider watches its source of truth (the docker event stream, a
//! static file), emits [`TargetEvent`]s, and on demand builds the full
//! [`ProxyConfig`] for a target id. The manager owns the provider
//! references for the process lifetime; providers own their clients and
//! internal caches.

pub mod docker;
pub mod list;

pub use docker::DockerTargetProvider;
pub use list::ListTargetProvider;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tsdproxy_model::{PortParseError, ProxyConfig};

#[derive(Debug, Error)]
pub enum TargetProviderError {
    #[error("target {0} not found")]
    TargetNotFound(String),

    /// Autodetection exhausted every probe without reaching the target.
    #[error("no valid target found for {0}")]
    NoValidTarget(String),

    #[error("no port found in container {0}")]
    NoPortFound(String),

    #[error(transparent)]
    InvalidPort(#[from] PortParseError),

    #[error("docker api error: {0}")]
    Api(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid list file {path}: {reason}")]
    InvalidList { path: PathBuf, reason: String },
}

/// What the provider wants the manager to do with a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetAction {
    StartProxy,
    StopProxy,
    RestartProxy,
    StartPort,
    StopPort,
    RestartPort,
}

/// One lifecycle event, carrying a reference to the provider that owns the
/// target so the manager can call back into it.
#[derive(Clone)]
pub struct TargetEvent {
    pub provider: Arc<dyn TargetProvider>,
    pub id: String,
    pub action: TargetAction,
}

impl std::fmt::Debug for TargetEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetEvent")
            .field("provider", &self.provider.name())
            .field("id", &self.id)
            .field("action", &self.action)
            .finish()
    }
}

/// Capability surface every target provider implements.
#[async_trait]
pub trait TargetProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Launch the provider's watch tasks. Emits `StartProxy` once for every
    /// currently eligible target, then follows the source's lifecycle until
    /// cancellation. Both channels close (all senders drop) before the
    /// provider winds down.
    async fn watch_events(
        self: Arc<Self>,
        cancel: CancellationToken,
        events: mpsc::Sender<TargetEvent>,
        errors: mpsc::Sender<TargetProviderError>,
    );

    /// Build the full proxy configuration for a target id, probing the
    /// target as needed. Fails when no target endpoint is reachable.
    async fn add_target(&self, id: &str) -> Result<ProxyConfig, TargetProviderError>;

    /// Release target-side resources for an id. Unknown ids produce a
    /// `TargetNotFound` error the manager logs and discards.
    async fn delete_proxy(&self, id: &str) -> Result<(), TargetProviderError>;

    /// Drop the id from the provider's internal table; called by the
    /// manager after the proxy reached `Stopped`.
    async fn remove_target(&self, id: &str);

    /// Proxy provider used for this provider's targets when a proxy names
    /// none itself.
    fn default_proxy_provider_name(&self) -> &str;

    /// Release underlying client resources.
    async fn close(&self);
}
