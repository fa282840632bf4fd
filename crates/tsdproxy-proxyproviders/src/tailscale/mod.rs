//! Tailscale proxy provider.
//!
//! Every proxy gets its own tailnet node: a dedicated `tailscaled` process
//! rooted at `<data_dir>/<hostname>/`, driven through the `tailscale` CLI
//! against that node's control socket. One identity, one hostname, one set
//! of listeners per proxy.

mod node;

pub use node::TailscaleNode;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tsdproxy_model::ProxyConfig;

use crate::{ProxyNode, ProxyProvider, ProxyProviderError};

/// Provider-wide settings shared by every node it mints.
#[derive(Debug, Clone, Default)]
pub struct TailscaleProviderConfig {
    /// Default auth key; a proxy's own key takes precedence.
    pub auth_key: String,
    /// Control plane URL; empty means the public tailscale coordination
    /// server.
    pub control_url: String,
    /// Root of per-node state directories.
    pub data_dir: PathBuf,
}

pub struct TailscaleProvider {
    name: String,
    config: TailscaleProviderConfig,
}

impl TailscaleProvider {
    pub fn new(name: impl Into<String>, config: TailscaleProviderConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

#[async_trait]
impl ProxyProvider for TailscaleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_proxy(
        &self,
        config: &ProxyConfig,
    ) -> Result<Arc<dyn ProxyNode>, ProxyProviderError> {
        let auth_key = if config.tailscale.auth_key.is_empty() {
            self.config.auth_key.clone()
        } else {
            config.tailscale.auth_key.clone()
        };

        debug!(provider = %self.name, hostname = %config.hostname, "minting tailscale node");

        let node = TailscaleNode::new(
            &config.hostname,
            self.config.data_dir.join(&config.hostname),
            auth_key,
            self.config.control_url.clone(),
            config.tailscale.clone(),
        );

        Ok(Arc::new(node))
    }
}
