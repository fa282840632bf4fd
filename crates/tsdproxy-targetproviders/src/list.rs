//! Static list target provider.
//!
//! Proxies come from a YAML file keyed by hostname. Unlike the docker
//! provider there is no lifecycle to follow: every entry gets a start event
//! when watching begins, and the provider then idles until shutdown.
//!
//! ```yaml
//! web:
//!   ports:
//!     main: "443/https:8080/http"
//!   targets:
//!     main: "http://192.168.1.10:8080"
//! docs:
//!   ports:
//!     redir: "443/https->https://docs.example.com"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use tsdproxy_config::ListTargetProviderConfig;
use tsdproxy_model::ProxyConfig;

use crate::{TargetAction, TargetEvent, TargetProvider, TargetProviderError};

/// One file entry: a proxy configuration plus explicit target URLs per
/// port label.
#[derive(Debug, Clone, Deserialize)]
struct ListEntry {
    #[serde(flatten)]
    config: ProxyConfig,
    #[serde(default)]
    targets: HashMap<String, Url>,
}

pub struct ListTargetProvider {
    name: String,
    filename: PathBuf,
    default_proxy_provider: String,
    entries: HashMap<String, ListEntry>,
    active: std::sync::Mutex<HashMap<String, ProxyConfig>>,
}

impl ListTargetProvider {
    pub fn new(name: &str, config: &ListTargetProviderConfig) -> Result<Self, TargetProviderError> {
        let raw = std::fs::read_to_string(&config.filename)?;
        let entries: HashMap<String, ListEntry> =
            serde_yaml::from_str(&raw).map_err(|err| TargetProviderError::InvalidList {
                path: config.filename.clone(),
                reason: err.to_string(),
            })?;

        info!(list = %name, file = %config.filename.display(), proxies = entries.len(), "loaded proxy list");

        Ok(Self {
            name: name.to_string(),
            filename: config.filename.clone(),
            default_proxy_provider: config.default_proxy_provider.clone(),
            entries,
            active: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn build_config(&self, hostname: &str) -> Result<ProxyConfig, TargetProviderError> {
        let entry = self
            .entries
            .get(hostname)
            .ok_or_else(|| TargetProviderError::TargetNotFound(hostname.to_string()))?;

        let mut config = entry.config.clone();
        config.hostname = hostname.to_string();
        config.target_provider = self.name.clone();
        config.target_id = hostname.to_string();
        if config.dashboard.label.is_empty() {
            config.dashboard.label = hostname.to_string();
        }

        for (label, port) in config.ports.iter_mut() {
            if port.is_redirect {
                continue;
            }
            if let Some(target) = entry.targets.get(label) {
                port.targets = vec![target.clone()];
            }
            // List entries carry their targets verbatim; a port that still
            // points at the placeholder host cannot be proxied.
            let unresolved = port
                .first_target()
                .map_or(true, |url| url.host_str() == Some("0.0.0.0"));
            if unresolved {
                return Err(TargetProviderError::InvalidList {
                    path: self.filename.clone(),
                    reason: format!("proxy {hostname:?} port {label:?} has no target url"),
                });
            }
        }

        Ok(config)
    }
}

#[async_trait]
impl TargetProvider for ListTargetProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch_events(
        self: Arc<Self>,
        cancel: CancellationToken,
        events: mpsc::Sender<TargetEvent>,
        errors: mpsc::Sender<TargetProviderError>,
    ) {
        let provider = self.clone();
        tokio::spawn(async move {
            for hostname in provider.entries.keys() {
                let event = TargetEvent {
                    provider: provider.clone() as Arc<dyn TargetProvider>,
                    id: hostname.clone(),
                    action: TargetAction::StartProxy,
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = events.send(event) => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }

            // The file is static; hold both channels open until shutdown.
            cancel.cancelled().await;
            drop(events);
            drop(errors);
        });
    }

    async fn add_target(&self, id: &str) -> Result<ProxyConfig, TargetProviderError> {
        let config = self.build_config(id)?;
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), config.clone());
        Ok(config)
    }

    async fn delete_proxy(&self, id: &str) -> Result<(), TargetProviderError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.remove(id).is_none() {
            return Err(TargetProviderError::TargetNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn remove_target(&self, id: &str) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    fn default_proxy_provider_name(&self) -> &str {
        &self.default_proxy_provider
    }

    async fn close(&self) {
        debug!(list = %self.name, "closing list target provider");
    }
}
