//! Docker target provider: discovers labeled containers through the Engine
//! API, follows start/die events, and builds proxy configurations by
//! inspecting containers.

mod autodetect;
mod client;
mod container;

pub use client::DockerClient;
pub use container::{LABEL_ENABLE, LABEL_IS_ENABLED, LABEL_PORT_PREFIX, LABEL_PREFIX};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tsdproxy_config::DockerTargetProviderConfig;
use tsdproxy_model::ProxyConfig;

use crate::{TargetAction, TargetEvent, TargetProvider, TargetProviderError};
use container::Container;

/// How often the container cache is reconciled against the engine.
pub const CONTAINER_RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

pub struct DockerTargetProvider {
    name: String,
    client: DockerClient,
    containers: std::sync::Mutex<HashMap<String, Container>>,
    target_hostname: String,
    default_proxy_provider: String,
    try_internal_network: bool,
    default_bridge_address: std::sync::Mutex<String>,
}

impl DockerTargetProvider {
    pub async fn new(
        name: &str,
        config: &DockerTargetProviderConfig,
    ) -> Result<Self, TargetProviderError> {
        let client = DockerClient::new(&config.host)?;

        let provider = Self {
            name: name.to_string(),
            client,
            containers: std::sync::Mutex::new(HashMap::new()),
            target_hostname: config.target_hostname.clone(),
            default_proxy_provider: config.default_proxy_provider.clone(),
            try_internal_network: config.try_docker_internal_network,
            default_bridge_address: std::sync::Mutex::new(String::new()),
        };

        provider.detect_default_bridge_address().await;

        Ok(provider)
    }

    /// Find the gateway of the engine's default bridge network; used when
    /// probing host-networked containers.
    async fn detect_default_bridge_address(&self) {
        let networks = match self.client.list_networks().await {
            Ok(networks) => networks,
            Err(err) => {
                error!(docker = %self.name, error = %err, "error listing docker networks");
                return;
            }
        };

        for network in networks {
            if network
                .options
                .get("com.docker.network.bridge.default_bridge")
                .map(String::as_str)
                != Some("true")
            {
                continue;
            }
            if let Some(gateway) = network.ipam.config.first().map(|c| c.gateway.trim()) {
                if !gateway.is_empty() {
                    info!(docker = %self.name, gateway, "default bridge network found");
                    *self
                        .default_bridge_address
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()) = gateway.to_string();
                }
            }
            return;
        }
    }

    fn default_bridge_address(&self) -> String {
        self.default_bridge_address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn event(self: &Arc<Self>, id: String, action: TargetAction) -> TargetEvent {
        TargetEvent {
            provider: self.clone(),
            id,
            action,
        }
    }

    /// Emit a start event for every eligible container already running.
    async fn start_all(
        self: Arc<Self>,
        cancel: CancellationToken,
        events: mpsc::Sender<TargetEvent>,
        errors: mpsc::Sender<TargetProviderError>,
    ) {
        let containers = match self.client.list_containers(LABEL_IS_ENABLED).await {
            Ok(containers) => containers,
            Err(err) => {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = errors.send(err) => {}
                }
                return;
            }
        };

        for summary in containers {
            let event = self.event(summary.id, TargetAction::StartProxy);
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = events.send(event) => {
                    if result.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn reconcile_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(CONTAINER_RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; skip the initial tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.reconcile_containers().await,
            }
        }
    }

    /// Drop cache entries for containers the engine no longer reports.
    /// Advisory only: the engine is expected to have emitted a die event
    /// for each of them, so no stop events are synthesized here.
    async fn reconcile_containers(&self) {
        let listed = match self.client.list_containers(LABEL_IS_ENABLED).await {
            Ok(containers) => containers,
            Err(err) => {
                error!(docker = %self.name, error = %err, "error listing containers for reconciliation");
                return;
            }
        };

        let actual: std::collections::HashSet<&str> =
            listed.iter().map(|c| c.id.as_str()).collect();

        let mut removed = 0usize;
        {
            let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
            containers.retain(|id, _| {
                let keep = actual.contains(id.as_str());
                if !keep {
                    debug!(docker = %self.name, container = %id, "removed stale container from cache");
                    removed += 1;
                }
                keep
            });
        }

        if removed > 0 {
            info!(docker = %self.name, count = removed, "reconciled stale containers from cache");
        }
    }
}

#[async_trait]
impl TargetProvider for DockerTargetProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch_events(
        self: Arc<Self>,
        cancel: CancellationToken,
        events: mpsc::Sender<TargetEvent>,
        errors: mpsc::Sender<TargetProviderError>,
    ) {
        let mut engine_events = match self
            .client
            .events(LABEL_IS_ENABLED, cancel.child_token())
            .await
        {
            Ok(rx) => rx,
            Err(err) => {
                let _ = errors.send(err).await;
                return;
            }
        };

        // Engine event pump. Owns a sender for both channels so they stay
        // open exactly as long as the stream is alive.
        let provider = self.clone();
        let event_tx = events.clone();
        let error_tx = errors.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let engine_event = tokio::select! {
                    _ = pump_cancel.cancelled() => return,
                    event = engine_events.recv() => match event {
                        Some(event) => event,
                        None => {
                            if !pump_cancel.is_cancelled() {
                                let _ = error_tx
                                    .send(TargetProviderError::Api(
                                        "docker event stream ended".to_string(),
                                    ))
                                    .await;
                            }
                            return;
                        }
                    },
                };

                let action = match engine_event.action.as_str() {
                    "start" => TargetAction::StartProxy,
                    "die" => TargetAction::StopProxy,
                    _ => continue,
                };
                info!(docker = %provider.name, container = %engine_event.actor.id, action = ?action, "container lifecycle event");

                let event = provider.event(engine_event.actor.id, action);
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        // Proxies for containers that were already running.
        let provider = self.clone();
        let start_cancel = cancel.clone();
        tokio::spawn(async move { provider.start_all(start_cancel, events, errors).await });

        tokio::spawn(self.reconcile_loop(cancel));
    }

    async fn add_target(&self, id: &str) -> Result<ProxyConfig, TargetProviderError> {
        let inspect = self.client.inspect_container(id).await?;

        let container = Container::from_inspect(
            inspect,
            &self.name,
            &self.target_hostname,
            &self.default_bridge_address(),
            self.try_internal_network,
        );

        let mut config = container.base_proxy_config()?;
        container.fill_targets(&mut config).await?;

        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), container);

        Ok(config)
    }

    async fn delete_proxy(&self, id: &str) -> Result<(), TargetProviderError> {
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        if containers.remove(id).is_none() {
            return Err(TargetProviderError::TargetNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn remove_target(&self, id: &str) {
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    fn default_proxy_provider_name(&self) -> &str {
        &self.default_proxy_provider
    }

    async fn close(&self) {
        debug!(docker = %self.name, "closing docker target provider");
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
