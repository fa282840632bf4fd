//! Container view: labels plus the network facts needed to pick a target.

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;
use url::Url;

use tsdproxy_model::{PortConfig, ProxyConfig};

use super::autodetect;
use super::client::ContainerInspect;
use crate::TargetProviderError;

pub const LABEL_PREFIX: &str = "tsdproxy.";
pub const LABEL_ENABLE: &str = "tsdproxy.enable";
/// Engine-side filter expression for eligible containers.
pub const LABEL_IS_ENABLED: &str = "tsdproxy.enable=true";

pub const LABEL_NAME: &str = "tsdproxy.name";
pub const LABEL_CONTAINER_ACCESS_LOG: &str = "tsdproxy.containeraccesslog";
pub const LABEL_PROXY_PROVIDER: &str = "tsdproxy.proxyprovider";
pub const LABEL_PORT_PREFIX: &str = "tsdproxy.port.";
pub const LABEL_EPHEMERAL: &str = "tsdproxy.ephemeral";
pub const LABEL_RUN_WEB_CLIENT: &str = "tsdproxy.runwebclient";
pub const LABEL_TSNET_VERBOSE: &str = "tsdproxy.tsnet_verbose";
pub const LABEL_AUTHKEY: &str = "tsdproxy.authkey";
pub const LABEL_AUTHKEY_FILE: &str = "tsdproxy.authkeyfile";
pub const LABEL_AUTODETECT: &str = "tsdproxy.autodetect";
pub const LABEL_TAGS: &str = "tsdproxy.tags";

// Legacy single-port labels.
pub const LABEL_CONTAINER_PORT: &str = "tsdproxy.container_port";
pub const LABEL_SCHEME: &str = "tsdproxy.scheme";
pub const LABEL_TLS_VALIDATE: &str = "tsdproxy.tlsvalidate";
pub const LABEL_FUNNEL: &str = "tsdproxy.funnel";

pub const LABEL_DASHBOARD_VISIBLE: &str = "tsdproxy.dash.visible";
pub const LABEL_DASHBOARD_LABEL: &str = "tsdproxy.dash.label";
pub const LABEL_DASHBOARD_ICON: &str = "tsdproxy.dash.icon";

pub const DEFAULT_TARGET_SCHEME: &str = "http";

/// Placeholder host left by the label grammar until a real target is known.
const PLACEHOLDER_HOST: &str = "0.0.0.0";

#[derive(Debug, Clone)]
pub(crate) struct Container {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub network_mode: String,
    pub ip_addresses: Vec<String>,
    pub gateways: Vec<String>,
    pub exposed_ports: Vec<u16>,
    /// internal port → first published host port
    pub published_ports: HashMap<u16, u16>,
    pub default_bridge_address: String,
    pub target_hostname: String,
    pub provider_name: String,
    pub try_internal_network: bool,
}

impl Container {
    pub fn from_inspect(
        inspect: ContainerInspect,
        provider_name: &str,
        target_hostname: &str,
        default_bridge_address: &str,
        try_internal_network: bool,
    ) -> Self {
        let mut ip_addresses = Vec::new();
        let mut gateways = Vec::new();
        for endpoint in inspect.network_settings.networks.values() {
            if !endpoint.ip_address.is_empty() {
                ip_addresses.push(endpoint.ip_address.clone());
            }
            if !endpoint.gateway.is_empty() {
                gateways.push(endpoint.gateway.clone());
            }
        }
        ip_addresses.sort();
        gateways.sort();

        let mut exposed_ports: Vec<u16> = inspect
            .config
            .exposed_ports
            .keys()
            .filter_map(|key| parse_port_key(key))
            .collect();
        exposed_ports.sort_unstable();

        let mut published_ports = HashMap::new();
        for (key, bindings) in &inspect.network_settings.ports {
            let Some(internal) = parse_port_key(key) else {
                continue;
            };
            let Some(bindings) = bindings else { continue };
            if let Some(host_port) = bindings.first().and_then(|b| b.host_port.parse().ok()) {
                published_ports.insert(internal, host_port);
            }
        }

        Self {
            id: inspect.id,
            name: inspect.name.trim_start_matches('/').to_string(),
            labels: inspect.config.labels,
            network_mode: inspect.host_config.network_mode,
            ip_addresses,
            gateways,
            exposed_ports,
            published_ports,
            default_bridge_address: default_bridge_address.to_string(),
            target_hostname: target_hostname.to_string(),
            provider_name: provider_name.to_string(),
            try_internal_network,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.label_bool(LABEL_ENABLE, false)
    }

    fn autodetect_enabled(&self) -> bool {
        self.label_bool(LABEL_AUTODETECT, true)
    }

    fn label_bool(&self, key: &str, default: bool) -> bool {
        match self.labels.get(key).map(String::as_str) {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            _ => default,
        }
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str).filter(|s| !s.is_empty())
    }

    /// Overlay hostname: explicit label, else the container name made
    /// DNS-label safe.
    pub fn hostname(&self) -> String {
        self.label(LABEL_NAME)
            .map(str::to_string)
            .unwrap_or_else(|| sanitize_hostname(&self.name))
    }

    /// Build the proxy configuration from labels alone. Targets of
    /// non-redirect ports still point at the placeholder host afterwards;
    /// [`Container::fill_targets`] resolves them.
    pub fn base_proxy_config(&self) -> Result<ProxyConfig, TargetProviderError> {
        if !self.is_enabled() {
            return Err(TargetProviderError::TargetNotFound(self.id.clone()));
        }

        let hostname = self.hostname();
        let mut config = ProxyConfig::new(hostname.clone());
        config.target_provider = self.provider_name.clone();
        config.target_id = self.id.clone();

        if let Some(provider) = self.label(LABEL_PROXY_PROVIDER) {
            config.proxy_provider = provider.to_string();
        }
        config.proxy_access_log = self.label_bool(LABEL_CONTAINER_ACCESS_LOG, true);

        for (key, value) in &self.labels {
            let Some(label) = key.strip_prefix(LABEL_PORT_PREFIX) else {
                continue;
            };
            let port = PortConfig::parse(value)?;
            config.ports.insert(label.to_string(), port);
        }
        if config.ports.is_empty() {
            let (label, port) = self.legacy_port()?;
            config.ports.insert(label, port);
        }

        config.tailscale.ephemeral = self.label_bool(LABEL_EPHEMERAL, false);
        config.tailscale.run_web_client = self.label_bool(LABEL_RUN_WEB_CLIENT, false);
        config.tailscale.verbose = self.label_bool(LABEL_TSNET_VERBOSE, false);
        if let Some(tags) = self.label(LABEL_TAGS) {
            config.tailscale.tags = tags.to_string();
        }
        if let Some(auth_key) = self.label(LABEL_AUTHKEY) {
            config.tailscale.auth_key = auth_key.to_string();
        }
        if let Some(auth_key_file) = self.label(LABEL_AUTHKEY_FILE) {
            match tsdproxy_config::read_auth_key(Path::new(auth_key_file)) {
                Ok(key) => config.tailscale.auth_key = key,
                Err(err) => warn!(container = %self.name, error = %err, "could not read auth key file"),
            }
        }

        config.dashboard.visible = self.label_bool(LABEL_DASHBOARD_VISIBLE, true);
        config.dashboard.label = self
            .label(LABEL_DASHBOARD_LABEL)
            .map(str::to_string)
            .unwrap_or(hostname);
        if let Some(icon) = self.label(LABEL_DASHBOARD_ICON) {
            config.dashboard.icon = icon.to_string();
        }

        Ok(config)
    }

    /// Single-port configuration from the legacy labels, used when no
    /// `tsdproxy.port.<label>` labels are present.
    fn legacy_port(&self) -> Result<(String, PortConfig), TargetProviderError> {
        let container_port = match self.label(LABEL_CONTAINER_PORT) {
            Some(value) => value.parse::<u16>().map_err(|_| {
                TargetProviderError::Api(format!(
                    "container {}: invalid {LABEL_CONTAINER_PORT} {value:?}",
                    self.name
                ))
            })?,
            None => self
                .exposed_ports
                .first()
                .copied()
                .ok_or_else(|| TargetProviderError::NoPortFound(self.name.clone()))?,
        };
        let scheme = self.label(LABEL_SCHEME).unwrap_or(DEFAULT_TARGET_SCHEME);

        let mut port = PortConfig::parse_long_label(&format!("443/https:{container_port}/{scheme}"))?;
        port.tls_validate = self.label_bool(LABEL_TLS_VALIDATE, true);
        port.tailscale.funnel = self.label_bool(LABEL_FUNNEL, false);

        Ok(("default".to_string(), port))
    }

    /// Resolve the placeholder target of every non-redirect port, probing
    /// the container when autodetection is enabled.
    pub async fn fill_targets(&self, config: &mut ProxyConfig) -> Result<(), TargetProviderError> {
        for port in config.ports.values_mut() {
            if port.is_redirect {
                continue;
            }

            let placeholder = port
                .first_target()
                .map_or(true, |url| url.host_str() == Some(PLACEHOLDER_HOST));
            if !placeholder {
                continue;
            }

            let scheme = port
                .first_target()
                .map(|url| url.scheme().to_string())
                .unwrap_or_else(|| DEFAULT_TARGET_SCHEME.to_string());
            let internal_port = port
                .first_target()
                .and_then(Url::port_or_known_default)
                .or_else(|| self.exposed_ports.first().copied())
                .ok_or_else(|| TargetProviderError::NoPortFound(self.name.clone()))?;
            let published_port = self
                .published_ports
                .get(&internal_port)
                .copied()
                .or_else(|| self.published_ports.values().next().copied());

            let target = if self.autodetect_enabled() {
                autodetect::with_retries(self, &scheme, internal_port, published_port).await?
            } else {
                self.static_target(&scheme, internal_port, published_port)?
            };

            port.targets = vec![target];
        }

        Ok(())
    }

    /// Target without probing: docker-internal address when configured,
    /// else the provider's target hostname with the published port.
    fn static_target(
        &self,
        scheme: &str,
        internal_port: u16,
        published_port: Option<u16>,
    ) -> Result<Url, TargetProviderError> {
        if self.try_internal_network {
            if let Some(ip) = self.ip_addresses.first() {
                return build_target(scheme, ip, internal_port);
            }
        }

        let published = published_port
            .ok_or_else(|| TargetProviderError::NoValidTarget(self.name.clone()))?;
        let hostname = if self.target_hostname.is_empty() {
            self.gateways
                .first()
                .cloned()
                .ok_or_else(|| TargetProviderError::NoValidTarget(self.name.clone()))?
        } else {
            self.target_hostname.clone()
        };

        build_target(scheme, &hostname, published)
    }
}

pub(crate) fn build_target(
    scheme: &str,
    host: &str,
    port: u16,
) -> Result<Url, TargetProviderError> {
    Url::parse(&format!("{scheme}://{host}:{port}"))
        .map_err(|err| TargetProviderError::Api(format!("building target url: {err}")))
}

/// `"8080/tcp"` → `8080`; udp and malformed keys are skipped.
fn parse_port_key(key: &str) -> Option<u16> {
    let (port, proto) = key.split_once('/')?;
    if proto != "tcp" {
        return None;
    }
    port.parse().ok()
}

/// Container names may carry characters a DNS label cannot.
fn sanitize_hostname(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
