//! Proxy configuration: the handoff artifact a target provider builds for
//! the proxy manager.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::port::PortConfig;

/// Ports keyed by label, ordered for stable iteration.
pub type PortConfigList = BTreeMap<String, PortConfig>;

pub const DEFAULT_DASHBOARD_ICON: &str = "tsdproxy";

/// Everything the manager needs to build one proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Unique overlay name; also the manager's table key.
    pub hostname: String,
    /// Name of the target provider that produced this config.
    #[serde(skip)]
    pub target_provider: String,
    /// Identifier of the target inside its provider, kept for deletion.
    #[serde(skip)]
    pub target_id: String,
    /// Explicit proxy provider override; empty means "use defaults".
    pub proxy_provider: String,
    pub ports: PortConfigList,
    pub tailscale: TailscaleConfig,
    pub dashboard: DashboardConfig,
    pub proxy_access_log: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            target_provider: String::new(),
            target_id: String::new(),
            proxy_provider: String::new(),
            ports: PortConfigList::new(),
            tailscale: TailscaleConfig::default(),
            dashboard: DashboardConfig::default(),
            proxy_access_log: true,
        }
    }
}

impl ProxyConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }
}

/// Per-proxy options for the tailscale proxy provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TailscaleConfig {
    /// Advertised ACL tags, comma separated (`tag:proxy,tag:web`).
    pub tags: String,
    pub auth_key: String,
    /// Ephemeral nodes are deleted from the tailnet on close.
    pub ephemeral: bool,
    pub run_web_client: bool,
    pub verbose: bool,
}

/// How the proxy is presented on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub label: String,
    pub icon: String,
    pub visible: bool,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            icon: DEFAULT_DASHBOARD_ICON.to_string(),
            visible: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_defaults() {
        let config = ProxyConfig::new("funnel-me");
        assert_eq!(config.hostname, "funnel-me");
        assert!(config.proxy_access_log);
        assert!(config.dashboard.visible);
        assert_eq!(config.dashboard.icon, DEFAULT_DASHBOARD_ICON);
        assert!(!config.tailscale.ephemeral);
    }

    #[test]
    fn test_yaml_deserialization() {
        let yaml = r#"
hostname: web
proxy_provider: default
ports:
  web: "443/https:8080/http"
  redir: "80/http->https://web.example.com"
tailscale:
  ephemeral: true
  tags: "tag:proxy"
dashboard:
  label: Web
"#;
        let config: ProxyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.hostname, "web");
        assert_eq!(config.ports.len(), 2);
        assert!(config.ports["redir"].is_redirect);
        assert!(config.tailscale.ephemeral);
        assert_eq!(config.tailscale.tags, "tag:proxy");
        assert_eq!(config.dashboard.label, "Web");
        assert!(config.dashboard.visible);
    }
}
