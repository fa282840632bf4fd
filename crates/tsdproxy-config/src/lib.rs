//! Process configuration, assembled from environment variables.
//!
//! tsdproxy is configured the way its container images are deployed: a
//! handful of `TSDPROXY_*` variables plus `DOCKER_HOST`. The result is one
//! docker target provider named `local`, one tailscale proxy provider named
//! `default`, and optional static list providers.

use std::collections::HashMap;
use std::env;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

pub const DOCKER_DEFAULT_NAME: &str = "local";
pub const TAILSCALE_DEFAULT_PROVIDER_NAME: &str = "default";

const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
const DEFAULT_DATA_DIR: &str = "/data";
const DOCKER_INTERNAL_HOSTNAME: &str = "host.docker.internal";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading auth key file {path}: {source}")]
    AuthKeyFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    /// Proxy provider used when neither the proxy nor its target provider
    /// names one.
    pub default_proxy_provider: String,
    pub docker: HashMap<String, DockerTargetProviderConfig>,
    pub lists: HashMap<String, ListTargetProviderConfig>,
    pub tailscale: TailscaleServersConfig,
}

/// Admin HTTP endpoint binding.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub hostname: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// One docker target provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerTargetProviderConfig {
    /// Docker Engine endpoint (`unix:///...` or `tcp://host:port`).
    pub host: String,
    /// Hostname substituted for the placeholder target address when a
    /// container publishes ports on the docker host itself.
    pub target_hostname: String,
    pub default_proxy_provider: String,
    /// Probe container-internal addresses before falling back to gateways.
    pub try_docker_internal_network: bool,
}

impl Default for DockerTargetProviderConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_DOCKER_HOST.to_string(),
            target_hostname: String::new(),
            default_proxy_provider: String::new(),
            try_docker_internal_network: false,
        }
    }
}

/// One static list target provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ListTargetProviderConfig {
    pub filename: PathBuf,
    #[serde(default)]
    pub default_proxy_provider: String,
}

/// Tailscale proxy providers plus the shared node state root.
#[derive(Debug, Clone)]
pub struct TailscaleServersConfig {
    pub providers: HashMap<String, TailscaleServerConfig>,
    /// Root of per-node state directories (`<data_dir>/<hostname>/`).
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TailscaleServerConfig {
    pub auth_key: String,
    pub auth_key_file: String,
    pub control_url: String,
}

impl AppConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            http: HttpConfig::default(),
            default_proxy_provider: String::new(),
            docker: HashMap::new(),
            lists: HashMap::new(),
            tailscale: TailscaleServersConfig {
                providers: HashMap::new(),
                data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            },
        };

        if let Ok(port) = env::var("TSDPROXY_HTTP_PORT") {
            config.http.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                name: "TSDPROXY_HTTP_PORT".to_string(),
                reason: format!("{port:?} is not a port number"),
            })?;
        }

        config.generate_docker_config();
        config.generate_tailscale_config()?;
        config.generate_list_config();

        Ok(config)
    }

    fn generate_docker_config(&mut self) {
        let mut docker = DockerTargetProviderConfig::default();

        if let Ok(host) = env::var("DOCKER_HOST") {
            if !host.is_empty() {
                docker.host = host;
            }
        }
        if let Ok(hostname) = env::var("TSDPROXY_HOSTNAME") {
            if !hostname.is_empty() {
                docker.target_hostname = hostname;
            }
        }

        // When tsdproxy itself runs inside docker, host.docker.internal
        // reaches published ports without further configuration.
        if resolves(DOCKER_INTERNAL_HOSTNAME) {
            info!(hostname = DOCKER_INTERNAL_HOSTNAME, "using docker internal hostname as default target");
            docker.target_hostname = DOCKER_INTERNAL_HOSTNAME.to_string();
        }

        self.docker.insert(DOCKER_DEFAULT_NAME.to_string(), docker);
    }

    fn generate_tailscale_config(&mut self) -> Result<(), ConfigError> {
        let mut ts = TailscaleServerConfig::default();

        let auth_key_file = env::var("TSDPROXY_AUTHKEYFILE").unwrap_or_default();
        let mut auth_key = env::var("TSDPROXY_AUTHKEY").unwrap_or_default();

        if !auth_key_file.is_empty() {
            auth_key = read_auth_key(Path::new(&auth_key_file))?;
            ts.auth_key_file = auth_key_file;
        }
        ts.auth_key = auth_key;

        if let Ok(control_url) = env::var("TSDPROXY_CONTROLURL") {
            ts.control_url = control_url;
        }
        if let Ok(data_dir) = env::var("TSDPROXY_DATADIR") {
            if !data_dir.is_empty() {
                self.tailscale.data_dir = PathBuf::from(data_dir);
            }
        }

        self.tailscale
            .providers
            .insert(TAILSCALE_DEFAULT_PROVIDER_NAME.to_string(), ts);

        if self.default_proxy_provider.is_empty() {
            self.default_proxy_provider = TAILSCALE_DEFAULT_PROVIDER_NAME.to_string();
        }

        Ok(())
    }

    fn generate_list_config(&mut self) {
        let Ok(lists) = env::var("TSDPROXY_LISTS") else {
            return;
        };

        for entry in lists.split(',').filter(|s| !s.trim().is_empty()) {
            let path = PathBuf::from(entry.trim());
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| entry.trim().to_string());
            debug!(provider = %name, file = %path.display(), "configured list provider");
            self.lists.insert(
                name,
                ListTargetProviderConfig {
                    filename: path,
                    default_proxy_provider: String::new(),
                },
            );
        }
    }
}

/// Read an auth key from a file, trimming whitespace. Secrets mounted by
/// orchestrators usually carry a trailing newline.
pub fn read_auth_key(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map(|key| key.trim().to_string())
        .map_err(|source| ConfigError::AuthKeyFile {
            path: path.to_path_buf(),
            source,
        })
}

fn resolves(hostname: &str) -> bool {
    (hostname, 0u16)
        .to_socket_addrs()
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_auth_key_trims() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tskey-auth-abc123  ").unwrap();
        let key = read_auth_key(file.path()).unwrap();
        assert_eq!(key, "tskey-auth-abc123");
    }

    #[test]
    fn test_read_auth_key_missing_file() {
        let err = read_auth_key(Path::new("/nonexistent/authkey")).unwrap_err();
        assert!(matches!(err, ConfigError::AuthKeyFile { .. }));
    }

    #[test]
    fn test_docker_defaults() {
        let docker = DockerTargetProviderConfig::default();
        assert_eq!(docker.host, DEFAULT_DOCKER_HOST);
        assert!(docker.target_hostname.is_empty());
    }

    #[test]
    fn test_resolves_rejects_garbage() {
        assert!(!resolves("no-such-host.invalid"));
    }
}
