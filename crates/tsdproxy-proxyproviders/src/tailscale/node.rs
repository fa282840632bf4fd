//! One tailnet node: a `tailscaled` child process plus the `tailscale` CLI
//! pointed at its control socket.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader as AsyncBufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use async_trait::async_trait;
use tsdproxy_model::{PortConfig, Protocol, TailscaleConfig, Whois};

use crate::{NodeListener, ProxyNode, ProxyProviderError};

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const WHOIS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Node identity learned from `tailscale status --json` once the node has
/// joined the tailnet.
#[derive(Debug, Clone)]
struct NodeInfo {
    dns_name: String,
    ip: IpAddr,
}

pub struct TailscaleNode {
    hostname: String,
    state_dir: PathBuf,
    socket_path: PathBuf,
    auth_key: String,
    control_url: String,
    ts: TailscaleConfig,

    tailscaled: tokio::sync::Mutex<Option<Child>>,
    auth_url: std::sync::Mutex<Option<String>>,
    info: std::sync::Mutex<Option<NodeInfo>>,
    whois_cache: tokio::sync::Mutex<HashMap<IpAddr, (Option<Whois>, Instant)>>,
}

impl TailscaleNode {
    pub fn new(
        hostname: &str,
        state_dir: PathBuf,
        auth_key: String,
        control_url: String,
        ts: TailscaleConfig,
    ) -> Self {
        let socket_path = state_dir.join("tailscaled.sock");
        Self {
            hostname: hostname.to_string(),
            state_dir,
            socket_path,
            auth_key,
            control_url,
            ts,
            tailscaled: tokio::sync::Mutex::new(None),
            auth_url: std::sync::Mutex::new(None),
            info: std::sync::Mutex::new(None),
            whois_cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn tailscale_command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("tailscale");
        cmd.arg("--socket").arg(&self.socket_path);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a `tailscale` subcommand to completion, returning stdout.
    async fn run_tailscale(&self, args: &[&str]) -> Result<String, ProxyProviderError> {
        let output = self
            .tailscale_command(args)
            .output()
            .await
            .map_err(|err| ProxyProviderError::Overlay(format!("running tailscale: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProxyProviderError::Overlay(format!(
                "tailscale {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn spawn_tailscaled(&self) -> Result<(), ProxyProviderError> {
        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .map_err(|err| ProxyProviderError::Overlay(format!("creating state dir: {err}")))?;

        let mut cmd = Command::new("tailscaled");
        cmd.arg("--statedir")
            .arg(&self.state_dir)
            .arg("--socket")
            .arg(&self.socket_path)
            .arg("--tun")
            .arg(tun_name(&self.hostname));
        if self.ts.verbose {
            cmd.arg("--verbose").arg("2");
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|err| ProxyProviderError::Overlay(format!("spawning tailscaled: {err}")))?;

        *self.tailscaled.lock().await = Some(child);
        Ok(())
    }

    async fn wait_for_socket(&self, cancel: &CancellationToken) -> Result<(), ProxyProviderError> {
        let deadline = Instant::now() + SOCKET_WAIT_TIMEOUT;
        while !self.socket_path.exists() {
            if Instant::now() >= deadline {
                return Err(ProxyProviderError::Overlay(format!(
                    "tailscaled socket {} did not appear",
                    self.socket_path.display()
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProxyProviderError::Canceled),
                _ = tokio::time::sleep(SOCKET_POLL_INTERVAL) => {}
            }
        }
        Ok(())
    }

    fn up_args(&self) -> Vec<String> {
        let mut args = vec![
            "up".to_string(),
            "--reset".to_string(),
            format!("--hostname={}", self.hostname),
        ];
        if !self.auth_key.is_empty() {
            args.push(format!("--authkey={}", self.auth_key));
        }
        if !self.ts.tags.is_empty() {
            args.push(format!("--advertise-tags={}", self.ts.tags));
        }
        if !self.control_url.is_empty() {
            args.push(format!("--login-server={}", self.control_url));
        }
        args
    }

    /// Drive `tailscale up`. Without an auth key the command blocks on
    /// interactive login and prints the URL; it is captured into
    /// `auth_url` for the proxy's status poller.
    async fn run_up(&self, cancel: &CancellationToken) -> Result<(), ProxyProviderError> {
        let args = self.up_args();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let mut child = self
            .tailscale_command(&arg_refs)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ProxyProviderError::Overlay(format!("running tailscale up: {err}")))?;

        // `up` reports the login URL on stderr; a reader task parks it in a
        // shared slot the poll loop below publishes from.
        let url_slot = Arc::new(std::sync::Mutex::new(None::<String>));
        if let Some(stderr) = child.stderr.take() {
            let slot = url_slot.clone();
            tokio::spawn(async move {
                let mut lines = AsyncBufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(url) = parse_auth_url(&line) {
                        *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(url);
                    }
                }
            });
        }

        let status = loop {
            if let Some(url) = url_slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                info!(hostname = %self.hostname, "tailscale login required");
                *self.auth_url.lock().unwrap_or_else(|e| e.into_inner()) = Some(url);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    return Err(ProxyProviderError::Overlay(format!("waiting for up: {err}")))
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(ProxyProviderError::Canceled);
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        };

        if !status.success() {
            return Err(ProxyProviderError::Overlay(
                "tailscale up exited with failure".to_string(),
            ));
        }

        // Authenticated; the login URL is no longer pending.
        *self.auth_url.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn fetch_node_info(&self) -> Result<NodeInfo, ProxyProviderError> {
        let output = self.run_tailscale(&["status", "--json"]).await?;
        let info = parse_status(&output)?;
        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
        Ok(info)
    }

    fn node_info(&self) -> Result<NodeInfo, ProxyProviderError> {
        self.info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ProxyProviderError::Overlay("node has not joined the tailnet".into()))
    }

    /// Fetch (or reuse) the node's HTTPS certificate and build a TLS
    /// acceptor from it.
    async fn tls_acceptor(&self) -> Result<TlsAcceptor, ProxyProviderError> {
        let info = self.node_info()?;
        let cert_path = self.state_dir.join(format!("{}.crt", info.dns_name));
        let key_path = self.state_dir.join(format!("{}.key", info.dns_name));

        if !cert_path.exists() || !key_path.exists() {
            self.run_tailscale(&[
                "cert",
                "--cert-file",
                &cert_path.to_string_lossy(),
                "--key-file",
                &key_path.to_string_lossy(),
                &info.dns_name,
            ])
            .await?;
        }

        let certs = rustls_pemfile::certs(&mut BufReader::new(
            File::open(&cert_path).map_err(ProxyProviderError::Listener)?,
        ))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ProxyProviderError::Tls(format!("parsing certificate: {err}")))?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(
            File::open(&key_path).map_err(ProxyProviderError::Listener)?,
        ))
        .map_err(|err| ProxyProviderError::Tls(format!("parsing key: {err}")))?
        .ok_or_else(|| ProxyProviderError::Tls("no private key in pem file".to_string()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| ProxyProviderError::Tls(err.to_string()))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

#[async_trait]
impl ProxyNode for TailscaleNode {
    async fn start(&self, cancel: CancellationToken) -> Result<(), ProxyProviderError> {
        self.spawn_tailscaled().await?;
        self.wait_for_socket(&cancel).await?;
        self.run_up(&cancel).await?;
        let info = self.fetch_node_info().await?;
        info!(hostname = %self.hostname, ip = %info.ip, dns_name = %info.dns_name, "node joined tailnet");

        if self.ts.run_web_client {
            if let Err(err) = self.run_tailscale(&["set", "--webclient=true"]).await {
                warn!(hostname = %self.hostname, error = %err, "could not enable web client");
            }
        }

        Ok(())
    }

    async fn auth_url(&self) -> Option<String> {
        self.auth_url.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn listen(&self, port: &PortConfig) -> Result<NodeListener, ProxyProviderError> {
        let info = self.node_info()?;
        let addr = SocketAddr::new(info.ip, port.proxy_port);

        let listener = TcpListener::bind(addr).await?;
        debug!(hostname = %self.hostname, %addr, protocol = %port.proxy_protocol, "listener bound");

        if port.tailscale.funnel {
            // Funnel ingress terminates at the relay and reaches this
            // listener from inside the host, so the scheme tells the
            // overlay how to speak to us, not the public side.
            let scheme = match port.proxy_protocol {
                Protocol::Https => "https+insecure",
                Protocol::Http => "http",
                Protocol::Tcp => "tcp",
            };
            let target = format!("{}://{}:{}", scheme, info.ip, port.proxy_port);
            self.run_tailscale(&["funnel", "--bg", &target]).await?;
            info!(hostname = %self.hostname, port = port.proxy_port, "port published on funnel");
        }

        match port.proxy_protocol {
            Protocol::Https => {
                let acceptor = self.tls_acceptor().await?;
                Ok(NodeListener::Tls(listener, acceptor))
            }
            Protocol::Http | Protocol::Tcp => Ok(NodeListener::Plain(listener)),
        }
    }

    async fn whois(&self, remote: SocketAddr) -> Option<Whois> {
        let ip = remote.ip();

        {
            let cache = self.whois_cache.lock().await;
            if let Some((who, stored)) = cache.get(&ip) {
                if stored.elapsed() < WHOIS_CACHE_TTL {
                    return who.clone();
                }
            }
        }

        let result = match self.run_tailscale(&["whois", "--json", &ip.to_string()]).await {
            Ok(output) => parse_whois(&output),
            Err(err) => {
                debug!(hostname = %self.hostname, %ip, error = %err, "whois lookup failed");
                None
            }
        };

        self.whois_cache
            .lock()
            .await
            .insert(ip, (result.clone(), Instant::now()));
        result
    }

    async fn close(&self) -> Result<(), ProxyProviderError> {
        let Some(mut child) = self.tailscaled.lock().await.take() else {
            return Ok(());
        };

        if let Err(err) = self.run_tailscale(&["serve", "reset"]).await {
            debug!(hostname = %self.hostname, error = %err, "serve reset failed");
        }
        if self.ts.ephemeral {
            if let Err(err) = self.run_tailscale(&["logout"]).await {
                warn!(hostname = %self.hostname, error = %err, "logout failed");
            }
        }

        let _ = child.kill().await;
        let _ = child.wait().await;

        if self.ts.ephemeral {
            if let Err(err) = tokio::fs::remove_dir_all(&self.state_dir).await {
                warn!(hostname = %self.hostname, error = %err, "could not remove node state");
            }
        }

        info!(hostname = %self.hostname, "node closed");
        Ok(())
    }
}

/// Build a tun interface name unique enough per node; linux caps interface
/// names at 15 bytes.
fn tun_name(hostname: &str) -> String {
    let sanitized: String = hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(11)
        .collect();
    format!("tsp-{sanitized}")
}

/// Extract the interactive login URL from one line of `tailscale up`
/// output.
fn parse_auth_url(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.starts_with("https://") && trimmed.contains("/a/") {
        Some(trimmed.to_string())
    } else {
        None
    }
}

#[derive(Deserialize)]
struct StatusRoot {
    #[serde(rename = "Self")]
    self_node: StatusSelf,
}

#[derive(Deserialize)]
struct StatusSelf {
    #[serde(rename = "DNSName")]
    dns_name: String,
    #[serde(rename = "TailscaleIPs")]
    tailscale_ips: Vec<String>,
}

fn parse_status(json: &str) -> Result<NodeInfo, ProxyProviderError> {
    let root: StatusRoot = serde_json::from_str(json)
        .map_err(|err| ProxyProviderError::Overlay(format!("parsing status json: {err}")))?;

    let dns_name = root.self_node.dns_name.trim_end_matches('.').to_string();
    if dns_name.is_empty() {
        return Err(ProxyProviderError::Overlay(
            "status json carries no dns name".to_string(),
        ));
    }

    let ip = root
        .self_node
        .tailscale_ips
        .iter()
        .find_map(|ip| ip.parse::<IpAddr>().ok().filter(IpAddr::is_ipv4))
        .ok_or_else(|| ProxyProviderError::Overlay("node has no tailscale ipv4".to_string()))?;

    Ok(NodeInfo { dns_name, ip })
}

#[derive(Deserialize)]
struct WhoisRoot {
    #[serde(rename = "Node")]
    node: Option<WhoisNode>,
    #[serde(rename = "UserProfile")]
    user_profile: Option<WhoisProfile>,
}

#[derive(Deserialize)]
struct WhoisNode {
    #[serde(rename = "StableID", default)]
    stable_id: String,
}

#[derive(Deserialize)]
struct WhoisProfile {
    #[serde(rename = "LoginName", default)]
    login_name: String,
    #[serde(rename = "DisplayName", default)]
    display_name: String,
    #[serde(rename = "ProfilePicURL", default)]
    profile_pic_url: String,
}

fn parse_whois(json: &str) -> Option<Whois> {
    let root: WhoisRoot = serde_json::from_str(json).ok()?;
    let profile = root.user_profile?;

    Some(Whois {
        id: root.node.map(|n| n.stable_id).unwrap_or_default(),
        username: profile.login_name,
        display_name: profile.display_name,
        profile_pic_url: profile.profile_pic_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_url() {
        assert_eq!(
            parse_auth_url("\thttps://login.tailscale.com/a/abc123"),
            Some("https://login.tailscale.com/a/abc123".to_string())
        );
        assert_eq!(parse_auth_url("To authenticate, visit:"), None);
        assert_eq!(parse_auth_url(""), None);
        assert_eq!(parse_auth_url("https://tailscale.com/kb"), None);
    }

    #[test]
    fn test_parse_status() {
        let json = r#"{
            "BackendState": "Running",
            "Self": {
                "DNSName": "web.tailnet-1234.ts.net.",
                "TailscaleIPs": ["100.101.102.103", "fd7a:115c::1"]
            }
        }"#;
        let info = parse_status(json).unwrap();
        assert_eq!(info.dns_name, "web.tailnet-1234.ts.net");
        assert_eq!(info.ip, "100.101.102.103".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_status_requires_ipv4() {
        let json = r#"{"Self": {"DNSName": "web.ts.net.", "TailscaleIPs": ["fd7a:115c::1"]}}"#;
        assert!(parse_status(json).is_err());
    }

    #[test]
    fn test_parse_whois() {
        let json = r#"{
            "Node": {"StableID": "nWEB1234", "Name": "laptop.tailnet-1234.ts.net."},
            "UserProfile": {
                "LoginName": "ada@example.com",
                "DisplayName": "Ada",
                "ProfilePicURL": "https://example.com/ada.png"
            }
        }"#;
        let who = parse_whois(json).unwrap();
        assert_eq!(who.id, "nWEB1234");
        assert_eq!(who.username, "ada@example.com");
        assert_eq!(who.display_name, "Ada");
        assert_eq!(who.profile_pic_url, "https://example.com/ada.png");
    }

    #[test]
    fn test_parse_whois_not_found() {
        assert!(parse_whois("{}").is_none());
        assert!(parse_whois("not json").is_none());
    }

    #[test]
    fn test_tun_name_is_short() {
        let name = tun_name("a-very-long-hostname-indeed");
        assert!(name.len() <= 15);
        assert!(name.starts_with("tsp-"));
    }
}
