//! Port configuration and the label grammars that produce it.
//!
//! Two grammars parse into a [`PortConfig`]:
//!
//! 1. Long labels: `<proxy port>[/<proxy protocol>]:<target port>[/<target protocol>]`
//!    - `443/https:8080/http` forwards the node's 443 to port 8080 on the target
//!    - `443:8080` uses the defaults (`https` in front, `http` behind)
//! 2. Redirect labels: `<proxy port>[/<proxy protocol>]-><url>`
//!    - `443/https->https://example.com/x` answers HTTP 308 with that location
//! 3. Short labels: `<proxy port>[/<proxy protocol>]`
//!    - no target yet; the target provider injects one later (autodetect)
//!
//! Option tokens may be appended after a trailing comma:
//! `443:8080,no_tlsvalidate,tailscale_funnel`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use url::Url;

const REDIRECT_SEPARATOR: &str = "->";
const PROXY_SEPARATOR: char = ':';
const PROTOCOL_SEPARATOR: char = '/';
const OPTION_SEPARATOR: char = ',';

const OPTION_NO_TLS_VALIDATE: &str = "no_tlsvalidate";
const OPTION_TAILSCALE_FUNNEL: &str = "tailscale_funnel";

pub const DEFAULT_PROXY_PORT: u16 = 443;
pub const DEFAULT_TARGET_PROTOCOL: Protocol = Protocol::Http;

/// Errors produced by the label grammars.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortParseError {
    #[error("invalid proxy configuration: {0}")]
    InvalidProxyConfig(String),

    #[error("invalid target configuration: {0}")]
    InvalidTargetConfig(String),
}

/// Protocol spoken on a listening socket or towards a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PortParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(PortParseError::InvalidProxyConfig(format!(
                "unknown protocol {other:?}"
            ))),
        }
    }
}

/// Tailscale-specific options of one port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailscalePort {
    /// Publish this port on the public internet through the overlay relay.
    #[serde(default)]
    pub funnel: bool,
}

/// How one listening socket of one proxy forwards or redirects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub proxy_port: u16,
    pub proxy_protocol: Protocol,
    /// Ordered target URLs. Selection is currently always the first entry;
    /// multiple targets are kept for future round-robin.
    pub targets: Vec<Url>,
    pub is_redirect: bool,
    pub tls_validate: bool,
    pub tailscale: TailscalePort,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            proxy_port: DEFAULT_PROXY_PORT,
            proxy_protocol: Protocol::Https,
            targets: Vec::new(),
            is_redirect: false,
            tls_validate: true,
            tailscale: TailscalePort::default(),
        }
    }
}

impl PortConfig {
    /// Parse a label, dispatching between the long and short grammars.
    pub fn parse(label: &str) -> Result<Self, PortParseError> {
        if label.contains(REDIRECT_SEPARATOR) || label.contains(PROXY_SEPARATOR) {
            Self::parse_long_label(label)
        } else {
            Self::parse_short_label(label)
        }
    }

    /// Parse a long label: proxy segment plus a target segment or redirect URL.
    pub fn parse_long_label(label: &str) -> Result<Self, PortParseError> {
        let mut config = PortConfig::default();
        let body = config.strip_options(label);

        if let Some((proxy, redirect)) = body.split_once(REDIRECT_SEPARATOR) {
            config.parse_proxy_segment(proxy)?;
            config.is_redirect = true;
            config.parse_redirect_target(redirect)?;
            return Ok(config);
        }

        let (proxy, target) = body.split_once(PROXY_SEPARATOR).ok_or_else(|| {
            PortParseError::InvalidProxyConfig(format!("missing ':' or '->' in {body:?}"))
        })?;
        if target.contains(PROXY_SEPARATOR) {
            return Err(PortParseError::InvalidProxyConfig(format!(
                "too many ':' in {body:?}"
            )));
        }

        config.parse_proxy_segment(proxy)?;
        config.parse_target_segment(target)?;

        Ok(config)
    }

    /// Parse a short label: proxy segment only, no target. The target must
    /// be injected later by the target provider.
    pub fn parse_short_label(label: &str) -> Result<Self, PortParseError> {
        let mut config = PortConfig::default();
        let body = config.strip_options(label);
        config.parse_proxy_segment(&body)?;
        Ok(config)
    }

    /// Consume known option tokens from the tail of the label, returning
    /// the remaining grammar body. Unknown tokens are left in place so a
    /// redirect URL containing a comma is not mangled.
    fn strip_options(&mut self, label: &str) -> String {
        let mut body = label.trim();
        while let Some((head, tail)) = body.rsplit_once(OPTION_SEPARATOR) {
            match tail.trim() {
                OPTION_NO_TLS_VALIDATE => self.tls_validate = false,
                OPTION_TAILSCALE_FUNNEL => self.tailscale.funnel = true,
                _ => break,
            }
            body = head;
        }
        body.trim().to_string()
    }

    fn parse_proxy_segment(&mut self, segment: &str) -> Result<(), PortParseError> {
        let mut parts = segment.split(PROTOCOL_SEPARATOR);

        let port = parts.next().unwrap_or_default();
        self.proxy_port = port.parse::<u16>().map_err(|err| {
            PortParseError::InvalidProxyConfig(format!("invalid proxy port {port:?}: {err}"))
        })?;
        if self.proxy_port == 0 {
            return Err(PortParseError::InvalidProxyConfig(
                "proxy port must be 1..65535".to_string(),
            ));
        }

        if let Some(protocol) = parts.next() {
            self.proxy_protocol = protocol.parse()?;
        }
        if parts.next().is_some() {
            return Err(PortParseError::InvalidProxyConfig(format!(
                "too many '/' in {segment:?}"
            )));
        }

        Ok(())
    }

    fn parse_target_segment(&mut self, segment: &str) -> Result<(), PortParseError> {
        let mut parts = segment.split(PROTOCOL_SEPARATOR);

        let port = parts.next().unwrap_or_default();
        let target_port = port.parse::<u16>().map_err(|err| {
            PortParseError::InvalidTargetConfig(format!("invalid target port {port:?}: {err}"))
        })?;
        if target_port == 0 {
            return Err(PortParseError::InvalidTargetConfig(
                "target port must be 1..65535".to_string(),
            ));
        }

        let protocol = match parts.next() {
            Some(p) => match p {
                "http" => Protocol::Http,
                "https" => Protocol::Https,
                other => {
                    return Err(PortParseError::InvalidTargetConfig(format!(
                        "unknown target protocol {other:?}"
                    )))
                }
            },
            None => DEFAULT_TARGET_PROTOCOL,
        };
        if parts.next().is_some() {
            return Err(PortParseError::InvalidTargetConfig(format!(
                "too many '/' in {segment:?}"
            )));
        }

        // Placeholder host; the target provider replaces it once the real
        // target address is known.
        let url = Url::parse(&format!("{protocol}://0.0.0.0:{target_port}")).map_err(|err| {
            PortParseError::InvalidTargetConfig(format!("error building target url: {err}"))
        })?;
        self.targets = vec![url];

        Ok(())
    }

    fn parse_redirect_target(&mut self, segment: &str) -> Result<(), PortParseError> {
        let url = Url::parse(segment).map_err(|err| {
            PortParseError::InvalidTargetConfig(format!("invalid redirect url {segment:?}: {err}"))
        })?;
        if url.scheme().is_empty() || url.host_str().map_or(true, str::is_empty) {
            return Err(PortParseError::InvalidTargetConfig(format!(
                "redirect url {segment:?} must carry a scheme and a host"
            )));
        }
        self.targets = vec![url];
        Ok(())
    }

    /// First target URL, if any target has been resolved yet.
    pub fn first_target(&self) -> Option<&Url> {
        self.targets.first()
    }

    pub fn add_target(&mut self, target: Url) {
        self.targets.push(target);
    }

    /// Replace a target URL with a new one, used when the target address
    /// changes underneath us (for example a container IP on restart).
    pub fn replace_target(&mut self, origin: &Url, target: Url) {
        for slot in &mut self.targets {
            if slot == origin {
                *slot = target.clone();
            }
        }
    }

    /// Render the configuration back into a long (or short) label. The
    /// result re-parses into an equal `PortConfig`.
    pub fn to_label(&self) -> String {
        let mut label = format!("{}/{}", self.proxy_port, self.proxy_protocol);

        if self.is_redirect {
            if let Some(target) = self.first_target() {
                label.push_str(REDIRECT_SEPARATOR);
                label.push_str(target.as_str());
            }
        } else if let Some(target) = self.first_target() {
            let port = target.port_or_known_default().unwrap_or(0);
            label.push(PROXY_SEPARATOR);
            label.push_str(&format!("{}{}{}", port, PROTOCOL_SEPARATOR, target.scheme()));
        }

        if !self.tls_validate {
            label.push(OPTION_SEPARATOR);
            label.push_str(OPTION_NO_TLS_VALIDATE);
        }
        if self.tailscale.funnel {
            label.push(OPTION_SEPARATOR);
            label.push_str(OPTION_TAILSCALE_FUNNEL);
        }

        label
    }
}

impl fmt::Display for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_label())
    }
}

impl Serialize for PortConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_label())
    }
}

impl<'de> Deserialize<'de> for PortConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        PortConfig::parse(&label).map_err(serde::de::Error::custom)
    }
}
