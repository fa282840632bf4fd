//! Proxy lifecycle status and the events broadcast on every transition.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle states of one proxy.
///
/// The happy path is `Initializing → Starting → Authenticating? → Running`;
/// `Authenticating` only appears when the proxy provider needs interactive
/// login. Teardown runs `Stopping → Stopped`. `Error` is absorbing until the
/// proxy is rebuilt from a fresh `Initializing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    Initializing,
    Starting,
    Authenticating,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Initializing => "Initializing",
            ProxyStatus::Starting => "Starting",
            ProxyStatus::Authenticating => "Authenticating",
            ProxyStatus::Running => "Running",
            ProxyStatus::Stopping => "Stopping",
            ProxyStatus::Stopped => "Stopped",
            ProxyStatus::Error => "Error",
        }
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status transition, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyEvent {
    /// Proxy hostname.
    pub id: String,
    /// Port label, when the event concerns a single port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Interactive login URL, carried by `Authenticating` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    pub status: ProxyStatus,
}

impl ProxyEvent {
    pub fn new(id: impl Into<String>, status: ProxyStatus) -> Self {
        Self {
            id: id.into(),
            port: None,
            auth_url: None,
            status,
        }
    }

    pub fn with_auth_url(mut self, auth_url: impl Into<String>) -> Self {
        self.auth_url = Some(auth_url.into());
        self
    }
}
