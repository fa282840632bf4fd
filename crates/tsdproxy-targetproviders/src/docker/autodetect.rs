//! Target autodetection: TCP-probe the container the ways it might be
//! reachable and keep the first address that answers.
//!
//! Probe order:
//! 1. host networking: default bridge gateway + internal port
//! 2. each container IP + internal port
//! 3. each network gateway + published port
//!
//! Containers are often probed while still booting, so the full ladder is
//! retried with a generous sleep in between.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};
use url::Url;

use super::container::{build_target, Container};
use crate::TargetProviderError;

pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const AUTODETECT_TRIES: u32 = 10;
const AUTODETECT_SLEEP: Duration = Duration::from_secs(5);

/// Run the probe ladder until something answers, retrying the whole
/// sequence while the container may still be starting up.
pub(crate) async fn with_retries(
    container: &Container,
    scheme: &str,
    internal_port: u16,
    published_port: Option<u16>,
) -> Result<Url, TargetProviderError> {
    for attempt in 1..=AUTODETECT_TRIES {
        match try_connect(container, scheme, internal_port, published_port).await {
            Ok(url) => return Ok(url),
            Err(err) => {
                debug!(container = %container.name, attempt, error = %err, "autodetect attempt failed");
            }
        }
        if attempt < AUTODETECT_TRIES {
            tokio::time::sleep(AUTODETECT_SLEEP).await;
        }
    }

    Err(TargetProviderError::NoValidTarget(container.name.clone()))
}

/// One pass over the probe ladder.
pub(crate) async fn try_connect(
    container: &Container,
    scheme: &str,
    internal_port: u16,
    published_port: Option<u16>,
) -> Result<Url, TargetProviderError> {
    if let Ok(url) = try_internal_port(container, scheme, internal_port).await {
        return Ok(url);
    }

    if let Some(published) = published_port {
        if let Ok(url) = try_published_port(container, scheme, published).await {
            return Ok(url);
        }
    }

    Err(TargetProviderError::NoValidTarget(container.name.clone()))
}

async fn try_internal_port(
    container: &Container,
    scheme: &str,
    port: u16,
) -> Result<Url, TargetProviderError> {
    // Host networking leaves the container without its own address; the
    // service sits behind the default bridge gateway.
    if container.network_mode == "host" && !container.default_bridge_address.is_empty() {
        let gateway = &container.default_bridge_address;
        if dial(gateway, port).await.is_ok() {
            info!(container = %container.name, address = %gateway, port, "reachable via default bridge and internal port");
            return build_target(scheme, gateway, port);
        }
        debug!(container = %container.name, address = %gateway, port, "default bridge probe failed");
    }

    for ip in &container.ip_addresses {
        if dial(ip, port).await.is_ok() {
            info!(container = %container.name, address = %ip, port, "reachable via container ip and internal port");
            return build_target(scheme, ip, port);
        }
        debug!(container = %container.name, address = %ip, port, "internal probe failed");
    }

    Err(TargetProviderError::NoValidTarget(container.name.clone()))
}

async fn try_published_port(
    container: &Container,
    scheme: &str,
    port: u16,
) -> Result<Url, TargetProviderError> {
    for gateway in &container.gateways {
        if dial(gateway, port).await.is_ok() {
            info!(container = %container.name, address = %gateway, port, "reachable via network gateway and published port");
            return build_target(scheme, gateway, port);
        }
        debug!(container = %container.name, address = %gateway, port, "published probe failed");
    }

    Err(TargetProviderError::NoValidTarget(container.name.clone()))
}

async fn dial(host: &str, port: u16) -> Result<(), TargetProviderError> {
    let address = format!("{host}:{port}");
    timeout(DIAL_TIMEOUT, TcpStream::connect(&address))
        .await
        .map_err(|_| TargetProviderError::Api(format!("dial {address} timed out")))??;
    Ok(())
}
