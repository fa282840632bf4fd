//! Proxy providers mint overlay-network nodes.
//!
//! A [`ProxyProvider`] is a factory keyed by name in the proxy manager; it
//! turns a proxy configuration into a [`ProxyNode`] bound to the overlay
//! identity of the proxy's hostname. The node joins the overlay (possibly
//! after interactive authentication), hands out listening sockets, resolves
//! caller identities, and releases everything on close.
//!
//! The only provider shipped today is [`tailscale`], but the manager treats
//! providers purely through this capability surface, so several providers
//! may coexist under different names.

pub mod tailscale;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use tsdproxy_model::{PortConfig, ProxyConfig, Whois};

#[derive(Debug, Error)]
pub enum ProxyProviderError {
    /// Fatal failure in the overlay layer; the proxy transitions to `Error`.
    #[error("overlay error: {0}")]
    Overlay(String),

    #[error("listener error: {0}")]
    Listener(#[from] io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    /// Start was interrupted by cancellation; not an error status.
    #[error("canceled")]
    Canceled,
}

/// Factory for overlay nodes, registered in the manager under a name.
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Mint a node for this proxy configuration. The node is not joined to
    /// the overlay until [`ProxyNode::start`] is called.
    async fn new_proxy(
        &self,
        config: &ProxyConfig,
    ) -> Result<Arc<dyn ProxyNode>, ProxyProviderError>;
}

/// One overlay node, owned by exactly one proxy.
#[async_trait]
pub trait ProxyNode: Send + Sync {
    /// Join the overlay. Blocks until the node is usable; when interactive
    /// authentication is required, [`ProxyNode::auth_url`] surfaces the
    /// login URL while this call is pending.
    async fn start(&self, cancel: CancellationToken) -> Result<(), ProxyProviderError>;

    /// Interactive login URL, if authentication is currently pending.
    async fn auth_url(&self) -> Option<String>;

    /// Bind one listening socket for the given port configuration.
    async fn listen(&self, port: &PortConfig) -> Result<NodeListener, ProxyProviderError>;

    /// Overlay identity of the remote peer, if it is known to the mesh.
    async fn whois(&self, remote: SocketAddr) -> Option<Whois>;

    /// Leave the overlay and release sockets and node state. Idempotent.
    async fn close(&self) -> Result<(), ProxyProviderError>;
}

/// A listening socket on an overlay node, optionally terminating TLS.
pub enum NodeListener {
    Plain(TcpListener),
    Tls(TcpListener, TlsAcceptor),
}

impl NodeListener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            NodeListener::Plain(listener) | NodeListener::Tls(listener, _) => listener.local_addr(),
        }
    }

    /// Accept one connection, completing the TLS handshake when this
    /// listener terminates TLS.
    pub async fn accept(&self) -> io::Result<(NodeStream, SocketAddr)> {
        match self {
            NodeListener::Plain(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((NodeStream::Plain(stream), peer))
            }
            NodeListener::Tls(listener, acceptor) => {
                let (stream, peer) = listener.accept().await?;
                let stream = acceptor.accept(stream).await?;
                Ok((NodeStream::Tls(Box::new(stream)), peer))
            }
        }
    }
}

/// An accepted connection, plain or TLS-terminated.
pub enum NodeStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for NodeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NodeStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            NodeStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NodeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NodeStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            NodeStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NodeStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            NodeStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NodeStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            NodeStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
