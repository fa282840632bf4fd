//! One listening socket of one proxy: reverse proxy, redirector or raw TCP
//! passthrough.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HOST, LOCATION};
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tsdproxy_model::{
    PortConfig, Protocol, HEADER_DISPLAY_NAME, HEADER_PROFILE_PIC_URL, HEADER_USERNAME,
};
use tsdproxy_proxyproviders::{NodeListener, NodeStream, ProxyNode};

const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

type ProxyBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Error)]
enum UpstreamError {
    #[error("no target configured")]
    NoTarget,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream http error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("invalid header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),

    #[error("invalid uri: {0}")]
    Uri(#[from] http::uri::InvalidUri),

    #[error("invalid tls server name: {0}")]
    TlsName(String),
}

/// A bound socket with its accept task. Shutdown aborts the task and every
/// connection it spawned observes the cancellation token.
pub struct PortListener {
    label: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PortListener {
    pub fn spawn(
        label: String,
        config: PortConfig,
        listener: NodeListener,
        node: Arc<dyn ProxyNode>,
        access_log: bool,
        cancel: CancellationToken,
    ) -> Self {
        let tls = config
            .first_target()
            .filter(|target| !config.is_redirect && target.scheme() == "https")
            .map(|_| tls_connector(config.tls_validate));

        let context = Arc::new(ListenerContext {
            label: label.clone(),
            config,
            node,
            access_log,
            tls,
        });

        let accept_cancel = cancel.clone();
        let handle = tokio::spawn(accept_loop(listener, context, accept_cancel));

        Self {
            label,
            cancel,
            handle,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.handle.abort();
        let _ = self.handle.await;
    }
}

struct ListenerContext {
    label: String,
    config: PortConfig,
    node: Arc<dyn ProxyNode>,
    access_log: bool,
    /// Present when forwarding to an https target; validation mode is
    /// fixed by the port's `tls_validate` flag.
    tls: Option<TlsConnector>,
}

async fn accept_loop(
    listener: NodeListener,
    context: Arc<ListenerContext>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    debug!(port = %context.label, error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let context = context.clone();
        let conn_cancel = cancel.child_token();
        match context.config.proxy_protocol {
            Protocol::Tcp => {
                tokio::spawn(tcp_forward(stream, peer, context, conn_cancel));
            }
            Protocol::Http | Protocol::Https => {
                tokio::spawn(serve_http(stream, peer, context, conn_cancel));
            }
        }
    }
}

async fn serve_http(
    stream: NodeStream,
    peer: SocketAddr,
    context: Arc<ListenerContext>,
    cancel: CancellationToken,
) {
    let service = service_fn(move |request| {
        let context = context.clone();
        async move { context.handle(request, peer).await }
    });

    let connection = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(READ_HEADER_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service);

    tokio::select! {
        // Dropping the connection tears down any in-flight upstream
        // request along with it.
        _ = cancel.cancelled() => {}
        result = connection => {
            if let Err(err) = result {
                debug!(error = %err, "connection ended with error");
            }
        }
    }
}

impl ListenerContext {
    async fn handle(
        self: &Arc<Self>,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, std::convert::Infallible> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let result = if self.config.is_redirect {
            self.redirect(&request)
        } else {
            self.forward(request, peer).await
        };

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                // Runtime upstream failures answer 502 and do not touch
                // the proxy's status.
                warn!(port = %self.label, error = %err, "upstream request failed");
                let mut response = Response::new(full_body("bad gateway"));
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        };

        if self.access_log {
            info!(
                port = %self.label,
                peer = %peer,
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                "request"
            );
        }

        Ok(response)
    }

    /// Forward the request to the first target, streaming both bodies.
    async fn forward(
        &self,
        mut request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, UpstreamError> {
        let target = self.config.first_target().ok_or(UpstreamError::NoTarget)?;
        let host = target
            .host_str()
            .ok_or(UpstreamError::NoTarget)?
            .to_string();
        let port = target
            .port_or_known_default()
            .ok_or(UpstreamError::NoTarget)?;
        let authority = format!("{host}:{port}");

        self.inject_whois(&mut request, peer).await?;

        // Preserve the inbound Host when the protocols line up; rewrite it
        // when crossing http/https so the target sees a name it serves.
        let schemes_match = (self.config.proxy_protocol == Protocol::Https)
            == (target.scheme() == "https");
        if !schemes_match {
            request
                .headers_mut()
                .insert(HOST, HeaderValue::from_str(&authority)?);
        }

        // Upstream speaks origin-form HTTP/1.1.
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        *request.uri_mut() = path_and_query.parse()?;

        let stream = TcpStream::connect(&authority).await?;
        let response = match &self.tls {
            Some(connector) => {
                let server_name = ServerName::try_from(host)
                    .map_err(|err| UpstreamError::TlsName(err.to_string()))?;
                let tls_stream = connector.connect(server_name, stream).await?;
                send_upstream(TokioIo::new(tls_stream), request).await?
            }
            None => send_upstream(TokioIo::new(stream), request).await?,
        };

        Ok(response.map(BodyExt::boxed))
    }

    /// Strip the identity headers from the inbound request, then set them
    /// when the overlay knows who is calling.
    async fn inject_whois(
        &self,
        request: &mut Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<(), UpstreamError> {
        let headers = request.headers_mut();
        headers.remove(HEADER_USERNAME);
        headers.remove(HEADER_DISPLAY_NAME);
        headers.remove(HEADER_PROFILE_PIC_URL);

        let Some(who) = self.node.whois(peer).await else {
            return Ok(());
        };

        headers.insert(HEADER_USERNAME, HeaderValue::from_str(&who.username)?);
        headers.insert(HEADER_DISPLAY_NAME, HeaderValue::from_str(&who.display_name)?);
        headers.insert(
            HEADER_PROFILE_PIC_URL,
            HeaderValue::from_str(&who.profile_pic_url)?,
        );

        Ok(())
    }

    /// Permanent redirect to the configured URL, carrying the inbound
    /// query string along.
    fn redirect(&self, request: &Request<Incoming>) -> Result<Response<ProxyBody>, UpstreamError> {
        let target = self.config.first_target().ok_or(UpstreamError::NoTarget)?;

        let mut location = target.to_string();
        if let Some(query) = request.uri().query() {
            location.push(if target.query().is_some() { '&' } else { '?' });
            location.push_str(query);
        }

        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::PERMANENT_REDIRECT;
        response
            .headers_mut()
            .insert(LOCATION, HeaderValue::from_str(&location)?);

        Ok(response)
    }
}

async fn send_upstream<I>(
    io: TokioIo<I>,
    request: Request<Incoming>,
) -> Result<Response<Incoming>, UpstreamError>
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(error = %err, "upstream connection closed");
        }
    });

    Ok(sender.send_request(request).await?)
}

/// Raw TCP passthrough for `tcp` protocol ports.
async fn tcp_forward(
    mut downstream: NodeStream,
    peer: SocketAddr,
    context: Arc<ListenerContext>,
    cancel: CancellationToken,
) {
    let Some(target) = context.config.first_target() else {
        warn!(port = %context.label, "tcp port has no target");
        return;
    };
    let authority = match (target.host_str(), target.port_or_known_default()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        _ => {
            warn!(port = %context.label, "tcp target carries no host and port");
            return;
        }
    };

    let mut upstream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(port = %context.label, peer = %peer, error = %err, "tcp upstream unreachable");
            return;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut downstream, &mut upstream) => {
            match result {
                Ok((to_upstream, to_downstream)) => {
                    debug!(port = %context.label, peer = %peer, to_upstream, to_downstream, "tcp session ended");
                }
                Err(err) => {
                    debug!(port = %context.label, peer = %peer, error = %err, "tcp session failed");
                }
            }
        }
    }
}

fn tls_connector(validate: bool) -> TlsConnector {
    let config = if validate {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification))
            .with_no_client_auth()
    };

    TlsConnector::from(Arc::new(config))
}

fn empty_body() -> ProxyBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

fn full_body(content: &'static str) -> ProxyBody {
    Full::new(Bytes::from_static(content.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

mod danger {
    //! Certificate verifier for targets with `tls_validate` off, e.g.
    //! containers serving self-signed certificates.

    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
            ]
        }
    }
}
