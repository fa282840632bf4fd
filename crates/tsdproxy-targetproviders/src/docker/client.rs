//! Minimal Docker Engine API client.
//!
//! Speaks HTTP/1.1 directly over the engine socket (`unix://` or `tcp://`),
//! one connection per request, with a detached driver task per connection.
//! Only the handful of endpoints the target provider needs are exposed.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TargetProviderError;

const EVENT_STREAM_BUFFER: usize = 32;

/// Where the engine listens.
#[derive(Debug, Clone)]
enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

#[derive(Debug, Clone)]
pub struct DockerClient {
    endpoint: Endpoint,
}

impl DockerClient {
    /// Build a client from a `DOCKER_HOST` style endpoint string.
    pub fn new(host: &str) -> Result<Self, TargetProviderError> {
        let endpoint = if let Some(path) = host.strip_prefix("unix://") {
            Endpoint::Unix(PathBuf::from(path))
        } else if let Some(addr) = host.strip_prefix("tcp://") {
            Endpoint::Tcp(addr.to_string())
        } else if let Some(addr) = host.strip_prefix("http://") {
            Endpoint::Tcp(addr.to_string())
        } else {
            return Err(TargetProviderError::Api(format!(
                "unsupported docker host {host:?}"
            )));
        };

        Ok(Self { endpoint })
    }

    /// List running containers carrying the enable label.
    pub async fn list_containers(
        &self,
        label: &str,
    ) -> Result<Vec<ContainerSummary>, TargetProviderError> {
        let filters = serde_json::json!({ "label": [label] }).to_string();
        let path = format!("/containers/json?filters={}", percent_encode(&filters));
        self.get_json(&path).await
    }

    pub async fn inspect_container(
        &self,
        id: &str,
    ) -> Result<ContainerInspect, TargetProviderError> {
        self.get_json(&format!("/containers/{id}/json")).await
    }

    pub async fn list_networks(&self) -> Result<Vec<Network>, TargetProviderError> {
        self.get_json("/networks").await
    }

    /// Stream engine events filtered to container start/die for labeled
    /// containers. The returned channel closes when the stream ends or the
    /// token fires.
    pub async fn events(
        &self,
        label: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<EngineEvent>, TargetProviderError> {
        let filters = serde_json::json!({
            "label": [label],
            "type": ["container"],
            "event": ["start", "die"],
        })
        .to_string();
        let path = format!("/events?filters={}", percent_encode(&filters));
        let response = self.request(&path).await?;

        let (tx, rx) = mpsc::channel(EVENT_STREAM_BUFFER);
        tokio::spawn(async move {
            let mut body = response.into_body();
            let mut buffer: Vec<u8> = Vec::new();

            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = body.frame() => frame,
                };
                match frame {
                    Some(Ok(frame)) => {
                        let Some(data) = frame.data_ref() else { continue };
                        buffer.extend_from_slice(data);
                        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            let line = &line[..line.len() - 1];
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_slice::<EngineEvent>(line) {
                                Ok(event) => {
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    debug!(error = %err, "skipping undecodable engine event")
                                }
                            }
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "docker event stream failed");
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(rx)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TargetProviderError> {
        let response = self.request(path).await?;
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| TargetProviderError::Api(format!("reading response body: {err}")))?
            .to_bytes();

        serde_json::from_slice(&body)
            .map_err(|err| TargetProviderError::Api(format!("decoding {path}: {err}")))
    }

    async fn request(&self, path: &str) -> Result<Response<Incoming>, TargetProviderError> {
        match &self.endpoint {
            Endpoint::Unix(socket) => {
                let stream = UnixStream::connect(socket).await?;
                self.send_request(stream, path).await
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                self.send_request(stream, path).await
            }
        }
    }

    async fn send_request<S>(
        &self,
        stream: S,
        path: &str,
    ) -> Result<Response<Incoming>, TargetProviderError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| TargetProviderError::Api(format!("engine handshake: {err}")))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(error = %err, "docker connection closed");
            }
        });

        let request = Request::builder()
            .uri(path)
            .header(http::header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .map_err(|err| TargetProviderError::Api(format!("building request: {err}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|err| TargetProviderError::Api(format!("sending request: {err}")))?;

        if response.status() == http::StatusCode::NOT_FOUND {
            return Err(TargetProviderError::TargetNotFound(path.to_string()));
        }
        if !response.status().is_success() {
            return Err(TargetProviderError::Api(format!(
                "engine returned {} for {path}",
                response.status()
            )));
        }

        Ok(response)
    }
}

/// Query-string encoding for the JSON filter parameter.
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 3);
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
    #[serde(rename = "State", default)]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerInspect {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Config", default)]
    pub config: ContainerConfig,
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
    #[serde(rename = "HostConfig", default)]
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
    #[serde(rename = "ExposedPorts", default)]
    pub exposed_ports: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSettings {
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, EndpointSettings>,
    #[serde(rename = "Ports", default)]
    pub ports: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(rename = "Gateway", default)]
    pub gateway: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    #[serde(rename = "NetworkMode", default)]
    pub network_mode: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Network {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Options", default)]
    pub options: HashMap<String, String>,
    #[serde(rename = "IPAM", default)]
    pub ipam: Ipam,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ipam {
    #[serde(rename = "Config", default)]
    pub config: Vec<IpamConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpamConfig {
    #[serde(rename = "Gateway", default)]
    pub gateway: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Type", default)]
    pub event_type: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parsing() {
        assert!(DockerClient::new("unix:///var/run/docker.sock").is_ok());
        assert!(DockerClient::new("tcp://127.0.0.1:2375").is_ok());
        assert!(DockerClient::new("http://127.0.0.1:2375").is_ok());
        assert!(DockerClient::new("ssh://example.com").is_err());
    }

    #[test]
    fn test_percent_encode() {
        assert_eq!(
            percent_encode(r#"{"label":["a=b"]}"#),
            "%7B%22label%22%3A%5B%22a%3Db%22%5D%7D"
        );
        assert_eq!(percent_encode("plain-text_1.0~x"), "plain-text_1.0~x");
    }

    #[test]
    fn test_decode_event() {
        let json = r#"{"Type":"container","Action":"start","Actor":{"ID":"abc123","Attributes":{"name":"web"}}}"#;
        let event: EngineEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.action, "start");
        assert_eq!(event.event_type, "container");
        assert_eq!(event.actor.id, "abc123");
    }

    #[test]
    fn test_decode_inspect_subset() {
        let json = r#"{
            "Id": "abc",
            "Name": "/web",
            "Config": {
                "Labels": {"tsdproxy.enable": "true"},
                "ExposedPorts": {"8080/tcp": {}}
            },
            "NetworkSettings": {
                "Networks": {"bridge": {"IPAddress": "172.17.0.2", "Gateway": "172.17.0.1"}},
                "Ports": {"8080/tcp": [{"HostIp": "0.0.0.0", "HostPort": "30080"}]}
            },
            "HostConfig": {"NetworkMode": "bridge"}
        }"#;
        let inspect: ContainerInspect = serde_json::from_str(json).unwrap();
        assert_eq!(inspect.name, "/web");
        assert_eq!(
            inspect.network_settings.networks["bridge"].ip_address,
            "172.17.0.2"
        );
        assert_eq!(inspect.config.exposed_ports.len(), 1);
        assert_eq!(inspect.host_config.network_mode, "bridge");
    }

    #[test]
    fn test_decode_network_list() {
        let json = r#"[{
            "Name": "bridge",
            "Options": {"com.docker.network.bridge.default_bridge": "true"},
            "IPAM": {"Config": [{"Gateway": "172.17.0.1", "Subnet": "172.17.0.0/16"}]}
        }]"#;
        let networks: Vec<Network> = serde_json::from_str(json).unwrap();
        assert_eq!(networks[0].ipam.config[0].gateway, "172.17.0.1");
        assert_eq!(
            networks[0].options["com.docker.network.bridge.default_bridge"],
            "true"
        );
    }
}
