//! In-memory providers for exercising the manager without docker or an
//! overlay.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use tsdproxy_manager::StatusEvents;
use tsdproxy_model::{PortConfig, ProxyConfig, ProxyEvent, Whois};
use tsdproxy_proxyproviders::{NodeListener, ProxyNode, ProxyProvider, ProxyProviderError};
use tsdproxy_targetproviders::{TargetAction, TargetEvent, TargetProvider, TargetProviderError};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default, Clone)]
pub struct MockNodeBehavior {
    /// Block `start` until [`MockNode::release`] is called.
    pub hold_start: bool,
    /// Login URL surfaced while `start` is held.
    pub auth_url: Option<String>,
    pub fail_start: bool,
    pub whois: Option<Whois>,
}

pub struct MockNode {
    behavior: MockNodeBehavior,
    pub started: AtomicBool,
    pub closed: AtomicBool,
    released: AtomicBool,
    release: Notify,
    pub listen_addrs: Mutex<Vec<SocketAddr>>,
}

impl MockNode {
    pub fn new(behavior: MockNodeBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            release: Notify::new(),
            listen_addrs: Mutex::new(Vec::new()),
        })
    }

    /// Let a held `start` complete.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyNode for MockNode {
    async fn start(&self, cancel: CancellationToken) -> Result<(), ProxyProviderError> {
        if self.behavior.fail_start {
            return Err(ProxyProviderError::Overlay("mock start failure".into()));
        }
        if self.behavior.hold_start && !self.released.load(Ordering::SeqCst) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProxyProviderError::Canceled),
                _ = self.release.notified() => {}
            }
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn auth_url(&self) -> Option<String> {
        if self.started.load(Ordering::SeqCst) {
            None
        } else {
            self.behavior.auth_url.clone()
        }
    }

    async fn listen(&self, _port: &PortConfig) -> Result<NodeListener, ProxyProviderError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        self.listen_addrs
            .lock()
            .unwrap()
            .push(listener.local_addr()?);
        Ok(NodeListener::Plain(listener))
    }

    async fn whois(&self, _remote: SocketAddr) -> Option<Whois> {
        self.behavior.whois.clone()
    }

    async fn close(&self) -> Result<(), ProxyProviderError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockProxyProvider {
    name: String,
    behavior: MockNodeBehavior,
    pub nodes: Mutex<Vec<Arc<MockNode>>>,
    pub minted: AtomicUsize,
}

impl MockProxyProvider {
    pub fn new(name: &str, behavior: MockNodeBehavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior,
            nodes: Mutex::new(Vec::new()),
            minted: AtomicUsize::new(0),
        })
    }

    /// Wait until the provider has minted at least `count` nodes and
    /// return the most recent one.
    pub async fn wait_for_node(&self, count: usize) -> Arc<MockNode> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            {
                let nodes = self.nodes.lock().unwrap();
                if nodes.len() >= count {
                    return nodes[count - 1].clone();
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for node {count}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl ProxyProvider for MockProxyProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_proxy(
        &self,
        _config: &ProxyConfig,
    ) -> Result<Arc<dyn ProxyNode>, ProxyProviderError> {
        let node = MockNode::new(self.behavior.clone());
        self.minted.fetch_add(1, Ordering::SeqCst);
        self.nodes.lock().unwrap().push(node.clone());
        Ok(node)
    }
}

/// Tracks how many `add_target` calls run at once.
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    pub max: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockTargetProvider {
    name: String,
    default_proxy_provider: String,
    pub configs: Mutex<HashMap<String, ProxyConfig>>,
    pub deleted: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub fail_delete: AtomicBool,
    pub add_delay: Mutex<Duration>,
    pub gauge: ConcurrencyGauge,
    events: Mutex<Option<mpsc::Sender<TargetEvent>>>,
}

impl MockTargetProvider {
    pub fn new(name: &str, default_proxy_provider: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            default_proxy_provider: default_proxy_provider.to_string(),
            configs: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            fail_delete: AtomicBool::new(false),
            add_delay: Mutex::new(Duration::ZERO),
            gauge: ConcurrencyGauge::default(),
            events: Mutex::new(None),
        })
    }

    /// Register the configuration `add_target` returns for `id`.
    pub fn set_target(&self, id: &str, hostname: &str) {
        self.configs
            .lock()
            .unwrap()
            .insert(id.to_string(), ProxyConfig::new(hostname));
    }

    pub fn set_target_config(&self, id: &str, config: ProxyConfig) {
        self.configs.lock().unwrap().insert(id.to_string(), config);
    }

    /// Inject a lifecycle event as if the orchestrator emitted it.
    pub async fn emit(self: &Arc<Self>, id: &str, action: TargetAction) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        let tx = loop {
            if let Some(tx) = self.events.lock().unwrap().clone() {
                break tx;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "watch_events was never called"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        let event = TargetEvent {
            provider: self.clone() as Arc<dyn TargetProvider>,
            id: id.to_string(),
            action,
        };
        tx.send(event).await.expect("manager stopped watching");
    }
}

#[async_trait]
impl TargetProvider for MockTargetProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch_events(
        self: Arc<Self>,
        cancel: CancellationToken,
        events: mpsc::Sender<TargetEvent>,
        errors: mpsc::Sender<TargetProviderError>,
    ) {
        *self.events.lock().unwrap() = Some(events.clone());
        tokio::spawn(async move {
            cancel.cancelled().await;
            drop(events);
            drop(errors);
        });
    }

    async fn add_target(&self, id: &str) -> Result<ProxyConfig, TargetProviderError> {
        self.gauge.enter();
        let delay = *self.add_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self
            .configs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TargetProviderError::TargetNotFound(id.to_string()));
        self.gauge.exit();

        let mut config = result?;
        config.target_provider = self.name.clone();
        config.target_id = id.to_string();
        Ok(config)
    }

    async fn delete_proxy(&self, id: &str) -> Result<(), TargetProviderError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(TargetProviderError::TargetNotFound(id.to_string()));
        }
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove_target(&self, id: &str) {
        self.removed.lock().unwrap().push(id.to_string());
    }

    fn default_proxy_provider_name(&self) -> &str {
        &self.default_proxy_provider
    }

    async fn close(&self) {}
}

/// Receive the next status event or panic after a timeout.
pub async fn next_event(subscription: &mut StatusEvents) -> ProxyEvent {
    tokio::time::timeout(RECV_TIMEOUT, subscription.recv())
        .await
        .expect("timed out waiting for status event")
        .expect("status channel closed")
}

/// Poll until `predicate` holds.
pub async fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for condition"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
