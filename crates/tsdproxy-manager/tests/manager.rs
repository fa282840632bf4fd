//! Manager behavior against in-memory providers: lifecycle ordering,
//! bounded concurrency, broker fan-out, teardown.

mod support;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use support::{
    next_event, wait_until, MockNodeBehavior, MockProxyProvider, MockTargetProvider,
};
use tsdproxy_manager::{ProxyManager, MAX_CONCURRENT_EVENT_HANDLERS};
use tsdproxy_model::ProxyStatus;
use tsdproxy_proxyproviders::ProxyProvider;
use tsdproxy_targetproviders::{TargetAction, TargetProvider};

fn build_manager(
    target: &Arc<MockTargetProvider>,
    proxy: &Arc<MockProxyProvider>,
) -> (ProxyManager, CancellationToken) {
    let manager = ProxyManager::new("default");
    manager.add_target_provider(target.name().to_string(), target.clone());
    manager.add_proxy_provider(proxy.name().to_string(), proxy.clone());
    manager.start();

    let cancel = CancellationToken::new();
    manager.watch_events(cancel.clone());
    (manager, cancel)
}

#[tokio::test]
async fn happy_path_emits_ordered_status_events() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new("default", MockNodeBehavior::default());
    let (manager, _cancel) = build_manager(&target, &proxy);

    let mut events = manager.subscribe_status_events();
    target.set_target("a", "foo");
    target.emit("a", TargetAction::StartProxy).await;

    assert_eq!(next_event(&mut events).await.status, ProxyStatus::Initializing);
    let starting = next_event(&mut events).await;
    assert_eq!(starting.status, ProxyStatus::Starting);
    assert_eq!(starting.id, "foo");
    // Once Starting is observable the table entry must exist.
    assert!(manager.get_proxy("foo").is_some());
    assert_eq!(next_event(&mut events).await.status, ProxyStatus::Running);

    let proxy_handle = manager.get_proxy("foo").expect("proxy in table");
    assert_eq!(proxy_handle.status(), ProxyStatus::Running);
}

#[tokio::test]
async fn stop_event_tears_the_proxy_down() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new("default", MockNodeBehavior::default());
    let (manager, _cancel) = build_manager(&target, &proxy);

    target.set_target("a", "foo");
    target.emit("a", TargetAction::StartProxy).await;
    let manager_probe = manager.clone();
    wait_until(move || {
        manager_probe
            .get_proxy("foo")
            .is_some_and(|p| p.status() == ProxyStatus::Running)
    })
    .await;

    let mut events = manager.subscribe_status_events();
    target.emit("a", TargetAction::StopProxy).await;

    assert_eq!(next_event(&mut events).await.status, ProxyStatus::Stopping);
    assert_eq!(next_event(&mut events).await.status, ProxyStatus::Stopped);

    let manager_probe = manager.clone();
    wait_until(move || manager_probe.get_proxy("foo").is_none()).await;

    assert_eq!(target.deleted.lock().unwrap().as_slice(), ["a"]);
    assert_eq!(target.removed.lock().unwrap().as_slice(), ["a"]);
    assert!(proxy.wait_for_node(1).await.is_closed());
}

#[tokio::test]
async fn failed_delete_leaves_the_proxy_in_place() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new("default", MockNodeBehavior::default());
    let (manager, _cancel) = build_manager(&target, &proxy);

    target.set_target("a", "foo");
    target.emit("a", TargetAction::StartProxy).await;
    let manager_probe = manager.clone();
    wait_until(move || {
        manager_probe
            .get_proxy("foo")
            .is_some_and(|p| p.status() == ProxyStatus::Running)
    })
    .await;

    target.fail_delete.store(true, Ordering::SeqCst);
    target.emit("a", TargetAction::StopProxy).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let kept = manager.get_proxy("foo").expect("proxy must stay in table");
    assert_eq!(kept.status(), ProxyStatus::Running);
}

#[tokio::test]
async fn restart_rebuilds_the_proxy() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new("default", MockNodeBehavior::default());
    let (manager, _cancel) = build_manager(&target, &proxy);

    target.set_target("a", "foo");
    target.emit("a", TargetAction::StartProxy).await;
    let manager_probe = manager.clone();
    wait_until(move || {
        manager_probe
            .get_proxy("foo")
            .is_some_and(|p| p.status() == ProxyStatus::Running)
    })
    .await;

    let mut events = manager.subscribe_status_events();
    target.emit("a", TargetAction::RestartProxy).await;

    let statuses: Vec<ProxyStatus> = [
        next_event(&mut events).await,
        next_event(&mut events).await,
        next_event(&mut events).await,
        next_event(&mut events).await,
        next_event(&mut events).await,
    ]
    .iter()
    .map(|e| e.status)
    .collect();
    assert_eq!(
        statuses,
        [
            ProxyStatus::Stopping,
            ProxyStatus::Stopped,
            ProxyStatus::Initializing,
            ProxyStatus::Starting,
            ProxyStatus::Running,
        ]
    );
    assert_eq!(proxy.minted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn start_and_stop_storm_settles_to_the_surviving_set() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new("default", MockNodeBehavior::default());
    let (manager, _cancel) = build_manager(&target, &proxy);

    for i in 0..20 {
        target.set_target(&format!("id-{i}"), &format!("host-{i}"));
    }
    for i in 0..20 {
        target
            .emit(&format!("id-{i}"), TargetAction::StartProxy)
            .await;
    }
    let manager_probe = manager.clone();
    wait_until(move || manager_probe.proxies().len() == 20).await;

    for i in (0..20).step_by(2) {
        target
            .emit(&format!("id-{i}"), TargetAction::StopProxy)
            .await;
    }
    let manager_probe = manager.clone();
    wait_until(move || manager_probe.proxies().len() == 10).await;

    for i in 0..20 {
        let present = manager.get_proxy(&format!("host-{i}")).is_some();
        assert_eq!(present, i % 2 == 1, "host-{i} presence");
    }
}

#[tokio::test]
async fn event_handlers_are_bounded_by_the_worker_pool() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new("default", MockNodeBehavior::default());
    let (manager, _cancel) = build_manager(&target, &proxy);

    *target.add_delay.lock().unwrap() = Duration::from_millis(100);
    for i in 0..80 {
        target.set_target(&format!("id-{i}"), &format!("host-{i}"));
    }
    for i in 0..80 {
        target
            .emit(&format!("id-{i}"), TargetAction::StartProxy)
            .await;
    }

    let manager_probe = manager.clone();
    wait_until(move || manager_probe.proxies().len() == 80).await;

    let max = target.gauge.max.load(Ordering::SeqCst);
    assert!(
        max <= MAX_CONCURRENT_EVENT_HANDLERS,
        "observed {max} concurrent handlers"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_subscriber_drops_events_without_blocking_others() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new("default", MockNodeBehavior::default());
    let (manager, _cancel) = build_manager(&target, &proxy);

    // Never drained; its buffer fills and overflow is dropped.
    let mut slow = manager.subscribe_status_events();

    let mut active = manager.subscribe_status_events();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    tokio::spawn(async move {
        while let Some(event) = active.recv().await {
            sink.lock().unwrap().push(event);
        }
    });

    // 40 proxies × (Initializing, Starting, Running) = 120 events.
    for i in 0..40 {
        target.set_target(&format!("id-{i}"), &format!("host-{i}"));
        target
            .emit(&format!("id-{i}"), TargetAction::StartProxy)
            .await;
    }

    let counter = received.clone();
    wait_until(move || counter.lock().unwrap().len() == 120).await;

    let mut slow_count = 0;
    while slow.try_recv().is_ok() {
        slow_count += 1;
    }
    assert!(slow_count <= 100, "slow subscriber got {slow_count} events");
}

#[tokio::test]
async fn auth_required_surfaces_the_login_url() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new(
        "default",
        MockNodeBehavior {
            hold_start: true,
            auth_url: Some("https://login.tailscale.com/a/abc".to_string()),
            ..MockNodeBehavior::default()
        },
    );
    let (manager, _cancel) = build_manager(&target, &proxy);

    let mut events = manager.subscribe_status_events();
    target.set_target("a", "foo");
    target.emit("a", TargetAction::StartProxy).await;

    assert_eq!(next_event(&mut events).await.status, ProxyStatus::Initializing);
    assert_eq!(next_event(&mut events).await.status, ProxyStatus::Starting);

    let authenticating = next_event(&mut events).await;
    assert_eq!(authenticating.status, ProxyStatus::Authenticating);
    assert_eq!(
        authenticating.auth_url.as_deref(),
        Some("https://login.tailscale.com/a/abc")
    );

    proxy.wait_for_node(1).await.release();
    assert_eq!(next_event(&mut events).await.status, ProxyStatus::Running);
}

#[tokio::test]
async fn failed_start_leaves_an_error_proxy_in_the_table() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new(
        "default",
        MockNodeBehavior {
            fail_start: true,
            ..MockNodeBehavior::default()
        },
    );
    let (manager, _cancel) = build_manager(&target, &proxy);

    let mut events = manager.subscribe_status_events();
    target.set_target("a", "foo");
    target.emit("a", TargetAction::StartProxy).await;

    assert_eq!(next_event(&mut events).await.status, ProxyStatus::Initializing);
    assert_eq!(next_event(&mut events).await.status, ProxyStatus::Starting);
    assert_eq!(next_event(&mut events).await.status, ProxyStatus::Error);

    let failed = manager.get_proxy("foo").expect("error proxies stay visible");
    assert_eq!(failed.status(), ProxyStatus::Error);
    assert!(failed.last_error().is_some());
}

#[tokio::test]
async fn unknown_proxy_provider_skips_the_target() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new("default", MockNodeBehavior::default());
    let (manager, _cancel) = build_manager(&target, &proxy);

    let mut config = tsdproxy_model::ProxyConfig::new("foo");
    config.proxy_provider = "nope".to_string();
    target.set_target_config("a", config);
    target.emit("a", TargetAction::StartProxy).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(manager.get_proxy("foo").is_none());
    assert_eq!(proxy.minted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn target_provider_default_wins_over_global_default() {
    let target = MockTargetProvider::new("mock", "alt");
    let default_provider = MockProxyProvider::new("default", MockNodeBehavior::default());
    let alt_provider = MockProxyProvider::new("alt", MockNodeBehavior::default());

    let manager = ProxyManager::new("default");
    manager.add_target_provider(target.name().to_string(), target.clone());
    manager.add_proxy_provider("default", default_provider.clone());
    manager.add_proxy_provider("alt", alt_provider.clone());
    manager.start();
    let cancel = CancellationToken::new();
    manager.watch_events(cancel);

    target.set_target("a", "foo");
    target.emit("a", TargetAction::StartProxy).await;

    let manager_probe = manager.clone();
    wait_until(move || manager_probe.get_proxy("foo").is_some()).await;
    alt_provider.wait_for_node(1).await;
    assert_eq!(default_provider.minted.load(Ordering::SeqCst), 0);
    assert_eq!(alt_provider.minted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_all_proxies_closes_everything() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new("default", MockNodeBehavior::default());
    let (manager, _cancel) = build_manager(&target, &proxy);

    for i in 0..3 {
        target.set_target(&format!("id-{i}"), &format!("host-{i}"));
        target
            .emit(&format!("id-{i}"), TargetAction::StartProxy)
            .await;
    }
    let manager_probe = manager.clone();
    wait_until(move || manager_probe.proxies().len() == 3).await;

    manager.stop_all_proxies().await;

    assert!(manager.proxies().is_empty());
    for i in 1..=3 {
        assert!(proxy.wait_for_node(i).await.is_closed());
    }
}

#[tokio::test]
async fn unsubscribe_closes_the_channel() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new("default", MockNodeBehavior::default());
    let (manager, _cancel) = build_manager(&target, &proxy);

    let mut events = manager.subscribe_status_events();
    manager.unsubscribe_status_events(events.id());
    assert!(events.recv().await.is_none());

    // Unknown ids are a no-op.
    manager.unsubscribe_status_events(9999);

    // Later proxies broadcast only to live subscribers.
    target.set_target("a", "foo");
    target.emit("a", TargetAction::StartProxy).await;
    let manager_probe = manager.clone();
    wait_until(move || manager_probe.get_proxy("foo").is_some()).await;
    assert_eq!(proxy.minted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancellation_stops_the_watchers() {
    let target = MockTargetProvider::new("mock", "");
    let proxy = MockProxyProvider::new("default", MockNodeBehavior::default());
    let (manager, cancel) = build_manager(&target, &proxy);

    target.set_target("a", "foo");
    target.emit("a", TargetAction::StartProxy).await;
    let manager_probe = manager.clone();
    wait_until(move || manager_probe.get_proxy("foo").is_some()).await;

    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    manager.stop_all_proxies().await;
    assert!(manager.proxies().is_empty());
}
