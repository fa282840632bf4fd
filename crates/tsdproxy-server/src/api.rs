//! Admin HTTP surface: readiness, the status event stream, and a JSON
//! snapshot of the proxy table.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::Stream;
use serde::Serialize;

use tsdproxy_manager::{ProxyManager, StatusEvents};

pub struct AppState {
    pub manager: ProxyManager,
    pub ready: AtomicBool,
}

impl AppState {
    pub fn new(manager: ProxyManager) -> Arc<Self> {
        Arc::new(Self {
            manager,
            ready: AtomicBool::new(false),
        })
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health/ready/", get(ready))
        .route("/stream", get(stream))
        .route("/proxies", get(list_proxies))
        .with_state(state)
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(serde_json::json!({"status": "OK"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "NOK"})),
        )
    }
}

#[derive(Debug, Serialize)]
struct ProxyView {
    id: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    dashboard: DashboardView,
    ports: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DashboardView {
    label: String,
    icon: String,
    visible: bool,
}

async fn list_proxies(State(state): State<Arc<AppState>>) -> Json<Vec<ProxyView>> {
    let mut views: Vec<ProxyView> = state
        .manager
        .proxies()
        .into_iter()
        .map(|proxy| ProxyView {
            id: proxy.config.hostname.clone(),
            status: proxy.status().to_string(),
            auth_url: proxy.auth_url(),
            error: proxy.last_error(),
            dashboard: DashboardView {
                label: proxy.config.dashboard.label.clone(),
                icon: proxy.config.dashboard.icon.clone(),
                visible: proxy.config.dashboard.visible,
            },
            ports: proxy
                .config
                .ports
                .iter()
                .map(|(label, port)| format!("{label}: {port}"))
                .collect(),
        })
        .collect();
    views.sort_by(|a, b| a.id.cmp(&b.id));

    Json(views)
}

/// Server-sent events feed of proxy status changes. The subscription is
/// dropped (and unsubscribed) when the client disconnects.
async fn stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.manager.subscribe_status_events();
    Sse::new(EventStream(subscription)).keep_alive(KeepAlive::default())
}

struct EventStream(StatusEvents);

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.0.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                let sse_event = Event::default()
                    .event("proxy-status")
                    .json_data(&event)
                    .unwrap_or_else(|_| Event::default());
                Poll::Ready(Some(Ok(sse_event)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        AppState::new(ProxyManager::new("default"))
    }

    #[tokio::test]
    async fn test_ready_endpoint_follows_the_flag() {
        let state = test_state();
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health/ready/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready(true);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health/ready/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_proxies_endpoint_starts_empty() {
        let app = router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/proxies")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert!(parsed.is_empty());
    }
}
