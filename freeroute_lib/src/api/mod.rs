//! HTTP control surface: the resolve event log over SSE, and CRUD on
//! manual domain lists. Grounded on
//! `original_source/service/src/web_server.py`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::warn;

use crate::events::EventBus;
use crate::lists::registry::ListRegistry;
use crate::net::interfaces;
use crate::router::Router as DomainRouter;

#[derive(Clone)]
struct ApiState {
    registry: Arc<Mutex<ListRegistry>>,
    router: Arc<DomainRouter>,
    event_bus: Arc<EventBus>,
    ignore_interfaces: Arc<Vec<String>>,
}

#[derive(Deserialize)]
struct DomainBody {
    domain: String,
}

pub async fn serve(
    port: u16,
    registry: Arc<Mutex<ListRegistry>>,
    router: Arc<DomainRouter>,
    event_bus: Arc<EventBus>,
    ignore_interfaces: Vec<String>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let state = ApiState {
        registry,
        router,
        event_bus,
        ignore_interfaces: Arc::new(ignore_interfaces),
    };

    let api = AxumRouter::new()
        .route("/api/event-log", get(event_log))
        .route("/api/domain-lists", get(list_domain_lists))
        .route(
            "/api/domain-lists/:name",
            get(get_domain_list).post(add_domain).delete(remove_domain),
        )
        .route("/api/interfaces", get(list_network_interfaces))
        .with_state(state);

    let app = match static_dir() {
        Some(dir) => api.fallback_service(ServeDir::new(dir)),
        None => api,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    Ok(())
}

/// `static/` then `ui/build/`, whichever exists first, matching the
/// Python original's search order.
fn static_dir() -> Option<&'static str> {
    for dir in ["static", "ui/build"] {
        if Path::new(dir).is_dir() {
            return Some(dir);
        }
    }
    None
}

async fn event_log(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(event) => Some(Ok(Event::default().json_data(event).unwrap())),
            Err(e) => {
                warn!("event log subscriber lagged: {}", e);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(15)))
}

async fn list_domain_lists(State(state): State<ApiState>) -> Json<Vec<String>> {
    Json(state.registry.lock().await.get_manual_lists())
}

async fn list_network_interfaces(
    State(state): State<ApiState>,
) -> Result<Json<Vec<interfaces::NetworkInterface>>, StatusCode> {
    interfaces::list_interfaces(&state.ignore_interfaces)
        .map(Json)
        .map_err(|e| {
            warn!("failed to list network interfaces: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_domain_list(
    State(state): State<ApiState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<Vec<String>>, StatusCode> {
    state
        .registry
        .lock()
        .await
        .get_all(&name)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn add_domain(
    State(state): State<ApiState>,
    AxumPath(name): AxumPath<String>,
    Json(body): Json<DomainBody>,
) -> Result<impl IntoResponse, StatusCode> {
    let spec = {
        let mut registry = state.registry.lock().await;
        let matcher = registry.get_matcher_mut(&name).ok_or(StatusCode::NOT_FOUND)?;
        matcher.add(&body.domain);
        registry.classify(&body.domain, &[]).await.cloned()
    };
    state.router.re_route(&body.domain, spec.as_ref()).await;
    Ok(Json("ok"))
}

async fn remove_domain(
    State(state): State<ApiState>,
    AxumPath(name): AxumPath<String>,
    Json(body): Json<DomainBody>,
) -> Result<impl IntoResponse, StatusCode> {
    let spec = {
        let mut registry = state.registry.lock().await;
        let matcher = registry.get_matcher_mut(&name).ok_or(StatusCode::NOT_FOUND)?;
        matcher.remove(&body.domain);
        registry.classify(&body.domain, &[]).await.cloned()
    };
    state.router.re_route(&body.domain, spec.as_ref()).await;
    Ok(Json("ok"))
}
