use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use parley_common::{ActiveUsers, IceServersResponse};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::registry::Registry;
use crate::router::{MessageRouter, RouterOptions};
use crate::signal::{self, Gateway, GatewayLimits};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub gateway: Arc<Gateway>,
    pub ice_servers: Arc<IceServersResponse>,
}

impl AppState {
    pub fn new(
        options: RouterOptions,
        limits: GatewayLimits,
        ice_servers: IceServersResponse,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let router = MessageRouter::new(registry.clone(), options);
        Self {
            registry,
            gateway: Arc::new(Gateway::new(router, limits)),
            ice_servers: Arc::new(ice_servers),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.router_options(),
            config.gateway_limits(),
            IceServersResponse {
                ice_servers: config.ice_servers(),
            },
        )
    }
}

impl axum::extract::FromRef<AppState> for Arc<Registry> {
    fn from_ref(state: &AppState) -> Self {
        state.registry.clone()
    }
}

impl axum::extract::FromRef<AppState> for Arc<Gateway> {
    fn from_ref(state: &AppState) -> Self {
        state.gateway.clone()
    }
}

impl axum::extract::FromRef<AppState> for Arc<IceServersResponse> {
    fn from_ref(state: &AppState) -> Self {
        state.ice_servers.clone()
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    sessions: usize,
    connections: usize,
}

async fn health(
    State(registry): State<Arc<Registry>>,
    State(gateway): State<Arc<Gateway>>,
) -> impl IntoResponse {
    Json(Health {
        status: "ok",
        sessions: registry.len().await,
        connections: gateway.active_connections(),
    })
}

async fn roster(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    Json(ActiveUsers {
        users: registry.snapshot().await,
    })
}

async fn ice_servers(State(servers): State<Arc<IceServersResponse>>) -> impl IntoResponse {
    Json(servers.as_ref().clone())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Parley signaling online" }))
        .route("/health", get(health))
        .route("/roster", get(roster))
        .route("/ice-servers", get(ice_servers))
        .route("/signal", get(signal::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves. Connection info is attached so the
/// gateway can log peer addresses.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
