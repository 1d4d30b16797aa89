//! Rendezvous server that pairs two WebRTC peers through a generated
//! diceware passphrase and relays their offer, answer and ICE candidates.

pub mod config;
pub mod connection;
pub mod error;
pub mod index;
pub mod passphrase;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod router;
pub mod routes;
pub mod telemetry;
pub mod websocket;

use std::sync::Arc;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::passphrase::PassphraseGenerator;
use crate::reconciler::DisconnectReconciler;
use crate::registry::SessionRegistry;
use crate::router::SignalingRouter;

#[derive(Clone)]
pub struct AppState {
    pub router: SignalingRouter,
    pub reconciler: DisconnectReconciler,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            router: SignalingRouter::new(registry.clone()),
            reconciler: DisconnectReconciler::new(registry),
            metrics: None,
        }
    }

    pub fn from_generator(generator: Arc<dyn PassphraseGenerator>) -> Self {
        Self::new(SessionRegistry::new(generator))
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.router.registry()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(websocket::websocket_handler))
        .route("/ws", get(websocket::websocket_handler))
        .route("/healthz", get(routes::health_handler))
        .route("/debug/stats", get(routes::stats_handler))
        .route("/metrics", get(routes::metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
