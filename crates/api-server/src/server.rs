//! API server — HTTP trigger and operator endpoints plus the Prometheus
//! exporter.

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use cadence_channels::gateway::MessageGateway;
use cadence_core::config::AppConfig;
use cadence_journey::JourneyStore;

use crate::rest::{self, AppState};

/// Build the HTTP router over `state`.
pub fn router<S, G>(state: AppState<S, G>) -> Router
where
    S: JourneyStore + 'static,
    G: MessageGateway + 'static,
{
    Router::new()
        // Journey trigger
        .route(
            "/v1/journeys/execute",
            get(rest::execute_journeys::<S, G>).post(rest::execute_journeys::<S, G>),
        )
        // Operator controls
        .route("/v1/enrollments/:id", get(rest::get_enrollment::<S, G>))
        .route("/v1/enrollments/:id/pause", post(rest::pause_enrollment::<S, G>))
        .route("/v1/enrollments/:id/resume", post(rest::resume_enrollment::<S, G>))
        // Operational endpoints
        .route("/health", get(rest::health_check::<S, G>))
        .route("/ready", get(rest::readiness::<S, G>))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Main API server.
pub struct ApiServer<S, G> {
    config: AppConfig,
    state: AppState<S, G>,
}

impl<S, G> ApiServer<S, G>
where
    S: JourneyStore + 'static,
    G: MessageGateway + 'static,
{
    pub fn new(config: AppConfig, state: AppState<S, G>) -> Self {
        Self { config, state }
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(self.state.clone());

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics exporter on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
