use std::{any::Any, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request, State},
    http::{Response, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::{
    adapters::{admin, health_checker::HealthChecker},
    config::AdminConfig,
    core::{error::GatewayError, router::RequestRouter},
};

/// State shared by every axum handler of the gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub router: Arc<RequestRouter>,
    pub health_checker: Arc<HealthChecker>,
    /// Present when the binary installed the Prometheus recorder
    pub prometheus: Option<PrometheusHandle>,
    pub admin: Arc<AdminConfig>,
}

/// Assemble the axum application: liveness, Prometheus scrape, admin API and
/// the catch-all proxy.
pub fn build_app(state: GatewayState) -> Router {
    let mut app = Router::new()
        .route("/health", get(liveness))
        .route("/metrics", get(prometheus_metrics));

    if state.admin.enabled {
        let admin_routes = admin::routes(state.clone()).fallback(admin_not_found);
        let prefix = state.admin.path_prefix.trim_end_matches('/');
        app = if prefix.is_empty() {
            app.merge(admin_routes)
        } else {
            app.nest(prefix, admin_routes)
        };
        tracing::info!(prefix = %state.admin.path_prefix, "Admin API enabled");
    }

    app.fallback(proxy)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn liveness(State(state): State<GatewayState>) -> impl IntoResponse {
    let registry = &state.router.components().registry;
    let body = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "healthy": registry.healthy_service_count().await,
            "total": registry.service_count(),
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    (StatusCode::OK, Json(body))
}

async fn prometheus_metrics(State(state): State<GatewayState>) -> Response<AxumBody> {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => GatewayError::NotFound("Metrics recorder is not installed".to_string())
            .into_response(),
    }
}

async fn admin_not_found(req: Request) -> Response<AxumBody> {
    GatewayError::NotFound(format!("No admin endpoint {} {}", req.method(), req.uri().path()))
        .into_response()
}

async fn proxy(State(state): State<GatewayState>, req: Request) -> Response<AxumBody> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    state.router.handle(req, peer).await
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response<AxumBody> {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    tracing::error!(panic = %detail, "Request handler panicked");
    GatewayError::Internal("Unexpected failure while handling the request".to_string())
        .into_response()
}
