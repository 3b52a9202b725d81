//! Admin/control surface, nested under `admin.path_prefix`.
//!
//! Every handler answers with JSON; failures use the same error envelope as the
//! proxied traffic so operators and clients parse one shape.
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Request, State, rejection::JsonRejection},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::Serialize;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::{
    adapters::{health_checker::TickReport, http_handler::GatewayState},
    core::{
        circuit_breaker::{BreakerStatus, CircuitState},
        error::GatewayError,
        instance::{ServiceInstance, ServiceRegistration},
        router::bearer_token,
    },
    metrics::MetricsSummary,
};

const UPTIME_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

type AdminResult<T> = Result<T, GatewayError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceView {
    #[serde(flatten)]
    instance: ServiceInstance,
    /// Healthy share of probes over the last 24h; null without history
    uptime_24h: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceView {
    name: String,
    active: bool,
    healthy_instances: usize,
    total_instances: usize,
    instances: Vec<InstanceView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryView {
    #[serde(flatten)]
    requests: MetricsSummary,
    healthy_services: usize,
    total_services: usize,
    open_circuit_breakers: usize,
    rate_limit_buckets: usize,
}

/// Admin routes, relative to the prefix; the caller nests them.
pub fn routes(state: GatewayState) -> Router<GatewayState> {
    Router::new()
        .route("/services", post(register_service).get(list_services))
        .route("/services/{name}", delete(deregister_service))
        .route("/services/{name}/{id}", delete(deregister_instance))
        .route("/services/{name}/{id}/heartbeat", put(heartbeat))
        .route("/circuit-breakers", get(list_circuit_breakers))
        .route("/circuit-breakers/{name}", get(get_circuit_breaker))
        .route("/metrics/summary", get(metrics_summary))
        .route("/health-checks/run", post(run_health_checks))
        .layer(middleware::from_fn_with_state(state, require_admin_token))
}

async fn require_admin_token(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin.token.as_deref() else {
        return next.run(req).await;
    };

    match bearer_token(req.headers()) {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => {
            next.run(req).await
        }
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "Rejected admin call with invalid token");
            GatewayError::Unauthorized("Invalid admin token".to_string()).into_response()
        }
        None => GatewayError::Unauthorized("Admin token required".to_string()).into_response(),
    }
}

async fn register_service(
    State(state): State<GatewayState>,
    payload: Result<Json<ServiceRegistration>, JsonRejection>,
) -> AdminResult<(StatusCode, Json<ServiceInstance>)> {
    let Json(registration) =
        payload.map_err(|rejection| GatewayError::Validation(rejection.body_text()))?;
    let instance = state
        .router
        .components()
        .registry
        .register_service(registration)
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn deregister_service(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> AdminResult<StatusCode> {
    state
        .router
        .components()
        .registry
        .deregister_service(&name, None)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deregister_instance(
    State(state): State<GatewayState>,
    Path((name, id)): Path<(String, String)>,
) -> AdminResult<StatusCode> {
    let components = state.router.components();
    components.registry.deregister_service(&name, Some(&id)).await?;
    components.balancer.forget_instance(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn heartbeat(
    State(state): State<GatewayState>,
    Path((name, id)): Path<(String, String)>,
) -> AdminResult<Json<ServiceInstance>> {
    let instance = state
        .router
        .components()
        .registry
        .heartbeat(&name, &id)
        .await?;
    Ok(Json(instance))
}

async fn list_services(State(state): State<GatewayState>) -> AdminResult<impl IntoResponse> {
    let snapshots = state.router.components().registry.list_all().await;

    let mut services = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        let healthy_instances = snapshot.healthy_count();
        let total_instances = snapshot.instances.len();
        let mut instances = Vec::with_capacity(total_instances);
        for instance in snapshot.instances {
            let uptime_24h = state
                .health_checker
                .uptime_percentage(&instance.id, UPTIME_WINDOW)
                .await?;
            instances.push(InstanceView {
                instance,
                uptime_24h,
            });
        }
        services.push(ServiceView {
            name: snapshot.name,
            active: snapshot.active,
            healthy_instances,
            total_instances,
            instances,
        });
    }

    Ok(Json(json!({ "services": services })))
}

async fn list_circuit_breakers(State(state): State<GatewayState>) -> impl IntoResponse {
    let breakers = state.router.components().breakers.snapshot().await;
    Json(json!({ "circuitBreakers": breakers }))
}

async fn get_circuit_breaker(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Json<BreakerStatus> {
    let breakers = &state.router.components().breakers;
    // a service that never failed has no breaker state yet
    let status = breakers.status(&name).await.unwrap_or(BreakerStatus {
        service: name,
        state: CircuitState::Closed,
        failure_count: 0,
        threshold: breakers.threshold(),
        next_attempt_at: None,
    });
    Json(status)
}

async fn metrics_summary(State(state): State<GatewayState>) -> impl IntoResponse {
    let components = state.router.components();
    Json(SummaryView {
        requests: components.metrics.summary().await,
        healthy_services: components.registry.healthy_service_count().await,
        total_services: components.registry.service_count(),
        open_circuit_breakers: components.breakers.open_count(),
        rate_limit_buckets: components.limiter.bucket_count(),
    })
}

async fn run_health_checks(State(state): State<GatewayState>) -> Json<TickReport> {
    tracing::info!("Health check cycle triggered through admin API");
    Json(state.health_checker.run_once().await)
}
