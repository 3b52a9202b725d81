//! Request routing: the per-request pipeline composing every traffic component.
//!
//! For each inbound call the router matches a route, authenticates, applies the
//! rate limiter, consults the circuit breaker, picks an instance and forwards
//! with the route timeout. Every failure ends up as a [`GatewayError`] rendered
//! into the stable JSON envelope, so [`RequestRouter::handle`] never fails.
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Request, Response,
    header::{AUTHORIZATION, HOST},
    request::Parts,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::RouteConfig,
    core::{
        circuit_breaker::{BreakerAdmission, CircuitBreakerRegistry},
        error::GatewayError,
        instance::ServiceInstance,
        load_balancer::LoadBalancer,
        rate_limiter::{
            RateLimitDecision, RateLimitRequest, RateLimiter, algorithms::Admission,
            identity::client_ip,
        },
        registry::ServiceRegistry,
        route_table::{RouteTable, upstream_path},
    },
    metrics::{self, GatewayMetrics},
    tracing_setup,
    ports::{
        authenticator::{AuthError, Authenticator, Principal},
        http_client::{HttpClient, HttpClientError},
    },
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared components the router composes.
#[derive(Clone)]
pub struct RouterComponents {
    pub registry: Arc<ServiceRegistry>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub balancer: Arc<LoadBalancer>,
    pub authenticator: Arc<dyn Authenticator>,
    pub client: Arc<dyn HttpClient>,
    pub metrics: Arc<GatewayMetrics>,
}

pub struct RequestRouter {
    routes: ArcSwap<RouteTable>,
    components: RouterComponents,
}

impl RequestRouter {
    pub fn new(routes: Vec<RouteConfig>, components: RouterComponents) -> Self {
        Self {
            routes: ArcSwap::from_pointee(RouteTable::new(routes)),
            components,
        }
    }

    /// Replace the route table. Breaker and limiter state are untouched.
    pub fn reload_routes(&self, routes: Vec<RouteConfig>) {
        let table = RouteTable::new(routes);
        tracing::info!(routes = table.len(), "Route table reloaded");
        self.routes.store(Arc::new(table));
    }

    pub fn route_table(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    pub fn components(&self) -> &RouterComponents {
        &self.components
    }

    /// Run the full pipeline for one request. Errors become envelope responses.
    pub async fn handle(&self, req: Request<AxumBody>, peer: Option<SocketAddr>) -> Response<AxumBody> {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let span = tracing_setup::request_span(req.method().as_str(), req.uri().path(), &request_id);
        let current = span.clone();

        async move {
            let route = self.routes.load().find(req.method(), req.uri().path());
            let (service, result) = match route {
                Ok(route) => {
                    let result = self.dispatch(&route, req, peer, &request_id).await;
                    (route.target.clone(), result)
                }
                Err(e) => ("unmatched".to_string(), Err(e)),
            };
            current.record("service", service.as_str());

            let tally = result.as_ref().map(|_| ()).map_err(Clone::clone);
            self.components.metrics.record(&service, &tally).await;

            match result {
                Ok(mut response) => {
                    current.record("http.status_code", response.status().as_u16());
                    if let Ok(value) = HeaderValue::from_str(&request_id) {
                        response.headers_mut().insert(REQUEST_ID_HEADER, value);
                    }
                    tracing::debug!(status = %response.status(), service = %service, "Request completed");
                    response
                }
                Err(e) => {
                    current.record("http.status_code", e.status_code().as_u16());
                    if e.status_code().is_server_error() {
                        tracing::warn!(error = %e, code = e.code(), service = %service, "Request failed");
                    } else {
                        tracing::debug!(error = %e, code = e.code(), service = %service, "Request rejected");
                    }
                    e.to_response(Some(&request_id))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch(
        &self,
        route: &RouteConfig,
        req: Request<AxumBody>,
        peer: Option<SocketAddr>,
        request_id: &str,
    ) -> Result<Response<AxumBody>, GatewayError> {
        let peer_ip = peer.map(|addr| addr.ip());
        let principal = self.authenticate(route, req.headers()).await?;

        let decision = self
            .components
            .limiter
            .check(RateLimitRequest {
                route,
                path: req.uri().path(),
                headers: req.headers(),
                principal: principal.as_ref(),
                peer: peer_ip,
            })
            .await?;

        let (parts, body) = req.into_parts();
        let body = read_body(body, route.max_body_bytes).await?;

        let client = client_ip(&parts.headers, peer_ip);
        let mut response = self
            .forward_with_retries(route, &parts, body, client, request_id)
            .await?;

        if let RateLimitDecision::Allowed(admission) = decision {
            apply_rate_limit_headers(response.headers_mut(), &admission);
        }
        Ok(response)
    }

    /// Resolve the caller. Routes that require auth fail closed; others use a
    /// valid token when one is offered and ignore it otherwise.
    async fn authenticate(
        &self,
        route: &RouteConfig,
        headers: &HeaderMap,
    ) -> Result<Option<Principal>, GatewayError> {
        let token = bearer_token(headers);

        if !route.auth_required {
            let Some(token) = token else {
                return Ok(None);
            };
            return Ok(self.components.authenticator.verify(token).await.ok());
        }

        let token =
            token.ok_or_else(|| GatewayError::Unauthorized("Missing bearer token".to_string()))?;
        let principal = match self.components.authenticator.verify(token).await {
            Ok(principal) => principal,
            Err(AuthError::InvalidToken) => {
                return Err(GatewayError::Unauthorized(
                    "Invalid or expired token".to_string(),
                ));
            }
            Err(e) => return Err(GatewayError::Internal(e.to_string())),
        };

        if !route.roles.is_empty() && !principal.has_any_role(&route.roles) {
            return Err(GatewayError::Forbidden(format!(
                "Route {} requires one of the roles: {}",
                route.path,
                route.roles.join(", ")
            )));
        }
        Ok(Some(principal))
    }

    async fn forward_with_retries(
        &self,
        route: &RouteConfig,
        parts: &Parts,
        body: Bytes,
        client: Option<IpAddr>,
        request_id: &str,
    ) -> Result<Response<AxumBody>, GatewayError> {
        let service = route.target.as_str();
        let attempts = if route.idempotent {
            route.retries.saturating_add(1)
        } else {
            1
        };
        let mut excluded: Vec<String> = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..attempts {
            let admission = if route.circuit_breaker {
                match self.components.breakers.admit(service).await {
                    Some(admission) => admission,
                    None => {
                        return Err(last_error.unwrap_or_else(|| GatewayError::CircuitOpen {
                            service: service.to_string(),
                        }));
                    }
                }
            } else {
                BreakerAdmission::Closed
            };

            let instances = self
                .components
                .registry
                .get_healthy_instances(service)
                .await;
            let selected = self
                .components
                .balancer
                .select(service, &instances, route.load_balancer, client, &excluded)
                .await;
            let instance = match selected {
                Ok(instance) => instance,
                Err(e) => {
                    // the trial slot must not stay claimed by a request that never went out
                    if admission == BreakerAdmission::Trial {
                        self.record_breaker(service, false).await;
                    }
                    return Err(last_error.unwrap_or(e));
                }
            };

            let result = {
                let _in_flight = self.components.balancer.begin_request(&instance.id).await;
                self.forward(route, parts, body.clone(), &instance, request_id)
                    .await
            };
            if route.circuit_breaker {
                self.record_breaker(service, result.is_ok()).await;
            }

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    tracing::warn!(
                        service = %service,
                        instance_id = %instance.id,
                        attempt = attempt + 1,
                        error = %e,
                        "Upstream attempt failed, retrying on another instance"
                    );
                    excluded.push(instance.id);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Internal("No attempt was made".to_string())))
    }

    async fn record_breaker(&self, service: &str, success: bool) {
        let breakers = &self.components.breakers;
        breakers.record_result(service, success).await;
        metrics::set_open_circuit_breakers(breakers.open_count());
    }

    async fn forward(
        &self,
        route: &RouteConfig,
        parts: &Parts,
        body: Bytes,
        instance: &ServiceInstance,
        request_id: &str,
    ) -> Result<Response<AxumBody>, GatewayError> {
        let service = route.target.as_str();
        let path = upstream_path(route, parts.uri.path());
        let query = parts
            .uri
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();
        let uri = format!("{}{}{}", instance.base_url(), path, query);

        let mut builder = Request::builder().method(parts.method.clone()).uri(&uri);
        if let Some(headers) = builder.headers_mut() {
            copy_forwardable_headers(&parts.headers, headers);
            add_forwarded_headers(&parts.headers, headers, request_id);
        }
        let request = builder
            .body(AxumBody::from(body))
            .map_err(|e| GatewayError::Internal(format!("Failed to build upstream request: {e}")))?;

        let timeout_ms = route.timeout_ms;
        let span = tracing_setup::upstream_span(service, &instance.id, &uri);
        let outcome = {
            let _timer = self.components.metrics.upstream_timer(service);
            tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.components.client.send_request(request),
            )
            .instrument(span)
            .await
        };

        match outcome {
            Err(_) | Ok(Err(HttpClientError::Timeout(_))) => Err(GatewayError::UpstreamTimeout {
                service: service.to_string(),
                timeout_ms,
            }),
            Ok(Err(e)) => Err(GatewayError::UpstreamError {
                service: service.to_string(),
                message: e.to_string(),
                status: None,
            }),
            Ok(Ok(response)) if response.status().is_server_error() => {
                let status = response.status();
                Err(GatewayError::UpstreamError {
                    service: service.to_string(),
                    message: format!("instance {} responded with {status}", instance.id),
                    status: Some(status.as_u16()),
                })
            }
            Ok(Ok(mut response)) => {
                strip_hop_by_hop(response.headers_mut());
                Ok(response)
            }
        }
    }
}

/// Buffer the inbound body, refusing anything over `limit` bytes.
async fn read_body(body: AxumBody, limit: usize) -> Result<Bytes, GatewayError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(GatewayError::PayloadTooLarge { limit_bytes: limit })
        }
        Err(e) => Err(GatewayError::Validation(format!(
            "Failed to read request body: {e}"
        ))),
    }
}

/// Token of an `Authorization: Bearer <token>` header; the scheme is case-insensitive.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn copy_forwardable_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if !is_hop_by_hop(name) && name != HOST {
            to.append(name.clone(), value.clone());
        }
    }
}

fn add_forwarded_headers(original: &HeaderMap, headers: &mut HeaderMap, request_id: &str) {
    if let Some(host) = original.get(HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }
    if !headers.contains_key("x-forwarded-proto") {
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, admission: &Admission) {
    let values = [
        ("x-ratelimit-limit", admission.limit),
        ("x-ratelimit-remaining", admission.remaining),
        ("x-ratelimit-reset", admission.reset_after_ms.div_ceil(1_000)),
    ];
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(name, value);
        }
    }
}
