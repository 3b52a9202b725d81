//! Keel - the traffic-management runtime of an API gateway.
//!
//! Keel sits between clients and a fleet of backend services. It keeps track of
//! which backend instances exist and whether they are healthy, decides which
//! instance should receive each request, and protects backends from overload and
//! cascading failure.
//!
//! # Components
//! - Service registry with (host, port) upsert, heartbeats and persisted history
//! - Periodic health checker with `service_down` / `high_latency` alerts
//! - Per-service circuit breaker (CLOSED / OPEN / HALF_OPEN with a single trial)
//! - Tiered, context-aware rate limiter (fixed window, sliding window, token bucket)
//! - Load balancer (round-robin, least-connections, weighted, ip-hash)
//! - Request router composing all of the above, with retries for idempotent routes
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use keel::{
//!     adapters::MemoryRegistryStore,
//!     core::{ServiceRegistration, ServiceRegistry},
//!     ports::clock::SystemClock,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let registry = ServiceRegistry::new(Arc::new(MemoryRegistryStore::new(100)), Arc::new(SystemClock));
//! registry
//!     .register_service(ServiceRegistration::new("orders", "10.0.0.5", 8081))
//!     .await?;
//! assert_eq!(registry.get_healthy_instances("orders").await.len(), 1);
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Collaborators are **ports** (traits in [`ports`]) with in-process **adapters**
//! (in [`adapters`]); the traffic logic lives in [`core`] and only talks to ports.
//! The binary wires the adapters together and serves them through axum.
//!
//! # Error Handling
//! Request-path failures are [`core::GatewayError`] values rendered into a stable
//! JSON envelope. Setup code returns `eyre::Result<T>` with `WrapErr` context.
//!
//! # Concurrency & Data Structures
//! Shared maps are `scc::HashMap` owned by the component that needs them; hot
//! reloadable settings sit behind `arc-swap`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{GatewayState, HealthChecker, HttpClientAdapter, build_app},
    core::{GatewayError, RequestRouter, RouterComponents, ServiceRegistry},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
