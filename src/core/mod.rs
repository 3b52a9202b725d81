pub mod alerts;
pub mod circuit_breaker;
pub mod error;
pub mod instance;
pub mod load_balancer;
pub mod rate_limiter;
pub mod registry;
pub mod route_table;
pub mod router;

pub use alerts::{AlertDispatcher, AlertMonitor, AlertRules};
pub use circuit_breaker::{CircuitBreakerRegistry, CircuitState};
pub use error::GatewayError;
pub use instance::{ServiceHealthRecord, ServiceInstance, ServiceRegistration};
pub use load_balancer::{LoadBalancer, LoadBalancerFactory};
pub use rate_limiter::RateLimiter;
pub use registry::ServiceRegistry;
pub use route_table::RouteTable;
pub use router::{RequestRouter, RouterComponents};
