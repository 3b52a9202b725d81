pub mod admin;
pub mod authenticator;
pub mod config_providers;
pub mod health_checker;
pub mod http_client;
pub mod http_handler;
pub mod memory_rate_limit;
pub mod memory_store;
pub mod webhook;

/// Re-export commonly used types from adapters
pub use authenticator::StaticTokenAuthenticator;
pub use config_providers::{FileConfigProvider, HttpConfigProvider};
pub use health_checker::{HealthChecker, TickReport};
pub use http_client::HttpClientAdapter;
pub use http_handler::{GatewayState, build_app};
pub use memory_rate_limit::MemoryRateLimitStore;
pub use memory_store::MemoryRegistryStore;
pub use webhook::WebhookAlertHandler;
