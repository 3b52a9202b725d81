pub mod alerts;
pub mod audit;
pub mod authenticator;
pub mod clock;
pub mod config_provider;
pub mod http_client;
pub mod rate_limit_store;
pub mod store;
