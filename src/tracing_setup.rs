use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialize logging from the `[logging]` section. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .wrap_err_with(|| format!("Invalid log level: {}", config.level))?,
    };
    init_with_filter(filter, config.json)?;

    tracing::info!(level = %config.level, json = config.json, "Keel logging initialized");
    Ok(())
}

/// Initialize logging with an explicit filter directive, ignoring `RUST_LOG`.
pub fn init_tracing_with_config(level: &str, json_format: bool) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;
    init_with_filter(filter, json_format)
}

fn init_with_filter(filter: EnvFilter, json_format: bool) -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json_format {
        Registry::default()
            .with(filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(false)
                    .with_span_list(true),
            )
            .try_init()
            .wrap_err("Failed to install JSON tracing subscriber")
    } else {
        Registry::default()
            .with(filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
            .wrap_err("Failed to install console tracing subscriber")
    }
}

/// Span covering one inbound request through the router.
pub fn request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        service = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
    )
}

/// Span covering one forwarded call to a backend instance.
pub fn upstream_span(service: &str, instance_id: &str, uri: &str) -> tracing::Span {
    tracing::debug_span!(
        "upstream",
        service = service,
        instance.id = instance_id,
        backend.uri = uri,
        http.status_code = tracing::field::Empty,
    )
}
