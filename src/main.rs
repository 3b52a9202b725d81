use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{WrapErr, eyre},
};
use keel::{
    adapters::{
        FileConfigProvider, GatewayState, HealthChecker, HttpClientAdapter, HttpConfigProvider,
        MemoryRateLimitStore, MemoryRegistryStore, StaticTokenAuthenticator, WebhookAlertHandler,
        build_app,
    },
    config::{ConfigValidator, GatewayConfig, loader::load_config_unchecked},
    core::{
        AlertDispatcher, AlertMonitor, AlertRules, CircuitBreakerRegistry, LoadBalancer,
        RateLimiter, RequestRouter, RouterComponents, ServiceRegistry,
    },
    metrics::{self, GatewayMetrics},
    ports::{
        audit::TracingViolationSink,
        clock::{Clock, SystemClock},
        config_provider::ConfigProvider,
        http_client::HttpClient,
    },
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason},
};

const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);
const RELOAD_DEBOUNCE: Duration = Duration::from_secs(2);
const REMOTE_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "keel.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "keel.toml")]
        config: String,
    },
    /// Write a starter configuration file
    Init {
        #[clap(short, long, default_value = "keel.toml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        /// Configuration file, or an http(s) URL to poll
        #[clap(short, long, default_value = "keel.toml")]
        config: String,
    },
}

fn create_config_provider(config_path: &str) -> Result<Arc<dyn ConfigProvider>> {
    if config_path.starts_with("http://") || config_path.starts_with("https://") {
        Ok(Arc::new(HttpConfigProvider::new(
            config_path,
            REMOTE_POLL_INTERVAL,
        )?))
    } else {
        Ok(Arc::new(FileConfigProvider::new(config_path)?))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

/// Everything the running gateway shares between the server and background tasks.
struct Runtime {
    router: Arc<RequestRouter>,
    health_checker: Arc<HealthChecker>,
    limiter: Arc<RateLimiter>,
    authenticator: Arc<StaticTokenAuthenticator>,
}

async fn build_runtime(config: &GatewayConfig) -> Result<Runtime> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryRegistryStore::new(config.health_check.history_limit));

    let registry = Arc::new(
        ServiceRegistry::new(store.clone(), clock.clone()).with_thresholds(
            config.health_check.healthy_threshold,
            config.health_check.unhealthy_threshold,
        ),
    );
    let restored = registry
        .restore_from_store()
        .await
        .wrap_err("Failed to restore registry from store")?;
    if restored > 0 {
        tracing::info!(instances = restored, "Restored registered instances");
    }
    for registration in &config.services {
        match registry.register_service(registration.clone()).await {
            Ok(instance) => tracing::info!(
                service = %instance.name,
                instance_id = %instance.id,
                address = %format!("{}:{}", instance.host, instance.port),
                "Registered instance from configuration"
            ),
            Err(e) => tracing::warn!(error = %e, "Skipping invalid service registration"),
        }
    }

    let client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().wrap_err("Failed to create HTTP client adapter")?);
    let balancer = Arc::new(LoadBalancer::new(config.load_balancer));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit.clone(),
        Arc::new(MemoryRateLimitStore::new()),
        clock.clone(),
        Arc::new(TracingViolationSink),
    ));
    let authenticator = Arc::new(StaticTokenAuthenticator::from_config(&config.auth));

    let components = RouterComponents {
        registry: registry.clone(),
        breakers: Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker,
            clock.clone(),
        )),
        limiter: limiter.clone(),
        balancer: balancer.clone(),
        authenticator: authenticator.clone(),
        client: client.clone(),
        metrics: Arc::new(GatewayMetrics::new()),
    };
    let router = Arc::new(RequestRouter::new(config.routes.clone(), components));
    for route in router.route_table().routes() {
        tracing::info!(path = %route.path, target = %route.target, "Configured route");
    }

    let dispatcher = Arc::new(AlertDispatcher::new(config.alerts.max_handlers));
    for webhook in &config.alerts.webhooks {
        let handler = WebhookAlertHandler::new(webhook)
            .wrap_err_with(|| format!("Failed to create webhook for {}", webhook.url))?;
        dispatcher
            .subscribe(Arc::new(handler))
            .map_err(|e| eyre!("Failed to subscribe webhook {}: {e}", webhook.url))?;
    }

    let health_checker = Arc::new(
        HealthChecker::new(
            registry,
            client,
            store,
            AlertMonitor::new(AlertRules::from_config(&config.alerts), clock.clone()),
            dispatcher,
            clock,
            config.health_check.clone(),
        )
        .with_load_balancer(balancer),
    );

    Ok(Runtime {
        router,
        health_checker,
        limiter,
        authenticator,
    })
}

async fn serve(config_path: &str) -> Result<()> {
    let config_provider =
        create_config_provider(config_path).wrap_err("Failed to create config provider")?;
    let config = config_provider
        .load_config()
        .await
        .wrap_err_with(|| format!("Failed to load initial config from {config_path}"))?;

    tracing_setup::init_tracing(&config.logging).wrap_err("Failed to initialize tracing")?;
    tracing::info!(config = %config_path, "Loaded configuration");

    let prometheus = match metrics::install_prometheus_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus endpoint disabled");
            None
        }
    };

    let runtime = build_runtime(&config).await?;
    let shutdown = Arc::new(GracefulShutdown::new());

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move { signal_shutdown.run_signal_handler().await });

    runtime.health_checker.start();
    spawn_bucket_sweeper(runtime.limiter.clone(), shutdown.clone());
    spawn_config_watcher(config_provider, &runtime, shutdown.clone());

    let app = build_app(GatewayState {
        router: runtime.router.clone(),
        health_checker: runtime.health_checker.clone(),
        prometheus,
        admin: Arc::new(config.admin.clone()),
    });

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .wrap_err_with(|| format!("Invalid listen address {}", config.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind to {addr}"))?;
    tracing::info!(%addr, "Keel gateway listening");

    let server_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            server_shutdown.wait_for_shutdown_signal().await;
        })
        .await
    });

    let result = tokio::select! {
        joined = &mut server => {
            // the server stopped on its own; release the background tasks too
            shutdown.trigger_shutdown(ShutdownReason::Force);
            joined.map_err(|e| eyre!("Server task failed: {e}"))?.wrap_err("Server error")
        }
        reason = shutdown.wait_for_shutdown_signal() => {
            tracing::info!(reason = ?reason, "Draining in-flight requests");
            match tokio::time::timeout(shutdown.drain_timeout(), &mut server).await {
                Ok(joined) => joined
                    .map_err(|e| eyre!("Server task failed: {e}"))?
                    .wrap_err("Server error"),
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = shutdown.drain_timeout().as_secs(),
                        "Drain timeout exceeded, closing remaining connections"
                    );
                    server.abort();
                    Ok(())
                }
            }
        }
    };

    runtime.health_checker.stop().await;
    tracing::info!("Keel gateway stopped");
    result
}

fn spawn_bucket_sweeper(limiter: Arc<RateLimiter>, shutdown: Arc<GracefulShutdown>) {
    let interval = limiter
        .settings()
        .purge_interval()
        .unwrap_or(DEFAULT_PURGE_INTERVAL)
        .max(Duration::from_secs(1));
    let mut stop = shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = ticker.tick() => {
                    let purged = limiter.purge_expired().await;
                    if purged > 0 {
                        tracing::debug!(purged, remaining = limiter.bucket_count(), "Purged idle rate limit buckets");
                    }
                }
            }
        }
        tracing::debug!("Rate limit bucket sweeper stopped");
    });
}

/// Apply reloadable sections (routes, rate limits, auth tokens) when the provider signals a change.
fn spawn_config_watcher(
    provider: Arc<dyn ConfigProvider>,
    runtime: &Runtime,
    shutdown: Arc<GracefulShutdown>,
) {
    let Some(mut notify_rx) = provider.watch() else {
        tracing::warn!("Config provider does not support watching; hot reload disabled");
        return;
    };
    let router = runtime.router.clone();
    let limiter = runtime.limiter.clone();
    let authenticator = runtime.authenticator.clone();
    let mut stop = shutdown.subscribe();

    tokio::spawn(async move {
        tracing::info!("Config watcher started");
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                signal = notify_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }

            // editors tend to emit several events per save
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            while notify_rx.try_recv().is_ok() {}

            match provider.load_config().await {
                Ok(new_config) => {
                    router.reload_routes(new_config.routes);
                    limiter.update_settings(new_config.rate_limit);
                    authenticator.update(&new_config.auth);
                    tracing::info!(
                        routes = router.route_table().len(),
                        "Configuration reloaded (listener, registry and health settings need a restart)"
                    );
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to reload configuration, keeping the current one");
                }
            }
        }
        tracing::info!("Config watcher stopped");
    });
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config_unchecked(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Routes: {}", config.routes.len());
            println!("   • Static Services: {}", config.services.len());
            println!("   • Health Checks: {}", config.health_check.enabled);
            println!("   • Rate Limiting: {}", config.rate_limit.enabled);
            println!(
                "   • Admin API: {}",
                if config.admin.enabled {
                    config.admin.path_prefix.as_str()
                } else {
                    "disabled"
                }
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Write a starter configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, DEFAULT_CONFIG)
        .await
        .wrap_err("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'keel serve --config {config_path}' to start the gateway");
    Ok(())
}

const DEFAULT_CONFIG: &str = r#"# Keel gateway configuration

listen_addr = "127.0.0.1:8080"
load_balancer = "round_robin"

[admin]
enabled = true
path_prefix = "/admin"
# token = "change-me"

[logging]
level = "info"
json = false

[health_check]
enabled = true
interval_secs = 30
timeout_ms = 5000
concurrency = 16
# evict_after_failures = 10

[circuit_breaker]
threshold = 5
timeout_ms = 60000

[rate_limit]
enabled = true
purge_interval = "60s"

[alerts]
cooldown = "5m"
latency_threshold_ms = 2000
# [[alerts.webhooks]]
# url = "https://hooks.example.com/keel"

[[routes]]
path = "/api/orders"
target = "orders"
methods = ["GET", "POST"]
timeout_ms = 10000
# max_body_bytes = 10485760

[[services]]
name = "orders"
host = "127.0.0.1"
port = 3000
"#;
