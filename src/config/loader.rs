use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Result, WrapErr};

use crate::config::{models::GatewayConfig, validation::ConfigValidator};

/// Prefix for environment overrides, e.g. `KEEL__LISTEN_ADDR=0.0.0.0:9000`
pub const ENV_PREFIX: &str = "KEEL";

/// Load and validate configuration from a file.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    let config = load_config_sync(config_path)?;
    ConfigValidator::validate(&config)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;
    Ok(config)
}

/// Infer the file format from the extension, defaulting to TOML
pub fn format_for(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Toml,
    }
}

/// Load configuration synchronously, merging `KEEL__*` environment overrides.
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let path = Path::new(config_path);

    let settings = Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?,
            format_for(path),
        ))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    let gateway_config: GatewayConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;

    Ok(gateway_config)
}

/// Parse configuration from an in-memory document (used by the HTTP provider).
pub fn parse_config_str(content: &str, format: FileFormat) -> Result<GatewayConfig> {
    let settings = Config::builder()
        .add_source(File::from_str(content, format))
        .build()
        .context("Failed to parse configuration document")?;

    settings
        .try_deserialize()
        .context("Failed to deserialize configuration document")
}

/// Load configuration without validation (used for the validate command)
pub async fn load_config_unchecked(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}
