pub mod types;

use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{ListingsError, Result};
use types::Config;

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        ListingsError::Config(format!(
            "failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yml::from_str(&content)?;
    Ok(config)
}

/// Loads `.env`, the YAML file, then the process environment on top.
pub fn load_config_with_env(path: &Path) -> Result<Config> {
    dotenvy::dotenv().ok();
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Applies the environment variables the import tooling has always honoured.
pub fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(uri) = lookup("MONGODB_URI") {
        config.database.uri = uri;
    }
    if let Some(name) = lookup("MONGODB_DB") {
        config.database.name = name;
    }
    if let Some(collection) = lookup("COLLECTION_NAME") {
        config.database.collection = collection;
    }
    if let Some(raw) = lookup("SAMPLE_SIZE") {
        config.import.sample_size = raw.trim().parse().map_err(|_| {
            ListingsError::Config(format!("SAMPLE_SIZE must be a non-negative integer, got '{raw}'"))
        })?;
    }
    if let Some(path) = lookup("DATA_PATH") {
        config.import.data_path = PathBuf::from(path);
    }
    if let Some(level) = lookup("LOG_LEVEL") {
        config.log_level = level.to_lowercase();
    }
    Ok(())
}

/// Masks the password of a connection string so it can be logged.
pub fn redact_uri(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some("****")).is_err() {
                return "<redacted>".into();
            }
            url.to_string()
        }
        Ok(_) => uri.to_string(),
        Err(_) => "<unparseable uri>".into(),
    }
}
