// Service configuration loading and validation

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

fn default_max_session_count() -> usize {
    1
}

/// Resolved configuration for the session service.
///
/// All values arrive already resolved from the deployment's configuration
/// source; anything malformed is a fatal initialization failure, not a
/// runtime error.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Seconds of inactivity after which a session expires.
    pub inactivity_timeout_secs: i64,
    /// Grace window applied by mark-for-unregister before the record
    /// disappears.
    pub removal_grace_secs: i64,
    /// Whether a user may hold more than one concurrent session.
    pub allow_multiple_sessions: bool,
    /// Cap on concurrent sessions per user; only consulted when multiple
    /// sessions are allowed.
    #[serde(default = "default_max_session_count")]
    pub max_session_count: usize,
    /// Internal caller identity → pre-provisioned session identifier.
    pub trusted_callers: HashMap<String, String>,
    /// Which storage backend to run against.
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory,
    DistributedCache { url: String },
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.inactivity_timeout_secs <= 0 {
            return Err("inactivity_timeout_secs must be positive".to_string());
        }
        if self.removal_grace_secs <= 0 {
            return Err("removal_grace_secs must be positive".to_string());
        }
        if self.allow_multiple_sessions && self.max_session_count == 0 {
            return Err(
                "max_session_count must be at least 1 when multiple sessions are allowed"
                    .to_string(),
            );
        }
        if self.trusted_callers.is_empty() {
            return Err("at least one trusted caller must be configured".to_string());
        }
        for (caller, session_id) in &self.trusted_callers {
            if caller.trim().is_empty() || session_id.trim().is_empty() {
                return Err(format!(
                    "trusted caller entries cannot be blank (caller: '{}')",
                    caller
                ));
            }
        }
        if let StoreConfig::DistributedCache { url } = &self.store {
            if url.trim().is_empty() {
                return Err("distributed cache url cannot be blank".to_string());
            }
        }
        Ok(())
    }
}

/// Load and validate configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ServiceConfig, String> {
    let path = path.as_ref();
    info!("Loading configuration from: {}", path.display());

    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

    let config: ServiceConfig = serde_yaml::from_str(&contents)
        .map_err(|e| format!("Failed to parse YAML config: {}", e))?;

    config.validate()?;

    info!(
        "Configuration loaded with {} trusted caller(s)",
        config.trusted_callers.len()
    );

    Ok(config)
}

/// Load configuration from SESSION_CONFIG_PATH, falling back to common
/// file locations.
pub fn load_config_with_fallback() -> Result<ServiceConfig, String> {
    if let Ok(config_path) = std::env::var("SESSION_CONFIG_PATH") {
        match load_config(&config_path) {
            Ok(config) => return Ok(config),
            Err(e) => warn!(
                "Failed to load config from SESSION_CONFIG_PATH ({}): {}",
                config_path, e
            ),
        }
    }

    for path in ["session.yaml", "session.yml", "config.yaml", "config.yml"] {
        if Path::new(path).exists() {
            match load_config(path) {
                Ok(config) => return Ok(config),
                Err(e) => warn!("Failed to load config from '{}': {}", path, e),
            }
        }
    }

    Err(
        "No configuration file found. Create a session.yaml file or set the \
         SESSION_CONFIG_PATH environment variable."
            .to_string(),
    )
}
