//! Persistent configuration model, defaults and load-or-create.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::error::{FlingError, Result};
use crate::state_persistence::write_atomic;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Receiver discovery preferences.
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    /// Connect and detach behavior.
    pub session: SessionConfig,
    #[serde(default)]
    /// Transport command and status polling behavior.
    pub transport: TransportConfig,
    #[serde(default)]
    /// Media catalog location.
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DiscoveryConfig {
    /// DNS-SD service type browsed for receivers.
    #[serde(default = "default_service_type")]
    pub service_type: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SessionConfig {
    /// Bounded wait for the listener detach while the app is pausing.
    #[serde(default = "default_detach_timeout_ms")]
    pub detach_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TransportConfig {
    /// Failures absorbed silently before the session is torn down.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_position_update_interval_ms")]
    pub position_update_interval_ms: u64,
    /// Step used by forward and backward seeks.
    #[serde(default = "default_seek_step_ms")]
    pub seek_step_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_file_name")]
    pub file_name: String,
    /// Overrides the writable catalog directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            detach_timeout_ms: default_detach_timeout_ms(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: default_max_consecutive_errors(),
            position_update_interval_ms: default_position_update_interval_ms(),
            seek_step_ms: default_seek_step_ms(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            file_name: default_catalog_file_name(),
            directory: None,
        }
    }
}

fn default_service_type() -> String {
    "amzn.thin.pl".to_string()
}

fn default_detach_timeout_ms() -> u64 {
    3_000
}

fn default_max_consecutive_errors() -> u32 {
    5
}

fn default_position_update_interval_ms() -> u64 {
    1_000
}

fn default_seek_step_ms() -> u64 {
    10_000
}

fn default_catalog_file_name() -> String {
    "FlingSample.json".to_string()
}

/// Clamps values into ranges the runtime can work with.
pub fn sanitize_config(config: Config) -> Config {
    let service_type = config.discovery.service_type.trim();
    let service_type = if service_type.is_empty() {
        default_service_type()
    } else {
        service_type.to_string()
    };
    let file_name = config.catalog.file_name.trim();
    let file_name = if file_name.is_empty() || file_name.contains(['/', '\\']) {
        default_catalog_file_name()
    } else {
        file_name.to_string()
    };

    Config {
        discovery: DiscoveryConfig { service_type },
        session: SessionConfig {
            detach_timeout_ms: config.session.detach_timeout_ms.clamp(100, 60_000),
        },
        transport: TransportConfig {
            max_consecutive_errors: config.transport.max_consecutive_errors.min(100),
            position_update_interval_ms: config
                .transport
                .position_update_interval_ms
                .clamp(100, 60_000),
            seek_step_ms: config.transport.seek_step_ms.clamp(1_000, 600_000),
        },
        catalog: CatalogConfig {
            file_name,
            directory: config.catalog.directory,
        },
    }
}

/// Reads `path`, creating it with sanitized defaults when missing.
///
/// A file that does not parse falls back to defaults and is left untouched.
pub fn load_or_create_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let default_config = sanitize_config(Config::default());
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        let text = toml::to_string(&default_config)
            .map_err(|err| FlingError::Persistence(format!("failed to serialize config: {err}")))?;
        write_atomic(path, &text)?;
        return Ok(default_config);
    }

    let text = fs::read_to_string(path)?;
    let config = match toml::from_str::<Config>(&text) {
        Ok(config) => config,
        Err(err) => {
            warn!(
                "Failed to parse config {}, using defaults: {}",
                path.display(),
                err
            );
            Config::default()
        }
    };
    Ok(sanitize_config(config))
}
