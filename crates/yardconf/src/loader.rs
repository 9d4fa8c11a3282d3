//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, SwitchyardConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files
/// that exist. If `cli_path` is provided and exists, it replaces the local
/// override.
pub fn discover_config_files(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/switchyard/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("switchyard/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("switchyard.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load all discovered files (deep-merged, later wins), then env overrides.
pub fn load_layered(
    cli_path: Option<&Path>,
) -> Result<(SwitchyardConfig, ConfigSources), ConfigError> {
    let mut sources = ConfigSources::default();
    let mut merged = toml::Table::new();

    for path in discover_config_files(cli_path) {
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        let table: toml::Table =
            contents
                .parse()
                .map_err(|e: toml::de::Error| ConfigError::Parse {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
        merge_tables(&mut merged, table);
        sources.files.push(path);
    }

    let mut config: SwitchyardConfig =
        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: PathBuf::from("<merged>"),
                message: e.to_string(),
            })?;

    apply_env_overrides(&mut config, &mut sources);
    Ok((config, sources))
}

/// Deep-merge `overlay` into `base`. Tables merge recursively; every other
/// value type replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                merge_tables(base_table, overlay_table);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply `SWITCHYARD_*` environment variable overrides.
///
/// Unparseable values are ignored with the file/default value left intact.
pub fn apply_env_overrides(config: &mut SwitchyardConfig, sources: &mut ConfigSources) {
    fn take<T: std::str::FromStr>(name: &str, slot: &mut T, sources: &mut ConfigSources) {
        if let Ok(raw) = env::var(name) {
            if let Ok(value) = raw.parse::<T>() {
                *slot = value;
                sources.env_overrides.push(name.to_string());
            }
        }
    }

    take(
        "SWITCHYARD_ASYNC_THRESHOLD_MS",
        &mut config.router.async_threshold_ms,
        sources,
    );
    take(
        "SWITCHYARD_WORKER_POOL_SIZE",
        &mut config.dispatcher.worker_pool_size,
        sources,
    );
    take(
        "SWITCHYARD_RETRY_BASE_MS",
        &mut config.dispatcher.retry_base_ms,
        sources,
    );
    take(
        "SWITCHYARD_RETRY_CAP_MS",
        &mut config.dispatcher.retry_cap_ms,
        sources,
    );
    take(
        "SWITCHYARD_CIRCUIT_OPEN_THRESHOLD",
        &mut config.dispatcher.circuit_open_threshold,
        sources,
    );
    take(
        "SWITCHYARD_CIRCUIT_OPEN_DURATION_MS",
        &mut config.dispatcher.circuit_open_duration_ms,
        sources,
    );
    take(
        "SWITCHYARD_PROGRESS_FLUSH_INTERVAL_MS",
        &mut config.progress.flush_interval_ms,
        sources,
    );
    take(
        "SWITCHYARD_PROGRESS_MAX_BATCH",
        &mut config.progress.max_batch,
        sources,
    );
    take(
        "SWITCHYARD_PROGRESS_FORCE_THRESHOLD",
        &mut config.progress.force_threshold,
        sources,
    );
    take(
        "SWITCHYARD_REQUEST_RETRY_BASE_MS",
        &mut config.executor.retry_base_ms,
        sources,
    );
    take(
        "SWITCHYARD_REQUEST_RETRY_CAP_MS",
        &mut config.executor.retry_cap_ms,
        sources,
    );
    take(
        "SWITCHYARD_MAX_RETRIES",
        &mut config.executor.max_retries,
        sources,
    );
    take(
        "SWITCHYARD_HANDLER_TIMEOUT_MS",
        &mut config.executor.handler_timeout_ms,
        sources,
    );
    take(
        "SWITCHYARD_CONNECTION_TTL_SECS",
        &mut config.ttl.connection_ttl_secs,
        sources,
    );
    take(
        "SWITCHYARD_REQUEST_TTL_SECS",
        &mut config.ttl.request_ttl_secs,
        sources,
    );
}
