//! Engine wiring shared by every command.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;
use transfer_core::config::resolve_default_config_path;
use transfer_core::{Database, EngineConfig, LocalDisk, SqliteCatalog, TransferEngine};

use crate::cli::{Args, RunArgs};

pub struct AppContext {
    pub engine: TransferEngine,
    pub catalog: Arc<SqliteCatalog>,
}

impl AppContext {
    /// Loads configuration, opens the database and builds the engine.
    ///
    /// Without `run` the engine never admits transfers, so one-shot commands
    /// only change records.
    pub async fn open(args: &Args, run: Option<&RunArgs>) -> Result<Self> {
        let mut config = load_config(args.config.as_deref())?;
        if let Some(database) = &args.database {
            config.database.clone_from(database);
        }
        if let Some(run) = run {
            apply_run_overrides(&mut config, run);
        }
        debug!(?config, "effective configuration");

        if let Some(parent) = config.database.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let db = Database::new(&config.database)
            .await
            .with_context(|| format!("opening database {}", config.database.display()))?;

        let catalog = Arc::new(SqliteCatalog::new(db.clone()));
        let temp = Arc::new(LocalDisk::new(&config.temp_dir));
        let permanent = Arc::new(LocalDisk::new(&config.storage_dir));
        let engine = TransferEngine::new(config, db, catalog.clone(), temp, permanent)?;
        if run.is_none() {
            engine.suspend_admission();
        }

        Ok(Self { engine, catalog })
    }
}

/// Explicit `--config` must load; the default location is used only when it
/// exists.
fn load_config(explicit: Option<&Path>) -> Result<EngineConfig> {
    if let Some(path) = explicit {
        return EngineConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    match resolve_default_config_path() {
        Some(path) if path.is_file() => {
            debug!(path = %path.display(), "using default config file");
            EngineConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        _ => Ok(EngineConfig::default()),
    }
}

fn apply_run_overrides(config: &mut EngineConfig, run: &RunArgs) {
    if let Some(workers) = run.workers {
        config.worker_pool_size = usize::from(workers);
    }
    if let Some(ceiling) = run.domain_concurrency {
        config.domain_concurrency = usize::from(ceiling);
    }
    if let Some(retries) = run.max_retries {
        config.retry_budget = u32::from(retries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_overrides_replace_config_values() {
        let mut config = EngineConfig::default();
        let run = RunArgs {
            workers: Some(4),
            domain_concurrency: Some(1),
            max_retries: Some(0),
            no_progress: true,
        };
        apply_run_overrides(&mut config, &run);
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.domain_concurrency, 1);
        assert_eq!(config.retry_budget, 0);
    }

    #[test]
    fn test_missing_overrides_keep_config_values() {
        let mut config = EngineConfig::default();
        apply_run_overrides(&mut config, &RunArgs::default());
        assert_eq!(config.worker_pool_size, EngineConfig::default().worker_pool_size);
    }

    #[test]
    fn test_explicit_config_must_exist() {
        assert!(load_config(Some(Path::new("/nonexistent/transfer.toml"))).is_err());
    }
}
