//! Layered configuration loading: built-in defaults → TOML file → environment
//! variables (`DOWNLOADER_` prefix). CLI flags are applied by `main` after
//! loading, taking precedence over all three.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalityKind {
    Finalized,
    Safe,
    Latest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinalitySetting {
    pub kind: FinalityKind,
    #[serde(default)]
    pub lag: u64,
}

impl From<&FinalitySetting> for downloader_core::Finality {
    fn from(f: &FinalitySetting) -> Self {
        match f.kind {
            FinalityKind::Finalized => downloader_core::Finality::Finalized,
            FinalityKind::Safe => downloader_core::Finality::Safe,
            FinalityKind::Latest => downloader_core::Finality::Latest { lag: f.lag },
        }
    }
}

/// The storage backend to wire into the orchestrator. The `postgres`
/// variant always deserializes (so a config naming it gets the feature-gate
/// rejection `main.rs` reports, not a serde unknown-variant error) but is
/// only reachable at runtime when the binary was built with the `postgres`
/// feature (the default build only enables `sqlite`).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageSettings {
    Memory,
    Sqlite { path: String },
    Postgres { database_url: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchEntry {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub start_block: u64,
}

/// Every key spec.md §6 names, plus connection settings for the RPC
/// endpoint and the storage backend, plus the logging knobs from §9.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub rpc_endpoint: String,
    pub chunk_size: u64,
    pub finality: FinalitySetting,
    pub start_block: u64,
    pub block_time_secs: u64,
    pub too_many_results_markers: Vec<String>,
    pub storage: StorageSettings,
    pub log_level: String,
    pub log_format: String,
    pub log_file: Option<String>,
    #[serde(default)]
    pub watch: Vec<WatchEntry>,
}

/// Loads settings with precedence defaults → `config_path` (if given) →
/// environment (`DOWNLOADER__` nested keys, e.g. `DOWNLOADER__STORAGE__PATH`).
pub fn load(config_path: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder()
        .set_default("rpc_endpoint", "http://127.0.0.1:8545")?
        .set_default("chunk_size", 5_000)?
        .set_default("finality.kind", "finalized")?
        .set_default("finality.lag", 0)?
        .set_default("start_block", 0)?
        .set_default("block_time_secs", 12)?
        .set_default(
            "too_many_results_markers",
            vec![
                "query returned more than".to_string(),
                "block range is too large".to_string(),
                "limit exceeded".to_string(),
            ],
        )?
        .set_default("storage.backend", "memory")?
        .set_default("log_level", "info")?
        .set_default("log_format", "pretty")?;

    if let Some(path) = config_path {
        builder = builder.add_source(File::with_name(path).required(false));
    }

    builder = builder.add_source(Environment::with_prefix("DOWNLOADER").separator("__"));

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_config_file() {
        let settings = load(None).unwrap();
        assert_eq!(settings.rpc_endpoint, "http://127.0.0.1:8545");
        assert_eq!(settings.chunk_size, 5_000);
        assert!(matches!(settings.storage, StorageSettings::Memory));
        assert!(settings.watch.is_empty());
    }

    #[test]
    fn environment_overrides_defaults() {
        std::env::set_var("DOWNLOADER__CHUNK_SIZE", "500");
        let settings = load(None).unwrap();
        assert_eq!(settings.chunk_size, 500);
        std::env::remove_var("DOWNLOADER__CHUNK_SIZE");
    }
}
