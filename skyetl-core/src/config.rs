//! Configuration for skyetl.
//!
//! Uses `figment` for layered configuration: defaults -> user file -> workspace
//! file -> environment -> CLI overrides.

use crate::data::registry::{AIRLINES, AIRPORTS, DatasetRegistry, FLIGHTS};
use crate::data::source::SourceConfig;
use crate::error::{EtlError, Result};
use crate::load::{DEFAULT_CHUNK_SIZE, LoadPolicy};
use crate::pipeline::RunMode;
use crate::sink::ConnectionDescriptor;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable consulted when `database_url` is not configured.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

const ENV_PREFIX: &str = "SKYETL_";
const CONFIG_DIR: &str = ".skyetl";
const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    /// Sink connection string. Falls back to `DATABASE_URL`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Base directory for relative source paths.
    pub data_dir: PathBuf,
    /// Source per dataset name.
    pub sources: BTreeMap<String, SourceConfig>,
    /// Rows per extracted and loaded chunk.
    pub chunk_size: usize,
    pub load_policy: LoadPolicy,
    pub mode: RunMode,
    /// Chunks buffered between streaming stages.
    pub channel_capacity: usize,
    /// Cap on flight rows loaded; `None` loads everything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flights_row_limit: Option<usize>,
    pub registry: DatasetRegistry,
}

impl Default for EtlConfig {
    fn default() -> Self {
        let sources = [FLIGHTS, AIRLINES, AIRPORTS]
            .into_iter()
            .map(|name| (name.to_string(), SourceConfig::csv(format!("{name}.csv"))))
            .collect();
        Self {
            database_url: None,
            data_dir: PathBuf::from("data"),
            sources,
            chunk_size: DEFAULT_CHUNK_SIZE,
            load_policy: LoadPolicy::default(),
            mode: RunMode::default(),
            channel_capacity: 2,
            flights_row_limit: None,
            registry: DatasetRegistry::default(),
        }
    }
}

impl EtlConfig {
    /// Check values figment cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(EtlError::config("chunk_size must be greater than zero"));
        }
        if self.channel_capacity == 0 {
            return Err(EtlError::config("channel_capacity must be greater than zero"));
        }
        self.registry.validate().map_err(EtlError::Config)?;
        for def in &self.registry.datasets {
            if !self.sources.contains_key(&def.name) {
                return Err(EtlError::config(format!(
                    "no source configured for dataset '{}'",
                    def.name
                )));
            }
        }
        Ok(())
    }

    /// Source for `dataset` with relative paths resolved against `data_dir`.
    pub fn source(&self, dataset: &str) -> Result<SourceConfig> {
        self.sources
            .get(dataset)
            .map(|s| s.resolved(&self.data_dir))
            .ok_or_else(|| {
                EtlError::config(format!("no source configured for dataset '{dataset}'"))
            })
    }

    /// Parse the configured connection string, falling back to `DATABASE_URL`.
    pub fn connection(&self) -> Result<ConnectionDescriptor> {
        let raw = match &self.database_url {
            Some(url) => url.clone(),
            None => std::env::var(DATABASE_URL_ENV).map_err(|_| {
                EtlError::config(format!(
                    "no database_url configured and {DATABASE_URL_ENV} is not set"
                ))
            })?,
        };
        ConnectionDescriptor::parse(&raw)
    }
}

/// Values given on the command line. Unset fields leave lower layers alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_policy: Option<LoadPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flights_row_limit: Option<usize>,
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (prefixed with `SKYETL_`, `__` for nesting)
/// 3. `explicit_file`, or the workspace config (`.skyetl/config.toml`)
/// 4. User config (`~/.config/skyetl/config.toml`)
/// 5. Built-in defaults
///
/// A relative `data_dir` is resolved against `workspace`.
pub fn load_config(
    workspace: Option<&Path>,
    explicit_file: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<EtlConfig> {
    let mut figment = Figment::from(Serialized::defaults(EtlConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "skyetl", "skyetl") {
        let user_config = dirs.config_dir().join(CONFIG_FILE);
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    match (explicit_file, workspace) {
        (Some(file), _) => {
            if !file.exists() {
                return Err(EtlError::config(format!("config file {} not found", file.display())));
            }
            figment = figment.merge(Toml::file(file));
        }
        (None, Some(ws)) => {
            let ws_config = workspace_config_path(ws);
            if ws_config.exists() {
                figment = figment.merge(Toml::file(&ws_config));
            }
        }
        (None, None) => {}
    }

    // SKYETL_CHUNK_SIZE, SKYETL_SOURCES__FLIGHTS__PATH, ...
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let mut config: EtlConfig = figment
        .extract()
        .map_err(|e| EtlError::config(e.to_string()))?;

    if let Some(ws) = workspace
        && config.data_dir.is_relative()
    {
        config.data_dir = ws.join(&config.data_dir);
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = EtlConfig::default();
        assert_eq!(config.chunk_size, 100_000);
        assert_eq!(config.channel_capacity, 2);
        assert_eq!(config.load_policy, LoadPolicy::StopOnError);
        assert_eq!(config.mode, RunMode::Materialized);
        assert!(config.flights_row_limit.is_none());
        assert!(config.validate().is_ok());
        assert_eq!(
            config.source(FLIGHTS).unwrap(),
            SourceConfig::csv("data/flights.csv")
        );
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            workspace_config_path(dir.path()),
            r#"
database_url = "sqlite://out/etl.db"
chunk_size = 5000
load_policy = "all_or_nothing"
mode = "streaming"

[sources.airports]
type = "csv"
path = "ref/airports.tsv"
delimiter = "\t"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None, None).unwrap();
        assert_eq!(config.chunk_size, 5000);
        assert_eq!(config.load_policy, LoadPolicy::AllOrNothing);
        assert_eq!(config.mode, RunMode::Streaming);
        assert_eq!(config.data_dir, dir.path().join("data"));
        match config.source(AIRPORTS).unwrap() {
            SourceConfig::Csv { path, delimiter, .. } => {
                assert_eq!(path, dir.path().join("data").join("ref/airports.tsv"));
                assert_eq!(delimiter, '\t');
            }
            other => panic!("unexpected source: {other:?}"),
        }
        assert_eq!(config.connection().unwrap().database, "out/etl.db");
    }

    #[test]
    fn test_overrides_win_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(&file, "chunk_size = 5000\nflights_row_limit = 10\n").unwrap();

        let overrides = ConfigOverrides {
            chunk_size: Some(7),
            load_policy: Some(LoadPolicy::BestEffort),
            ..Default::default()
        };
        let config = load_config(None, Some(&file), Some(&overrides)).unwrap();
        assert_eq!(config.chunk_size, 7);
        assert_eq!(config.flights_row_limit, Some(10));
        assert_eq!(config.load_policy, LoadPolicy::BestEffort);
    }

    #[test]
    fn test_sqlite_query_source_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(
            &file,
            r#"
[sources.flights]
type = "sqlite"
db_path = "/srv/raw.db"
query = "SELECT * FROM flights"
"#,
        )
        .unwrap();
        let config = load_config(None, Some(&file), None).unwrap();
        assert_eq!(
            config.source(FLIGHTS).unwrap(),
            SourceConfig::Sqlite {
                db_path: PathBuf::from("/srv/raw.db"),
                query: "SELECT * FROM flights".into(),
            }
        );
    }

    #[test]
    fn test_missing_explicit_file_is_config_error() {
        let err = load_config(None, Some(Path::new("/nonexistent/skyetl.toml")), None).unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let overrides = ConfigOverrides {
            chunk_size: Some(0),
            ..Default::default()
        };
        assert!(load_config(None, None, Some(&overrides)).is_err());
    }

    #[test]
    fn test_configured_url_takes_precedence() {
        let config = EtlConfig {
            database_url: Some("sqlite::memory:".into()),
            ..Default::default()
        };
        assert!(config.connection().unwrap().is_memory());
    }
}
