//! Configuration loading from dataward.toml.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use policy::{Id, QueryFilterSet, TableSchema};
use runtime::DEFAULT_SUPERUSER_ID;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// SQLite database file.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    #[serde(default = "default_superuser_id")]
    pub superuser_id: Id,

    /// Default tracing directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Application tables the CLI can query.
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TableConfig {
    #[serde(default)]
    pub columns: Vec<String>,

    /// Named joins to other configured tables.
    #[serde(default)]
    pub relations: BTreeMap<String, RelationConfig>,

    /// Query parameters accepted for this table.
    #[serde(default)]
    pub filters: FilterConfig,
}

#[derive(Debug, Deserialize)]
pub struct RelationConfig {
    pub table: String,
    pub local: String,
    pub remote: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub keys: Vec<String>,
}

fn default_database() -> PathBuf {
    PathBuf::from("dataward.db")
}

fn default_superuser_id() -> Id {
    DEFAULT_SUPERUSER_ID
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: default_database(),
            superuser_id: default_superuser_id(),
            log_level: default_log_level(),
            tables: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Like [`Config::load`], falling back to defaults when the file is
    /// missing.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML string. Declared filter keys are
    /// checked against their table.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.filter_sets()?;
        Ok(config)
    }

    /// Schema of a configured table, with its relations resolved
    /// recursively. A relation leading back to a table already on the
    /// path gets a target without relations.
    pub fn schema(&self, table: &str) -> Result<TableSchema, ConfigError> {
        if !self.tables.contains_key(table) {
            return Err(ConfigError::UnknownTable(table.to_string()));
        }
        Ok(self.build_schema(table, &mut BTreeSet::new()))
    }

    fn build_schema(&self, table: &str, visiting: &mut BTreeSet<String>) -> TableSchema {
        let mut schema = TableSchema::new(table);
        let Some(config) = self.tables.get(table) else {
            return schema;
        };
        schema = schema.with_columns(config.columns.iter().cloned());
        visiting.insert(table.to_string());
        for (path, relation) in &config.relations {
            let target = if visiting.contains(&relation.table) {
                TableSchema::new(&relation.table).with_columns(
                    self.tables
                        .get(&relation.table)
                        .map(|t| t.columns.clone())
                        .unwrap_or_default(),
                )
            } else {
                self.build_schema(&relation.table, visiting)
            };
            schema = schema.with_relation(path, &relation.local, &relation.remote, target);
        }
        visiting.remove(table);
        schema
    }

    /// Validated query filter sets for every configured table.
    pub fn filter_sets(&self) -> Result<BTreeMap<String, QueryFilterSet>, ConfigError> {
        self.tables
            .iter()
            .map(|(name, table)| -> Result<_, ConfigError> {
                let set = QueryFilterSet::new(self.schema(name)?, table.filters.keys.iter().cloned())
                    .map_err(|source| ConfigError::Filter {
                        table: name.clone(),
                        source,
                    })?;
                Ok((name.clone(), set))
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("table '{0}' is not configured")]
    UnknownTable(String),

    #[error("invalid filter for table '{table}': {source}")]
    Filter {
        table: String,
        source: policy::Error,
    },
}
