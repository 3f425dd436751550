// ⚙️ Store configuration
//
// Sources, later wins: built-in defaults, JSON file, DEDUP_* environment variables.

use crate::db::setup_database;
use crate::error::{DedupError, Result};
use crate::gateway::SqliteGateway;
use log::info;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Keeps a multi-row staging INSERT well under SQLite's bound parameter limit.
pub const MAX_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Staging rows per INSERT statement
    pub batch_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            batch_size: crate::bulk::BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_path: PathBuf,
    /// Write-ahead logging, lets readers run next to the single writer
    pub wal: bool,
    pub loader: LoaderConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database_path: PathBuf::from("dedup.db"),
            wal: true,
            loader: LoaderConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| DedupError::Decode {
            message: format!("cannot read config {}: {}", path.display(), e),
        })?;
        let config: StoreConfig = serde_json::from_str(&text).map_err(|e| DedupError::Decode {
            message: format!("invalid config {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `DEDUP_DB_PATH`, `DEDUP_BATCH_SIZE` and `DEDUP_WAL`.
    pub fn from_env() -> Result<Self> {
        let mut config = StoreConfig::default();
        config.apply_env()?;
        Ok(config)
    }

    /// File (when given) then environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => StoreConfig::from_file(path)?,
            None => StoreConfig::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = env::var("DEDUP_DB_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Ok(size) = env::var("DEDUP_BATCH_SIZE") {
            self.loader.batch_size = size.trim().parse().map_err(|_| DedupError::Decode {
                message: format!("DEDUP_BATCH_SIZE is not a number: {:?}", size),
            })?;
        }
        if let Ok(wal) = env::var("DEDUP_WAL") {
            self.wal = match wal.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(DedupError::Decode {
                        message: format!("DEDUP_WAL is not a boolean: {:?}", other),
                    })
                }
            };
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.loader.batch_size == 0 || self.loader.batch_size > MAX_BATCH_SIZE {
            return Err(DedupError::Decode {
                message: format!(
                    "batch_size must be between 1 and {}, got {}",
                    MAX_BATCH_SIZE, self.loader.batch_size
                ),
            });
        }
        Ok(())
    }

    /// Open the database and make sure the schema exists.
    pub fn open(&self) -> Result<SqliteGateway> {
        let gateway = SqliteGateway::open(&self.database_path)?;
        if self.wal {
            gateway
                .connection()
                .pragma_update(None, "journal_mode", "WAL")?;
        }
        setup_database(gateway.connection())?;
        info!(
            "Opened {} (wal: {}, batch size: {})",
            self.database_path.display(),
            self.wal,
            self.loader.batch_size
        );
        Ok(gateway)
    }
}
