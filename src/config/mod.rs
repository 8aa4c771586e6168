use std::{fs, path::Path};

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::contracts::{Catalog, DefinitionError};
use crate::demo;

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    /// Cat and Dog implementing Animal.
    #[default]
    Animals,
    /// Cat and Dog implementing IAnimal, which requires Owned.
    Ianimal,
}

impl CatalogKind {
    pub fn build(self) -> Result<Catalog, DefinitionError> {
        match self {
            CatalogKind::Animals => demo::animal_catalog(),
            CatalogKind::Ianimal => demo::ianimal_catalog(),
        }
    }
}

/// File-level settings. Command-line flags take precedence over every field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Contract id seed; drawn from the OS when absent.
    pub seed: Option<u64>,
    pub catalog: CatalogKind,
    pub log_filter: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Applies command-line overrides.
    pub fn merge(
        mut self,
        seed: Option<u64>,
        catalog: Option<CatalogKind>,
        log_filter: Option<String>,
    ) -> Self {
        if seed.is_some() {
            self.seed = seed;
        }
        if let Some(catalog) = catalog {
            self.catalog = catalog;
        }
        if log_filter.is_some() {
            self.log_filter = log_filter;
        }
        self
    }

    pub fn seed_or_random(&self) -> u64 {
        self.seed.unwrap_or_else(|| OsRng.next_u64())
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}
