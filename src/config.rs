use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::FlurryError;

/// Trailing-edge debounce window for live typing.
pub const DEFAULT_DEBOUNCE_MS: u64 = 150;

/// Max provider fetches running at once across the whole controller.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub debounce: Duration,
    pub max_concurrent_fetches: usize,
    /// In-memory catalogs to register as providers (used by the binary).
    pub catalogs: Vec<CatalogConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            catalogs: Vec::new(),
        }
    }
}

/// One `[[catalog]]` table.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CatalogConfig {
    pub name: String,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default = "default_min_query_len")]
    pub min_query_len: usize,
    /// Simulated per-fetch latency.
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub capacity: Option<usize>,
    /// Report an exact match when an item equals the query.
    #[serde(default = "default_true")]
    pub exact_match: bool,
    /// Abort own fetch when a sibling reports an exact match.
    #[serde(default)]
    pub yield_to_exact_match: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
}

fn default_min_query_len() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    debounce_ms: Option<u64>,
    max_concurrent_fetches: Option<usize>,
    #[serde(default, rename = "catalog")]
    catalogs: Vec<CatalogConfig>,
}

impl Config {
    /// `FLURRY_CONFIG` names a TOML file; otherwise read the environment.
    pub fn load() -> Result<Self, FlurryError> {
        match env::var("FLURRY_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::from_env()),
        }
    }

    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(raw) = env::var("FLURRY_DEBOUNCE_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.debounce = Duration::from_millis(ms),
                Err(_) => tracing::warn!(
                    value = %raw,
                    "FLURRY_DEBOUNCE_MS is not a number, using {DEFAULT_DEBOUNCE_MS}ms"
                ),
            }
        }

        if let Ok(raw) = env::var("FLURRY_MAX_CONCURRENT_FETCHES") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.max_concurrent_fetches = n,
                _ => tracing::warn!(
                    value = %raw,
                    "FLURRY_MAX_CONCURRENT_FETCHES must be a positive integer, using {DEFAULT_MAX_CONCURRENT_FETCHES}"
                ),
            }
        }

        config
    }

    pub fn from_file(path: &Path) -> Result<Self, FlurryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FlurryError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, FlurryError> {
        let file: ConfigFile =
            toml::from_str(raw).map_err(|e| FlurryError::Config(e.to_string()))?;

        let max_concurrent_fetches = file
            .max_concurrent_fetches
            .unwrap_or(DEFAULT_MAX_CONCURRENT_FETCHES);
        if max_concurrent_fetches == 0 {
            return Err(FlurryError::Config(
                "max_concurrent_fetches must be at least 1".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for catalog in &file.catalogs {
            if !seen.insert(catalog.name.as_str()) {
                return Err(FlurryError::Config(format!(
                    "duplicate catalog name: {}",
                    catalog.name
                )));
            }
        }

        Ok(Self {
            debounce: Duration::from_millis(file.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS)),
            max_concurrent_fetches,
            catalogs: file.catalogs,
        })
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}
