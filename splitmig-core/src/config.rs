use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BlueprintKind, MigrationResult, ValidationError};
use crate::executor::RetryPolicy;

pub const DEFAULT_DATABASE_URL: &str = "mysql://root@localhost/splitphp";
pub const DEFAULT_CACHE_PATH: &str = "cache/database-metadata.json";

/// Runtime settings, read from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `DATABASE_URL`
    pub database_url: String,
    /// `DB_WORK_AROUND_FACTOR`: how many times a transient failure is tried.
    pub work_around_factor: u32,
    /// `DB_RETRY_DELAY_MS`
    pub retry_delay: Duration,
    /// `APP_ENV`: environment matched against seed allowlists.
    pub environment: String,
    /// `SPLITMIG_CACHE_PATH`
    pub cache_path: PathBuf,
    /// `SPLITMIG_ROOT`: project root for migration discovery.
    pub root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_owned(),
            work_around_factor: 5,
            retry_delay: Duration::from_millis(1000),
            environment: "dev".to_owned(),
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            root: PathBuf::from("."),
        }
    }
}

impl Config {
    pub fn from_env() -> MigrationResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> MigrationResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();
        let mut errors = Vec::new();

        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(raw) = get("DB_WORK_AROUND_FACTOR") {
            match raw.trim().parse::<u32>() {
                Ok(n) => config.work_around_factor = n.max(1),
                Err(_) => errors.push(invalid("DB_WORK_AROUND_FACTOR", &raw)),
            }
        }
        if let Some(raw) = get("DB_RETRY_DELAY_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.retry_delay = Duration::from_millis(ms),
                Err(_) => errors.push(invalid("DB_RETRY_DELAY_MS", &raw)),
            }
        }
        if let Some(env) = get("APP_ENV") {
            config.environment = env;
        }
        if let Some(path) = get("SPLITMIG_CACHE_PATH") {
            config.cache_path = PathBuf::from(path);
        }
        if let Some(root) = get("SPLITMIG_ROOT") {
            config.root = PathBuf::from(root);
        }

        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors.into())
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.work_around_factor, self.retry_delay)
    }
}

fn invalid(key: &str, raw: &str) -> ValidationError {
    ValidationError::new(
        BlueprintKind::Setting,
        key,
        format!("expected a non-negative integer, got '{}'", raw),
    )
}
