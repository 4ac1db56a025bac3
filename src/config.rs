//! Runtime configuration.
//!
//! Layered: built-in defaults, then an optional JSON file, then
//! `TRUCK_RATINGS_*` environment variables. The CLI applies its flags last.

use crate::core::aggregate::FoldPolicy;
use crate::error::{Error, Result};
use crate::trigger::dispatcher::DispatchConfig;
use crate::trigger::transaction::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// Prefix shared by all environment overrides
pub const ENV_PREFIX: &str = "TRUCK_RATINGS_";

/// File name of the rating write-ahead log inside `data_dir`
pub const WAL_FILE_NAME: &str = "ratings.wal";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for the rating WAL; ratings are kept in memory only when unset
    pub data_dir: Option<PathBuf>,
    pub fold_policy: FoldPolicy,
    /// Skip redelivered writes instead of counting them again
    pub dedup_replays: bool,
    pub retry: RetryPolicy,
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Defaults, overlaid with `path` if given, then with the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = serde_json::from_str(&raw).map_err(|e| {
            Error::Configuration(format!("invalid config file {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Apply `TRUCK_RATINGS_*` overrides using `lookup` to read variables
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(dir) = var("DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(policy) = var("FOLD_POLICY") {
            self.fold_policy = policy.parse()?;
        }
        if let Some(dedup) = var("DEDUP_REPLAYS") {
            self.dedup_replays = parse_var("DEDUP_REPLAYS", &dedup)?;
        }
        if let Some(attempts) = var("MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_var("MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(concurrency) = var("MAX_CONCURRENCY") {
            self.dispatch.max_concurrency = parse_var("MAX_CONCURRENCY", &concurrency)?;
        }
        if let Some(redeliveries) = var("MAX_REDELIVERIES") {
            self.dispatch.max_redeliveries = parse_var("MAX_REDELIVERIES", &redeliveries)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Configuration("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::Configuration(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if self.dispatch.max_concurrency == 0 {
            return Err(Error::Configuration(
                "dispatch.max_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Location of the rating WAL, when persistence is enabled
    pub fn wal_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(WAL_FILE_NAME))
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Configuration(format!("{ENV_PREFIX}{name}={raw:?}: {e}")))
}
