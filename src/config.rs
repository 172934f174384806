// src/config.rs

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::warn;
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreOptions;
use crate::thresholds::ThresholdMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
}

/// Settings built once at startup and handed by reference to each component.
#[derive(Debug, Clone, Serialize)]
pub struct AtlasConfig {
    // Storage
    pub database_path: PathBuf,          // Default: <data dir>/atlas/atlas_data.db
    pub compress_payloads: bool,         // Default: true
    pub page_size: usize,                // Default: 256 rows

    // Collection
    pub source_query: String,            // Default: "query_stats"
    pub collection_interval: Duration,   // Default: 60 seconds
    pub query_timeout: Duration,         // Default: 10 seconds
    pub degraded_after: u32,             // Default: 3 failed rounds

    // Fan-out
    pub subscriber_timeout: Duration,    // Default: 5000 ms
    pub gap_threshold_rounds: u32,       // Default: 3 intervals

    // Alerting
    pub thresholds_path: Option<PathBuf>,
    pub threshold_mode: ThresholdMode,   // Default: default

    pub mq: MqConfig,
}

/// External message bus settings. Routing names are deployment configuration.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MqConfig {
    pub enabled: bool,                   // Default: false
    pub exchange: String,                // Default: "atlas_performance"
    pub queue: String,                   // Default: "atlas_performance_queue"
    pub routing_key: String,             // Default: "atlas_performance_key"
}

impl Default for MqConfig {
    fn default() -> Self {
        MqConfig {
            enabled: false,
            exchange: "atlas_performance".to_string(),
            queue: "atlas_performance_queue".to_string(),
            routing_key: "atlas_performance_key".to_string(),
        }
    }
}

impl Default for AtlasConfig {
    fn default() -> Self {
        AtlasConfig {
            database_path: default_database_path(),
            compress_payloads: true,
            page_size: 256,
            source_query: "query_stats".to_string(),
            collection_interval: Duration::from_secs(60),
            query_timeout: Duration::from_secs(10),
            degraded_after: 3,
            subscriber_timeout: Duration::from_millis(5_000),
            gap_threshold_rounds: 3,
            thresholds_path: None,
            threshold_mode: ThresholdMode::Default,
            mq: MqConfig::default(),
        }
    }
}

fn default_database_path() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("atlas");
    path.push("atlas_data.db");
    path
}

impl AtlasConfig {
    /// Defaults, then the env file (`.env` in the working directory when no
    /// path is given), then the process environment.
    pub fn load(env_file: Option<&Path>) -> Result<Self, ConfigError> {
        match env_file {
            Some(path) => {
                dotenvy::from_path(path).map_err(|source| ConfigError::EnvFile {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            None => {
                // A missing .env is the normal case.
                let _ = dotenvy::dotenv();
            }
        }
        Ok(Self::from_lookup(|key| std::env::var(key).ok()))
    }

    /// Build from an arbitrary key lookup. Unparseable values keep their
    /// default and are logged.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AtlasConfig::default();

        let interval_secs = parse_or(&lookup, "COLLECTION_LAPSE", defaults.collection_interval.as_secs());
        let interval_secs = if interval_secs == 0 {
            warn!("COLLECTION_LAPSE must be positive, using default");
            defaults.collection_interval.as_secs()
        } else {
            interval_secs
        };

        let mq_defaults = MqConfig::default();
        let mq = MqConfig {
            enabled: parse_flag(&lookup, "RABBITMQ", mq_defaults.enabled),
            exchange: lookup("RABBITMQ_EXCHANGE").unwrap_or(mq_defaults.exchange),
            queue: lookup("RABBITMQ_QUEUE").unwrap_or(mq_defaults.queue),
            routing_key: lookup("RABBITMQ_ROUTING_KEY").unwrap_or(mq_defaults.routing_key),
        };

        AtlasConfig {
            database_path: lookup("ATLAS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            compress_payloads: parse_flag(&lookup, "ATLAS_COMPRESS", defaults.compress_payloads),
            page_size: parse_or(&lookup, "ATLAS_PAGE_SIZE", defaults.page_size).max(1),
            source_query: lookup("ATLAS_SOURCE")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.source_query),
            collection_interval: Duration::from_secs(interval_secs),
            query_timeout: Duration::from_secs(parse_or(
                &lookup,
                "ATLAS_QUERY_TIMEOUT_SECS",
                defaults.query_timeout.as_secs(),
            )),
            degraded_after: parse_or(&lookup, "ATLAS_DEGRADED_AFTER", defaults.degraded_after).max(1),
            subscriber_timeout: Duration::from_millis(parse_or(
                &lookup,
                "ATLAS_SUBSCRIBER_TIMEOUT_MS",
                defaults.subscriber_timeout.as_millis() as u64,
            )),
            gap_threshold_rounds: parse_or(&lookup, "ATLAS_GAP_ROUNDS", defaults.gap_threshold_rounds)
                .max(1),
            thresholds_path: lookup("ATLAS_THRESHOLDS").map(PathBuf::from),
            threshold_mode: parse_or(&lookup, "ATLAS_THRESHOLD_MODE", defaults.threshold_mode),
            mq,
        }
    }

    /// Largest tolerated distance between consecutive snapshots of a source.
    pub fn gap_threshold(&self) -> Duration {
        self.collection_interval * self.gap_threshold_rounds
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            compress_payloads: self.compress_payloads,
            page_size: self.page_size,
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("ignoring invalid {}='{}', using default", key, raw);
                default
            }
        },
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ),
    }
}
