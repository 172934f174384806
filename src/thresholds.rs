//! Statement-level performance thresholds and the evaluator that flags
//! snapshots breaching them.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::{split_metric_name, Snapshot};

const FILE_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum ThresholdsError {
    #[error("failed to access thresholds file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid thresholds file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    /// Balanced for most databases.
    #[default]
    Default,
    /// Smaller databases: flags more statements.
    Conservative,
    /// Large databases: flags only severe statements.
    Aggressive,
}

impl FromStr for ThresholdMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(ThresholdMode::Default),
            "conservative" => Ok(ThresholdMode::Conservative),
            "aggressive" => Ok(ThresholdMode::Aggressive),
            other => Err(format!("unknown threshold mode '{}'", other)),
        }
    }
}

impl fmt::Display for ThresholdMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThresholdMode::Default => "default",
            ThresholdMode::Conservative => "conservative",
            ThresholdMode::Aggressive => "aggressive",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    // Time, milliseconds
    pub max_avg_elapsed_time_ms: f64,            // Default: 1000
    pub max_total_elapsed_time_ms: f64,          // Default: 30000
    pub max_avg_cpu_time_ms: f64,                // Default: 5000

    // I/O
    pub max_avg_logical_reads: f64,              // Default: 10000
    pub max_avg_physical_reads: f64,             // Default: 1000
    pub max_total_logical_reads: i64,            // Default: 1000000

    // Memory and spills
    pub min_spills_to_capture: i64,              // Default: 1
    pub max_avg_grant_kb: f64,                   // Default: 50000

    // Execution frequency
    pub min_execution_count: i64,                // Default: 1
    pub max_execution_count_for_slow_queries: i64, // Default: 10

    // Ratios, lower is worse
    pub min_buffer_hit_ratio: f64,               // Default: 80
    pub min_cpu_efficiency_ratio: f64,           // Default: 50

    pub max_stored_queries_per_collection: usize, // Default: 50
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        PerformanceThresholds {
            max_avg_elapsed_time_ms: 1000.0,
            max_total_elapsed_time_ms: 30000.0,
            max_avg_cpu_time_ms: 5000.0,
            max_avg_logical_reads: 10000.0,
            max_avg_physical_reads: 1000.0,
            max_total_logical_reads: 1_000_000,
            min_spills_to_capture: 1,
            max_avg_grant_kb: 50000.0,
            min_execution_count: 1,
            max_execution_count_for_slow_queries: 10,
            min_buffer_hit_ratio: 80.0,
            min_cpu_efficiency_ratio: 50.0,
            max_stored_queries_per_collection: 50,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ThresholdsFile {
    thresholds: PerformanceThresholds,
    #[serde(default)]
    description: String,
    #[serde(default)]
    version: String,
}

impl PerformanceThresholds {
    pub fn preset(mode: ThresholdMode) -> Self {
        let base = PerformanceThresholds::default();
        match mode {
            ThresholdMode::Default => base,
            ThresholdMode::Conservative => PerformanceThresholds {
                max_avg_elapsed_time_ms: 500.0,
                max_total_elapsed_time_ms: 10000.0,
                max_avg_cpu_time_ms: 2000.0,
                max_avg_logical_reads: 5000.0,
                max_avg_physical_reads: 500.0,
                max_stored_queries_per_collection: 25,
                ..base
            },
            ThresholdMode::Aggressive => PerformanceThresholds {
                max_avg_elapsed_time_ms: 2000.0,
                max_total_elapsed_time_ms: 60000.0,
                max_avg_cpu_time_ms: 10000.0,
                max_avg_logical_reads: 20000.0,
                max_avg_physical_reads: 2000.0,
                max_stored_queries_per_collection: 100,
                ..base
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self, ThresholdsError> {
        let json = fs::read_to_string(path)?;
        let file: ThresholdsFile = serde_json::from_str(&json)?;
        Ok(file.thresholds)
    }

    /// Load from `path`, writing the `mode` preset there first when the
    /// file does not exist yet.
    pub fn load_or_init(path: &Path, mode: ThresholdMode) -> Result<Self, ThresholdsError> {
        if path.exists() {
            let thresholds = Self::load(path)?;
            info!("loaded performance thresholds from {}", path.display());
            return Ok(thresholds);
        }
        let thresholds = Self::preset(mode);
        thresholds.save(path)?;
        info!(
            "wrote {} performance thresholds to {}",
            mode,
            path.display()
        );
        Ok(thresholds)
    }

    pub fn save(&self, path: &Path) -> Result<(), ThresholdsError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = ThresholdsFile {
            thresholds: self.clone(),
            description: "Atlas performance filtering thresholds".to_string(),
            version: FILE_VERSION.to_string(),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    fn rules(&self) -> [ThresholdRule; 10] {
        use Comparison::{Above, AtLeast, Below};
        [
            ThresholdRule::new("avg_elapsed_time_ms", Above, self.max_avg_elapsed_time_ms, true),
            ThresholdRule::new("total_elapsed_time_ms", Above, self.max_total_elapsed_time_ms, true),
            ThresholdRule::new("avg_cpu_time_ms", Above, self.max_avg_cpu_time_ms, true),
            ThresholdRule::new("avg_logical_reads", Above, self.max_avg_logical_reads, false),
            ThresholdRule::new("avg_physical_reads", Above, self.max_avg_physical_reads, false),
            ThresholdRule::new("total_logical_reads", Above, self.max_total_logical_reads as f64, false),
            ThresholdRule::new("total_spills", AtLeast, self.min_spills_to_capture.max(1) as f64, false),
            ThresholdRule::new("avg_grant_kb", Above, self.max_avg_grant_kb, false),
            ThresholdRule::new("buffer_hit_ratio", Below, self.min_buffer_hit_ratio, false),
            ThresholdRule::new("cpu_efficiency_ratio", Below, self.min_cpu_efficiency_ratio, false),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Above,
    AtLeast,
    Below,
}

#[derive(Clone, Copy, Debug)]
struct ThresholdRule {
    metric: &'static str,
    comparison: Comparison,
    limit: f64,
    time_based: bool,
}

impl ThresholdRule {
    fn new(metric: &'static str, comparison: Comparison, limit: f64, time_based: bool) -> Self {
        ThresholdRule {
            metric,
            comparison,
            limit,
            time_based,
        }
    }

    /// How far past the limit `value` is; `None` when within it.
    fn severity(&self, value: f64) -> Option<f64> {
        match self.comparison {
            Comparison::Above if value > self.limit => Some(ratio(value, self.limit)),
            Comparison::AtLeast if value >= self.limit => Some(ratio(value, self.limit)),
            Comparison::Below if value < self.limit => Some(ratio(self.limit, value)),
            _ => None,
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator <= 0.0 {
        f64::MAX
    } else {
        numerator / denominator
    }
}

/// One metric of one statement past its limit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThresholdBreach {
    /// Statement key (for example the query hash); `None` for server-wide metrics.
    pub key: Option<String>,
    pub metric: String,
    pub value: f64,
    pub limit: f64,
    pub comparison: Comparison,
    pub severity: f64,
    /// A slow statement that also runs often.
    pub frequent: bool,
}

pub struct ThresholdEvaluator {
    thresholds: PerformanceThresholds,
}

impl ThresholdEvaluator {
    pub fn new(thresholds: PerformanceThresholds) -> Self {
        ThresholdEvaluator { thresholds }
    }

    pub fn thresholds(&self) -> &PerformanceThresholds {
        &self.thresholds
    }

    /// Breaches in `snapshot`, most severe first, limited to
    /// `max_stored_queries_per_collection` distinct statements.
    pub fn evaluate(&self, snapshot: &Snapshot) -> Vec<ThresholdBreach> {
        let rules = self.thresholds.rules();
        let mut breaches = Vec::new();

        for (name, value) in snapshot.metric_set() {
            let (key, metric) = split_metric_name(name);
            let Some(rule) = rules.iter().find(|rule| rule.metric == metric) else {
                continue;
            };
            let executions = key.and_then(|key| {
                snapshot
                    .metric(&format!("{}.execution_count", key))
                    .map(|v| v.as_f64())
            });
            if matches!(executions, Some(count) if count < self.thresholds.min_execution_count as f64) {
                continue;
            }
            let value = value.as_f64();
            let Some(severity) = rule.severity(value) else {
                continue;
            };
            let frequent = rule.time_based
                && matches!(executions, Some(count)
                    if count >= self.thresholds.max_execution_count_for_slow_queries as f64);
            breaches.push(ThresholdBreach {
                key: key.map(str::to_string),
                metric: metric.to_string(),
                value,
                limit: rule.limit,
                comparison: rule.comparison,
                severity,
                frequent,
            });
        }

        breaches.sort_by(|a, b| {
            b.frequent
                .cmp(&a.frequent)
                .then_with(|| b.severity.total_cmp(&a.severity))
                .then_with(|| a.key.cmp(&b.key))
                .then_with(|| a.metric.cmp(&b.metric))
        });

        let cap = self.thresholds.max_stored_queries_per_collection;
        let mut kept_keys: Vec<Option<String>> = Vec::new();
        breaches.retain(|breach| {
            if kept_keys.contains(&breach.key) {
                return true;
            }
            if kept_keys.len() >= cap {
                return false;
            }
            kept_keys.push(breach.key.clone());
            true
        });
        if kept_keys.len() >= cap && cap > 0 {
            warn!(
                "threshold breaches capped at {} statements for {}",
                cap,
                snapshot.timestamp()
            );
        }
        breaches
    }
}
