use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// A scalar as handed back by the database driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl RawValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            RawValue::Null => "null",
            RawValue::Bool(_) => "bool",
            RawValue::Int(_) => "int",
            RawValue::Float(_) => "float",
            RawValue::Text(_) => "text",
        }
    }

    /// Text form used for key columns.
    pub fn as_key(&self) -> Option<String> {
        match self {
            RawValue::Null => None,
            RawValue::Bool(b) => Some(b.to_string()),
            RawValue::Int(i) => Some(i.to_string()),
            RawValue::Float(f) => Some(f.to_string()),
            RawValue::Text(s) if s.trim().is_empty() => None,
            RawValue::Text(s) => Some(s.trim().to_string()),
        }
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Int(value)
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Float(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

/// One tabular row: column name to scalar.
pub type RawMetricRow = BTreeMap<String, RawValue>;

/// Rows returned by the query of a single metric group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupResult {
    pub group: String,
    pub rows: Vec<RawMetricRow>,
}

/// Everything one collection round produced, tagged with a single timestamp.
#[derive(Clone, Debug)]
pub struct RawBatch {
    pub collected_at: DateTime<Utc>,
    pub source_query: String,
    pub groups: Vec<GroupResult>,
}

impl RawBatch {
    pub fn new(collected_at: DateTime<Utc>, source_query: &str) -> Self {
        RawBatch {
            collected_at,
            source_query: source_query.to_string(),
            groups: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: &str, rows: Vec<RawMetricRow>) -> Self {
        self.groups.push(GroupResult {
            group: group.to_string(),
            rows,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// A typed metric value after normalization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
    #[serde(with = "duration_ms")]
    Duration(Duration),
    Percentage(f64),
}

impl MetricValue {
    /// Flattened numeric form; durations are expressed in milliseconds.
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Integer(v) => *v as f64,
            MetricValue::Float(v) | MetricValue::Percentage(v) => *v,
            MetricValue::Duration(d) => d.as_nanos() as f64 / 1e6,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Integer(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Duration(d) => write!(f, "{}ms", d.as_secs_f64() * 1000.0),
            MetricValue::Percentage(v) => write!(f, "{}%", v),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_nanos() as f64 / 1e6)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "invalid duration {}ms",
                ms
            )));
        }
        Ok(Duration::from_nanos((ms * 1e6).round() as u64))
    }
}

pub type MetricSet = BTreeMap<String, MetricValue>;

/// One immutable, timestamped bundle of typed metrics.
///
/// Timestamps are kept at microsecond precision, the resolution of the
/// store key, so two snapshots compare equal exactly when the store would
/// treat them as the same row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(deserialize_with = "micros_timestamp")]
    timestamp: DateTime<Utc>,
    source_query: String,
    metric_set: MetricSet,
}

impl Snapshot {
    pub fn new(timestamp: DateTime<Utc>, source_query: &str, metric_set: MetricSet) -> Self {
        Snapshot {
            timestamp: timestamp.trunc_subsecs(6),
            source_query: source_query.to_string(),
            metric_set,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source_query(&self) -> &str {
        &self.source_query
    }

    pub fn metric_set(&self) -> &MetricSet {
        &self.metric_set
    }

    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.metric_set.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.metric_set.is_empty()
    }

    /// Identity used for dedup in the store.
    pub fn key(&self) -> (&str, DateTime<Utc>) {
        (&self.source_query, self.timestamp)
    }
}

/// `"{key}.{metric}"` into its parts; unkeyed names have no key.
pub(crate) fn split_metric_name(name: &str) -> (Option<&str>, &str) {
    match name.rsplit_once('.') {
        Some((key, metric)) if !key.is_empty() && !metric.is_empty() => (Some(key), metric),
        _ => (None, name),
    }
}

fn micros_timestamp<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<DateTime<Utc>, D::Error> {
    DateTime::<Utc>::deserialize(deserializer).map(|t| t.trunc_subsecs(6))
}

/// Non-fatal note produced while normalizing a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AnalysisWarning {
    /// A required column was absent; the whole group was dropped.
    MissingColumn { group: String, column: String },
    /// A value could not be coerced to the declared kind; only that metric was dropped.
    Coercion {
        group: String,
        metric: String,
        found: String,
        reason: String,
    },
    /// The batch carried rows for a group the schema does not declare.
    UnknownGroup { group: String },
    /// A keyed group row had no usable key value.
    MissingKey { group: String, row: usize },
    /// The query returned no rows.
    EmptyGroup { group: String },
}

impl fmt::Display for AnalysisWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisWarning::MissingColumn { group, column } => {
                write!(f, "group {} missing required column {}", group, column)
            }
            AnalysisWarning::Coercion {
                group,
                metric,
                found,
                reason,
            } => write!(
                f,
                "group {} metric {} could not coerce {}: {}",
                group, metric, found, reason
            ),
            AnalysisWarning::UnknownGroup { group } => write!(f, "unknown metric group {}", group),
            AnalysisWarning::MissingKey { group, row } => {
                write!(f, "group {} row {} has no key value", group, row)
            }
            AnalysisWarning::EmptyGroup { group } => write!(f, "group {} returned no rows", group),
        }
    }
}
