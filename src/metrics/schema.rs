//! Per-group metric schema: which columns a query returns, which of them are
//! required, and how each raw value is coerced into a [`MetricValue`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{MetricValue, RawValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Microseconds,
    #[default]
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    fn nanos_per_unit(self) -> f64 {
        match self {
            TimeUnit::Microseconds => 1e3,
            TimeUnit::Milliseconds => 1e6,
            TimeUnit::Seconds => 1e9,
        }
    }

    /// `amount` must be finite and non-negative.
    fn to_duration(self, amount: f64) -> Result<Duration, String> {
        let nanos = (amount * self.nanos_per_unit()).round();
        if nanos > u64::MAX as f64 {
            return Err(format!("duration {} out of range", amount));
        }
        Ok(Duration::from_nanos(nanos as u64))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MetricKind {
    Integer,
    Float,
    Duration {
        #[serde(default)]
        unit: TimeUnit,
    },
    Percentage,
}

impl MetricKind {
    /// Coerce a driver value into this kind.
    pub fn coerce(&self, raw: &RawValue) -> Result<MetricValue, String> {
        match self {
            MetricKind::Integer => coerce_integer(raw).map(MetricValue::Integer),
            MetricKind::Float => coerce_number(raw).map(MetricValue::Float),
            MetricKind::Duration { unit } => {
                let amount = coerce_number(raw)?;
                if amount < 0.0 {
                    return Err(format!("negative duration {}", amount));
                }
                unit.to_duration(amount).map(MetricValue::Duration)
            }
            MetricKind::Percentage => {
                let pct = coerce_number(raw)?;
                if !(0.0..=100.0).contains(&pct) {
                    return Err(format!("percentage {} outside 0..=100", pct));
                }
                Ok(MetricValue::Percentage(pct))
            }
        }
    }
}

/// 2^63; `i64::MAX as f64` rounds up to it, so the bound must be exclusive.
const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;

fn coerce_integer(raw: &RawValue) -> Result<i64, String> {
    match raw {
        RawValue::Int(v) => Ok(*v),
        RawValue::Float(v) => integral(*v).ok_or_else(|| format!("{} is not an integer in range", v)),
        RawValue::Text(s) => {
            let trimmed = s.trim();
            if let Ok(v) = trimmed.parse::<i64>() {
                return Ok(v);
            }
            // Decimal columns often come back as "123.000".
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(integral)
                .ok_or_else(|| format!("'{}' is not an integer in range", s))
        }
        other => Err(format!("{} is not numeric", other.type_name())),
    }
}

fn integral(v: f64) -> Option<i64> {
    (v.is_finite() && v.fract() == 0.0 && v >= i64::MIN as f64 && v < I64_UPPER).then(|| v as i64)
}

fn coerce_number(raw: &RawValue) -> Result<f64, String> {
    let value = match raw {
        RawValue::Int(v) => *v as f64,
        RawValue::Float(v) => *v,
        RawValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{}' is not a number", s))?,
        other => return Err(format!("{} is not numeric", other.type_name())),
    };
    if !value.is_finite() {
        return Err(format!("{} is not finite", value));
    }
    Ok(value)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Column in the raw row.
    pub column: String,
    /// Name in the snapshot's metric set; defaults to the column name.
    #[serde(default)]
    pub name: Option<String>,
    pub kind: MetricKind,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl MetricSpec {
    pub fn required(column: &str, kind: MetricKind) -> Self {
        MetricSpec {
            column: column.to_string(),
            name: None,
            kind,
            required: true,
        }
    }

    pub fn optional(column: &str, kind: MetricKind) -> Self {
        MetricSpec {
            required: false,
            ..MetricSpec::required(column, kind)
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn metric_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.column)
    }
}

/// One monitored group: the query that produces it and the metrics read from its rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricGroup {
    pub name: String,
    pub query: String,
    /// When set, every row contributes metrics prefixed by this column's value.
    #[serde(default)]
    pub key_column: Option<String>,
    pub metrics: Vec<MetricSpec>,
}

impl MetricGroup {
    pub fn new(name: &str, query: &str) -> Self {
        MetricGroup {
            name: name.to_string(),
            query: query.to_string(),
            key_column: None,
            metrics: Vec::new(),
        }
    }

    pub fn keyed_by(mut self, column: &str) -> Self {
        self.key_column = Some(column.to_string());
        self
    }

    pub fn metric(mut self, spec: MetricSpec) -> Self {
        self.metrics.push(spec);
        self
    }

    pub fn required_columns(&self) -> impl Iterator<Item = &str> {
        self.key_column
            .as_deref()
            .into_iter()
            .chain(self.metrics.iter().filter(|m| m.required).map(|m| m.column.as_str()))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSchema {
    pub groups: Vec<MetricGroup>,
}

impl MetricSchema {
    pub fn new(groups: Vec<MetricGroup>) -> Self {
        MetricSchema { groups }
    }

    pub fn group(&self, name: &str) -> Option<&MetricGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Server-wide counters plus per-statement statistics from the plan cache.
    pub fn sql_server_default() -> Self {
        let ms = MetricKind::Duration {
            unit: TimeUnit::Milliseconds,
        };
        let (integer, float, percentage) =
            (MetricKind::Integer, MetricKind::Float, MetricKind::Percentage);

        let server = MetricGroup::new("server", SERVER_COUNTERS_QUERY)
            .metric(MetricSpec::required("cpu", percentage))
            .metric(MetricSpec::required("io_wait", integer))
            .metric(MetricSpec::optional("active_sessions", integer));

        let mut stats = MetricGroup::new("query_stats", QUERY_STATS_QUERY).keyed_by("query_hash");
        for column in [
            "total_elapsed_time_ms",
            "total_cpu_time_ms",
            "min_elapsed_time_ms",
            "max_elapsed_time_ms",
            "avg_elapsed_time_ms",
            "avg_cpu_time_ms",
        ] {
            stats = stats.metric(MetricSpec::required(column, ms));
        }
        for column in [
            "execution_count",
            "total_logical_reads",
            "total_physical_reads",
            "total_logical_writes",
            "total_spills",
            "total_grant_kb",
        ] {
            stats = stats.metric(MetricSpec::required(column, integer));
        }
        for column in [
            "avg_logical_reads",
            "avg_physical_reads",
            "avg_spills",
            "avg_grant_kb",
        ] {
            stats = stats.metric(MetricSpec::required(column, float));
        }
        stats = stats
            .metric(MetricSpec::optional("buffer_hit_ratio", percentage))
            .metric(MetricSpec::optional("cpu_efficiency_ratio", percentage));

        MetricSchema::new(vec![server, stats])
    }
}

const SERVER_COUNTERS_QUERY: &str = r#"
SELECT
    (SELECT TOP 1 100 - r.SystemIdle
       FROM (SELECT record.value('(./Record/SchedulerMonitorEvent/SystemHealth/SystemIdle)[1]', 'int') AS SystemIdle
               FROM (SELECT CONVERT(xml, record) AS record
                       FROM sys.dm_os_ring_buffers
                      WHERE ring_buffer_type = N'RING_BUFFER_SCHEDULER_MONITOR') AS x) AS r) AS cpu,
    (SELECT SUM(wait_time_ms) FROM sys.dm_os_wait_stats WHERE wait_type LIKE 'PAGEIOLATCH%') AS io_wait,
    (SELECT COUNT(*) FROM sys.dm_exec_sessions WHERE is_user_process = 1) AS active_sessions
"#;

const QUERY_STATS_QUERY: &str = r#"
SELECT TOP 50
    CONVERT(varchar(32), qs.query_hash, 1) AS query_hash,
    qs.execution_count,
    qs.total_elapsed_time / 1000 AS total_elapsed_time_ms,
    qs.total_worker_time / 1000 AS total_cpu_time_ms,
    qs.min_elapsed_time / 1000 AS min_elapsed_time_ms,
    qs.max_elapsed_time / 1000 AS max_elapsed_time_ms,
    CAST(qs.total_elapsed_time / 1000.0 / qs.execution_count AS decimal(18, 2)) AS avg_elapsed_time_ms,
    CAST(qs.total_worker_time / 1000.0 / qs.execution_count AS decimal(18, 2)) AS avg_cpu_time_ms,
    qs.total_logical_reads,
    qs.total_physical_reads,
    qs.total_logical_writes,
    CAST(qs.total_logical_reads * 1.0 / qs.execution_count AS decimal(18, 2)) AS avg_logical_reads,
    CAST(qs.total_physical_reads * 1.0 / qs.execution_count AS decimal(18, 2)) AS avg_physical_reads,
    qs.total_spills,
    CAST(qs.total_spills * 1.0 / qs.execution_count AS decimal(18, 2)) AS avg_spills,
    qs.total_grant_kb,
    CAST(qs.total_grant_kb * 1.0 / qs.execution_count AS decimal(18, 2)) AS avg_grant_kb,
    CASE WHEN qs.total_logical_reads = 0 THEN 100
         ELSE CAST(100.0 * (qs.total_logical_reads - qs.total_physical_reads) / qs.total_logical_reads AS decimal(5, 2))
    END AS buffer_hit_ratio,
    CASE WHEN qs.total_elapsed_time = 0 THEN 100
         ELSE CAST(100.0 * qs.total_worker_time / qs.total_elapsed_time AS decimal(5, 2))
    END AS cpu_efficiency_ratio
FROM sys.dm_exec_query_stats AS qs
WHERE qs.execution_count > 0
ORDER BY qs.total_elapsed_time DESC
"#;
