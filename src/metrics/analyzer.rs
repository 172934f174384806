use std::sync::Arc;

use log::{debug, warn};

use super::schema::{MetricGroup, MetricSchema};
use super::types::{AnalysisWarning, GroupResult, MetricSet, RawMetricRow, RawBatch, Snapshot};

/// Result of normalizing one batch.
#[derive(Clone, Debug)]
pub struct Analysis {
    pub snapshot: Snapshot,
    pub warnings: Vec<AnalysisWarning>,
}

/// Pure mapping from raw batches to typed snapshots.
///
/// Holds only the schema; no state is carried from one call to the next.
#[derive(Clone, Debug)]
pub struct DataAnalyzer {
    schema: Arc<MetricSchema>,
}

impl DataAnalyzer {
    pub fn new(schema: Arc<MetricSchema>) -> Self {
        DataAnalyzer { schema }
    }

    pub fn schema(&self) -> &MetricSchema {
        &self.schema
    }

    /// Normalize a batch. The snapshot carries the batch's collection
    /// timestamp, never the time of analysis.
    pub fn analyze(&self, batch: &RawBatch) -> Analysis {
        let mut metric_set = MetricSet::new();
        let mut warnings = Vec::new();

        for result in &batch.groups {
            let Some(group) = self.schema.group(&result.group) else {
                warnings.push(AnalysisWarning::UnknownGroup {
                    group: result.group.clone(),
                });
                continue;
            };
            analyze_group(group, result, &mut metric_set, &mut warnings);
        }

        for warning in &warnings {
            warn!("analysis warning ({}): {}", batch.source_query, warning);
        }
        debug!(
            "analyzed batch {} @ {}: {} metrics, {} warnings",
            batch.source_query,
            batch.collected_at,
            metric_set.len(),
            warnings.len()
        );

        Analysis {
            snapshot: Snapshot::new(batch.collected_at, &batch.source_query, metric_set),
            warnings,
        }
    }
}

fn analyze_group(
    group: &MetricGroup,
    result: &GroupResult,
    out: &mut MetricSet,
    warnings: &mut Vec<AnalysisWarning>,
) {
    if result.rows.is_empty() {
        warnings.push(AnalysisWarning::EmptyGroup {
            group: group.name.clone(),
        });
        return;
    }

    // Required columns are checked across every row before anything is
    // emitted so that a group is either present or absent as a whole.
    for row in &result.rows {
        if let Some(column) = group.required_columns().find(|c| !row.contains_key(*c)) {
            warnings.push(AnalysisWarning::MissingColumn {
                group: group.name.clone(),
                column: column.to_string(),
            });
            return;
        }
    }

    match group.key_column.as_deref() {
        None => {
            if result.rows.len() > 1 {
                debug!(
                    "group {} returned {} rows, reading the first",
                    group.name,
                    result.rows.len()
                );
            }
            read_row(group, &result.rows[0], None, out, warnings);
        }
        Some(key_column) => {
            for (index, row) in result.rows.iter().enumerate() {
                match row.get(key_column).and_then(|v| v.as_key()) {
                    Some(key) => read_row(group, row, Some(&key), out, warnings),
                    None => warnings.push(AnalysisWarning::MissingKey {
                        group: group.name.clone(),
                        row: index,
                    }),
                }
            }
        }
    }
}

fn read_row(
    group: &MetricGroup,
    row: &RawMetricRow,
    key: Option<&str>,
    out: &mut MetricSet,
    warnings: &mut Vec<AnalysisWarning>,
) {
    for spec in &group.metrics {
        // Optional columns that are absent are simply skipped.
        let Some(raw) = row.get(&spec.column) else {
            continue;
        };
        let name = match key {
            Some(key) => format!("{}.{}", key, spec.metric_name()),
            None => spec.metric_name().to_string(),
        };
        match spec.kind.coerce(raw) {
            Ok(value) => {
                out.insert(name, value);
            }
            Err(reason) => warnings.push(AnalysisWarning::Coercion {
                group: group.name.clone(),
                metric: name,
                found: raw.type_name().to_string(),
                reason,
            }),
        }
    }
}
