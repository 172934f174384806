//! Database collaborator boundary.
//!
//! The driver and connection management live outside this crate; the
//! collector only needs something that turns a group's query into rows.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use super::schema::MetricGroup;
use super::types::RawMetricRow;

/// A single group query failed. Non-fatal: the group is left out of the round.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("query for group {group} failed: {message}")]
    Query { group: String, message: String },
    #[error("query for group {group} timed out after {elapsed:?}")]
    Timeout { group: String, elapsed: Duration },
    #[error("database unavailable: {0}")]
    Unavailable(String),
}

impl CollectionError {
    pub fn query(group: &str, message: impl Into<String>) -> Self {
        CollectionError::Query {
            group: group.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Run the group's query and return its rows.
    async fn fetch(&self, group: &MetricGroup) -> Result<Vec<RawMetricRow>, CollectionError>;
}

#[derive(Debug, Deserialize)]
struct ReplayFile {
    rounds: Vec<HashMap<String, ReplayGroup>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum ReplayGroup {
    Rows(Vec<RawMetricRow>),
    Failure { error: String },
}

/// Serves pre-recorded rounds of rows.
///
/// Each round maps a group name to either a list of rows or
/// `{"error": "..."}`; a group absent from a round fails with a query error
/// for that round. Every fetch of a group consumes that group's next
/// recorded entry, so a collector that queries each group once per round
/// replays the recording round by round. Once exhausted, fetches fail with
/// [`CollectionError::Unavailable`] unless the source loops.
pub struct ReplaySource {
    recording: HashMap<String, Vec<Option<ReplayGroup>>>,
    pending: Mutex<HashMap<String, VecDeque<Option<ReplayGroup>>>>,
    rounds: usize,
    looping: bool,
}

impl ReplaySource {
    pub fn from_json(json: &str, looping: bool) -> Result<Self, serde_json::Error> {
        let file: ReplayFile = serde_json::from_str(json)?;
        let rounds = file.rounds.len();

        let mut recording: HashMap<String, Vec<Option<ReplayGroup>>> = HashMap::new();
        for name in file.rounds.iter().flat_map(|round| round.keys()) {
            recording.entry(name.clone()).or_default();
        }
        for round in &file.rounds {
            for (name, entries) in recording.iter_mut() {
                entries.push(round.get(name).cloned());
            }
        }

        let pending = recording
            .iter()
            .map(|(name, entries)| (name.clone(), entries.iter().cloned().collect()))
            .collect();

        Ok(ReplaySource {
            recording,
            pending: Mutex::new(pending),
            rounds,
            looping,
        })
    }

    pub fn from_path(path: &Path, looping: bool) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json, looping)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn rounds_recorded(&self) -> usize {
        self.rounds
    }
}

#[async_trait]
impl MetricSource for ReplaySource {
    async fn fetch(&self, group: &MetricGroup) -> Result<Vec<RawMetricRow>, CollectionError> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = pending.get_mut(&group.name) else {
            return Err(CollectionError::query(
                &group.name,
                "group not present in recording",
            ));
        };
        if queue.is_empty() && self.looping {
            if let Some(entries) = self.recording.get(&group.name) {
                queue.extend(entries.iter().cloned());
            }
        }
        match queue.pop_front() {
            Some(Some(ReplayGroup::Rows(rows))) => Ok(rows),
            Some(Some(ReplayGroup::Failure { error })) => {
                Err(CollectionError::query(&group.name, error))
            }
            Some(None) => Err(CollectionError::query(
                &group.name,
                "group not present in recorded round",
            )),
            None => Err(CollectionError::Unavailable(
                "replay recording exhausted".to_string(),
            )),
        }
    }
}
