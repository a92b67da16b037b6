//! Probe results and the downtime / data-loss metrics derived from them.

use std::collections::BTreeMap;
use std::time::Duration;

use jiff::Timestamp;
use serde::Serialize;

use super::ProbeTarget;
use crate::events::Event;

/// Why a check failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MissReason {
    /// The write was rejected or errored.
    WriteFailed { error: String },
    /// The read errored (including redirects the client did not follow).
    ReadFailed { error: String },
    /// Nothing stored under the key, field, or member.
    Absent,
    /// Something else stored there.
    Mismatch { expected: String, actual: String },
}

impl std::fmt::Display for MissReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissReason::WriteFailed { error } => write!(f, "write failed: {}", error),
            MissReason::ReadFailed { error } => write!(f, "read failed: {}", error),
            MissReason::Absent => write!(f, "value absent"),
            MissReason::Mismatch { expected, actual } => {
                write!(f, "expected {:?}, found {:?}", expected, actual)
            }
        }
    }
}

/// A read-after-write check that failed during the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissRecord {
    pub cycle: u64,
    pub target: ProbeTarget,
    pub reason: MissReason,
}

/// A value found absent or wrong by the final verification pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingAfterRecord {
    pub cycle: u64,
    pub target: ProbeTarget,
    pub reason: MissReason,
}

/// Counts and percentages for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSummary {
    pub misses: u64,
    pub missing_after: u64,
    pub percentage_of_misses: f64,
    pub percentage_missing_after: f64,
}

/// Report without the event log, for printing and metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSummary {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub total_cycles: u64,
    pub stopped_early: bool,
    pub downtime: f64,
    pub data_loss: f64,
    pub targets: BTreeMap<ProbeTarget, TargetSummary>,
}

/// Result of one probe run. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    /// Wall time the scheduler ran, excluding verification.
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Cycles started, whether or not they had finished at stop time.
    pub total_cycles: u64,
    /// `stop()` was called before the duration elapsed.
    pub stopped_early: bool,
    /// Sorted by (cycle, target).
    pub misses: Vec<MissRecord>,
    /// Sorted by (cycle, target).
    pub missing_after: Vec<MissingAfterRecord>,
    pub events: Vec<Event>,
}

impl ProbeReport {
    pub fn misses_for(&self, target: ProbeTarget) -> u64 {
        self.misses.iter().filter(|m| m.target == target).count() as u64
    }

    pub fn missing_after_for(&self, target: ProbeTarget) -> u64 {
        self.missing_after
            .iter()
            .filter(|m| m.target == target)
            .count() as u64
    }

    /// `100 * misses / total_cycles`, 0 without cycles.
    pub fn percentage_of_misses(&self, target: ProbeTarget) -> f64 {
        percentage(self.misses_for(target), self.total_cycles)
    }

    /// `100 * missing_after / total_cycles`, 0 without cycles.
    pub fn percentage_missing_after(&self, target: ProbeTarget) -> f64 {
        percentage(self.missing_after_for(target), self.total_cycles)
    }

    /// Mean miss percentage over the three targets.
    pub fn downtime(&self) -> f64 {
        mean(ProbeTarget::ALL.map(|t| self.percentage_of_misses(t)))
    }

    /// Mean missing-after percentage over the three targets.
    pub fn data_loss(&self) -> f64 {
        mean(ProbeTarget::ALL.map(|t| self.percentage_missing_after(t)))
    }

    pub fn is_clean(&self) -> bool {
        self.misses.is_empty() && self.missing_after.is_empty()
    }

    pub fn summary(&self) -> ProbeSummary {
        let targets = ProbeTarget::ALL
            .into_iter()
            .map(|t| {
                (
                    t,
                    TargetSummary {
                        misses: self.misses_for(t),
                        missing_after: self.missing_after_for(t),
                        percentage_of_misses: self.percentage_of_misses(t),
                        percentage_missing_after: self.percentage_missing_after(t),
                    },
                )
            })
            .collect();

        ProbeSummary {
            started_at: self.started_at,
            finished_at: self.finished_at,
            total_cycles: self.total_cycles,
            stopped_early: self.stopped_early,
            downtime: self.downtime(),
            data_loss: self.data_loss(),
            targets,
        }
    }
}

fn percentage(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * count as f64 / total as f64
    }
}

fn mean(values: [f64; 3]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u128(duration.as_millis())
    }
}
