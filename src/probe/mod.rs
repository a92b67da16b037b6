//! Continuous consistency probing.
//!
//! A [`Prober`] measures how a cluster behaves while it is being changed:
//! every cycle writes its index to a standalone key, a hash field and a
//! sorted-set member, reads each back, and at the end re-reads everything.
//! The [`ProbeReport`] turns failed read-backs into a downtime figure and
//! values missing at the end into a data-loss figure.
//!
//! ```rust,ignore
//! let prober = Prober::new(Arc::new(client), ProberConfig::default(), EventLog::new());
//! prober.start()?;
//! // ... migrate slots ...
//! let report = prober.stop().await?;
//! println!("downtime {:.2}%", report.downtime());
//! ```

use serde::Serialize;

pub mod config;
pub mod prober;
pub mod report;
pub mod scheduler;
pub mod target;

pub use config::ProberConfig;
pub use prober::Prober;
pub use report::{
    MissReason, MissRecord, MissingAfterRecord, ProbeReport, ProbeSummary, TargetSummary,
};
pub use scheduler::{CycleScheduler, ScheduledRun, StopCause};
pub use target::ProbeTarget;

/// Lifecycle of a [`Prober`]. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ready,
    Running,
    /// No new cycles; in-flight cycles and verification still running.
    Stopped,
    /// Report available.
    Done,
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStatus::Ready => write!(f, "ready"),
            ProbeStatus::Running => write!(f, "running"),
            ProbeStatus::Stopped => write!(f, "stopped"),
            ProbeStatus::Done => write!(f, "done"),
        }
    }
}
