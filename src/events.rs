//! Append-only event log shared by the prober and the migrator.
//!
//! Every append is also emitted as a `tracing` event, so the log and the
//! process logs tell the same story.

use std::sync::{Arc, Mutex, MutexGuard};

use jiff::Timestamp;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::probe::ProbeTarget;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProbeStarted,
    ProbeStopped,
    ProbeDone,
    CycleStarted,
    CycleFinished,
    WriteFailed,
    ReadFailed,
    ReadMismatch,
    VerificationPassed,
    VerificationFailed,
    MigrationStarted,
    MigrationPhase,
    MigrationFinished,
    MigrationFailed,
}

impl EventKind {
    /// Failures are logged at `warn`.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EventKind::WriteFailed
                | EventKind::ReadFailed
                | EventKind::ReadMismatch
                | EventKind::VerificationFailed
                | EventKind::MigrationFailed
        )
    }

    fn is_milestone(&self) -> bool {
        matches!(
            self,
            EventKind::ProbeStarted
                | EventKind::ProbeStopped
                | EventKind::ProbeDone
                | EventKind::MigrationStarted
                | EventKind::MigrationFinished
        )
    }
}

/// One entry in the log.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub at: Timestamp,
    pub kind: EventKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ProbeTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u16>,
}

impl Event {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            at: Timestamp::now(),
            kind,
            message: message.into(),
            cycle: None,
            target: None,
            slot: None,
        }
    }

    pub fn with_cycle(mut self, cycle: u64) -> Self {
        self.cycle = Some(cycle);
        self
    }

    pub fn with_target(mut self, target: ProbeTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_slot(mut self, slot: u16) -> Self {
        self.slot = Some(slot);
        self
    }
}

#[derive(Debug, Default)]
struct Entries {
    events: Vec<Event>,
    sealed: bool,
}

/// Cheaply cloneable handle to one shared log.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<Entries>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        // A panic while holding the lock leaves a valid Vec behind.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event. Returns false if the log is sealed.
    pub fn record(&self, event: Event) -> bool {
        let mut entries = self.entries();
        if entries.sealed {
            debug!(kind = ?event.kind, "Dropping event appended after seal");
            return false;
        }
        emit(&event);
        entries.events.push(event);
        true
    }

    /// Shorthand for `record(Event::new(kind, message))`.
    pub fn note(&self, kind: EventKind, message: impl Into<String>) -> bool {
        self.record(Event::new(kind, message))
    }

    /// Make the log read-only.
    pub fn seal(&self) {
        self.entries().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.entries().sealed
    }

    /// Events in append order.
    pub fn snapshot(&self) -> Vec<Event> {
        self.entries().events.clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.entries()
            .events
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().events.is_empty()
    }
}

fn emit(event: &Event) {
    let target = event.target.map(|t| t.as_str());
    if event.kind.is_failure() {
        warn!(kind = ?event.kind, cycle = ?event.cycle, target = ?target, slot = ?event.slot, "{}", event.message);
    } else if event.kind.is_milestone() {
        info!(kind = ?event.kind, cycle = ?event.cycle, slot = ?event.slot, "{}", event.message);
    } else {
        debug!(kind = ?event.kind, cycle = ?event.cycle, target = ?target, slot = ?event.slot, "{}", event.message);
    }
}
