//! The consistency prober.
//!
//! Each cycle writes its index to three data shapes and reads every value
//! back after a short delay. When the run ends, every cycle is verified once
//! more to detect values lost after a successful write.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use jiff::Timestamp;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::config::ProberConfig;
use super::report::{MissReason, MissRecord, MissingAfterRecord, ProbeReport};
use super::scheduler::{CycleScheduler, StopCause};
use super::{ProbeStatus, ProbeTarget};
use crate::client::{DataCommands, ValkeyError};
use crate::error::ProbeError;
use crate::events::{Event, EventKind, EventLog};

type ReportSlot = Option<Arc<ProbeReport>>;
type StopCallback = Box<dyn FnOnce(&ProbeReport) + Send>;

/// Misses found by one cycle.
#[derive(Debug)]
struct CycleOutcome {
    index: u64,
    misses: Vec<MissRecord>,
}

struct Shared<D> {
    client: Arc<D>,
    config: Arc<ProberConfig>,
    log: EventLog,
    status: Mutex<ProbeStatus>,
    cancel: CancellationToken,
    report_tx: Mutex<Option<watch::Sender<ReportSlot>>>,
    report_rx: watch::Receiver<ReportSlot>,
    on_stop: Mutex<Vec<StopCallback>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Writes and reads probe values on a fixed cadence for a bounded time.
///
/// Cloning yields another handle to the same run.
pub struct Prober<D> {
    shared: Arc<Shared<D>>,
}

impl<D> Clone for Prober<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: DataCommands + 'static> Prober<D> {
    pub fn new(client: Arc<D>, config: ProberConfig, log: EventLog) -> Self {
        let (report_tx, report_rx) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                client,
                config: Arc::new(config),
                log,
                status: Mutex::new(ProbeStatus::Ready),
                cancel: CancellationToken::new(),
                report_tx: Mutex::new(Some(report_tx)),
                report_rx,
                on_stop: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn status(&self) -> ProbeStatus {
        *lock(&self.shared.status)
    }

    pub fn config(&self) -> &ProberConfig {
        &self.shared.config
    }

    pub fn log(&self) -> &EventLog {
        &self.shared.log
    }

    /// The report, once the run is done.
    pub fn report(&self) -> Option<Arc<ProbeReport>> {
        self.shared.report_rx.borrow().clone()
    }

    /// Run `callback` with the report when the run is done. Runs at once if
    /// it already is.
    pub fn on_stop(&self, callback: impl FnOnce(&ProbeReport) + Send + 'static) {
        let mut callbacks = lock(&self.shared.on_stop);
        match self.report() {
            Some(report) => {
                drop(callbacks);
                callback(&report);
            }
            None => callbacks.push(Box::new(callback)),
        }
    }

    /// Start probing. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), ProbeError> {
        let report_tx = {
            let mut status = lock(&self.shared.status);
            match *status {
                ProbeStatus::Ready => {}
                ProbeStatus::Running => return Err(ProbeError::AlreadyRunning),
                ProbeStatus::Stopped | ProbeStatus::Done => {
                    return Err(ProbeError::AlreadyFinished);
                }
            }
            let Some(report_tx) = lock(&self.shared.report_tx).take() else {
                return Err(ProbeError::InvalidState {
                    operation: "start",
                    status: *status,
                });
            };
            *status = ProbeStatus::Running;
            report_tx
        };

        let config = &self.shared.config;
        info!(
            prefix = %config.key_prefix,
            duration_ms = config.duration.as_millis() as u64,
            interval_ms = config.interval_between_cycles.as_millis() as u64,
            "Starting consistency probe"
        );
        self.shared
            .log
            .note(EventKind::ProbeStarted, format!("probe started with prefix {}", config.key_prefix));

        tokio::spawn(drive(Arc::clone(&self.shared), report_tx));
        Ok(())
    }

    /// Stop early and return the report once every cycle is accounted for.
    pub async fn stop(&self) -> Result<Arc<ProbeReport>, ProbeError> {
        {
            let mut status = lock(&self.shared.status);
            if *status != ProbeStatus::Running {
                return Err(ProbeError::NotRunning);
            }
            *status = ProbeStatus::Stopped;
        }
        info!("Stopping consistency probe");
        self.shared.cancel.cancel();
        self.wait().await
    }

    /// Stop the run, or if it already stopped on its own, wait for the
    /// report it is finishing.
    pub async fn stop_or_wait(&self) -> Result<Arc<ProbeReport>, ProbeError> {
        match self.stop().await {
            Err(ProbeError::NotRunning) => self.wait().await,
            result => result,
        }
    }

    /// Wait for the run to finish on its own (or through `stop`).
    pub async fn wait(&self) -> Result<Arc<ProbeReport>, ProbeError> {
        if self.status() == ProbeStatus::Ready {
            return Err(ProbeError::InvalidState {
                operation: "wait",
                status: ProbeStatus::Ready,
            });
        }
        let mut rx = self.shared.report_rx.clone();
        let slot = rx
            .wait_for(|report| report.is_some())
            .await
            .map_err(|_| ProbeError::Aborted)?;
        slot.clone().ok_or(ProbeError::Aborted)
    }
}

/// Runs the schedule, verification and report publication.
async fn drive<D: DataCommands + 'static>(
    shared: Arc<Shared<D>>,
    report_tx: watch::Sender<ReportSlot>,
) {
    let started_at = Timestamp::now();
    let config = Arc::clone(&shared.config);
    let scheduler = CycleScheduler::new(
        config.interval_between_cycles,
        config.duration,
        shared.cancel.clone(),
    );

    let run = scheduler
        .run(|index, _tick| {
            let client = Arc::clone(&shared.client);
            let config = Arc::clone(&config);
            let log = shared.log.clone();
            async move { run_cycle(client.as_ref(), &config, &log, index).await }
        })
        .await;

    {
        let mut status = lock(&shared.status);
        if *status == ProbeStatus::Running {
            *status = ProbeStatus::Stopped;
        }
    }
    let stopped_early = run.cause == StopCause::Cancelled;
    shared.log.note(
        EventKind::ProbeStopped,
        format!(
            "probe stopped after {} cycles ({})",
            run.started,
            if stopped_early { "stop requested" } else { "duration elapsed" }
        ),
    );

    let mut by_cycle: BTreeMap<u64, Vec<MissRecord>> = BTreeMap::new();
    for outcome in run.outcomes {
        by_cycle.insert(outcome.index, outcome.misses);
    }
    let mut misses: Vec<MissRecord> = by_cycle.into_values().flatten().collect();
    misses.sort_by_key(|m| (m.cycle, m.target));

    let missing_after = verify(shared.client.as_ref(), &config, &shared.log, run.started).await;

    shared.log.note(
        EventKind::ProbeDone,
        format!(
            "probe done: {} misses, {} missing after",
            misses.len(),
            missing_after.len()
        ),
    );
    shared.log.seal();

    let report = Arc::new(ProbeReport {
        started_at,
        finished_at: Timestamp::now(),
        elapsed: run.elapsed,
        total_cycles: run.started,
        stopped_early,
        misses,
        missing_after,
        events: shared.log.snapshot(),
    });
    info!(
        total_cycles = report.total_cycles,
        downtime = report.downtime(),
        data_loss = report.data_loss(),
        "Consistency probe done"
    );

    *lock(&shared.status) = ProbeStatus::Done;
    // Publish under the callback lock so `on_stop` never misses the report.
    let callbacks = {
        let mut pending = lock(&shared.on_stop);
        report_tx.send_replace(Some(Arc::clone(&report)));
        std::mem::take(&mut *pending)
    };
    for callback in callbacks {
        callback(&report);
    }
}

#[instrument(skip(client, config, log), level = "debug")]
async fn run_cycle<D: DataCommands>(
    client: &D,
    config: &ProberConfig,
    log: &EventLog,
    index: u64,
) -> CycleOutcome {
    log.record(Event::new(EventKind::CycleStarted, "cycle started").with_cycle(index));

    let checks = ProbeTarget::ALL.map(|target| check_target(client, config, log, target, index));
    let misses: Vec<MissRecord> = join_all(checks).await.into_iter().flatten().collect();

    log.record(
        Event::new(
            EventKind::CycleFinished,
            format!("cycle finished with {} misses", misses.len()),
        )
        .with_cycle(index),
    );
    CycleOutcome { index, misses }
}

/// Write then read back one target. Returns the miss, if any.
async fn check_target<D: DataCommands>(
    client: &D,
    config: &ProberConfig,
    log: &EventLog,
    target: ProbeTarget,
    index: u64,
) -> Option<MissRecord> {
    if let Err(e) = write_value(client, config, target, index).await {
        log.record(
            Event::new(EventKind::WriteFailed, e.to_string())
                .with_cycle(index)
                .with_target(target),
        );
        return Some(MissRecord {
            cycle: index,
            target,
            reason: MissReason::WriteFailed {
                error: e.to_string(),
            },
        });
    }

    tokio::time::sleep(config.read_after_write_delay).await;

    let reason = match read_value(client, config, target, index).await {
        Ok(value) => compare(value, expected_value(config, target, index))?,
        Err(e) => {
            log.record(
                Event::new(EventKind::ReadFailed, e.to_string())
                    .with_cycle(index)
                    .with_target(target),
            );
            return Some(MissRecord {
                cycle: index,
                target,
                reason: MissReason::ReadFailed {
                    error: e.to_string(),
                },
            });
        }
    };

    log.record(
        Event::new(EventKind::ReadMismatch, reason.to_string())
            .with_cycle(index)
            .with_target(target),
    );
    Some(MissRecord {
        cycle: index,
        target,
        reason,
    })
}

/// Re-read every started cycle with bounded concurrency.
async fn verify<D: DataCommands>(
    client: &D,
    config: &ProberConfig,
    log: &EventLog,
    cycles: u64,
) -> Vec<MissingAfterRecord> {
    let checks = (0..cycles).flat_map(|cycle| ProbeTarget::ALL.map(|target| (cycle, target)));

    let mut missing: Vec<MissingAfterRecord> = stream::iter(checks)
        .map(|(cycle, target)| async move {
            let reason = match read_value(client, config, target, cycle).await {
                Ok(value) => compare(value, expected_value(config, target, cycle)),
                Err(e) => Some(MissReason::ReadFailed {
                    error: e.to_string(),
                }),
            };
            reason.map(|reason| MissingAfterRecord {
                cycle,
                target,
                reason,
            })
        })
        .buffer_unordered(config.verify_concurrency.max(1))
        .filter_map(|record| async move { record })
        .collect()
        .await;
    missing.sort_by_key(|m| (m.cycle, m.target));

    for record in &missing {
        log.record(
            Event::new(EventKind::VerificationFailed, record.reason.to_string())
                .with_cycle(record.cycle)
                .with_target(record.target),
        );
    }
    if missing.is_empty() {
        log.note(
            EventKind::VerificationPassed,
            format!("all {} cycles verified", cycles),
        );
    } else {
        warn!(missing = missing.len(), "Final verification found missing values");
    }
    missing
}

async fn write_value<D: DataCommands>(
    client: &D,
    config: &ProberConfig,
    target: ProbeTarget,
    index: u64,
) -> Result<(), ValkeyError> {
    match target {
        ProbeTarget::Key => {
            client
                .set(&config.cycle_key(index), &config.cycle_value(index))
                .await
        }
        ProbeTarget::HashField => {
            client
                .hset(&config.hash_key(), &index.to_string(), &config.cycle_value(index))
                .await
        }
        ProbeTarget::SortedSetMember => {
            client
                .zadd(&config.zset_key(), index as f64, &config.zset_member(index))
                .await
        }
    }
}

async fn read_value<D: DataCommands>(
    client: &D,
    config: &ProberConfig,
    target: ProbeTarget,
    index: u64,
) -> Result<Option<String>, ValkeyError> {
    match target {
        ProbeTarget::Key => client.get(&config.cycle_key(index)).await,
        ProbeTarget::HashField => client.hget(&config.hash_key(), &index.to_string()).await,
        ProbeTarget::SortedSetMember => Ok(client
            .zscore(&config.zset_key(), &config.zset_member(index))
            .await?
            .map(format_score)),
    }
}

/// What [`read_value`] returns when the write of `index` survived.
fn expected_value(config: &ProberConfig, target: ProbeTarget, index: u64) -> String {
    match target {
        ProbeTarget::Key | ProbeTarget::HashField => config.cycle_value(index),
        ProbeTarget::SortedSetMember => index.to_string(),
    }
}

fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.abs() < 9.0e15 {
        format!("{}", score as i64)
    } else {
        score.to_string()
    }
}

fn compare(value: Option<String>, expected: String) -> Option<MissReason> {
    match value {
        None => Some(MissReason::Absent),
        Some(actual) if actual == expected => None,
        Some(actual) => Some(MissReason::Mismatch { expected, actual }),
    }
}
