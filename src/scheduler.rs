//! Startup gap check, catch-up backfill, then steady latest-only ticks.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backfill::{plan_backfill, BackfillDecision, BackfillPlan};
use crate::collector::{CollectorError, GapAwareCollector, IndicatorComputation, RunStats};
use crate::gap::Gap;
use crate::observability::log_startup_action;
use crate::price::PointSource;
use crate::store::RecordStore;

pub trait Clock: Send + Sync + 'static {
    fn now_ms_utc(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms_utc(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Settable clock for deterministic runs.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms_utc: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now_ms_utc: i64) -> Self {
        Self {
            now_ms_utc: Arc::new(AtomicI64::new(now_ms_utc)),
        }
    }

    pub fn set(&self, now_ms_utc: i64) {
        self.now_ms_utc.store(now_ms_utc, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms_utc.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms_utc(&self) -> i64 {
        self.now_ms_utc.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SchedulerPhase {
    Startup,
    GapCheck,
    Backfilling { days: u32 },
    Normal,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartupAction {
    /// Store was empty; a first latest-only collection ran instead of a plan.
    FirstCollection(RunStats),
    Backfilled { plan: BackfillPlan, stats: RunStats },
    UpToDate { gap: Gap },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error("collector task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct Scheduler<C, S, T, K> {
    collector: Arc<GapAwareCollector<C, S, T>>,
    clock: Arc<K>,
    phase: RwLock<SchedulerPhase>,
}

impl<C, S, T, K> Scheduler<C, S, T, K>
where
    C: IndicatorComputation,
    S: PointSource<Point = C::Point>,
    T: RecordStore<Record = C::Record>,
    K: Clock,
{
    pub fn new(collector: Arc<GapAwareCollector<C, S, T>>, clock: Arc<K>) -> Self {
        Self {
            collector,
            clock,
            phase: RwLock::new(SchedulerPhase::Startup),
        }
    }

    pub fn collector(&self) -> &Arc<GapAwareCollector<C, S, T>> {
        &self.collector
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self
            .phase
            .read()
            .expect("scheduler phase lock should not be poisoned")
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        *self
            .phase
            .write()
            .expect("scheduler phase lock should not be poisoned") = phase;
        info!(
            component = "scheduler",
            event = "scheduler.phase",
            phase = ?phase
        );
    }

    /// Gap check plus catch-up. The gap is that of the most lagging symbol and
    /// the backfill window is sized for it. A store that cannot be read fails
    /// here.
    pub fn startup(&self, cancel: &CancellationToken) -> Result<StartupAction, CollectorError> {
        self.set_phase(SchedulerPhase::GapCheck);
        let now = self.clock.now_ms_utc();
        let gap = self.collector.overall_gap(now)?;
        let decision = plan_backfill(&gap, self.collector.config(), now);

        info!(
            component = "scheduler",
            event = "scheduler.gap_check",
            gap_hours = ?gap.hours(),
            last_ts_ms_utc = ?gap.last_ts_ms_utc(),
            decision = ?decision
        );

        let action = match decision {
            BackfillDecision::FirstRun => {
                StartupAction::FirstCollection(self.collector.run_collection(now, cancel)?)
            }
            BackfillDecision::UpToDate => StartupAction::UpToDate { gap },
            BackfillDecision::Backfill(plan) => {
                self.set_phase(SchedulerPhase::Backfilling { days: plan.days });
                let stats = self.collector.run_backfill(plan.days, now, cancel)?;
                StartupAction::Backfilled { plan, stats }
            }
        };

        self.set_phase(SchedulerPhase::Normal);
        Ok(action)
    }

    /// One latest-only pass at the current clock.
    pub fn tick(&self, cancel: &CancellationToken) -> Result<RunStats, CollectorError> {
        self.collector
            .run_collection(self.clock.now_ms_utc(), cancel)
    }

    /// Runs startup, then ticks every `tick_interval_ms` until cancelled.
    /// Passes never overlap: each tick is awaited before the next is taken and
    /// late ticks are skipped.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), SchedulerError> {
        let startup = {
            let scheduler = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || scheduler.startup(&cancel)).await?
        };
        match startup {
            Ok(action) => log_startup_action("scheduler", &action),
            Err(err) => {
                error!(
                    component = "scheduler",
                    event = "scheduler.startup.failed",
                    error = %err
                );
                self.set_phase(SchedulerPhase::Stopped);
                return Err(err.into());
            }
        }

        let period = Duration::from_millis(self.collector.config().tick_interval_ms);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let scheduler = Arc::clone(&self);
                    let pass_cancel = cancel.clone();
                    let result =
                        tokio::task::spawn_blocking(move || scheduler.tick(&pass_cancel)).await?;
                    if let Err(err) = result {
                        warn!(
                            component = "scheduler",
                            event = "scheduler.tick.failed",
                            error = %err
                        );
                    }
                }
            }
        }

        self.set_phase(SchedulerPhase::Stopped);
        Ok(())
    }
}
