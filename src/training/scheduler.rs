use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};

use chrono::Utc;
use serde::Serialize;
use tracing::{
    debug,
    info,
    warn,
};

use super::history::TrainingHistoryStore;
use crate::{
    activity::{
        ActivityEvent,
        ActivitySink,
    },
    core::{
        tasks::{
            CancelToken,
            CancellableTask,
            TaskHandle,
        },
        CurrentMetrics,
        HospitalId,
        HospitalSummary,
        RoundMetrics,
        RoundRecord,
        SchedulerError,
    },
    ledger::RemoteLedgerClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    RunningSingleRound,
    AutoTraining,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AutoTrainConfig {
    pub max_rounds: u32,
    pub accuracy_stop_threshold: f64,
}

impl AutoTrainConfig {
    pub fn new(max_rounds: u32, accuracy_stop_threshold: f64) -> Self {
        Self { max_rounds, accuracy_stop_threshold }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_rounds == 0 {
            return Err(SchedulerError::invalid_argument("max rounds must be at least 1"));
        }
        let threshold = self.accuracy_stop_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(SchedulerError::invalid_argument(format!(
                "accuracy stop threshold must be in (0, 1], got {threshold}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AutoTrainStop {
    MaxRounds,
    AccuracyReached,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoTrainSummary {
    pub rounds_executed: u32,
    pub final_round: u32,
    pub last_metrics: Option<RoundMetrics>,
    pub stop: AutoTrainStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AutoTrainProgress {
    pub target_max_rounds: u32,
    pub accuracy_stop_threshold: f64,
    pub last_metrics: Option<RoundMetrics>,
}

/// Read-only projection for the training page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerSnapshot {
    pub state: SchedulerState,
    pub selection: Vec<HospitalId>,
    pub history: Vec<RoundRecord>,
    pub current_round: u32,
    pub remote_call_pending: bool,
    pub auto_training: Option<AutoTrainProgress>,
}

pub type AutoTrainHandle = TaskHandle<Result<AutoTrainSummary, SchedulerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingCall {
    Round,
    Reset,
    Sync,
}

struct AutoRun {
    progress: AutoTrainProgress,
    token: CancelToken,
}

#[derive(Default)]
struct SchedulerInner {
    state: SchedulerState,
    selection: BTreeSet<HospitalId>,
    history: TrainingHistoryStore,
    pending: Option<PendingCall>,
    auto: Option<AutoRun>,
}

impl SchedulerInner {
    fn ensure_idle(&self, operation: &str) -> Result<(), SchedulerError> {
        if self.state != SchedulerState::Idle {
            return Err(SchedulerError::invalid_state(format!(
                "cannot {operation} while {:?}",
                self.state
            )));
        }
        if let Some(pending) = self.pending {
            return Err(SchedulerError::invalid_state(format!(
                "cannot {operation} while a {pending:?} call is still in flight"
            )));
        }
        Ok(())
    }

    fn ensure_ready_to_train(&self, operation: &str) -> Result<(), SchedulerError> {
        self.ensure_idle(operation)?;
        if self.selection.is_empty() {
            return Err(SchedulerError::invalid_argument("no hospitals selected"));
        }
        Ok(())
    }

    fn owns_run(&self, token: &CancelToken) -> bool {
        self.auto.as_ref().is_some_and(|run| run.token.same_as(token))
    }
}

/// Drives FL training rounds against the remote aggregator.
///
/// At most one remote call is in flight per scheduler. State lives behind a
/// mutex that is never held across an `.await`, so the scheduler can be shared
/// through an `Arc` between the UI and a spawned auto-training task.
pub struct RoundScheduler {
    client: Arc<dyn RemoteLedgerClient>,
    sink: Arc<dyn ActivitySink>,
    inner: Mutex<SchedulerInner>,
}

impl RoundScheduler {
    pub fn new(client: Arc<dyn RemoteLedgerClient>, sink: Arc<dyn ActivitySink>) -> Self {
        Self { client, sink, inner: Mutex::new(SchedulerInner::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SchedulerState {
        self.lock().state
    }

    pub fn selection(&self) -> BTreeSet<HospitalId> {
        self.lock().selection.clone()
    }

    pub fn history(&self) -> Vec<RoundRecord> {
        self.lock().history.snapshot()
    }

    pub fn current_round(&self) -> u32 {
        self.lock().history.current_round()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let inner = self.lock();
        SchedulerSnapshot {
            state: inner.state,
            selection: inner.selection.iter().cloned().collect(),
            history: inner.history.snapshot(),
            current_round: inner.history.current_round(),
            remote_call_pending: inner.pending.is_some(),
            auto_training: inner.auto.as_ref().map(|run| run.progress),
        }
    }

    pub fn select_hospitals<I>(&self, ids: I) -> Result<(), SchedulerError>
    where
        I: IntoIterator<Item = HospitalId>,
    {
        let ids: BTreeSet<HospitalId> = ids.into_iter().collect();
        if ids.iter().any(HospitalId::is_blank) {
            return Err(SchedulerError::invalid_argument("hospital ids must not be empty"));
        }

        {
            let mut inner = self.lock();
            inner.ensure_idle("change the hospital selection")?;
            inner.selection = ids.clone();
        }

        debug!(count = ids.len(), "Hospital selection replaced");
        self.sink.emit(ActivityEvent::info(
            "Hospitals selected",
            format!("{} hospital(s) selected for training", ids.len()),
        ));
        Ok(())
    }

    pub async fn verified_hospitals(&self) -> Result<Vec<HospitalSummary>, SchedulerError> {
        Ok(self.client.list_verified_hospitals().await?)
    }

    pub async fn current_metrics(&self) -> Result<CurrentMetrics, SchedulerError> {
        Ok(self.client.fetch_current_metrics().await?)
    }

    pub async fn run_single_round(&self) -> Result<RoundRecord, SchedulerError> {
        let selection = {
            let mut inner = self.lock();
            inner.ensure_ready_to_train("start a round")?;
            inner.state = SchedulerState::RunningSingleRound;
            inner.pending = Some(PendingCall::Round);
            inner.selection.clone()
        };

        info!(hospitals = selection.len(), "Running single training round");
        let result = self.execute_round(&selection).await;

        {
            let mut inner = self.lock();
            if inner.state == SchedulerState::RunningSingleRound {
                inner.state = SchedulerState::Idle;
            }
        }

        result
    }

    /// Validate, switch to `AutoTraining` and drive the loop on a spawned task.
    pub fn start_auto_training(
        self: &Arc<Self>,
        config: AutoTrainConfig,
    ) -> Result<AutoTrainHandle, SchedulerError> {
        let token = self.begin_auto_training(config)?;

        let scheduler = Arc::clone(self);
        let run_token = token.clone();
        let join_handle =
            tokio::spawn(async move { scheduler.drive_auto_training(config, run_token).await });

        Ok(TaskHandle::new(CancellableTask::AutoTraining, token, join_handle))
    }

    /// Same as [`RoundScheduler::start_auto_training`] but runs the loop on the caller's task.
    pub async fn run_auto_training(
        &self,
        config: AutoTrainConfig,
    ) -> Result<AutoTrainSummary, SchedulerError> {
        let token = self.begin_auto_training(config)?;
        self.drive_auto_training(config, token).await
    }

    /// Cancel any pending continuation and return to `Idle`. A round already in
    /// flight still completes and is recorded. A single round is not auto-training
    /// and is left to finish on its own.
    pub fn stop_auto_training(&self) {
        let stopped = {
            let mut inner = self.lock();
            if let Some(run) = inner.auto.take() {
                run.token.cancel();
            }
            if inner.state == SchedulerState::AutoTraining {
                inner.state = SchedulerState::Idle;
                true
            } else {
                false
            }
        };

        if stopped {
            info!("Auto-training stopped by operator");
            self.sink.emit(ActivityEvent::info("Auto-training stopped", "stopped by operator"));
        }
    }

    /// Clear history on the aggregator and locally. Local history is untouched if
    /// the remote reset fails.
    pub async fn reset_history(&self) -> Result<(), SchedulerError> {
        {
            let mut inner = self.lock();
            inner.ensure_idle("reset training history")?;
            inner.pending = Some(PendingCall::Reset);
        }

        let result = self.client.reset_training().await;

        let mut inner = self.lock();
        inner.pending = None;
        match result {
            Ok(()) => {
                let cleared = inner.history.len();
                inner.history.clear();
                drop(inner);

                info!(cleared, "Training history reset");
                self.sink.emit(ActivityEvent::success(
                    "Training history reset",
                    format!("{cleared} round(s) cleared"),
                ));
                Ok(())
            }
            Err(e) => {
                drop(inner);
                let error = SchedulerError::from(e);
                warn!(%error, "Training reset failed");
                self.sink.emit(ActivityEvent::error("Training reset failed", &error.message));
                Err(error)
            }
        }
    }

    /// Replace local history with the aggregator's copy.
    pub async fn sync_history(&self) -> Result<usize, SchedulerError> {
        {
            let mut inner = self.lock();
            inner.ensure_idle("sync training history")?;
            inner.pending = Some(PendingCall::Sync);
        }

        let result = self.client.fetch_history().await;

        let mut inner = self.lock();
        inner.pending = None;
        let outcome = match result {
            Ok(records) => inner
                .history
                .replace(records)
                .map(|()| inner.history.len())
                .map_err(SchedulerError::remote),
            Err(e) => Err(SchedulerError::from(e)),
        };
        drop(inner);

        match &outcome {
            Ok(rounds) => {
                self.sink.emit(ActivityEvent::success(
                    "Training history synced",
                    format!("{rounds} round(s) loaded"),
                ));
            }
            Err(error) => {
                warn!(%error, "Training history sync failed");
                self.sink.emit(ActivityEvent::error("Training history sync failed", &error.message));
            }
        }
        outcome
    }

    fn begin_auto_training(&self, config: AutoTrainConfig) -> Result<CancelToken, SchedulerError> {
        config.validate()?;

        let token = CancelToken::new();
        {
            let mut inner = self.lock();
            inner.ensure_ready_to_train("start auto-training")?;
            inner.state = SchedulerState::AutoTraining;
            inner.auto = Some(AutoRun {
                progress: AutoTrainProgress {
                    target_max_rounds: config.max_rounds,
                    accuracy_stop_threshold: config.accuracy_stop_threshold,
                    last_metrics: None,
                },
                token: token.clone(),
            });
        }

        info!(
            max_rounds = config.max_rounds,
            threshold = config.accuracy_stop_threshold,
            "Auto-training started"
        );
        self.sink.emit(ActivityEvent::info(
            "Auto-training started",
            format!(
                "up to {} rounds, stopping at {:.1}% accuracy",
                config.max_rounds,
                config.accuracy_stop_threshold * 100.0
            ),
        ));
        Ok(token)
    }

    async fn drive_auto_training(
        &self,
        config: AutoTrainConfig,
        token: CancelToken,
    ) -> Result<AutoTrainSummary, SchedulerError> {
        let mut rounds_executed = 0u32;
        let mut last_record: Option<RoundRecord> = None;

        let result = loop {
            let selection = {
                let mut inner = self.lock();
                if token.is_cancelled() || !inner.owns_run(&token) {
                    break Ok(AutoTrainStop::Cancelled);
                }
                inner.pending = Some(PendingCall::Round);
                inner.selection.clone()
            };

            let record = match self.execute_round(&selection).await {
                Ok(record) => record,
                Err(error) => break Err(error),
            };
            rounds_executed += 1;

            let reached_max = record.round >= config.max_rounds;
            let reached_accuracy = record.metrics.accuracy >= config.accuracy_stop_threshold;
            last_record = Some(record);

            if reached_max {
                break Ok(AutoTrainStop::MaxRounds);
            }
            if reached_accuracy {
                break Ok(AutoTrainStop::AccuracyReached);
            }

            tokio::task::yield_now().await;
        };

        {
            let mut inner = self.lock();
            if inner.owns_run(&token) {
                inner.auto = None;
                if inner.state == SchedulerState::AutoTraining {
                    inner.state = SchedulerState::Idle;
                }
            }
        }

        match result {
            Ok(stop) => {
                let final_round = match &last_record {
                    Some(record) => record.round,
                    None => self.current_round(),
                };
                info!(rounds_executed, final_round, ?stop, "Auto-training finished");
                if stop != AutoTrainStop::Cancelled {
                    self.sink.emit(ActivityEvent::success(
                        "Auto-training finished",
                        match stop {
                            AutoTrainStop::MaxRounds => {
                                format!("reached round limit after {rounds_executed} round(s)")
                            }
                            _ => format!(
                                "accuracy target reached after {rounds_executed} round(s)"
                            ),
                        },
                    ));
                }
                Ok(AutoTrainSummary {
                    rounds_executed,
                    final_round,
                    last_metrics: last_record.map(|r| r.metrics),
                    stop,
                })
            }
            Err(error) => {
                warn!(%error, rounds_executed, "Auto-training halted");
                self.sink.emit(ActivityEvent::error("Auto-training halted", &error.message));
                Err(error)
            }
        }
    }

    /// Issue one remote round and fold the result into history. The caller must
    /// have marked the round as pending.
    async fn execute_round(
        &self,
        selection: &BTreeSet<HospitalId>,
    ) -> Result<RoundRecord, SchedulerError> {
        let result = self.client.execute_round(selection).await;

        let mut inner = self.lock();
        inner.pending = None;

        match result {
            Ok(outcome) => {
                let expected = inner.history.next_round();
                if outcome.round != expected {
                    warn!(remote = outcome.round, local = expected, "Remote round number differs");
                }

                let record = inner.history.append(&outcome, Utc::now()).clone();
                if let Some(run) = inner.auto.as_mut() {
                    run.progress.last_metrics = Some(record.metrics);
                }
                drop(inner);

                info!(
                    round = record.round,
                    accuracy = record.metrics.accuracy,
                    loss = record.metrics.loss,
                    "Training round complete"
                );
                self.sink.emit(ActivityEvent::success(
                    format!("Round {} complete", record.round),
                    format!(
                        "accuracy {:.2}% ({:+.2}%), {} hospitals, {} samples",
                        record.metrics.accuracy * 100.0,
                        record.improvement.accuracy * 100.0,
                        record.participating_hospitals,
                        record.samples_trained
                    ),
                ));
                Ok(record)
            }
            Err(e) => {
                drop(inner);
                let error = SchedulerError::from(e);
                warn!(%error, "Training round failed");
                self.sink.emit(ActivityEvent::error("Training round failed", &error.message));
                Err(error)
            }
        }
    }
}
