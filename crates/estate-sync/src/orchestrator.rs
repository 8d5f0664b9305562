//! Single-flight run orchestration and the observable run status.
//!
//! The status record lives behind a `std::sync::Mutex` that is only held for
//! field updates, never across an await point. A run moves
//! `idle -> running -> done | error`; only `reset` returns it to `idle`.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use estate_core::{SessionCounters, VerdictCounts};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::export::ExportReceipt;
use crate::pipeline::{Pipeline, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Done,
    Error,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Done => "done",
            RunState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Prepare,
    Ingest,
    ScoreAndPersist,
    Export,
}

impl Stage {
    /// 1-based position in the run.
    pub fn index(self) -> u8 {
        match self {
            Stage::Prepare => 1,
            Stage::Ingest => 2,
            Stage::ScoreAndPersist => 3,
            Stage::Export => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Prepare => "preparing store",
            Stage::Ingest => "ingesting listings",
            Stage::ScoreAndPersist => "scoring and persisting",
            Stage::Export => "exporting reports",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagePhase {
    Started,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    IngestionUnavailable,
    StoreUnavailable,
    Internal,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::IngestionUnavailable => "ingestion_unavailable",
            FailureReason::StoreUnavailable => "store_unavailable",
            FailureReason::Internal => "internal",
        }
    }
}

impl From<&PipelineError> for FailureReason {
    fn from(err: &PipelineError) -> Self {
        match err {
            PipelineError::Ingestion(_) => FailureReason::IngestionUnavailable,
            // Any store error that escapes a stage, constraint or not, leaves the run unusable.
            PipelineError::Store(_) => FailureReason::StoreUnavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub session_id: Uuid,
    pub source_id: String,
    pub counters: SessionCounters,
    pub properties: usize,
    pub undervalued: usize,
    pub verdicts: VerdictCounts,
    pub export: Option<ExportReceipt>,
    pub export_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    /// 0 while idle, otherwise the index of the latest published stage.
    pub stage: u8,
    pub stage_label: Option<String>,
    pub stage_phase: Option<StagePhase>,
    pub session_id: Option<Uuid>,
    pub error_reason: Option<FailureReason>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<RunSummary>,
}

impl RunStatus {
    pub fn idle() -> Self {
        Self {
            state: RunState::Idle,
            stage: 0,
            stage_label: None,
            stage_phase: None,
            session_id: None,
            error_reason: None,
            error_message: None,
            started_at: None,
            finished_at: None,
            summary: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RunState::Done | RunState::Error)
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::idle()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Started(RunStatus),
    /// A run was already in progress or awaiting reset; nothing was started.
    Rejected(RunStatus),
}

impl Trigger {
    pub fn status(&self) -> &RunStatus {
        match self {
            Trigger::Started(s) | Trigger::Rejected(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResetOutcome {
    Reset(RunStatus),
    AlreadyIdle(RunStatus),
    /// Reset is refused while a run is in progress.
    Rejected(RunStatus),
}

/// Write access to the status record for the run in progress.
#[derive(Clone)]
struct StatusHandle {
    status: Arc<Mutex<RunStatus>>,
}

impl StatusHandle {
    fn lock(&self) -> MutexGuard<'_, RunStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_stage(&self, stage: Stage, phase: StagePhase) {
        let mut status = self.lock();
        if stage.index() < status.stage {
            return;
        }
        status.stage = stage.index();
        status.stage_label = Some(stage.label().to_string());
        status.stage_phase = Some(phase);
    }

    fn set_session(&self, session_id: Uuid) {
        self.lock().session_id = Some(session_id);
    }

    fn finish(&self, outcome: Result<RunSummary, (FailureReason, String)>) -> RunStatus {
        let mut status = self.lock();
        status.finished_at = Some(Utc::now());
        match outcome {
            Ok(summary) => {
                status.state = RunState::Done;
                status.session_id = Some(summary.session_id);
                status.summary = Some(summary);
            }
            Err((reason, message)) => {
                status.state = RunState::Error;
                status.error_reason = Some(reason);
                status.error_message = Some(message);
            }
        }
        status.clone()
    }
}

/// Owns the pipeline and guarantees at most one run at a time.
#[derive(Clone)]
pub struct RunOrchestrator {
    pipeline: Arc<Pipeline>,
    status: Arc<Mutex<RunStatus>>,
}

impl RunOrchestrator {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            status: Arc::new(Mutex::new(RunStatus::idle())),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn lock(&self) -> MutexGuard<'_, RunStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> RunStatus {
        self.lock().clone()
    }

    /// Compare-and-set from idle to running.
    fn try_begin(&self) -> Result<RunStatus, RunStatus> {
        let mut status = self.lock();
        if status.state != RunState::Idle {
            return Err(status.clone());
        }
        *status = RunStatus {
            state: RunState::Running,
            started_at: Some(Utc::now()),
            ..RunStatus::idle()
        };
        Ok(status.clone())
    }

    /// Starts a run in the background if none is active.
    pub fn trigger(&self) -> Trigger {
        match self.try_begin() {
            Err(current) => {
                info!(state = ?current.state, "run already active; trigger ignored");
                Trigger::Rejected(current)
            }
            Ok(started) => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.drive().await;
                });
                Trigger::Started(started)
            }
        }
    }

    /// Like [`trigger`](Self::trigger) but waits for the run; `Started` carries the terminal status.
    pub async fn run_inline(&self) -> Trigger {
        match self.try_begin() {
            Err(current) => Trigger::Rejected(current),
            Ok(_) => Trigger::Started(self.drive().await),
        }
    }

    pub fn reset(&self) -> ResetOutcome {
        let mut status = self.lock();
        match status.state {
            RunState::Idle => ResetOutcome::AlreadyIdle(status.clone()),
            RunState::Running => ResetOutcome::Rejected(status.clone()),
            RunState::Done | RunState::Error => {
                *status = RunStatus::idle();
                info!("run status reset to idle");
                ResetOutcome::Reset(status.clone())
            }
        }
    }

    async fn drive(&self) -> RunStatus {
        let handle = StatusHandle {
            status: self.status.clone(),
        };
        let pipeline = self.pipeline.clone();
        let task = tokio::spawn({
            let handle = handle.clone();
            async move { run_stages(&pipeline, &handle).await }.instrument(info_span!("run"))
        });

        let outcome = match task.await {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(err)) => {
                let reason = FailureReason::from(&err);
                error!(reason = reason.as_str(), error = %err, "run failed");
                Err((reason, err.to_string()))
            }
            Err(join) => {
                let message = if join.is_panic() {
                    panic_message(join.into_panic())
                } else {
                    "run task was cancelled".to_string()
                };
                error!(reason = "internal", error = %message, "run aborted");
                Err((FailureReason::Internal, message))
            }
        };
        handle.finish(outcome)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("pipeline panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("pipeline panicked: {s}")
    } else {
        "pipeline panicked".to_string()
    }
}

async fn run_stages(pipeline: &Pipeline, handle: &StatusHandle) -> Result<RunSummary, PipelineError> {
    handle.publish_stage(Stage::Prepare, StagePhase::Started);
    pipeline.prepare().await?;
    handle.publish_stage(Stage::Prepare, StagePhase::Completed);

    handle.publish_stage(Stage::Ingest, StagePhase::Started);
    let (session, batch) = pipeline.ingest().await?;
    handle.set_session(session.id);
    handle.publish_stage(Stage::Ingest, StagePhase::Completed);

    handle.publish_stage(Stage::ScoreAndPersist, StagePhase::Started);
    let dataset = pipeline
        .score_and_persist(session, batch)
        .instrument(info_span!("score_and_persist"))
        .await?;
    handle.publish_stage(Stage::ScoreAndPersist, StagePhase::Completed);

    handle.publish_stage(Stage::Export, StagePhase::Started);
    let (export, export_error) = match pipeline.export(&dataset).await {
        Ok(receipt) => {
            info!(directory = %receipt.directory, files = receipt.files.len(), "reports exported");
            (Some(receipt), None)
        }
        Err(err) => {
            warn!(error = %err, "export failed; run data is kept");
            (None, Some(err.to_string()))
        }
    };
    handle.publish_stage(Stage::Export, StagePhase::Completed);

    Ok(RunSummary {
        session_id: dataset.session.id,
        source_id: dataset.session.source_id.clone(),
        counters: dataset.session.counters,
        properties: dataset.properties.len(),
        undervalued: dataset.overview.summary.undervalued,
        verdicts: dataset.overview.summary.verdicts.clone(),
        export,
        export_error,
    })
}
