use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::error::PipelineError;
use crate::store::ArtifactHandle;

/// Opaque job identifier, assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Where the source video comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Source {
    /// A file already on local disk (upload path).
    Upload(PathBuf),
    /// A remote URL handed to the download tool.
    Url(String),
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Upload(path) => write!(f, "{}", path.display()),
            Source::Url(url) => f.write_str(url),
        }
    }
}

/// Position in the pipeline state machine. Transitions are strictly forward;
/// `Failed` and `Cancelled` are reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Submitted,
    Acquiring,
    Sampling,
    Analyzing,
    Scripting,
    Synthesizing,
    Composing,
    Done,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Submitted => "submitted",
            Stage::Acquiring => "acquiring",
            Stage::Sampling => "sampling",
            Stage::Analyzing => "analyzing",
            Stage::Scripting => "scripting",
            Stage::Synthesizing => "synthesizing",
            Stage::Composing => "composing",
            Stage::Done => "done",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed | Stage::Cancelled)
    }

    /// Ordering key for the forward-only invariant. Terminal states share
    /// the top slot: none of them can be left.
    fn index(&self) -> u8 {
        match self {
            Stage::Submitted => 0,
            Stage::Acquiring => 1,
            Stage::Sampling => 2,
            Stage::Analyzing => 3,
            Stage::Scripting => 4,
            Stage::Synthesizing => 5,
            Stage::Composing => 6,
            Stage::Done | Stage::Failed | Stage::Cancelled => 7,
        }
    }

    /// Fraction of the pipeline completed once this stage is *entered*.
    pub fn progress_base(&self) -> f32 {
        match self {
            Stage::Submitted => 0.0,
            Stage::Acquiring => 0.02,
            Stage::Sampling => 0.20,
            Stage::Analyzing => 0.30,
            Stage::Scripting => 0.55,
            Stage::Synthesizing => 0.65,
            Stage::Composing => 0.85,
            Stage::Done => 1.0,
            Stage::Failed | Stage::Cancelled => 0.0,
        }
    }

    /// Progress reached when this stage completes (the next stage's base).
    pub fn progress_ceiling(&self) -> f32 {
        match self {
            Stage::Submitted => Stage::Acquiring.progress_base(),
            Stage::Acquiring => Stage::Sampling.progress_base(),
            Stage::Sampling => Stage::Analyzing.progress_base(),
            Stage::Analyzing => Stage::Scripting.progress_base(),
            Stage::Scripting => Stage::Synthesizing.progress_base(),
            Stage::Synthesizing => Stage::Composing.progress_base(),
            Stage::Composing | Stage::Done => 1.0,
            Stage::Failed | Stage::Cancelled => 0.0,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Last fatal error, with the stage that raised it.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: PipelineError,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.stage, self.error)
    }
}

/// One end-to-end request to produce a commented video. Mutated only by the
/// orchestrator as stages complete.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub source: Source,
    pub config: JobConfig,
    pub stage: Stage,
    pub progress: f32,
    /// Per-stage artifact handles, in commit order.
    pub artifacts: Vec<(Stage, Vec<ArtifactHandle>)>,
    pub error: Option<StageFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(source: Source, config: JobConfig) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            source,
            config,
            stage: Stage::Submitted,
            progress: 0.0,
            artifacts: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance to a later stage. Backward or terminal-exit transitions are a
    /// logic error in the orchestrator and panic in debug builds.
    pub fn advance(&mut self, to: Stage) {
        debug_assert!(
            !self.stage.is_terminal() && to.index() > self.stage.index(),
            "illegal transition {} -> {}",
            self.stage,
            to
        );
        self.stage = to;
        self.progress = self.progress.max(to.progress_base());
        self.updated_at = Utc::now();
    }

    /// Record the artifacts a completed stage produced, before advancing.
    pub fn commit_artifacts(&mut self, stage: Stage, handles: Vec<ArtifactHandle>) {
        self.artifacts.push((stage, handles));
        self.progress = self.progress.max(stage.progress_ceiling());
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, stage: Stage, error: PipelineError) {
        self.error = Some(StageFailure { stage, error });
        self.stage = Stage::Failed;
        self.updated_at = Utc::now();
    }

    pub fn cancel(&mut self) {
        self.stage = Stage::Cancelled;
        self.updated_at = Utc::now();
    }

    /// The final composed video, present once the job is `Done`.
    pub fn final_artifact(&self) -> Option<&ArtifactHandle> {
        self.artifacts
            .iter()
            .find(|(stage, _)| *stage == Stage::Composing)
            .and_then(|(_, handles)| handles.first())
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            stage: self.stage,
            progress: self.progress,
            error: self.error.as_ref().map(|failure| failure.to_string()),
        }
    }
}

/// Caller-facing snapshot of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub stage: Stage,
    pub progress: f32,
    pub error: Option<String>,
}

/// The live job record, shared between the orchestrator task and callers
/// polling `status`. Critical sections are short and never await.
pub type SharedJob = Arc<std::sync::RwLock<Job>>;

/// Reports fan-out completion into the job record so `status()` shows
/// movement inside a long stage, scaled to that stage's progress span.
#[derive(Clone)]
pub struct StageProgress {
    job: SharedJob,
    lo: f32,
    hi: f32,
}

impl StageProgress {
    pub fn new(job: SharedJob, stage: Stage) -> Self {
        Self {
            job,
            lo: stage.progress_base(),
            hi: stage.progress_ceiling(),
        }
    }

    pub fn completed(&self, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        let fraction = self.lo + (self.hi - self.lo) * done as f32 / total as f32;
        let mut job = self.job.write().unwrap_or_else(|e| e.into_inner());
        job.progress = job.progress.max(fraction);
    }
}

/// Cooperative cancellation signal. Observed at stage boundaries and before
/// each new fan-out dispatch; in-flight remote calls are left to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
