use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::config::JobConfig;
use crate::job::{CancelFlag, Job, JobId, JobStatus, SharedJob, Source, Stage};
use crate::pipeline::Orchestrator;

/// What `result` tells a caller about a job's final artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Ready(PathBuf),
    NotReady { stage: Stage, progress: f32 },
    Failed { reason: String },
    Cancelled,
    /// The job finished but the retention window elapsed and the artifact
    /// was purged.
    Expired,
}

struct JobEntry {
    job: SharedJob,
    cancel: CancelFlag,
}

/// In-memory job registry fronting the orchestrator: submit, poll, fetch,
/// cancel. Records live for the process lifetime.
pub struct JobManager {
    orchestrator: Arc<Orchestrator>,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl JobManager {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a job and start its pipeline in the background.
    pub fn submit(&self, source: Source, config: JobConfig) -> JobId {
        let job = Job::new(source, config);
        let id = job.id;
        info!(job = %id, source = %job.source, "job submitted");

        let shared: SharedJob = Arc::new(std::sync::RwLock::new(job));
        let cancel = CancelFlag::new();
        self.jobs.write().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            JobEntry {
                job: Arc::clone(&shared),
                cancel: cancel.clone(),
            },
        );

        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            orchestrator.run(shared, cancel).await;
        });
        id
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let entry = jobs.get(&id)?;
        let status = entry.job.read().unwrap_or_else(|e| e.into_inner()).status();
        Some(status)
    }

    pub fn result(&self, id: JobId) -> Option<JobResult> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let entry = jobs.get(&id)?;
        let job = entry.job.read().unwrap_or_else(|e| e.into_inner());
        Some(match job.stage {
            Stage::Done => match job.final_artifact() {
                Some(handle) if handle.path().exists() => {
                    JobResult::Ready(handle.path().to_path_buf())
                }
                _ => JobResult::Expired,
            },
            Stage::Failed => JobResult::Failed {
                reason: job
                    .error
                    .as_ref()
                    .map(|failure| failure.to_string())
                    .unwrap_or_else(|| "unknown failure".into()),
            },
            Stage::Cancelled => JobResult::Cancelled,
            stage => JobResult::NotReady {
                stage,
                progress: job.progress,
            },
        })
    }

    /// Request cancellation. Takes effect at the job's next stage boundary
    /// or fan-out unit; returns false for unknown or already-terminal jobs.
    pub fn cancel(&self, id: JobId) -> bool {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = jobs.get(&id) else {
            return false;
        };
        let terminal = entry
            .job
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .stage
            .is_terminal();
        if terminal {
            return false;
        }
        info!(job = %id, "cancellation requested");
        entry.cancel.cancel();
        true
    }
}
