use std::fs;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::acquire::{acquire, SourceMedia};
use crate::analyze::analyze;
use crate::capability::{CallPool, Services};
use crate::compose::compose;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::job::{CancelFlag, JobId, SharedJob, Stage, StageProgress};
use crate::sample::sample;
use crate::script::generate;
use crate::store::{ArtifactHandle, ArtifactStore};
use crate::synth::synthesize_all;

/// Drives one job's stages strictly in order, committing each stage's
/// artifacts to the job record before advancing, and owns the terminal
/// cleanup: purge after a retention window on `Done`, immediately on
/// `Failed` or `Cancelled`.
pub struct Orchestrator {
    services: Services,
    store: Arc<ArtifactStore>,
    config: PipelineConfig,
    pool: CallPool,
}

impl Orchestrator {
    pub fn new(services: Services, store: Arc<ArtifactStore>, config: PipelineConfig) -> Self {
        let pool = CallPool::new(config.remote_call_permits);
        Self {
            services,
            store,
            config,
            pool,
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Run the job to a terminal state. Errors never escape: they land in
    /// the job record with stage attribution.
    pub async fn run(&self, shared: SharedJob, cancel: CancelFlag) {
        let id = shared.read().unwrap_or_else(|e| e.into_inner()).id;

        match self.execute(&shared, &cancel).await {
            Ok(_) => {
                let mut job = shared.write().unwrap_or_else(|e| e.into_inner());
                job.advance(Stage::Done);
                info!(job = %id, "pipeline finished");
                drop(job);
                self.schedule_purge(id);
            }
            Err(PipelineError::Cancelled) => {
                let mut job = shared.write().unwrap_or_else(|e| e.into_inner());
                job.cancel();
                info!(job = %id, "pipeline cancelled");
                drop(job);
                self.purge_now(id);
            }
            Err(err) => {
                let mut job = shared.write().unwrap_or_else(|e| e.into_inner());
                let stage = job.stage;
                error!(job = %id, %stage, %err, "pipeline failed");
                job.fail(stage, err);
                drop(job);
                self.purge_now(id);
            }
        }
    }

    async fn execute(
        &self,
        shared: &SharedJob,
        cancel: &CancelFlag,
    ) -> Result<ArtifactHandle, PipelineError> {
        let (id, source, config) = {
            let job = shared.read().unwrap_or_else(|e| e.into_inner());
            (job.id, job.source.clone(), job.config)
        };

        self.enter(shared, cancel, Stage::Acquiring)?;
        let media: SourceMedia = acquire(
            id,
            &source,
            &*self.services.downloader,
            &self.store,
            &self.config.limits,
            &self.config.acquire_retry,
        )
        .await?;
        self.commit(shared, Stage::Acquiring, vec![media.handle.clone()]);

        self.enter(shared, cancel, Stage::Sampling)?;
        let frames = sample(
            id,
            &media,
            &*self.services.frames,
            &self.store,
            &self.config.sampling,
        )
        .await?;
        self.commit(
            shared,
            Stage::Sampling,
            frames.iter().map(|frame| frame.image.clone()).collect(),
        );

        self.enter(shared, cancel, Stage::Analyzing)?;
        let progress = StageProgress::new(Arc::clone(shared), Stage::Analyzing);
        let analysis = analyze(
            id,
            &frames,
            Arc::clone(&self.services.vision),
            &self.pool,
            &self.config.analysis,
            cancel,
            &progress,
        )
        .await?;
        let analysis_artifact = self.write_json(id, "analyzing", "analysis.json", &analysis)?;
        self.commit(shared, Stage::Analyzing, vec![analysis_artifact]);

        self.enter(shared, cancel, Stage::Scripting)?;
        let segments = generate(
            id,
            &analysis.described,
            &media,
            config,
            Arc::clone(&self.services.text),
            &self.pool,
            &self.config.script_retry,
        )
        .await?;
        let script_artifact = self.write_json(id, "scripting", "script.json", &segments)?;
        self.commit(shared, Stage::Scripting, vec![script_artifact]);

        self.enter(shared, cancel, Stage::Synthesizing)?;
        let progress = StageProgress::new(Arc::clone(shared), Stage::Synthesizing);
        let segments = synthesize_all(
            id,
            segments,
            config.language,
            Arc::clone(&self.services.speech),
            &self.store,
            &self.pool,
            &self.config.synthesis,
            cancel,
            &progress,
        )
        .await?;
        self.commit(
            shared,
            Stage::Synthesizing,
            segments
                .iter()
                .filter_map(|segment| segment.audio.clone())
                .collect(),
        );

        self.enter(shared, cancel, Stage::Composing)?;
        let output = compose(
            id,
            &media,
            &segments,
            &*self.services.muxer,
            &self.store,
            &self.config.compose_retry,
        )
        .await?;
        self.commit(shared, Stage::Composing, vec![output.clone()]);

        Ok(output)
    }

    /// Stage boundary: the one place cancellation is observed outside the
    /// fan-out stages, and the only place the state machine moves forward.
    fn enter(
        &self,
        shared: &SharedJob,
        cancel: &CancelFlag,
        next: Stage,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let mut job = shared.write().unwrap_or_else(|e| e.into_inner());
        job.advance(next);
        info!(job = %job.id, stage = %next, "stage started");
        Ok(())
    }

    fn commit(&self, shared: &SharedJob, stage: Stage, handles: Vec<ArtifactHandle>) {
        let mut job = shared.write().unwrap_or_else(|e| e.into_inner());
        job.commit_artifacts(stage, handles);
    }

    fn write_json<T: Serialize>(
        &self,
        id: JobId,
        stage: &str,
        suffix: &str,
        value: &T,
    ) -> Result<ArtifactHandle, PipelineError> {
        let handle = self.store.allocate(id, stage, suffix)?;
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|err| PipelineError::Store(err.to_string()))?;
        fs::write(handle.path(), bytes).map_err(|source| PipelineError::Io {
            path: handle.path().to_path_buf(),
            source,
        })?;
        Ok(handle)
    }

    /// `Done` keeps the final artifact around long enough for the caller to
    /// fetch it, then purges.
    fn schedule_purge(&self, id: JobId) {
        let store = Arc::clone(&self.store);
        let retention = self.config.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Err(err) = store.purge(id) {
                warn!(job = %id, %err, "retention purge failed");
            }
        });
    }

    /// `Failed`/`Cancelled` have nothing worth retrieving: purge at once.
    fn purge_now(&self, id: JobId) {
        if let Err(err) = self.store.purge(id) {
            warn!(job = %id, %err, "purge failed");
        }
    }
}
