use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::capability::{call_with_retries, CallPool, SpeechSynthesizer};
use crate::config::{Language, SynthesisPolicy};
use crate::error::{CallError, PipelineError};
use crate::job::{CancelFlag, JobId, StageProgress};
use crate::script::ScriptSegment;
use crate::store::{ArtifactHandle, ArtifactStore};

/// Synthesize narration for every segment, bounded-concurrently, keeping the
/// audio list strictly in segment order. Unlike frame analysis there is no
/// partial tolerance: a missing line of narration fails the job.
pub async fn synthesize_all(
    job: JobId,
    mut segments: Vec<ScriptSegment>,
    language: Language,
    speech: Arc<dyn SpeechSynthesizer>,
    store: &ArtifactStore,
    pool: &CallPool,
    policy: &SynthesisPolicy,
    cancel: &CancelFlag,
    progress: &StageProgress,
) -> Result<Vec<ScriptSegment>, PipelineError> {
    let total = segments.len();
    let local = Arc::new(Semaphore::new(policy.max_concurrency.max(1)));
    let mut tasks: JoinSet<(usize, Option<Result<ArtifactHandle, CallError>>)> = JoinSet::new();

    for (index, segment) in segments.iter().enumerate() {
        let dest = store.allocate(job, "synthesizing", &format!("segment-{index}.mp3"))?;
        let text = segment.text.clone();
        let window = segment.window_secs();
        let speech = Arc::clone(&speech);
        let local = Arc::clone(&local);
        let pool = pool.clone();
        let cancel = cancel.clone();
        let policy = *policy;
        tasks.spawn(async move {
            let _slot = local
                .acquire_owned()
                .await
                .expect("synthesis semaphore closed");
            if cancel.is_cancelled() {
                return (index, None);
            }
            let outcome =
                synthesize_fitted(&text, language, window, &*speech, &pool, &policy, &dest)
                    .await
                    .map(|_| dest);
            (index, Some(outcome))
        });
    }

    let mut slots: Vec<Option<Result<ArtifactHandle, CallError>>> =
        (0..total).map(|_| None).collect();
    let mut settled = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, outcome)) => slots[index] = outcome,
            Err(join_error) => {
                return Err(PipelineError::SynthesisFailed(format!(
                    "synthesis task aborted: {join_error}"
                )));
            }
        }
        settled += 1;
        progress.completed(settled, total);
    }

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    for (index, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(Ok(handle)) => segments[index].audio = Some(handle),
            Some(Err(CallError::Timeout(elapsed))) => {
                return Err(PipelineError::Timeout(format!(
                    "segment {index} timed out after {elapsed:?}"
                )));
            }
            Some(Err(error)) => {
                return Err(PipelineError::SynthesisFailed(format!(
                    "segment {index}: {error}"
                )));
            }
            None => return Err(PipelineError::Cancelled),
        }
    }

    info!(job = %job, segments = total, "narration synthesized");
    Ok(segments)
}

/// One synthesis with a duration-fit pass: if the clip overruns its segment
/// window by more than the tolerance, re-synthesize once at a rate that
/// compresses it into the window (clamped to the service's ceiling).
async fn synthesize_fitted(
    text: &str,
    language: Language,
    window_secs: f64,
    speech: &dyn SpeechSynthesizer,
    pool: &CallPool,
    policy: &SynthesisPolicy,
    dest: &ArtifactHandle,
) -> Result<(), CallError> {
    let clip_secs = synth_once(text, language, 1.0, speech, pool, policy, dest).await?;

    if window_secs > 0.0 && clip_secs > window_secs * (1.0 + policy.overrun_tolerance) {
        let rate = (clip_secs / window_secs).min(policy.max_rate);
        debug!(clip_secs, window_secs, rate, "clip overruns window, refitting");
        synth_once(text, language, rate, speech, pool, policy, dest).await?;
    }
    Ok(())
}

async fn synth_once(
    text: &str,
    language: Language,
    rate: f64,
    speech: &dyn SpeechSynthesizer,
    pool: &CallPool,
    policy: &SynthesisPolicy,
    dest: &ArtifactHandle,
) -> Result<f64, CallError> {
    call_with_retries("synthesize", &policy.retry, || async {
        let _permit = pool.acquire().await;
        speech.synthesize(text, language, rate, dest.path()).await
    })
    .await
}
