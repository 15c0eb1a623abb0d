use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::config::{JobConfig, Language, RetryPolicy};
use crate::error::CallError;
use crate::job::Source;

/// Metadata learned about a source before committing to a full transfer.
/// Fields are `None` when the provider does not advertise them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceProbe {
    pub size_bytes: Option<u64>,
    pub duration_secs: Option<f64>,
}

/// What a completed fetch measured about the local file.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub size_bytes: u64,
    pub duration_secs: f64,
    pub title: Option<String>,
}

/// One timed commentary line as returned by the text-generation service,
/// before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Obtains a local copy of the source video.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Cheap metadata check, run before `fetch` so oversized sources can be
    /// rejected without paying for the transfer.
    async fn probe(&self, source: &Source) -> Result<SourceProbe, CallError>;

    async fn fetch(&self, source: &Source, dest: &Path) -> Result<FetchedMedia, CallError>;
}

/// Extracts still frames at the requested timestamps. One result per
/// timestamp, failures isolated per entry.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn sample(
        &self,
        video: &Path,
        timestamps: &[f64],
        out_dir: &Path,
    ) -> Vec<Result<PathBuf, CallError>>;
}

/// Describes one still image in natural language.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn describe(&self, image: &Path) -> Result<String, CallError>;
}

/// Context handed to the text-generation service for the script stage.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    /// `(timestamp_secs, description)` in playback order.
    pub scenes: Vec<(f64, String)>,
    pub duration_secs: f64,
    pub title: Option<String>,
    pub config: JobConfig,
}

/// Turns ordered scene descriptions into timed commentary lines.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn script(&self, request: &ScriptRequest) -> Result<Vec<RawSegment>, CallError>;
}

/// Synthesizes one utterance to `dest`, returning the measured clip
/// duration in seconds. `rate` is a speed multiplier (1.0 = natural).
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        language: Language,
        rate: f64,
        dest: &Path,
    ) -> Result<f64, CallError>;
}

/// Muxes the source video with narration clips placed at absolute offsets.
#[async_trait]
pub trait VideoMuxer: Send + Sync {
    async fn compose(
        &self,
        video: &Path,
        narration: &[(PathBuf, f64)],
        dest: &Path,
    ) -> Result<(), CallError>;
}

/// The external capabilities a pipeline run needs, bundled for injection.
#[derive(Clone)]
pub struct Services {
    pub downloader: Arc<dyn Downloader>,
    pub frames: Arc<dyn FrameExtractor>,
    pub vision: Arc<dyn VisionAnalyzer>,
    pub text: Arc<dyn TextGenerator>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub muxer: Arc<dyn VideoMuxer>,
}

/// Process-wide cap on in-flight remote calls, shared by every job so the
/// providers' rate limits hold regardless of how many jobs run. Permits are
/// RAII guards: release happens on every exit path.
#[derive(Debug, Clone)]
pub struct CallPool {
    permits: Arc<Semaphore>,
}

impl CallPool {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(permits)),
        }
    }

    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .expect("call pool semaphore closed")
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Run a remote call under the policy's per-call timeout, retrying transient
/// failures with exponential backoff. The last error is returned once the
/// attempt budget is spent; permanent errors return immediately.
pub async fn call_with_retries<T, F, Fut>(
    what: &str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1u32;
    loop {
        let outcome = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout(policy.call_timeout)),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                warn!(call = what, attempt, %error, "transient failure, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn quick_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = call_with_retries("test", &quick_policy(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CallError::Transient("blip".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = call_with_retries("test", &quick_policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CallError::Permanent("malformed".into())) }
        })
        .await;
        assert!(matches!(result, Err(CallError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = call_with_retries("test", &quick_policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CallError::Transient("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(CallError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_calls_become_timeouts() {
        let policy = RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(10));
        let result: Result<(), _> = call_with_retries("test", &policy, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(CallError::Timeout(_))));
    }

    #[tokio::test]
    async fn pool_gates_concurrent_holders() {
        let pool = CallPool::new(2);
        let a = pool.acquire().await;
        let _b = pool.acquire().await;
        assert_eq!(pool.available(), 0);
        drop(a);
        assert_eq!(pool.available(), 1);
    }
}
