use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Narration style for the generated commentary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentaryStyle {
    Documentary,
    Energetic,
    Analytical,
    Storyteller,
}

impl CommentaryStyle {
    pub fn name(&self) -> &'static str {
        match self {
            CommentaryStyle::Documentary => "documentary",
            CommentaryStyle::Energetic => "energetic",
            CommentaryStyle::Analytical => "analytical",
            CommentaryStyle::Storyteller => "storyteller",
        }
    }
}

/// Text-generation backend used for the script stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptModel {
    Gpt4oMini,
    Gpt4o,
    DeepseekChat,
}

impl ScriptModel {
    pub fn model_id(&self) -> &'static str {
        match self {
            ScriptModel::Gpt4oMini => "gpt-4o-mini",
            ScriptModel::Gpt4o => "gpt-4o",
            ScriptModel::DeepseekChat => "deepseek-chat",
        }
    }
}

/// Target narration language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    English,
    Urdu,
}

impl Language {
    /// Approximate spoken words per minute, used to budget script length.
    pub fn words_per_minute(&self) -> u32 {
        match self {
            Language::English => 150,
            Language::Urdu => 120,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Urdu => "Urdu",
        }
    }
}

/// Per-job user configuration, fixed at submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobConfig {
    pub style: CommentaryStyle,
    pub model: ScriptModel,
    pub language: Language,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            style: CommentaryStyle::Documentary,
            model: ScriptModel::Gpt4oMini,
            language: Language::English,
        }
    }
}

/// Hard limits applied to the source media before and after acquisition.
#[derive(Debug, Clone, Copy)]
pub struct SourceLimits {
    pub max_bytes: u64,
    pub max_duration_secs: f64,
}

impl Default for SourceLimits {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            max_duration_secs: 5.0 * 60.0,
        }
    }
}

/// Retry schedule for one class of remote calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, call_timeout: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            call_timeout,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(120),
        }
    }
}

/// Frame sampling tunables. More frames for longer videos, capped to bound
/// downstream API cost.
#[derive(Debug, Clone, Copy)]
pub struct SamplingPolicy {
    pub secs_per_frame: f64,
    pub min_frames: usize,
    pub max_frames: usize,
    /// Fraction of frames that must extract successfully; inclusive.
    pub min_coverage: f32,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            secs_per_frame: 10.0,
            min_frames: 3,
            max_frames: 16,
            min_coverage: 0.5,
        }
    }
}

/// Scene analysis fan-out tunables.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisPolicy {
    pub max_concurrency: usize,
    /// Fraction of frames that must be described successfully; inclusive.
    pub min_coverage: f32,
    pub retry: RetryPolicy,
}

impl Default for AnalysisPolicy {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            min_coverage: 0.5,
            retry: RetryPolicy::new(
                3,
                Duration::from_millis(500),
                Duration::from_secs(300),
            ),
        }
    }
}

/// Voice synthesis tunables.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisPolicy {
    pub max_concurrency: usize,
    /// A clip may overrun its segment window by this fraction before a
    /// re-synthesis pass at adjusted rate is triggered.
    pub overrun_tolerance: f64,
    /// Ceiling for the adjusted speech rate on the duration-fit pass.
    pub max_rate: f64,
    pub retry: RetryPolicy,
}

impl Default for SynthesisPolicy {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            overrun_tolerance: 0.10,
            max_rate: 2.0,
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything the orchestrator needs that is not per-job user input.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub limits: SourceLimits,
    pub sampling: SamplingPolicy,
    pub analysis: AnalysisPolicy,
    pub script_retry: RetryPolicy,
    pub synthesis: SynthesisPolicy,
    pub compose_retry: RetryPolicy,
    pub acquire_retry: RetryPolicy,
    /// Per-job scratch budget enforced by the artifact store.
    pub max_scratch_bytes: u64,
    /// Total in-flight remote calls allowed across all jobs.
    pub remote_call_permits: usize,
    /// How long a finished job's final artifact is kept before purge.
    pub retention: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            limits: SourceLimits::default(),
            sampling: SamplingPolicy::default(),
            analysis: AnalysisPolicy::default(),
            script_retry: RetryPolicy::new(
                3,
                Duration::from_secs(1),
                Duration::from_secs(180),
            ),
            synthesis: SynthesisPolicy::default(),
            compose_retry: RetryPolicy::new(
                2,
                Duration::from_secs(1),
                Duration::from_secs(600),
            ),
            acquire_retry: RetryPolicy::new(
                3,
                Duration::from_secs(2),
                Duration::from_secs(600),
            ),
            max_scratch_bytes: 512 * 1024 * 1024,
            remote_call_permits: 8,
            retention: Duration::from_secs(15 * 60),
        }
    }
}
