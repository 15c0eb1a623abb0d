use std::path::PathBuf;

use thiserror::Error;

/// Terminal error for a job, attributed to the stage that raised it.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("scratch budget exceeded: {used} bytes used of {limit} allowed")]
    ResourceExceeded { used: u64, limit: u64 },

    #[error("source is too large: {size} bytes (limit {limit})")]
    SourceTooLarge { size: u64, limit: u64 },

    #[error("source is too long: {duration:.1}s (limit {limit:.1}s)")]
    SourceTooLong { duration: f64, limit: f64 },

    #[error("unsupported source format: {0}")]
    UnsupportedFormat(String),

    #[error("could not acquire source media: {0}")]
    AcquisitionFailed(String),

    #[error(
        "insufficient coverage: {succeeded} of {total} succeeded ({achieved:.0}% < {required_pct:.0}%)",
        achieved = coverage_pct(.succeeded, .total),
        required_pct = .required * 100.0
    )]
    CoverageBelowThreshold {
        succeeded: usize,
        total: usize,
        required: f32,
    },

    #[error("script generation failed: {0}")]
    ScriptGenerationFailed(String),

    #[error("voice synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("video composition failed: {0}")]
    CompositionFailed(String),

    #[error("job was cancelled")]
    Cancelled,

    #[error("remote call timed out: {0}")]
    Timeout(String),

    #[error("artifact store error: {0}")]
    Store(String),

    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn coverage_pct(succeeded: &usize, total: &usize) -> f32 {
    if *total == 0 {
        0.0
    } else {
        *succeeded as f32 / *total as f32 * 100.0
    }
}

/// Failure of a single remote call, classified so the retry helper knows
/// whether another attempt can succeed.
#[derive(Debug, Error)]
pub enum CallError {
    /// Network blip, rate limit, 5xx: retryable.
    #[error("{0}")]
    Transient(String),

    /// The call will fail the same way again: not retried.
    #[error("{0}")]
    Permanent(String),

    /// The input itself cannot be handled (format, codec, URL scheme).
    #[error("{0}")]
    Unsupported(String),

    /// The per-call deadline elapsed: retryable.
    #[error("timed out after {0:.0?}")]
    Timeout(std::time::Duration),
}

impl CallError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CallError::Transient(_) | CallError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_error_reports_achieved_fraction() {
        let err = PipelineError::CoverageBelowThreshold {
            succeeded: 1,
            total: 4,
            required: 0.5,
        };
        let msg = err.to_string();
        assert!(msg.contains("1 of 4"), "{msg}");
        assert!(msg.contains("25%"), "{msg}");
        assert!(msg.contains("50%"), "{msg}");
    }

    #[test]
    fn transient_classification() {
        assert!(CallError::Transient("reset".into()).is_transient());
        assert!(CallError::Timeout(std::time::Duration::from_secs(5)).is_transient());
        assert!(!CallError::Permanent("bad image".into()).is_transient());
        assert!(!CallError::Unsupported("webm".into()).is_transient());
    }
}
