use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::job::JobId;

/// Reference to one scratch file owned by exactly one job. The path is only
/// ever handed out by [`ArtifactStore::allocate`], so no two jobs collide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    path: PathBuf,
}

impl ArtifactHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Per-job scratch directories under one root, with a total-size budget per
/// job and idempotent purge. The orchestrator is the only caller of `purge`.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    max_job_bytes: u64,
    seq: AtomicU64,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, max_job_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_job_bytes,
            seq: AtomicU64::new(0),
        }
    }

    pub fn job_dir(&self, job: JobId) -> PathBuf {
        self.root.join(job.to_string())
    }

    /// Reserve a fresh path for a stage artifact. The scratch budget is
    /// checked against what the job has already written; the caller writes
    /// to `handle.path()` afterwards.
    pub fn allocate(
        &self,
        job: JobId,
        stage: &str,
        suffix: &str,
    ) -> Result<ArtifactHandle, PipelineError> {
        let used = self.usage(job);
        if used > self.max_job_bytes {
            return Err(PipelineError::ResourceExceeded {
                used,
                limit: self.max_job_bytes,
            });
        }

        let dir = self.job_dir(job).join(stage);
        fs::create_dir_all(&dir).map_err(|source| PipelineError::Io {
            path: dir.clone(),
            source,
        })?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{seq:04}-{suffix}"));
        Ok(ArtifactHandle { path })
    }

    /// Create (if needed) and return a stage's scratch directory, applying
    /// the same budget check as `allocate`. Used by stages whose external
    /// tool writes a batch of files itself.
    pub fn stage_dir(&self, job: JobId, stage: &str) -> Result<PathBuf, PipelineError> {
        let used = self.usage(job);
        if used > self.max_job_bytes {
            return Err(PipelineError::ResourceExceeded {
                used,
                limit: self.max_job_bytes,
            });
        }
        let dir = self.job_dir(job).join(stage);
        fs::create_dir_all(&dir).map_err(|source| PipelineError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Wrap a file an external tool already wrote into a handle. The path
    /// must live under the job's scratch directory; anything else would
    /// escape the purge contract.
    pub fn adopt(&self, job: JobId, path: PathBuf) -> Result<ArtifactHandle, PipelineError> {
        if !path.starts_with(self.job_dir(job)) {
            return Err(PipelineError::Store(format!(
                "path {} is outside the scratch directory of job {job}",
                path.display()
            )));
        }
        Ok(ArtifactHandle { path })
    }

    /// Bytes currently on disk for this job. Missing directory counts as
    /// zero, matching the purge contract.
    pub fn usage(&self, job: JobId) -> u64 {
        dir_size(&self.job_dir(job))
    }

    /// Remove every artifact for a job. Idempotent: a missing directory is
    /// treated as already purged, including leftovers from a crashed prior
    /// run that removed part of the tree.
    pub fn purge(&self, job: JobId) -> Result<(), PipelineError> {
        let dir = self.job_dir(job);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(job = %job, "scratch purged");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PipelineError::Io { path: dir, source }),
        }
    }
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += dir_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max: u64) -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), max);
        (dir, store)
    }

    #[test]
    fn allocations_never_collide_across_jobs() {
        let (_guard, store) = store(u64::MAX);
        let a = JobId::new();
        let b = JobId::new();
        let ha = store.allocate(a, "sampling", "frame.jpg").unwrap();
        let hb = store.allocate(b, "sampling", "frame.jpg").unwrap();
        assert_ne!(ha.path(), hb.path());
        assert!(ha.path().starts_with(store.job_dir(a)));
        assert!(hb.path().starts_with(store.job_dir(b)));
    }

    #[test]
    fn purge_twice_is_clean() {
        let (_guard, store) = store(u64::MAX);
        let job = JobId::new();
        let handle = store.allocate(job, "acquiring", "source.mp4").unwrap();
        fs::write(handle.path(), b"data").unwrap();
        assert!(store.job_dir(job).exists());

        store.purge(job).unwrap();
        assert!(!store.job_dir(job).exists());
        // Second purge sees nothing and still succeeds.
        store.purge(job).unwrap();
    }

    #[test]
    fn purge_of_unknown_job_is_ok() {
        let (_guard, store) = store(u64::MAX);
        store.purge(JobId::new()).unwrap();
    }

    #[test]
    fn allocation_fails_once_budget_is_spent() {
        let (_guard, store) = store(16);
        let job = JobId::new();
        let handle = store.allocate(job, "acquiring", "source.mp4").unwrap();
        fs::write(handle.path(), vec![0u8; 64]).unwrap();

        let err = store.allocate(job, "sampling", "frame.jpg").unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExceeded { used: 64, .. }), "{err:?}");

        // Another job is unaffected by this job's spending.
        store.allocate(JobId::new(), "acquiring", "source.mp4").unwrap();
    }

    #[test]
    fn usage_counts_nested_files() {
        let (_guard, store) = store(u64::MAX);
        let job = JobId::new();
        let a = store.allocate(job, "sampling", "frame.jpg").unwrap();
        let b = store.allocate(job, "analyzing", "analysis.json").unwrap();
        fs::write(a.path(), vec![0u8; 10]).unwrap();
        fs::write(b.path(), vec![0u8; 5]).unwrap();
        assert_eq!(store.usage(job), 15);
    }
}
