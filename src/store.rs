//! Durable job state: one JSON file per job, replaced atomically.
//!
//! Every update is written to a temporary sibling, synced, renamed over the
//! previous file and the directory is synced, so a crash at any point leaves
//! either the old or the new record on disk. Updates are serialized per job
//! id; unrelated jobs never wait on each other.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncWriteExt};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("{0:?} is not a job id")]
    InvalidId(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt job record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("rejected update for job {job_id}: {reason}")]
    Invariant { job_id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::InProgress | JobStatus::Paused)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub video_id: String,
    pub stream_signature: String,
    pub target_path: PathBuf,
    pub total_bytes: Option<u64>,
    pub bytes_completed: u64,
    pub status: JobStatus,
    pub etag_or_fingerprint: Option<String>,
    pub last_modified: Option<String>,
    pub attempt_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl JobState {
    pub fn new(
        video_id: &str,
        stream_signature: &str,
        target_path: &Path,
        total_bytes: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: derive_job_id(video_id, stream_signature),
            video_id: video_id.to_string(),
            stream_signature: stream_signature.to_string(),
            target_path: target_path.to_path_buf(),
            total_bytes,
            bytes_completed: 0,
            status: JobStatus::Pending,
            etag_or_fingerprint: None,
            last_modified: None,
            attempt_count: 0,
            error_message: None,
            created_at: now,
            last_updated: now,
        }
    }

    fn apply(&mut self, delta: &JobDelta) -> Result<(), StoreError> {
        let mut next = self.clone();

        if delta.restart {
            next.bytes_completed = 0;
            next.total_bytes = None;
            next.etag_or_fingerprint = None;
            next.last_modified = None;
        }
        if let Some(total) = delta.total_bytes {
            next.total_bytes = Some(total);
        }
        if let Some(bytes) = delta.bytes_completed {
            next.bytes_completed = bytes;
        }
        if let Some(etag) = &delta.etag {
            next.etag_or_fingerprint = Some(etag.clone());
        }
        if let Some(lm) = &delta.last_modified {
            next.last_modified = Some(lm.clone());
        }
        if let Some(status) = delta.status {
            next.status = status;
        }
        if delta.new_attempt {
            next.attempt_count = next.attempt_count.saturating_add(1);
        }
        if let Some(msg) = &delta.error_message {
            next.error_message = Some(msg.clone());
        } else if delta.status == Some(JobStatus::Completed) {
            next.error_message = None;
        }

        if let Some(total) = next.total_bytes {
            if next.bytes_completed > total {
                return Err(self.rejected(format!(
                    "bytes_completed {} exceeds total_bytes {}",
                    next.bytes_completed, total
                )));
            }
        }
        if next.status == JobStatus::Completed && next.total_bytes != Some(next.bytes_completed) {
            return Err(self.rejected(format!(
                "cannot complete with {} of {:?} bytes",
                next.bytes_completed, next.total_bytes
            )));
        }

        next.last_updated = Utc::now();
        *self = next;
        Ok(())
    }

    fn rejected(&self, reason: String) -> StoreError {
        StoreError::Invariant {
            job_id: self.job_id.clone(),
            reason,
        }
    }
}

/// A partial update merged into a [`JobState`] by [`JobStore::update`].
#[derive(Debug, Clone, Default)]
pub struct JobDelta {
    pub status: Option<JobStatus>,
    pub bytes_completed: Option<u64>,
    pub total_bytes: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub error_message: Option<String>,
    pub new_attempt: bool,
    /// Drop progress and remote validators before applying the other fields.
    pub restart: bool,
}

impl JobDelta {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(bytes_completed: u64) -> Self {
        Self {
            bytes_completed: Some(bytes_completed),
            ..Default::default()
        }
    }

    pub fn restart() -> Self {
        Self {
            restart: true,
            status: Some(JobStatus::InProgress),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error_message = Some(msg.into());
        self
    }
}

/// Stable job id for a (video, stream) pair, so re-extracting the same video
/// and quality finds the existing job.
pub fn derive_job_id(video_id: &str, stream_signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(video_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(stream_signature.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let readable = !video_id.is_empty()
        && video_id.len() <= 32
        && video_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if readable {
        format!("{}_{}", video_id, &digest[..16])
    } else {
        digest[..32].to_string()
    }
}

/// Whether `job_id` has the shape [`derive_job_id`] gives it, and so is safe
/// to use as a file name.
pub fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id.len() <= 64
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Writes `contents` to `path` through a synced temporary file and a rename.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await?;
    sync_dir(path).await;
    Ok(())
}

#[cfg(unix)]
async fn sync_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        match fs::File::open(parent).await {
            Ok(dir) => {
                if let Err(e) = dir.sync_all().await {
                    debug!("could not sync {}: {}", parent.display(), e);
                }
            }
            Err(e) => debug!("could not open {}: {}", parent.display(), e),
        }
    }
}

#[cfg(not(unix))]
async fn sync_dir(_path: &Path) {}

pub struct JobStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, job_id: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_job_id(job_id) {
            return Err(StoreError::InvalidId(job_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", job_id)))
    }

    fn lock_for(&self, job_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(job_id.to_string()).or_default().clone()
    }

    /// Drops the job's lock entry once no other task holds or waits on it.
    fn release(&self, job_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let idle = locks
            .get(job_id)
            .map(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2)
            .unwrap_or(false);
        if idle {
            locks.remove(job_id);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    async fn read(&self, job_id: &str) -> Result<JobState, StoreError> {
        match fs::read(self.path(job_id)?).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(job_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, job: &JobState) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(job)?;
        write_atomic(&self.path(&job.job_id)?, &data).await?;
        Ok(())
    }

    /// Persists a new job. If a record with the same id already exists it is
    /// returned unchanged.
    pub async fn create(&self, job: JobState) -> Result<JobState, StoreError> {
        self.path(&job.job_id)?;
        let job_id = job.job_id.clone();
        let lock = self.lock_for(&job_id);
        let result = {
            let _guard = lock.lock().await;
            match self.read(&job.job_id).await {
                Ok(existing) => {
                    debug!("job {} already exists", existing.job_id);
                    Ok(existing)
                }
                Err(StoreError::NotFound(_)) => match self.write(&job).await {
                    Ok(()) => {
                        debug!("created job {}", job.job_id);
                        Ok(job)
                    }
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        };
        self.release(&job_id, lock);
        result
    }

    pub async fn load(&self, job_id: &str) -> Result<JobState, StoreError> {
        self.read(job_id).await
    }

    /// Merges `delta` into the stored job. The new record is on disk when
    /// this returns.
    pub async fn update(&self, job_id: &str, delta: JobDelta) -> Result<JobState, StoreError> {
        self.path(job_id)?;
        let lock = self.lock_for(job_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(job_id, &delta).await
        };
        self.release(job_id, lock);
        result
    }

    async fn apply_locked(&self, job_id: &str, delta: &JobDelta) -> Result<JobState, StoreError> {
        let mut job = self.read(job_id).await?;
        job.apply(delta)?;
        self.write(&job).await?;
        Ok(job)
    }

    pub async fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        let path = self.path(job_id)?;
        let lock = self.lock_for(job_id);
        let result = {
            let _guard = lock.lock().await;
            fs::remove_file(&path).await
        };
        self.release(job_id, lock);

        match result {
            Ok(()) => {
                info!("deleted job state {}", job_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(job_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self) -> Result<BTreeMap<String, JobState>, StoreError> {
        let mut jobs = BTreeMap::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(job_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read(job_id).await {
                Ok(job) => {
                    jobs.insert(job.job_id.clone(), job);
                }
                Err(StoreError::NotFound(_)) => (),
                Err(e) => warn!("skipping unreadable job record {}: {}", path.display(), e),
            }
        }

        Ok(jobs)
    }

    pub async fn list_incomplete(&self) -> Result<BTreeMap<String, JobState>, StoreError> {
        let mut jobs = self.list().await?;
        jobs.retain(|_, job| job.status.is_incomplete());
        Ok(jobs)
    }
}
