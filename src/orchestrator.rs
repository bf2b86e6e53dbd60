use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};

use crate::{
    breaker::{CircuitBreaker, CircuitSnapshot, OP_INNERTUBE},
    config::Config,
    downloader::{select_best_stream, target_file_name, ResumableDownloader},
    error::Error,
    extractor::{MetadataExtractor, WatchPageExtractor},
    player::PlayerArtifactCache,
    player_response::{StreamDescriptor, VideoDetails},
    session::{SessionFactory, SessionIdentity},
    store::{derive_job_id, JobState, JobStore},
    telemetry::{RiskAssessment, RiskScorer},
    transport::Transport,
    util::HttpClient,
};

/// Everything known about a video after extraction.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub metadata: VideoDetails,
    pub streams: Vec<StreamDescriptor>,
    /// Set when at least one stream needed the player to be resolved.
    pub player_version_id: Option<String>,
    pub sts: Option<u32>,
    pub risk: RiskAssessment,
    pub identity_id: u64,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOutcome {
    pub video_id: String,
    pub job_id: String,
    pub stream_signature: String,
    pub path: PathBuf,
}

/// Per-id results of a batch, in input order.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub results: Vec<(String, Result<T, Error>)>,
}

impl<T> BatchOutcome<T> {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.results
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (id.as_str(), e)))
    }
}

#[derive(Debug, Default)]
pub struct ResumeReport {
    pub completed: Vec<(String, PathBuf)>,
    pub failed: Vec<(String, Error)>,
    /// Jobs with recorded progress whose files are gone. Their state is kept.
    pub stale: Vec<String>,
}

pub struct Orchestrator {
    config: Config,
    http: Arc<HttpClient>,
    store: Arc<JobStore>,
    sessions: Arc<SessionFactory>,
    player: Arc<PlayerArtifactCache>,
    downloader: ResumableDownloader,
    extractor: Arc<dyn MetadataExtractor>,
}

impl Orchestrator {
    /// Wires up every component over `transport`, with the watch-page
    /// extractor as metadata source.
    pub async fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self, Error> {
        let store = Arc::new(JobStore::open(config.jobs_dir()).await?);
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let telemetry = Arc::new(RiskScorer::new(config.risk.clone()));
        let http = Arc::new(HttpClient::new(
            transport,
            breaker,
            telemetry,
            config.retry.clone(),
        ));
        let sessions = Arc::new(SessionFactory::new(
            config.session.clone(),
            config.platform.clone(),
        ));
        let persist_dir = config.player.persist.then(|| config.artifacts_dir());
        let player = Arc::new(PlayerArtifactCache::new(
            http.clone(),
            sessions.clone(),
            config.player.clone(),
            config.platform.clone(),
            persist_dir,
        ));
        player.sweep_persisted().await;
        let downloader = ResumableDownloader::new(
            http.clone(),
            store.clone(),
            sessions.clone(),
            player.clone(),
            config.download.clone(),
        );
        let extractor = Arc::new(WatchPageExtractor::new(http.clone()));

        Ok(Self {
            config,
            http,
            store,
            sessions,
            player,
            downloader,
            extractor,
        })
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn MetadataExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub async fn extract_video(&self, video_id: &str) -> Result<ExtractionResult, Error> {
        let identity = self.sessions.get_session();
        let extracted = self.extractor.extract(video_id, &identity).await;
        self.maybe_rotate();
        let extraction = extracted?;

        let (player_version_id, sts) = if extraction.streams.iter().any(|s| s.needs_decipher()) {
            let artifact = self.player.current_artifact().await?;
            (
                Some(artifact.player_version_id.clone()),
                Some(artifact.extracted_sts),
            )
        } else {
            (None, None)
        };

        let risk = self.http.telemetry().assess();
        info!(
            "extracted {} ({}): {} streams, risk {:?}",
            video_id,
            extraction.metadata.title,
            extraction.streams.len(),
            risk.level
        );

        Ok(ExtractionResult {
            metadata: extraction.metadata,
            streams: extraction.streams,
            player_version_id,
            sts,
            risk,
            identity_id: identity.id,
            extracted_at: Utc::now(),
        })
    }

    pub async fn extract_and_download(
        &self,
        video_id: &str,
        prefer_codec: Option<&str>,
    ) -> Result<DownloadOutcome, Error> {
        let result = self.extract_video(video_id).await?;
        let stream = select_best_stream(&result.streams, prefer_codec)
            .ok_or_else(|| Error::NoStream(video_id.to_string()))?;

        let signature = stream.signature();
        let job_id = derive_job_id(video_id, &signature);
        let target = self
            .config
            .download
            .output_dir
            .join(target_file_name(video_id, stream));
        info!("{}: downloading itag {} as job {}", video_id, stream.itag, job_id);

        let path = self
            .downloader
            .download_stream(&job_id, stream, &target, video_id)
            .await?;
        Ok(DownloadOutcome {
            video_id: video_id.to_string(),
            job_id,
            stream_signature: signature,
            path,
        })
    }

    pub async fn extract_multiple(
        &self,
        video_ids: &[String],
        max_concurrent: usize,
    ) -> BatchOutcome<ExtractionResult> {
        let results = stream::iter(video_ids)
            .map(|id| async move { (id.clone(), self.extract_video(id).await) })
            .buffered(max_concurrent.max(1))
            .collect::<Vec<_>>()
            .await;
        let outcome = BatchOutcome { results };
        info!(
            "batch extraction: {}/{} succeeded",
            outcome.succeeded(),
            video_ids.len()
        );
        outcome
    }

    pub async fn download_multiple(
        &self,
        video_ids: &[String],
        max_concurrent: usize,
        prefer_codec: Option<&str>,
    ) -> BatchOutcome<DownloadOutcome> {
        let results = stream::iter(video_ids)
            .map(|id| async move { (id.clone(), self.extract_and_download(id, prefer_codec).await) })
            .buffered(max_concurrent.max(1))
            .collect::<Vec<_>>()
            .await;
        let outcome = BatchOutcome { results };
        for (id, e) in outcome.failures() {
            warn!("{}: {}", id, e);
        }
        info!(
            "batch download: {}/{} succeeded",
            outcome.succeeded(),
            video_ids.len()
        );
        outcome
    }

    /// Picks up every unfinished job with a freshly extracted URL for the
    /// same stream. Videos are extracted once per call.
    pub async fn resume_incomplete_jobs(&self) -> Result<ResumeReport, Error> {
        let jobs = self.store.list_incomplete().await?;
        let mut report = ResumeReport::default();
        if jobs.is_empty() {
            debug!("no incomplete jobs");
            return Ok(report);
        }
        info!("resuming {} incomplete job(s)", jobs.len());

        let mut extractions: HashMap<String, ExtractionResult> = HashMap::new();
        for (job_id, job) in jobs {
            if self.is_stale(&job).await {
                warn!(
                    "{}: {} bytes recorded but no file on disk, leaving it alone",
                    job_id, job.bytes_completed
                );
                report.stale.push(job_id);
                continue;
            }

            if !extractions.contains_key(&job.video_id) {
                match self.extract_video(&job.video_id).await {
                    Ok(result) => {
                        extractions.insert(job.video_id.clone(), result);
                    }
                    Err(e) => {
                        warn!("{}: re-extraction failed: {}", job_id, e);
                        report.failed.push((job_id, e));
                        continue;
                    }
                }
            }
            let Some(stream) = extractions
                .get(&job.video_id)
                .and_then(|r| r.streams.iter().find(|s| s.signature() == job.stream_signature))
            else {
                report.failed.push((
                    job_id,
                    Error::NoStream(format!("{} {}", job.video_id, job.stream_signature)),
                ));
                continue;
            };

            info!("{}: resuming at {} bytes", job_id, job.bytes_completed);
            match self
                .downloader
                .download_stream(&job_id, stream, &job.target_path, &job.video_id)
                .await
            {
                Ok(path) => report.completed.push((job_id, path)),
                Err(e) => report.failed.push((job_id, e)),
            }
        }
        Ok(report)
    }

    async fn is_stale(&self, job: &JobState) -> bool {
        job.bytes_completed > 0
            && !exists(&self.downloader.part_path(&job.target_path)).await
            && !exists(&job.target_path).await
    }

    pub async fn incomplete_jobs(&self) -> Result<Vec<JobState>, Error> {
        Ok(self.store.list_incomplete().await?.into_values().collect())
    }

    /// Forgets a job and removes its partial file. A finished target stays.
    pub async fn delete_job(&self, job_id: &str) -> Result<(), Error> {
        let job = self.store.load(job_id).await?;
        let part = self.downloader.part_path(&job.target_path);
        match tokio::fs::remove_file(&part).await {
            Ok(()) => debug!("removed {}", part.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => return Err(e.into()),
        }
        self.store.delete(job_id).await?;
        Ok(())
    }

    pub fn risk(&self) -> RiskAssessment {
        self.http.telemetry().assess()
    }

    pub fn circuit(&self, op_class: &str) -> CircuitSnapshot {
        self.http.breaker().snapshot(op_class)
    }

    pub fn rotate_identity(&self, count: usize) -> Arc<SessionIdentity> {
        self.sessions.rotate(count.max(1))
    }

    fn maybe_rotate(&self) {
        if !self.config.auto_rotate {
            return;
        }
        if self.sessions.rotate_if_open(self.http.breaker(), OP_INNERTUBE) {
            return;
        }
        let level = self.http.telemetry().current_level();
        if level >= self.config.rotate_at {
            info!("risk level {:?}, rotating identity", level);
            self.sessions.rotate(1);
        }
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}
