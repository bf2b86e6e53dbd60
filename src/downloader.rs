//! Ranged, checkpointed transfers.
//!
//! Bytes go to `<target>.part`. The job record's `bytes_completed` only moves
//! forward after the part file has been synced up to that offset, so on
//! resume everything past the checkpoint is cut off and fetched again with a
//! `Range` request. The part file is renamed onto the target once the byte
//! count matches the remote total.

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::StreamExt;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};

use crate::{
    breaker::OP_DOWNLOAD,
    config::DownloadConfig,
    error::Error,
    player::PlayerArtifactCache,
    player_response::StreamDescriptor,
    session::SessionFactory,
    store::{JobDelta, JobState, JobStatus, JobStore, StoreError},
    transport::Request,
    util::{format_bytes, HttpClient},
};

pub struct ResumableDownloader {
    http: Arc<HttpClient>,
    store: Arc<JobStore>,
    sessions: Arc<SessionFactory>,
    player: Arc<PlayerArtifactCache>,
    config: DownloadConfig,
}

impl ResumableDownloader {
    pub fn new(
        http: Arc<HttpClient>,
        store: Arc<JobStore>,
        sessions: Arc<SessionFactory>,
        player: Arc<PlayerArtifactCache>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            http,
            store,
            sessions,
            player,
            config,
        }
    }

    pub fn part_path(&self, target_path: &Path) -> PathBuf {
        let mut name = target_path.as_os_str().to_owned();
        name.push(&self.config.part_suffix);
        PathBuf::from(name)
    }

    /// Downloads `stream` to `target_path`, resuming the job's previous
    /// progress when there is any.
    pub async fn download_stream(
        &self,
        job_id: &str,
        stream: &StreamDescriptor,
        target_path: &Path,
        video_id: &str,
    ) -> Result<PathBuf, Error> {
        let url = self.resolve_url(stream).await?;
        let mut job = self.open_job(job_id, stream, target_path, video_id).await?;
        let part = self.part_path(target_path);
        if let Some(dir) = part.parent() {
            fs::create_dir_all(dir).await?;
        }

        if job.status == JobStatus::Completed {
            if same_len(file_len(target_path).await?, job.total_bytes) {
                debug!("{}: already complete", job_id);
                return Ok(target_path.to_path_buf());
            }
            warn!("{}: completed file is gone, downloading again", job_id);
            job = self.store.update(job_id, JobDelta::restart()).await?;
        }
        if let Some(total) = job.total_bytes.filter(|&t| t > 0 && t == job.bytes_completed) {
            if same_len(file_len(target_path).await?, Some(total)) {
                self.store
                    .update(job_id, JobDelta::status(JobStatus::Completed))
                    .await?;
                return Ok(target_path.to_path_buf());
            }
            if file_len(&part).await?.map(|l| l >= total).unwrap_or(false) {
                info!("{}: finishing interrupted download", job_id);
                let file = OpenOptions::new().write(true).open(&part).await?;
                file.set_len(total).await?;
                file.sync_all().await?;
                return self.finalize(&job, &part, target_path).await;
            }
        }

        let mut restarted = false;
        loop {
            let outcome = match self.transfer(&mut job, &url, &part).await {
                Ok(()) => self.verify(&job, &part).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => return self.finalize(&job, &part, target_path).await,
                Err(Error::ResourceChanged(reason)) if !restarted => {
                    warn!("{}: {}, restarting from zero", job_id, reason);
                    restarted = true;
                    job = self.store.update(job_id, JobDelta::restart()).await?;
                    remove_if_exists(&part).await?;
                }
                Err(e) => return Err(self.settle_failure(job_id, e).await),
            }
        }
    }

    async fn resolve_url(&self, stream: &StreamDescriptor) -> Result<String, Error> {
        if !stream.needs_decipher() {
            return Ok(stream.resolve_url(|s| s.to_string())?);
        }
        let artifact = self.player.current_artifact().await?;
        let url = stream.resolve_url(|s| self.player.apply_decipher(&artifact, s))?;
        debug!(
            "itag {} deciphered with player {}",
            stream.itag, artifact.player_version_id
        );
        Ok(url)
    }

    async fn open_job(
        &self,
        job_id: &str,
        stream: &StreamDescriptor,
        target_path: &Path,
        video_id: &str,
    ) -> Result<JobState, Error> {
        match self.store.load(job_id).await {
            Ok(job) => Ok(job),
            Err(StoreError::NotFound(_)) => {
                let mut job = JobState::new(
                    video_id,
                    &stream.signature(),
                    target_path,
                    stream.content_length,
                );
                job.job_id = job_id.to_string();
                Ok(self.store.create(job).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Attempts under the breaker until the body is complete, a
    /// non-retryable error occurs or the retry budget runs out.
    async fn transfer(&self, job: &mut JobState, url: &str, part: &Path) -> Result<(), Error> {
        let breaker = self.http.breaker();
        let mut delays = self.http.retry().strategy();

        loop {
            if !breaker.allow(OP_DOWNLOAD) {
                return Err(Error::CircuitOpen(OP_DOWNLOAD.to_string()));
            }
            let result = self.attempt(job, url, part).await;
            match &result {
                Ok(()) => breaker.record_success(OP_DOWNLOAD),
                Err(e) => match e.failure_kind() {
                    Some(kind) => breaker.record_failure(OP_DOWNLOAD, kind),
                    None => breaker.release(OP_DOWNLOAD),
                },
            }

            match result {
                Err(e) if e.is_retryable() => match delays.next() {
                    Some(delay) => {
                        info!(
                            "{}: {} at {}, retrying in {:?}",
                            job.job_id,
                            e,
                            format_bytes(job.bytes_completed),
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                other => return other,
            }
        }
    }

    async fn attempt(&self, job: &mut JobState, url: &str, part: &Path) -> Result<(), Error> {
        let identity = self.sessions.get_session();
        let mut offset = self.checkpointed_offset(job, part).await?;
        let request = if offset > 0 {
            Request::ranged(url, offset)
        } else {
            Request::get(url)
        };

        let resp = match self.http.open_media(&identity, request).await {
            Err(Error::PermanentClient(416)) if offset > 0 => {
                return Err(Error::ResourceChanged(format!(
                    "range from {} not satisfiable",
                    offset
                )))
            }
            other => other?,
        };

        if offset > 0 && resp.status == 200 {
            warn!("{}: server ignored the range, restarting", job.job_id);
            *job = self.store.update(&job.job_id, JobDelta::restart()).await?;
            offset = 0;
        }
        let total = match resp.content_range() {
            Some((start, total)) if resp.status == 206 => {
                if start != offset {
                    return Err(Error::ResourceChanged(format!(
                        "asked for offset {}, got {}",
                        offset, start
                    )));
                }
                total
            }
            _ => resp.content_length().map(|len| len + offset),
        };

        if offset > 0 {
            if let (Some(old), Some(new)) = (job.etag_or_fingerprint.as_deref(), resp.etag()) {
                if old != new {
                    return Err(Error::ResourceChanged(format!("etag {} became {}", old, new)));
                }
            }
            if let (Some(old), Some(new)) = (job.total_bytes, total) {
                if old != new {
                    return Err(Error::ResourceChanged(format!("size {} became {}", old, new)));
                }
            }
        }

        *job = self
            .store
            .update(
                &job.job_id,
                JobDelta {
                    status: Some(JobStatus::InProgress),
                    total_bytes: total,
                    etag: resp.etag().map(str::to_string),
                    last_modified: resp.last_modified().map(str::to_string),
                    new_attempt: true,
                    ..Default::default()
                },
            )
            .await?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(part)
            .await?;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut written = offset;
        let mut since_checkpoint = 0u64;
        let mut body = resp.body;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.checkpoint(job, &mut file, written).await?;
                    return Err(e);
                }
            };
            if let Some(total) = job.total_bytes {
                if written + chunk.len() as u64 > total {
                    return Err(Error::ResourceChanged(format!("body overflows {} bytes", total)));
                }
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            since_checkpoint += chunk.len() as u64;

            if since_checkpoint >= self.config.checkpoint_bytes {
                self.checkpoint(job, &mut file, written).await?;
                since_checkpoint = 0;
            }
        }
        self.checkpoint(job, &mut file, written).await?;

        match job.total_bytes {
            Some(total) if written < total => Err(Error::TransientNetwork(format!(
                "body ended at {} of {}",
                written, total
            ))),
            Some(_) => Ok(()),
            None => {
                *job = self
                    .store
                    .update(
                        &job.job_id,
                        JobDelta {
                            total_bytes: Some(written),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Where the next request starts. A part file shorter than the durable
    /// checkpoint cannot be trusted and the job starts over.
    async fn checkpointed_offset(&self, job: &mut JobState, part: &Path) -> Result<u64, Error> {
        let offset = job.bytes_completed;
        if offset == 0 {
            return Ok(0);
        }
        let on_disk = file_len(part).await?.unwrap_or(0);
        if on_disk < offset {
            warn!(
                "{}: part file holds {} of {} checkpointed bytes, restarting",
                job.job_id, on_disk, offset
            );
            *job = self.store.update(&job.job_id, JobDelta::restart()).await?;
            return Ok(0);
        }
        Ok(offset)
    }

    async fn checkpoint(&self, job: &mut JobState, file: &mut File, written: u64) -> Result<(), Error> {
        file.flush().await?;
        file.sync_data().await?;
        if written != job.bytes_completed {
            *job = self
                .store
                .update(&job.job_id, JobDelta::progress(written))
                .await?;
            debug!("{}: checkpoint at {}", job.job_id, format_bytes(written));
        }
        Ok(())
    }

    async fn verify(&self, job: &JobState, part: &Path) -> Result<(), Error> {
        let on_disk = file_len(part).await?.unwrap_or(0);
        match job.total_bytes {
            Some(total) if total == job.bytes_completed && total == on_disk => Ok(()),
            total => Err(Error::ResourceChanged(format!(
                "have {} bytes ({} on disk), expected {:?}",
                job.bytes_completed, on_disk, total
            ))),
        }
    }

    async fn finalize(&self, job: &JobState, part: &Path, target_path: &Path) -> Result<PathBuf, Error> {
        fs::rename(part, target_path).await?;
        self.store
            .update(&job.job_id, JobDelta::status(JobStatus::Completed))
            .await?;
        info!(
            "{}: completed {} ({})",
            job.job_id,
            target_path.display(),
            format_bytes(job.bytes_completed)
        );
        Ok(target_path.to_path_buf())
    }

    /// Records why the job stopped. Anything that may clear up on its own
    /// leaves the job resumable.
    async fn settle_failure(&self, job_id: &str, e: Error) -> Error {
        if matches!(e, Error::Storage(_)) {
            return e;
        }
        let resumable = e.is_retryable()
            || matches!(
                e,
                Error::CircuitOpen(_) | Error::ChallengeDetected | Error::ResourceChanged(_)
            );
        let status = if resumable {
            JobStatus::Paused
        } else {
            JobStatus::Failed
        };
        warn!("{}: {:?} after {}", job_id, status, e);

        let delta = JobDelta::status(status).with_error(e.to_string());
        if let Err(store_err) = self.store.update(job_id, delta).await {
            error!("{}: could not record failure: {}", job_id, store_err);
        }
        e
    }
}

async fn file_len(path: &Path) -> Result<Option<u64>, Error> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn same_len(on_disk: Option<u64>, expected: Option<u64>) -> bool {
    matches!((on_disk, expected), (Some(a), Some(b)) if a == b)
}

async fn remove_if_exists(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn codec_family(stream: &StreamDescriptor) -> &'static str {
    let codecs = stream.codecs().to_ascii_lowercase();
    if codecs.starts_with("vp9") || codecs.starts_with("vp09") {
        "vp9"
    } else if codecs.starts_with("av01") {
        "av1"
    } else if codecs.starts_with("avc1") {
        "h264"
    } else if stream.is_audio() {
        "audio"
    } else {
        "unknown"
    }
}

/// Highest resolution, then bitrate, among video streams. A codec
/// preference narrows the choice when any stream matches it.
pub fn select_best_stream<'a>(
    streams: &'a [StreamDescriptor],
    prefer_codec: Option<&str>,
) -> Option<&'a StreamDescriptor> {
    let videos: Vec<&StreamDescriptor> = streams.iter().filter(|s| s.is_video()).collect();
    let preferred: Vec<&StreamDescriptor> = match prefer_codec.map(str::to_ascii_lowercase) {
        Some(codec) => videos
            .iter()
            .copied()
            .filter(|s| codec_family(s) == codec || s.mime_type.to_ascii_lowercase().contains(&codec))
            .collect(),
        None => Vec::new(),
    };
    let pool = if preferred.is_empty() { videos } else { preferred };

    pool.into_iter()
        .max_by_key(|s| (s.height.unwrap_or(0), s.bitrate))
}

/// `<video>_<quality>_<codec>.<ext>`, e.g. `V1_1080p_h264.mp4`.
pub fn target_file_name(video_id: &str, stream: &StreamDescriptor) -> String {
    let quality = stream
        .height
        .map(|h| format!("{}p", h))
        .unwrap_or_else(|| "unknown".into());
    format!(
        "{}_{}_{}.{}",
        video_id,
        quality,
        codec_family(stream),
        stream.extension()
    )
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::{
        breaker::{CircuitBreaker, State},
        config::{BreakerConfig, RiskConfig},
        player::tests::{cache_with, PLAYER_JS, PLAYER_URL},
        store::derive_job_id,
        telemetry::RiskScorer,
        testing::{fast_retry, media, stream, MockTransport},
    };

    use super::*;

    const URL: &str = "https://rr1.example/videoplayback?itag=137";

    struct Harness {
        transport: Arc<MockTransport>,
        store: Arc<JobStore>,
        breaker: Arc<CircuitBreaker>,
        downloader: ResumableDownloader,
        dir: TempDir,
    }

    impl Harness {
        fn target(&self) -> PathBuf {
            self.dir.path().join("out").join("V1_1080p_h264.mp4")
        }

        async fn seed(&self, stream: &StreamDescriptor, bytes: &[u8], etag: Option<&str>) -> String {
            let job_id = derive_job_id("V1", &stream.signature());
            let job = JobState::new("V1", &stream.signature(), &self.target(), stream.content_length);
            self.store.create(job).await.unwrap();
            self.store
                .update(
                    &job_id,
                    JobDelta {
                        status: Some(JobStatus::InProgress),
                        bytes_completed: Some(bytes.len() as u64),
                        etag: etag.map(str::to_string),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            std::fs::create_dir_all(self.target().parent().unwrap()).unwrap();
            std::fs::write(self.downloader.part_path(&self.target()), bytes).unwrap();
            job_id
        }
    }

    async fn harness(transport: MockTransport, threshold: u32, retries: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(transport);
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            ..Default::default()
        }));
        let http = Arc::new(HttpClient::new(
            transport.clone(),
            breaker.clone(),
            Arc::new(RiskScorer::new(RiskConfig::default())),
            fast_retry(retries),
        ));
        let store = Arc::new(JobStore::open(dir.path().join("jobs")).await.unwrap());
        let sessions = Arc::new(SessionFactory::new(Default::default(), Default::default()));
        let player = Arc::new(cache_with(transport.clone(), 4, None));
        let downloader = ResumableDownloader::new(
            http,
            store.clone(),
            sessions,
            player,
            DownloadConfig {
                output_dir: dir.path().join("out"),
                checkpoint_bytes: 100_000,
                part_suffix: ".part".into(),
            },
        );

        Harness {
            transport,
            store,
            breaker,
            downloader,
            dir,
        }
    }

    #[tokio::test]
    async fn fresh_download_completes() {
        let content = media(300_000);
        let h = harness(MockTransport::new(), 5, 3).await;
        h.transport.add_media(URL, content.clone(), Some("\"v1\""));
        let s = stream(137, URL, Some(1080), Some(300_000));
        let job_id = derive_job_id("V1", &s.signature());

        let path = h
            .downloader
            .download_stream(&job_id, &s, &h.target(), "V1")
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), content);
        assert!(!h.downloader.part_path(&path).exists());
        let job = h.store.load(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.bytes_completed, 300_000);
        assert_eq!(job.etag_or_fingerprint.as_deref(), Some("\"v1\""));
        assert_eq!(job.attempt_count, 1);
        assert_eq!(h.transport.requests()[0].range_start, None);
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_with_range() {
        let content = media(1_000_000);
        let h = harness(MockTransport::new(), 5, 3).await;
        h.transport.add_media(URL, content.clone(), Some("\"v1\""));
        let s = stream(137, URL, Some(1080), Some(1_000_000));
        let job_id = h.seed(&s, &content[..500_000], Some("\"v1\"")).await;

        let path = h
            .downloader
            .download_stream(&job_id, &s, &h.target(), "V1")
            .await
            .unwrap();

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].range_start, Some(500_000));
        assert_eq!(std::fs::read(&path).unwrap(), content);
        let job = h.store.load(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.bytes_completed, 1_000_000);
        assert_eq!(job.total_bytes, Some(1_000_000));
    }

    #[tokio::test]
    async fn interrupted_transfer_resumes_byte_identical() {
        let content = media(1_000_000);
        let h = harness(MockTransport::with_chunk_size(10_000), 5, 0).await;
        h.transport.add_media(URL, content.clone(), Some("\"v1\""));
        h.transport.cut_next_body(350_000);
        let s = stream(137, URL, Some(1080), Some(1_000_000));
        let job_id = derive_job_id("V1", &s.signature());

        let first = h.downloader.download_stream(&job_id, &s, &h.target(), "V1").await;
        assert!(matches!(first, Err(Error::TransientNetwork(_))));
        let job = h.store.load(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.bytes_completed, 350_000);

        // Bytes written after the last durable checkpoint, as a crash would leave them.
        let part = h.downloader.part_path(&h.target());
        let mut leftover = std::fs::read(&part).unwrap();
        leftover.extend_from_slice(&[0xAA; 4096]);
        std::fs::write(&part, leftover).unwrap();

        let path = h
            .downloader
            .download_stream(&job_id, &s, &h.target(), "V1")
            .await
            .unwrap();
        assert_eq!(h.transport.requests()[1].range_start, Some(350_000));
        assert_eq!(std::fs::read(&path).unwrap(), content);
    }

    #[tokio::test]
    async fn transient_cut_is_retried_within_one_call() {
        let content = media(500_000);
        let h = harness(MockTransport::with_chunk_size(10_000), 5, 3).await;
        h.transport.add_media(URL, content.clone(), None);
        h.transport.cut_next_body(120_000);
        let s = stream(137, URL, Some(1080), Some(500_000));
        let job_id = derive_job_id("V1", &s.signature());

        let path = h
            .downloader
            .download_stream(&job_id, &s, &h.target(), "V1")
            .await
            .unwrap();

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].range_start, Some(120_000));
        assert_eq!(std::fs::read(&path).unwrap(), content);
        assert_eq!(h.store.load(&job_id).await.unwrap().attempt_count, 2);
    }

    #[tokio::test]
    async fn changed_etag_restarts_from_zero() {
        let old = media(1_000_000);
        let new: Vec<u8> = old.iter().map(|b| b.wrapping_add(1)).collect();
        let h = harness(MockTransport::new(), 5, 3).await;
        h.transport.add_media(URL, new.clone(), Some("\"v2\""));
        let s = stream(137, URL, Some(1080), Some(1_000_000));
        let job_id = h.seed(&s, &old[..500_000], Some("\"v1\"")).await;

        let path = h
            .downloader
            .download_stream(&job_id, &s, &h.target(), "V1")
            .await
            .unwrap();

        let requests = h.transport.requests();
        assert_eq!(requests[0].range_start, Some(500_000));
        assert_eq!(requests[1].range_start, None);
        assert_eq!(std::fs::read(&path).unwrap(), new);
        let job = h.store.load(&job_id).await.unwrap();
        assert_eq!(job.etag_or_fingerprint.as_deref(), Some("\"v2\""));
    }

    #[tokio::test]
    async fn unsatisfiable_range_restarts() {
        let content = media(200_000);
        let h = harness(MockTransport::new(), 5, 3).await;
        h.transport.add_media(URL, content.clone(), None);
        let s = stream(137, URL, Some(1080), None);
        let job_id = h.seed(&s, &media(300_000), None).await;

        let path = h
            .downloader
            .download_stream(&job_id, &s, &h.target(), "V1")
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), content);
        assert_eq!(h.breaker.snapshot(OP_DOWNLOAD).consecutive_failures, 0);
    }

    #[tokio::test]
    async fn ignored_range_restarts_in_place() {
        let content = media(400_000);
        let h = harness(MockTransport::new(), 5, 3).await;
        h.transport.add_media(URL, content.clone(), None);
        h.transport.ignore_ranges(URL);
        let s = stream(137, URL, Some(1080), Some(400_000));
        let job_id = h.seed(&s, &content[..100_000], None).await;

        let path = h
            .downloader
            .download_stream(&job_id, &s, &h.target(), "V1")
            .await
            .unwrap();
        assert_eq!(h.transport.request_count(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), content);
    }

    #[tokio::test]
    async fn connection_failures_are_retried() {
        let content = media(80_000);
        let h = harness(MockTransport::new(), 5, 3).await;
        h.transport.add_media(URL, content.clone(), None);
        h.transport.fail_connect(2);
        let s = stream(137, URL, Some(1080), Some(80_000));
        let job_id = derive_job_id("V1", &s.signature());

        let path = h
            .downloader
            .download_stream(&job_id, &s, &h.target(), "V1")
            .await
            .unwrap();
        assert_eq!(h.transport.request_count(), 3);
        assert_eq!(std::fs::read(&path).unwrap(), content);
        assert_eq!(h.breaker.snapshot(OP_DOWNLOAD).consecutive_failures, 0);
    }

    #[tokio::test]
    async fn open_breaker_pauses_the_job() {
        let h = harness(MockTransport::new(), 2, 5).await;
        h.transport.add_media(URL, media(100_000), None);
        h.transport.fail_next(10, 503);
        let s = stream(137, URL, Some(1080), Some(100_000));
        let job_id = derive_job_id("V1", &s.signature());

        let result = h.downloader.download_stream(&job_id, &s, &h.target(), "V1").await;

        assert!(matches!(result, Err(Error::CircuitOpen(_))));
        assert_eq!(h.transport.request_count(), 2);
        assert_eq!(h.breaker.snapshot(OP_DOWNLOAD).state, State::Open);
        let job = h.store.load(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert!(job.status.is_incomplete());
    }

    #[tokio::test]
    async fn permanent_errors_fail_the_job() {
        let h = harness(MockTransport::new(), 5, 3).await;
        h.transport.fail_next(1, 403);
        let s = stream(137, URL, Some(1080), Some(100_000));
        let job_id = derive_job_id("V1", &s.signature());

        let result = h.downloader.download_stream(&job_id, &s, &h.target(), "V1").await;

        assert!(matches!(result, Err(Error::PermanentClient(403))));
        assert_eq!(h.transport.request_count(), 1);
        let job = h.store.load(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("403"));
    }

    #[tokio::test]
    async fn completed_job_is_not_downloaded_again() {
        let content = media(50_000);
        let h = harness(MockTransport::new(), 5, 3).await;
        h.transport.add_media(URL, content, None);
        let s = stream(137, URL, Some(1080), Some(50_000));
        let job_id = derive_job_id("V1", &s.signature());

        h.downloader.download_stream(&job_id, &s, &h.target(), "V1").await.unwrap();
        h.downloader.download_stream(&job_id, &s, &h.target(), "V1").await.unwrap();
        assert_eq!(h.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn interrupted_rename_is_finished() {
        let content = media(50_000);
        let h = harness(MockTransport::new(), 5, 3).await;
        let s = stream(137, URL, Some(1080), Some(50_000));
        let job_id = h.seed(&s, &content, None).await;

        let path = h
            .downloader
            .download_stream(&job_id, &s, &h.target(), "V1")
            .await
            .unwrap();
        assert_eq!(h.transport.request_count(), 0);
        assert_eq!(std::fs::read(&path).unwrap(), content);
        assert_eq!(h.store.load(&job_id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn ciphered_stream_is_deciphered_first() {
        let content = media(10_000);
        let h = harness(MockTransport::new(), 5, 3).await;
        h.transport.add_page(
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            r#"<script>var cfg = {"jsUrl":"/s/player/abc123/player_ias.vflset/en_US/base.js"};</script>"#,
        );
        h.transport.add_text(PLAYER_URL, PLAYER_JS, "text/javascript");
        let resolved = "https://rr1.example/videoplayback?itag=137&sig=kyxwvutsrqponmlzjihgfedcba";
        h.transport.add_media(resolved, content.clone(), None);

        let mut s = stream(137, URL, Some(1080), Some(10_000));
        s.url = None;
        s.signature_cipher = Some(
            "s=-abcdefghijklmnopqrstuvwxyz&sp=sig&url=https%3A%2F%2Frr1.example%2Fvideoplayback%3Fitag%3D137".into(),
        );
        let job_id = derive_job_id("V1", &s.signature());

        let path = h
            .downloader
            .download_stream(&job_id, &s, &h.target(), "V1")
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), content);
        assert_eq!(h.transport.requests().last().unwrap().url, resolved);
    }

    #[test]
    fn best_stream_selection() {
        let mut vp9 = stream(248, "https://x/248", Some(1080), None);
        vp9.mime_type = "video/webm; codecs=\"vp9\"".into();
        vp9.bitrate = 2_000_000;
        let h264_1080 = stream(137, "https://x/137", Some(1080), None);
        let h264_720 = stream(136, "https://x/136", Some(720), None);
        let audio = stream(140, "https://x/140", None, None);
        let streams = vec![audio, h264_720, h264_1080, vp9];

        assert_eq!(select_best_stream(&streams, None).unwrap().itag, 248);
        assert_eq!(select_best_stream(&streams, Some("h264")).unwrap().itag, 137);
        assert_eq!(select_best_stream(&streams, Some("av1")).unwrap().itag, 248);
        assert!(select_best_stream(&streams[..1], None).is_none());

        assert_eq!(target_file_name("V1", &streams[2]), "V1_1080p_h264.mp4");
        assert_eq!(target_file_name("V1", &streams[3]), "V1_1080p_vp9.webm");
    }
}
