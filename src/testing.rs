use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use bytes::Bytes;
use futures::{stream, StreamExt};

use crate::{
    config::RetryConfig,
    error::{classify_status, Error},
    extractor::{Extraction, MetadataExtractor},
    player_response::{ExtractionError, StreamDescriptor, VideoDetails},
    session::SessionIdentity,
    transport::{Request, Response, Transport},
};

/// Retries without any delay.
pub(crate) fn fast_retry(max_attempts: usize) -> RetryConfig {
    RetryConfig {
        max_attempts,
        backoff_base: 2,
        factor_ms: 0,
        max_delay_ms: 0,
        jitter: false,
    }
}

pub(crate) fn media(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct Resource {
    body: Bytes,
    content_type: String,
    etag: Option<String>,
    ranges: bool,
}

enum Failure {
    Status(u16),
    Connect,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<String, Resource>,
    failures: VecDeque<Failure>,
    cut_after: Option<usize>,
    requests: Vec<Request>,
}

/// Serves registered resources with range support. Failures and body cuts
/// are scripted ahead of the requests they should hit.
pub(crate) struct MockTransport {
    inner: Mutex<Inner>,
    chunk_size: usize,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::with_chunk_size(64 * 1024)
    }

    pub(crate) fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            chunk_size: chunk_size.max(1),
        }
    }

    fn add(&self, url: &str, resource: Resource) {
        self.inner
            .lock()
            .unwrap()
            .resources
            .insert(url.to_string(), resource);
    }

    pub(crate) fn add_page(&self, url: &str, html: &str) {
        self.add_text(url, html, "text/html; charset=utf-8");
    }

    pub(crate) fn add_text(&self, url: &str, text: &str, content_type: &str) {
        self.add(
            url,
            Resource {
                body: Bytes::from(text.to_string()),
                content_type: content_type.to_string(),
                etag: None,
                ranges: false,
            },
        );
    }

    /// Registers (or replaces) a ranged media resource.
    pub(crate) fn add_media(&self, url: &str, body: Vec<u8>, etag: Option<&str>) {
        self.add(
            url,
            Resource {
                body: Bytes::from(body),
                content_type: "video/mp4".into(),
                etag: etag.map(str::to_string),
                ranges: true,
            },
        );
    }

    pub(crate) fn ignore_ranges(&self, url: &str) {
        if let Some(r) = self.inner.lock().unwrap().resources.get_mut(url) {
            r.ranges = false;
        }
    }

    /// The next `n` requests get `status` with an empty body.
    pub(crate) fn fail_next(&self, n: usize, status: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures.extend((0..n).map(|_| Failure::Status(status)));
    }

    pub(crate) fn fail_connect(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures.extend((0..n).map(|_| Failure::Connect));
    }

    /// The next successful body breaks off after `bytes`.
    pub(crate) fn cut_next_body(&self, bytes: usize) {
        self.inner.lock().unwrap().cut_after = Some(bytes);
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.inner.lock().unwrap().requests.len()
    }

    fn empty(status: u16, headers: HashMap<String, String>) -> Response {
        Response {
            status,
            headers,
            body: stream::empty().boxed(),
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, _identity: &SessionIdentity, request: Request) -> Result<Response, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.requests.push(request.clone());

        match inner.failures.pop_front() {
            Some(Failure::Status(status)) => return Ok(Self::empty(status, HashMap::new())),
            Some(Failure::Connect) => {
                return Err(Error::TransientNetwork("connection refused".into()))
            }
            None => (),
        }

        let Some(resource) = inner.resources.get(&request.url) else {
            return Ok(Self::empty(404, HashMap::new()));
        };
        let total = resource.body.len();
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), resource.content_type.clone());
        if let Some(etag) = &resource.etag {
            headers.insert("etag".to_string(), etag.clone());
        }

        let (status, body) = match request.range_start {
            Some(start) if resource.ranges => {
                let start = start as usize;
                if start >= total {
                    headers.insert("content-range".to_string(), format!("bytes */{}", total));
                    return Ok(Self::empty(416, headers));
                }
                headers.insert(
                    "content-range".to_string(),
                    format!("bytes {}-{}/{}", start, total - 1, total),
                );
                (206, resource.body.slice(start..))
            }
            _ => (200, resource.body.clone()),
        };
        headers.insert("content-length".to_string(), body.len().to_string());

        let mut chunks: Vec<Result<Bytes, Error>> = Vec::new();
        let limit = if status == 200 || status == 206 {
            inner.cut_after.take()
        } else {
            None
        };
        let deliver = limit.map(|l| l.min(body.len())).unwrap_or(body.len());
        let mut offset = 0;
        while offset < deliver {
            let end = (offset + self.chunk_size).min(deliver);
            chunks.push(Ok(body.slice(offset..end)));
            offset = end;
        }
        if limit.is_some() {
            chunks.push(Err(Error::TransientNetwork("connection reset by peer".into())));
        }

        Ok(Response {
            status,
            headers,
            body: stream::iter(chunks).boxed(),
        })
    }
}

/// Answers extractions from a fixed table; unknown ids are "not found".
pub(crate) struct MockExtractor {
    videos: Mutex<HashMap<String, Extraction>>,
    statuses: Mutex<HashMap<String, u16>>,
    calls: AtomicUsize,
    identities: Mutex<Vec<u64>>,
}

impl MockExtractor {
    pub(crate) fn new() -> Self {
        Self {
            videos: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            identities: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, video_id: &str, streams: Vec<StreamDescriptor>) {
        let metadata = VideoDetails {
            video_id: video_id.to_string(),
            title: format!("Video {}", video_id),
            length_seconds: 60,
            channel_id: "UC1".into(),
            author: "someone".into(),
            view_count: 1,
            is_live_content: false,
        };
        self.videos
            .lock()
            .unwrap()
            .insert(video_id.to_string(), Extraction { metadata, streams });
    }

    /// Extraction of `video_id` answers with an HTTP failure.
    pub(crate) fn fail_with(&self, video_id: &str, status: u16) {
        self.statuses
            .lock()
            .unwrap()
            .insert(video_id.to_string(), status);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn identities(&self) -> Vec<u64> {
        self.identities.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl MetadataExtractor for MockExtractor {
    async fn extract(&self, video_id: &str, identity: &SessionIdentity) -> Result<Extraction, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.identities.lock().unwrap().push(identity.id);

        if let Some(status) = self.statuses.lock().unwrap().get(video_id) {
            if let Some(e) = classify_status(*status, None) {
                return Err(e);
            }
        }
        self.videos
            .lock()
            .unwrap()
            .get(video_id)
            .cloned()
            .ok_or_else(|| ExtractionError::NotFound(video_id.to_string()).into())
    }
}

/// A direct-URL stream descriptor.
pub(crate) fn stream(itag: u32, url: &str, height: Option<u32>, content_length: Option<u64>) -> StreamDescriptor {
    StreamDescriptor {
        itag,
        url: Some(url.to_string()),
        signature_cipher: None,
        mime_type: match height {
            Some(_) => "video/mp4; codecs=\"avc1.640028\"".into(),
            None => "audio/mp4; codecs=\"mp4a.40.2\"".into(),
        },
        bitrate: 1_000_000,
        width: height.map(|h| h * 16 / 9),
        height,
        content_length,
        quality_label: height.map(|h| format!("{}p", h)),
        fps: height.map(|_| 30),
    }
}
