use std::sync::Arc;

use crate::{
    breaker::OP_INNERTUBE,
    error::Error,
    player_response::{InitialPlayerResponse, StreamDescriptor, VideoDetails},
    session::{DeviceClass, SessionIdentity},
    util::HttpClient,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub metadata: VideoDetails,
    pub streams: Vec<StreamDescriptor>,
}

/// Turns a video id into metadata and stream descriptors. Platform verdicts
/// (not found, age restricted, ...) come back as [`Error::Extraction`].
#[async_trait::async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn extract(&self, video_id: &str, identity: &SessionIdentity) -> Result<Extraction, Error>;
}

/// Reads the player response embedded in the watch page.
pub struct WatchPageExtractor {
    http: Arc<HttpClient>,
}

impl WatchPageExtractor {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }

    pub fn watch_url(video_id: &str, identity: &SessionIdentity) -> String {
        match identity.device {
            DeviceClass::Desktop => format!("{}/watch?v={}", identity.client.origin, video_id),
            DeviceClass::Mobile => format!(
                "{}/watch?v={}&app=m&persist_app=1",
                identity.client.origin, video_id
            ),
        }
    }
}

#[async_trait::async_trait]
impl MetadataExtractor for WatchPageExtractor {
    async fn extract(&self, video_id: &str, identity: &SessionIdentity) -> Result<Extraction, Error> {
        let url = Self::watch_url(video_id, identity);
        let html = self.http.fetch_text(OP_INNERTUBE, identity, &url).await?;

        let ipr = InitialPlayerResponse::from_html(&html)?;
        ipr.check_playable(video_id)?;

        let metadata = ipr.video_details.clone().ok_or_else(|| {
            Error::NoStream(format!("{}: player response has no video details", video_id))
        })?;
        let streams = ipr.streams();
        debug!(
            "{}: {} streams via {} client",
            video_id,
            streams.len(),
            identity.client.name
        );

        Ok(Extraction { metadata, streams })
    }
}
