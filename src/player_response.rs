use serde::{Deserialize, Serialize};
use serde_aux::prelude::*;

// Only the parts of the player response the extractor reads.

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialPlayerResponse {
    pub playability_status: PlayabilityStatus,
    pub streaming_data: Option<StreamingData>,
    pub video_details: Option<VideoDetails>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayabilityStatus {
    pub status: Status,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    LoginRequired,
    AgeCheckRequired,
    ContentCheckRequired,
    Unplayable,
    LiveStreamOffline,
    Error,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingData {
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub expires_in_seconds: Option<i64>,
    #[serde(default)]
    pub formats: Vec<StreamDescriptor>,
    #[serde(default)]
    pub adaptive_formats: Vec<StreamDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetails {
    pub video_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "deserialize_number_from_string")]
    pub length_seconds: i64,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, deserialize_with = "deserialize_number_from_string")]
    pub view_count: i64,
    #[serde(default)]
    pub is_live_content: bool,
}

/// One downloadable format. Either `url` is set, or `signature_cipher`
/// carries the base URL and a scrambled signature that has to be deciphered
/// with the current player's plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescriptor {
    pub itag: u32,
    pub url: Option<String>,
    #[serde(alias = "cipher")]
    pub signature_cipher: Option<String>,
    pub mime_type: String,
    #[serde(default)]
    pub bitrate: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub content_length: Option<u64>,
    pub quality_label: Option<String>,
    pub fps: Option<u32>,
}

impl StreamDescriptor {
    /// Stable identity of the stream across extractions. URLs expire, so
    /// this is built from the format itself.
    pub fn signature(&self) -> String {
        let quality = match self.height {
            Some(h) => h.to_string(),
            None => format!("{}k", self.bitrate / 1000),
        };
        format!("{}:{}:{}", self.itag, self.container_mime(), quality)
    }

    /// `video/mp4` out of `video/mp4; codecs="avc1.640028"`.
    pub fn container_mime(&self) -> &str {
        self.mime_type.split(';').next().unwrap_or_default().trim()
    }

    pub fn extension(&self) -> &str {
        self.container_mime().split('/').nth(1).unwrap_or("bin")
    }

    pub fn codecs(&self) -> &str {
        self.mime_type
            .split_once("codecs=")
            .map(|(_, c)| c.trim_matches(|ch| ch == '"' || ch == ' '))
            .unwrap_or_default()
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    pub fn needs_decipher(&self) -> bool {
        self.url.is_none() && self.signature_cipher.is_some()
    }

    /// The playable URL. For ciphered streams `decipher` is applied to the
    /// scrambled signature and the result is attached under the parameter
    /// name the cipher asks for.
    pub fn resolve_url(&self, decipher: impl FnOnce(&str) -> String) -> Result<String, ExtractionError> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let cipher = self
            .signature_cipher
            .as_deref()
            .ok_or_else(|| ExtractionError::Cipher(format!("itag {} has no url", self.itag)))?;

        let (mut base, mut sig, mut param) = (None, None, None);
        for (k, v) in url::form_urlencoded::parse(cipher.as_bytes()) {
            match k.as_ref() {
                "url" => base = Some(v.into_owned()),
                "s" => sig = Some(v.into_owned()),
                "sp" => param = Some(v.into_owned()),
                _ => (),
            }
        }
        let (Some(base), Some(sig)) = (base, sig) else {
            return Err(ExtractionError::Cipher(format!(
                "itag {} cipher lacks url or s",
                self.itag
            )));
        };

        let mut url = url::Url::parse(&base)
            .map_err(|e| ExtractionError::Cipher(format!("itag {}: {}", self.itag, e)))?;
        url.query_pairs_mut().append_pair(
            param.as_deref().unwrap_or("signature"),
            &decipher(&sig),
        );
        Ok(url.into())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExtractionError {
    #[error("video {0} not found")]
    NotFound(String),
    #[error("video is age restricted: {0}")]
    AgeRestricted(String),
    #[error("video is not available in this region: {0}")]
    GeoBlocked(String),
    #[error("login required: {0}")]
    LoginRequired(String),
    #[error("video is unplayable: {0}")]
    Unplayable(String),
    #[error("Could not find initial player response")]
    NoInitialPlayerResponse,
    #[error("Could not parse initial player response")]
    ParseInitialPlayerResponse(#[from] serde_json::Error),
    #[error("malformed signature cipher: {0}")]
    Cipher(String),
}

const IPR_STRS: &[&str] = &["var ytInitialPlayerResponse =", "ytInitialPlayerResponse ="];

fn get_ipr_str(html: &str) -> Option<&str> {
    // Find the start of the initial player response
    let idx_ipr = IPR_STRS
        .iter()
        .find_map(|marker| html.find(marker).map(|i| i + marker.len()))?;

    // Find the start and end of the JSON object
    let idx_start = html[idx_ipr..].find('{')? + idx_ipr;
    let idx_end = html[idx_start..].find("};")? + idx_start + 1;

    // Bounds check
    if idx_start >= idx_end || idx_start >= html.len() || idx_end >= html.len() {
        return None;
    }

    Some(&html[idx_start..idx_end])
}

impl InitialPlayerResponse {
    pub fn from_html(html: &str) -> Result<Self, ExtractionError> {
        // Find the initial player response
        let ipr_str = get_ipr_str(html).ok_or(ExtractionError::NoInitialPlayerResponse)?;

        // Parse the JSON
        serde_json::from_str(ipr_str).map_err(ExtractionError::ParseInitialPlayerResponse)
    }

    /// Maps the playability verdict onto a typed error.
    pub fn check_playable(&self, video_id: &str) -> Result<(), ExtractionError> {
        let reason = self.playability_status.reason.clone().unwrap_or_default();
        let lower = reason.to_ascii_lowercase();

        match self.playability_status.status {
            Status::Ok => Ok(()),
            Status::AgeCheckRequired | Status::ContentCheckRequired => {
                Err(ExtractionError::AgeRestricted(reason))
            }
            Status::LoginRequired if lower.contains("age") || lower.contains("inappropriate") => {
                Err(ExtractionError::AgeRestricted(reason))
            }
            Status::LoginRequired => Err(ExtractionError::LoginRequired(reason)),
            Status::Unplayable if lower.contains("country") => Err(ExtractionError::GeoBlocked(reason)),
            Status::Error if reason.is_empty() || lower.contains("unavailable") => {
                Err(ExtractionError::NotFound(video_id.to_string()))
            }
            _ => Err(ExtractionError::Unplayable(reason)),
        }
    }

    /// Muxed formats followed by adaptive ones.
    pub fn streams(&self) -> Vec<StreamDescriptor> {
        self.streaming_data
            .as_ref()
            .map(|sd| {
                sd.formats
                    .iter()
                    .chain(sd.adaptive_formats.iter())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
