use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, RANGE},
    redirect,
};
use reqwest_cookie_store::CookieStoreMutex;

use crate::{config::SessionConfig, error::Error, session::SessionIdentity};

/// Clients kept alive for recently used identities.
const MAX_CLIENTS: usize = 8;

pub type BodyStream = BoxStream<'static, Result<Bytes, Error>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: String,
    /// Ask for `bytes=<start>-`.
    pub range_start: Option<u64>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range_start: None,
        }
    }

    pub fn ranged(url: impl Into<String>, start: u64) -> Self {
        Self {
            url: url.into(),
            range_start: Some(start),
        }
    }
}

/// Whether lowercase-keyed `headers` announce an HTML document.
pub fn is_html(headers: &HashMap<String, String>) -> bool {
    headers
        .get("content-type")
        .map(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}

pub struct Response {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub body: BodyStream,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn etag(&self) -> Option<&str> {
        self.header("etag")
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.header("last-modified")
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// `(start, total)` from `Content-Range: bytes start-end/total`. The total
    /// is `None` when the server sends `*`.
    pub fn content_range(&self) -> Option<(u64, Option<u64>)> {
        let value = self.header("content-range")?.trim();
        let rest = value.strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;
        let start = range.split_once('-')?.0.trim().parse().ok()?;
        Some((start, total.trim().parse().ok()))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")?
            .trim()
            .parse()
            .ok()
            .map(Duration::from_secs)
    }

    pub fn is_html(&self) -> bool {
        is_html(&self.headers)
    }

    pub async fn text(self) -> Result<String, Error> {
        read_text(self.body).await
    }
}

/// Drains a body as (lossy) UTF-8.
pub async fn read_text(body: BodyStream) -> Result<String, Error> {
    let chunks: Vec<Bytes> = body.try_collect().await?;
    Ok(String::from_utf8_lossy(&chunks.concat()).into_owned())
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` presenting `identity`. Non-2xx statuses are returned as
    /// responses; only failures to get a response at all are errors.
    async fn send(&self, identity: &SessionIdentity, request: Request) -> Result<Response, Error>;
}

/// reqwest-backed transport with one client (and cookie jar) per identity.
pub struct ReqwestTransport {
    timeout: Duration,
    connect_timeout: Duration,
    clients: Mutex<HashMap<u64, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, identity: &SessionIdentity) -> Result<reqwest::Client, Error> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&identity.id) {
            return Ok(client.clone());
        }

        let client = self.build_client(identity)?;
        if clients.len() >= MAX_CLIENTS {
            if let Some(oldest) = clients.keys().min().copied() {
                clients.remove(&oldest);
            }
        }
        clients.insert(identity.id, client.clone());
        Ok(client)
    }

    fn build_client(&self, identity: &SessionIdentity) -> Result<reqwest::Client, Error> {
        let mut headers = HeaderMap::new();
        for (name, value) in &identity.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::InvalidRequest(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::InvalidRequest(format!("header {}: {}", name, e)))?;
            headers.append(name, value);
        }

        let cookies = Arc::new(CookieStoreMutex::default());
        // Stop on challenge redirects so the caller gets to see them.
        let policy = redirect::Policy::custom(|attempt| {
            if attempt.url().path().starts_with("/sorry/") {
                attempt.stop()
            } else if attempt.previous().len() > 10 {
                attempt.error("too many redirects")
            } else {
                attempt.follow()
            }
        });

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .cookie_provider(cookies)
            .redirect(policy)
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout);
        if let Some(proxy) = &identity.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(Error::from_reqwest)?);
        }

        debug!(
            "built HTTP client for identity {} ({})",
            identity.id, identity.profile
        );
        builder.build().map_err(Error::from_reqwest)
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, identity: &SessionIdentity, request: Request) -> Result<Response, Error> {
        let client = self.client_for(identity)?;
        let mut builder = client.get(&request.url);
        if let Some(start) = request.range_start {
            builder = builder.header(RANGE, format!("bytes={}-", start));
        }

        let resp = builder.send().await.map_err(Error::from_reqwest)?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = resp.bytes_stream().map_err(Error::from_reqwest).boxed();

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}
