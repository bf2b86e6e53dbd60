use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::{
    breaker::{CircuitBreaker, State},
    config::{PlatformConfig, SessionConfig},
};

const FALLBACK_PROFILE: &str = "chrome120";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Desktop,
    Mobile,
}

/// Which internal-API client the identity claims to be. The extractor shapes
/// its requests after this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub name: &'static str,
    pub version: String,
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionIdentity {
    pub id: u64,
    pub profile: String,
    /// Sent in this order on every request made with the identity.
    pub headers: Vec<(String, String)>,
    pub device: DeviceClass,
    pub proxy: Option<String>,
    pub client: ClientContext,
    /// Visitor marker minted with the identity and sent as
    /// `X-Goog-Visitor-Id` for as long as it lives.
    pub visitor_id: String,
    pub created_at: DateTime<Utc>,
}

impl SessionIdentity {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("User-Agent")
    }
}

#[derive(Debug, Clone)]
struct Settings {
    proxy: Option<String>,
    mobile: bool,
}

pub struct SessionFactory {
    config: SessionConfig,
    platform: PlatformConfig,
    settings: RwLock<Settings>,
    pool: RwLock<Vec<Arc<SessionIdentity>>>,
    recent: Mutex<VecDeque<String>>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
    retired: AtomicU64,
}

impl SessionFactory {
    pub fn new(config: SessionConfig, platform: PlatformConfig) -> Self {
        let settings = Settings {
            proxy: config.proxy.clone(),
            mobile: config.mobile,
        };
        Self {
            config,
            platform,
            settings: RwLock::new(settings),
            pool: RwLock::new(Vec::new()),
            recent: Mutex::new(VecDeque::new()),
            cursor: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            retired: AtomicU64::new(0),
        }
    }

    /// The active identity, creating the pool on first use.
    pub fn get_session(&self) -> Arc<SessionIdentity> {
        {
            let pool = self.pool.read().unwrap_or_else(|e| e.into_inner());
            if let Some(active) = pool.first() {
                return active.clone();
            }
        }
        let mut pool = self.pool.write().unwrap_or_else(|e| e.into_inner());
        self.fill(&mut pool);
        pool[0].clone()
    }

    /// Retires the `count` oldest identities and activates replacements.
    /// Returns the identity that is active afterwards.
    pub fn rotate(&self, count: usize) -> Arc<SessionIdentity> {
        let mut pool = self.pool.write().unwrap_or_else(|e| e.into_inner());
        let n = count.min(pool.len());
        for old in pool.drain(..n) {
            info!("retiring identity {} ({})", old.id, old.profile);
        }
        self.retired.fetch_add(n as u64, Ordering::Relaxed);
        self.fill(&mut pool);

        let active = pool[0].clone();
        info!("active identity is now {} ({})", active.id, active.profile);
        active
    }

    /// Changes proxy and device class. The current pool is retired so the
    /// next identity reflects the new settings.
    pub fn configure(&self, proxy: Option<String>, mobile: bool) {
        {
            let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
            settings.proxy = proxy;
            settings.mobile = mobile;
        }
        let mut pool = self.pool.write().unwrap_or_else(|e| e.into_inner());
        self.retired.fetch_add(pool.len() as u64, Ordering::Relaxed);
        pool.clear();
        self.recent.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.cursor.store(0, Ordering::Relaxed);
        info!("session settings changed (mobile={})", mobile);
    }

    /// Rotates once if the breaker for `op_class` is currently open.
    pub fn rotate_if_open(&self, breaker: &CircuitBreaker, op_class: &str) -> bool {
        if breaker.snapshot(op_class).state == State::Open {
            warn!("{} circuit is open, rotating identity", op_class);
            self.rotate(1);
            true
        } else {
            false
        }
    }

    pub fn retired_count(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }

    fn fill(&self, pool: &mut Vec<Arc<SessionIdentity>>) {
        let settings = self
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        while pool.len() < self.config.pool_size.max(1) {
            let profile = self.next_profile(pool, settings.mobile);
            let identity = self.build(profile, &settings);
            debug!("created identity {} ({})", identity.id, identity.profile);
            pool.push(Arc::new(identity));
        }
    }

    fn next_profile(&self, pool: &[Arc<SessionIdentity>], mobile: bool) -> String {
        let list = if mobile {
            &self.config.mobile_impersonations
        } else {
            &self.config.impersonations
        };
        if list.is_empty() {
            return FALLBACK_PROFILE.to_string();
        }

        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let start = self.cursor.load(Ordering::Relaxed);
        let fresh = (0..list.len())
            .map(|i| (start + i) % list.len())
            .find(|&idx| {
                let candidate = &list[idx];
                !recent.contains(candidate) && !pool.iter().any(|p| &p.profile == candidate)
            });
        let idx = fresh.unwrap_or(start % list.len());
        self.cursor.store(idx + 1, Ordering::Relaxed);

        let profile = list[idx].clone();
        recent.push_back(profile.clone());
        while recent.len() > self.config.avoid_recent {
            recent.pop_front();
        }
        profile
    }

    fn build(&self, profile: String, settings: &Settings) -> SessionIdentity {
        let device = if settings.mobile {
            DeviceClass::Mobile
        } else {
            DeviceClass::Desktop
        };
        let client = match device {
            DeviceClass::Desktop => ClientContext {
                name: "WEB",
                version: self.config.client_version.clone(),
                origin: self.platform.web_origin.clone(),
            },
            DeviceClass::Mobile => ClientContext {
                name: "MWEB",
                version: self.config.client_version.clone(),
                origin: self.platform.mobile_origin.clone(),
            },
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let created_at = Utc::now();
        let visitor_id = visitor_id(id, &created_at, &profile);
        let mut headers = profile_headers(&profile, device, &client);
        headers.push(("X-Goog-Visitor-Id".to_string(), visitor_id.clone()));

        SessionIdentity {
            id,
            profile,
            headers,
            device,
            proxy: settings.proxy.clone(),
            client,
            visitor_id,
            created_at,
        }
    }
}

fn visitor_id(id: u64, created_at: &DateTime<Utc>, profile: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.to_be_bytes());
    hasher.update(created_at.timestamp().to_be_bytes());
    hasher.update(created_at.timestamp_subsec_nanos().to_be_bytes());
    hasher.update(profile.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(22);
    digest
}

enum Browser {
    Chrome(String),
    Safari(String),
    Firefox(String),
}

fn parse_profile(profile: &str) -> Browser {
    let version: String = profile
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .split(|c: char| c != '_' && !c.is_ascii_digit())
        .next()
        .unwrap_or_default()
        .trim_end_matches('_')
        .to_string();

    if profile.starts_with("safari") {
        let v = if version.is_empty() { "17_0".into() } else { version };
        Browser::Safari(v.replace('_', "."))
    } else if profile.starts_with("firefox") {
        let v = if version.is_empty() { "120".into() } else { version };
        Browser::Firefox(v)
    } else {
        let major = version.split('_').next().unwrap_or_default().to_string();
        Browser::Chrome(if major.is_empty() { "120".into() } else { major })
    }
}

/// The ordered header set a real browser of `profile` would send. Client
/// hints are only emitted for Chromium profiles, matching real browsers.
fn profile_headers(profile: &str, device: DeviceClass, client: &ClientContext) -> Vec<(String, String)> {
    let browser = parse_profile(profile);
    let mobile = device == DeviceClass::Mobile;

    let user_agent = match (&browser, mobile) {
        (Browser::Chrome(v), false) => format!(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.0.0 Safari/537.36",
            v
        ),
        (Browser::Chrome(v), true) => format!(
            "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.0.0 Mobile Safari/537.36",
            v
        ),
        (Browser::Safari(v), false) => format!(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/{} Safari/605.1.15",
            v
        ),
        (Browser::Safari(v), true) => format!(
            "Mozilla/5.0 (iPhone; CPU iPhone OS {} like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/{} Mobile/15E148 Safari/604.1",
            v.replace('.', "_"),
            v
        ),
        (Browser::Firefox(v), false) => format!(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:{}.0) Gecko/20100101 Firefox/{}.0",
            v, v
        ),
        (Browser::Firefox(v), true) => format!(
            "Mozilla/5.0 (Android 14; Mobile; rv:{}.0) Gecko/{}.0 Firefox/{}.0",
            v, v, v
        ),
    };

    let mut headers = vec![("User-Agent".to_string(), user_agent)];
    let mut push = |k: &str, v: &str| headers.push((k.to_string(), v.to_string()));

    if let Browser::Chrome(v) = &browser {
        push(
            "sec-ch-ua",
            &format!(
                r#""Chromium";v="{}", "Not(A:Brand";v="24", "Google Chrome";v="{}""#,
                v, v
            ),
        );
        push("sec-ch-ua-mobile", if mobile { "?1" } else { "?0" });
        push(
            "sec-ch-ua-platform",
            if mobile { r#""Android""# } else { r#""Windows""# },
        );
    }
    push(
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
    );
    push("Accept-Language", "en-US,en;q=0.9");
    if mobile {
        push("X-YouTube-Client-Name", "2");
        push("X-YouTube-Client-Version", &client.version);
        push("Origin", &client.origin);
        push("Referer", &format!("{}/", client.origin));
    } else {
        push("Upgrade-Insecure-Requests", "1");
        push("sec-fetch-dest", "document");
        push("sec-fetch-mode", "navigate");
        push("sec-fetch-site", "none");
        push("sec-fetch-user", "?1");
    }
    headers
}
