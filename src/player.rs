use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{fs, time::Instant};

use crate::{
    breaker::OP_PLAYER,
    config::{PlatformConfig, PlayerConfig},
    error::Error,
    session::SessionFactory,
    store::{write_atomic, StoreError},
    util::HttpClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "n", rename_all = "snake_case")]
pub enum DecipherOp {
    Reverse,
    /// Drop the first `n` characters.
    Slice(usize),
    /// Swap the first character with the one at `n % len`.
    Swap(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecipherPlan(pub Vec<DecipherOp>);

impl DecipherPlan {
    pub fn apply(&self, input: &str) -> String {
        let mut a: Vec<char> = input.chars().collect();
        for op in &self.0 {
            match *op {
                DecipherOp::Reverse => a.reverse(),
                DecipherOp::Slice(n) => {
                    a.drain(..n.min(a.len()));
                }
                DecipherOp::Swap(n) => {
                    if !a.is_empty() {
                        let i = n % a.len();
                        a.swap(0, i);
                    }
                }
            }
        }
        a.into_iter().collect()
    }
}

/// Immutable once extracted. A new player release is a new artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerArtifact {
    pub player_version_id: String,
    pub player_url: String,
    pub extracted_sts: u32,
    pub decipher_plan: DecipherPlan,
    pub extracted_at: DateTime<Utc>,
}

lazy_static! {
    static ref PLAYER_URL_RE: Regex =
        Regex::new(r#""(?:jsUrl|PLAYER_JS_URL)"\s*:\s*"([^"]+?base\.js)""#).unwrap();
    static ref PLAYER_VERSION_RE: Regex = Regex::new(r"/s/player/([a-zA-Z0-9_-]+)/").unwrap();
    static ref DECIPHER_NAME_RES: Vec<Regex> = [
        r"\.sig\|\|([a-zA-Z0-9$]+)\(",
        r"signature=([a-zA-Z0-9$]+)\(",
        r"\.s\)\s*&&\s*\w+\.set\([^,]+,\s*([a-zA-Z0-9$]+)\(",
        r"\bc&&\(c=([a-zA-Z0-9$]{2,})\(decodeURIComponent\(c\)\)",
        r#"([a-zA-Z0-9$]+)\s*=\s*function\(\s*a\s*\)\s*\{\s*a\s*=\s*a\.split\(\s*""\s*\)"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect();
    static ref CALL_RE: Regex = Regex::new(
        r#"^([a-zA-Z0-9$]+)(?:\.([a-zA-Z0-9$]+)|\["([a-zA-Z0-9$]+)"\])\(\s*\w+\s*,\s*(\d+)\s*\)$"#
    )
    .unwrap();
    static ref METHOD_RE: Regex =
        Regex::new(r#""?([a-zA-Z0-9$]+)"?\s*:\s*function\s*\([^)]*\)\s*\{([^}]*)\}"#).unwrap();
    static ref STS_RE: Regex =
        Regex::new(r#"(?:signatureTimestamp|sts)["']?\s*:\s*(\d{5})"#).unwrap();
}

/// Absolute player script URL referenced by a watch page.
pub fn find_player_url(html: &str, origin: &str) -> Option<String> {
    let path = PLAYER_URL_RE.captures(html)?.get(1)?.as_str().replace("\\/", "/");
    if path.starts_with("http") {
        Some(path)
    } else if path.starts_with("//") {
        Some(format!("https:{}", path))
    } else {
        Some(format!("{}{}", origin.trim_end_matches('/'), path))
    }
}

pub fn player_version_from_url(url: &str) -> Option<String> {
    PLAYER_VERSION_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone, Copy)]
enum Primitive {
    Reverse,
    Slice,
    Swap,
}

fn classify_method(body: &str) -> Option<Primitive> {
    if body.contains("reverse") {
        Some(Primitive::Reverse)
    } else if body.contains("splice") || body.contains("slice") {
        Some(Primitive::Slice)
    } else if body.contains('%') && body.contains("length") {
        Some(Primitive::Swap)
    } else {
        None
    }
}

fn decipher_plan(js: &str) -> Result<DecipherPlan, String> {
    let name = DECIPHER_NAME_RES
        .iter()
        .find_map(|re| re.captures(js).and_then(|c| c.get(1)))
        .map(|m| m.as_str())
        .ok_or("decipher function name not found")?;

    let name = regex::escape(name);
    let fn_re = Regex::new(&format!(
        r"(?:^|[^a-zA-Z0-9$.])(?:function\s+{name}|{name}\s*=\s*function)\s*\(\s*\w+\s*\)\s*\{{([^}}]+)\}}",
        name = name
    ))
    .map_err(|e| e.to_string())?;
    let body = fn_re
        .captures(js)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| format!("body of {} not found", name))?;

    let mut object: Option<&str> = None;
    let mut calls = Vec::new();
    for stmt in body.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        if stmt.contains(".split(") || stmt.starts_with("return") {
            continue;
        }
        let caps = CALL_RE
            .captures(stmt)
            .ok_or_else(|| format!("unrecognised statement `{}`", stmt))?;
        let obj = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let method = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let arg: usize = caps[4].parse().map_err(|_| format!("bad argument in `{}`", stmt))?;

        match object {
            Some(o) if o != obj => return Err(format!("calls span {} and {}", o, obj)),
            _ => object = Some(obj),
        }
        calls.push((method, arg));
    }
    let object = object.ok_or("decipher function makes no helper calls")?;

    let obj_re = Regex::new(&format!(
        r"(?s)var\s+{}\s*=\s*\{{(.*?)\}};",
        regex::escape(object)
    ))
    .map_err(|e| e.to_string())?;
    let helpers = obj_re
        .captures(js)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| format!("helper object {} not found", object))?;

    let mut methods = HashMap::new();
    for caps in METHOD_RE.captures_iter(helpers) {
        if let Some(kind) = classify_method(&caps[2]) {
            methods.insert(caps[1].to_string(), kind);
        }
    }

    calls
        .into_iter()
        .map(|(method, arg)| match methods.get(method) {
            Some(Primitive::Reverse) => Ok(DecipherOp::Reverse),
            Some(Primitive::Slice) => Ok(DecipherOp::Slice(arg)),
            Some(Primitive::Swap) => Ok(DecipherOp::Swap(arg)),
            None => Err(format!("helper {}.{} not understood", object, method)),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(DecipherPlan)
}

/// Extracts the artifact of one player release. Any missing piece means the
/// player format has drifted away from the known patterns.
pub fn extract_artifact(player_version_id: &str, player_url: &str, js: &str) -> Result<PlayerArtifact, Error> {
    let drift = |detail: String| Error::PlayerFormatDrift {
        player_version_id: player_version_id.to_string(),
        detail,
    };

    let extracted_sts = STS_RE
        .captures(js)
        .and_then(|c| c[1].parse().ok())
        .ok_or_else(|| drift("signature timestamp not found".into()))?;
    let decipher_plan = decipher_plan(js).map_err(drift)?;

    Ok(PlayerArtifact {
        player_version_id: player_version_id.to_string(),
        player_url: player_url.to_string(),
        extracted_sts,
        decipher_plan,
        extracted_at: Utc::now(),
    })
}

struct Slot {
    artifact: Arc<PlayerArtifact>,
    tick: u64,
}

/// Arena of artifacts plus an access-order index. Only entries nobody else
/// holds an `Arc` to are evicted.
struct Lru {
    capacity: usize,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    order: BTreeMap<u64, usize>,
    tick: u64,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn bump(&mut self, idx: usize) {
        self.tick += 1;
        if let Some(slot) = self.slots[idx].as_mut() {
            self.order.remove(&slot.tick);
            slot.tick = self.tick;
            self.order.insert(self.tick, idx);
        }
    }

    fn get(&mut self, version: &str) -> Option<Arc<PlayerArtifact>> {
        let idx = *self.index.get(version)?;
        self.bump(idx);
        self.slots[idx].as_ref().map(|s| s.artifact.clone())
    }

    fn insert(&mut self, artifact: PlayerArtifact) -> Arc<PlayerArtifact> {
        let artifact = Arc::new(artifact);
        let version = artifact.player_version_id.clone();
        let idx = match self.index.get(&version) {
            Some(&idx) => idx,
            None => {
                let idx = self.free.pop().unwrap_or_else(|| {
                    self.slots.push(None);
                    self.slots.len() - 1
                });
                self.index.insert(version, idx);
                idx
            }
        };
        if let Some(old) = self.slots[idx].take() {
            self.order.remove(&old.tick);
        }
        self.slots[idx] = Some(Slot {
            artifact: artifact.clone(),
            tick: 0,
        });
        self.bump(idx);
        self.evict_idle();
        artifact
    }

    fn evict_idle(&mut self) {
        while self.index.len() > self.capacity {
            let victim = self.order.values().copied().find(|&idx| {
                self.slots[idx]
                    .as_ref()
                    .map(|s| Arc::strong_count(&s.artifact) == 1)
                    .unwrap_or(false)
            });
            let Some(idx) = victim else {
                debug!("player cache over capacity, every entry is in use");
                break;
            };
            match self.slots[idx].take() {
                Some(slot) => {
                    self.order.remove(&slot.tick);
                    self.index.remove(&slot.artifact.player_version_id);
                    self.free.push(idx);
                    debug!("evicted player artifact {}", slot.artifact.player_version_id);
                }
                None => break,
            }
        }
    }
}

pub struct PlayerArtifactCache {
    http: Arc<HttpClient>,
    sessions: Arc<SessionFactory>,
    config: PlayerConfig,
    platform: PlatformConfig,
    persist_dir: Option<PathBuf>,
    lru: Mutex<Lru>,
    drifted: Mutex<HashMap<String, String>>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    current: tokio::sync::Mutex<Option<(Arc<PlayerArtifact>, Instant)>>,
    extractions: AtomicUsize,
}

impl PlayerArtifactCache {
    pub fn new(
        http: Arc<HttpClient>,
        sessions: Arc<SessionFactory>,
        config: PlayerConfig,
        platform: PlatformConfig,
        persist_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            http,
            sessions,
            lru: Mutex::new(Lru::new(config.cache_capacity)),
            config,
            platform,
            persist_dir,
            drifted: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            current: tokio::sync::Mutex::new(None),
            extractions: AtomicUsize::new(0),
        }
    }

    /// Number of extractions run so far, successful or not.
    pub fn extraction_count(&self) -> usize {
        self.extractions.load(Ordering::Relaxed)
    }

    /// A cached artifact, marked as most recently used. The entry cannot be
    /// evicted while the returned `Arc` is alive.
    pub fn acquire(&self, player_version_id: &str) -> Option<Arc<PlayerArtifact>> {
        self.lru
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(player_version_id)
    }

    pub fn apply_decipher(&self, artifact: &PlayerArtifact, input: &str) -> String {
        artifact.decipher_plan.apply(input)
    }

    pub async fn get_or_extract(&self, player_version_id: &str) -> Result<Arc<PlayerArtifact>, Error> {
        if let Some(artifact) = self.acquire(player_version_id) {
            return Ok(artifact);
        }
        let url = format!(
            "{}/s/player/{}/player_ias.vflset/en_US/base.js",
            self.platform.web_origin, player_version_id
        );
        self.load_or_extract(player_version_id, &url, false).await
    }

    /// Discovers the active player and extracts it, bypassing the cache.
    pub async fn sync_player_artifact(&self) -> Result<Arc<PlayerArtifact>, Error> {
        let identity = self.sessions.get_session();
        let page = format!(
            "{}/watch?v={}",
            self.platform.web_origin, self.config.discovery_video_id
        );
        let html = self.http.fetch_text(OP_PLAYER, &identity, &page).await?;

        let unknown = |detail: &str| Error::PlayerFormatDrift {
            player_version_id: "unknown".into(),
            detail: detail.into(),
        };
        let player_url = find_player_url(&html, &self.platform.web_origin)
            .ok_or_else(|| unknown("player URL not found on watch page"))?;
        let version = player_version_from_url(&player_url)
            .ok_or_else(|| unknown("player URL carries no version"))?;

        info!("active player is {}", version);
        self.load_or_extract(&version, &player_url, true).await
    }

    /// The active player's artifact, re-synced once the refresh interval
    /// has passed. A failed re-sync keeps serving the previous artifact.
    pub async fn current_artifact(&self) -> Result<Arc<PlayerArtifact>, Error> {
        let mut current = self.current.lock().await;
        if let Some((artifact, synced_at)) = current.as_ref() {
            if synced_at.elapsed() < self.config.refresh_interval() {
                return Ok(artifact.clone());
            }
        }

        match self.sync_player_artifact().await {
            Ok(artifact) => {
                *current = Some((artifact.clone(), Instant::now()));
                Ok(artifact)
            }
            Err(e) => match current.as_ref() {
                Some((artifact, _)) => {
                    warn!(
                        "player sync failed ({}), keeping {}",
                        e, artifact.player_version_id
                    );
                    Ok(artifact.clone())
                }
                None => Err(e),
            },
        }
    }

    fn inflight_lock(&self, version: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.entry(version.to_string()).or_default().clone()
    }

    /// Drops the version's entry once nobody else holds or waits on it.
    fn release_inflight(&self, version: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        let idle = inflight
            .get(version)
            .map(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2)
            .unwrap_or(false);
        if idle {
            inflight.remove(version);
        }
    }

    async fn load_or_extract(
        &self,
        version: &str,
        player_url: &str,
        force: bool,
    ) -> Result<Arc<PlayerArtifact>, Error> {
        let lock = self.inflight_lock(version);
        let result = {
            let _guard = lock.lock().await;
            self.extract_exclusive(version, player_url, force).await
        };
        self.release_inflight(version, lock);
        result
    }

    async fn extract_exclusive(
        &self,
        version: &str,
        player_url: &str,
        force: bool,
    ) -> Result<Arc<PlayerArtifact>, Error> {
        if !force {
            if let Some(artifact) = self.acquire(version) {
                return Ok(artifact);
            }
        }
        // Same version, same script: a drifted version is never worth refetching.
        if let Some(detail) = self
            .drifted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(version)
        {
            return Err(Error::PlayerFormatDrift {
                player_version_id: version.to_string(),
                detail: detail.clone(),
            });
        }
        if !force {
            if let Some(artifact) = self.load_persisted(version).await {
                debug!("loaded persisted player artifact {}", version);
                return Ok(self.insert(artifact));
            }
        }

        let identity = self.sessions.get_session();
        let js = self.http.fetch_text(OP_PLAYER, &identity, player_url).await?;

        self.extractions.fetch_add(1, Ordering::Relaxed);
        let (v, u) = (version.to_string(), player_url.to_string());
        let extracted = tokio::task::spawn_blocking(move || extract_artifact(&v, &u, &js))
            .await
            .map_err(|e| Error::PlayerFormatDrift {
                player_version_id: version.to_string(),
                detail: format!("extraction task failed: {}", e),
            })?;

        match extracted {
            Ok(artifact) => {
                info!(
                    "extracted player {} (sts={}, {} ops)",
                    version,
                    artifact.extracted_sts,
                    artifact.decipher_plan.0.len()
                );
                self.persist(&artifact).await;
                Ok(self.insert(artifact))
            }
            Err(Error::PlayerFormatDrift {
                player_version_id,
                detail,
            }) => {
                error!("player {} no longer matches: {}", player_version_id, detail);
                self.drifted
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(player_version_id.clone(), detail.clone());
                Err(Error::PlayerFormatDrift {
                    player_version_id,
                    detail,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn insert(&self, artifact: PlayerArtifact) -> Arc<PlayerArtifact> {
        self.lru
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(artifact)
    }

    fn persisted_path(&self, version: &str) -> Option<PathBuf> {
        let safe = version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe || version.is_empty() {
            return None;
        }
        self.persist_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", version)))
    }

    async fn load_persisted(&self, version: &str) -> Option<PlayerArtifact> {
        let path = self.persisted_path(version)?;
        let data = fs::read(&path).await.ok()?;
        let artifact: PlayerArtifact = match serde_json::from_slice(&data) {
            Ok(a) => a,
            Err(e) => {
                warn!("ignoring unreadable {}: {}", path.display(), e);
                return None;
            }
        };

        if self.expired(&artifact) {
            debug!("persisted player artifact {} expired", version);
            if let Err(e) = fs::remove_file(&path).await {
                warn!("could not remove {}: {}", path.display(), e);
            }
            return None;
        }
        Some(artifact)
    }

    fn expired(&self, artifact: &PlayerArtifact) -> bool {
        let age = Utc::now().signed_duration_since(artifact.extracted_at);
        age.num_seconds() >= self.config.persisted_ttl_secs as i64
    }

    /// Deletes persisted artifacts that are past their TTL or no longer
    /// parse. Returns how many files were removed.
    pub async fn sweep_persisted(&self) -> usize {
        let Some(dir) = self.persist_dir.as_ref() else {
            return 0;
        };
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("could not read {}: {}", dir.display(), e);
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let path = match entries.next_entry().await {
                Ok(Some(entry)) => entry.path(),
                Ok(None) => break,
                Err(e) => {
                    warn!("could not list {}: {}", dir.display(), e);
                    break;
                }
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stale = match fs::read(&path).await {
                Ok(data) => match serde_json::from_slice::<PlayerArtifact>(&data) {
                    Ok(artifact) => self.expired(&artifact),
                    Err(_) => true,
                },
                Err(_) => continue,
            };
            if stale {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("could not remove {}: {}", path.display(), e),
                }
            }
        }
        if removed > 0 {
            info!("removed {} expired player artifacts", removed);
        }
        removed
    }

    async fn persist(&self, artifact: &PlayerArtifact) {
        let Some(path) = self.persisted_path(&artifact.player_version_id) else {
            return;
        };
        let result = async {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).await?;
            }
            let data = serde_json::to_vec_pretty(artifact).map_err(StoreError::Serde)?;
            write_atomic(&path, &data).await?;
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!("could not persist player artifact: {}", e);
        }
    }
}
