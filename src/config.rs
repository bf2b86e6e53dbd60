use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};

use crate::telemetry::RiskLevel;

/// Every tunable of the engine. All sections fall back to their defaults when
/// missing, so a partial document deserializes cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding job state and cached player artifacts.
    pub state_dir: PathBuf,
    /// Rotate the session identity automatically when the risk level reaches
    /// `rotate_at` after an extraction.
    pub auto_rotate: bool,
    pub rotate_at: RiskLevel,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub risk: RiskConfig,
    pub session: SessionConfig,
    pub download: DownloadConfig,
    pub player: PlayerConfig,
    pub platform: PlatformConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".yta_state"),
            auto_rotate: false,
            rotate_at: RiskLevel::High,
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            risk: RiskConfig::default(),
            session: SessionConfig::default(),
            download: DownloadConfig::default(),
            player: PlayerConfig::default(),
            platform: PlatformConfig::default(),
        }
    }
}

impl Config {
    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join("jobs")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.state_dir.join("player_artifacts")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive qualifying failures before the circuit opens.
    pub failure_threshold: u32,
    pub cooldown_secs: f64,
    /// Applied to the cooldown each time a half-open trial fails.
    pub cooldown_multiplier: f64,
    pub max_cooldown_secs: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60.0,
            cooldown_multiplier: 2.0,
            max_cooldown_secs: 600.0,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs.max(0.0))
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.max_cooldown_secs.max(self.cooldown_secs).max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_attempts: usize,
    /// Delay before retry `n` is `factor_ms * base^n`, capped at `max_delay_ms`.
    pub backoff_base: u64,
    pub factor_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2,
            factor_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// The sequence of delays between attempts.
    pub fn strategy(&self) -> impl Iterator<Item = Duration> {
        let jittered = self.jitter;
        ExponentialBackoff::from_millis(self.backoff_base.max(1))
            .factor(self.factor_ms)
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .map(move |d| if jittered { jitter(d) } else { d })
            .take(self.max_attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Number of most recent samples considered.
    pub window: usize,
    /// Weight multiplier per step of age; the newest sample weighs 1.0.
    pub decay: f64,
    pub rate_limit_weight: f64,
    pub captcha_weight: f64,
    pub error_weight: f64,
    pub latency_weight: f64,
    /// Responses slower than this count as anomalous.
    pub slow_response_secs: f64,
    pub medium_threshold: f64,
    pub high_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            window: 50,
            decay: 0.9,
            rate_limit_weight: 0.6,
            captcha_weight: 0.4,
            error_weight: 0.3,
            latency_weight: 0.2,
            slow_response_secs: 2.0,
            medium_threshold: 0.3,
            high_threshold: 0.6,
            critical_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Desktop impersonation profiles, in rotation order.
    pub impersonations: Vec<String>,
    pub mobile_impersonations: Vec<String>,
    /// Identities kept ready; the head of the pool is the active one.
    pub pool_size: usize,
    /// How many recently used profiles rotation tries not to reuse.
    pub avoid_recent: usize,
    pub proxy: Option<String>,
    pub mobile: bool,
    pub client_version: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            impersonations: vec![
                "chrome120".into(),
                "chrome119".into(),
                "safari17_0".into(),
                "safari17_2".into(),
            ],
            mobile_impersonations: vec!["chrome120_android".into(), "safari17_2_ios".into()],
            pool_size: 2,
            avoid_recent: 2,
            proxy: None,
            mobile: false,
            client_version: "2.20250115.01.00".into(),
            timeout_secs: 60,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub output_dir: PathBuf,
    /// Durable checkpoint cadence; at most this many bytes are refetched after a crash.
    pub checkpoint_bytes: u64,
    pub part_suffix: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./downloads"),
            checkpoint_bytes: 4 * 1024 * 1024,
            part_suffix: ".part".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub cache_capacity: usize,
    /// How long the active player is trusted before it is re-synced.
    pub refresh_secs: u64,
    /// Persist extracted artifacts under the state directory.
    pub persist: bool,
    /// Persisted artifacts older than this are ignored.
    pub persisted_ttl_secs: u64,
    /// Page used to discover the currently active player.
    pub discovery_video_id: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10,
            refresh_secs: 3600,
            persist: true,
            persisted_ttl_secs: 3600,
            discovery_video_id: "dQw4w9WgXcQ".into(),
        }
    }
}

impl PlayerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub web_origin: String,
    pub mobile_origin: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            web_origin: "https://www.youtube.com".into(),
            mobile_origin: "https://m.youtube.com".into(),
        }
    }
}
