use std::{collections::VecDeque, sync::Mutex, time::Duration};

use serde::{Deserialize, Serialize};

use crate::config::RiskConfig;

/// Body fragments that only show up on challenge / CAPTCHA interstitials.
const CHALLENGE_MARKERS: &[&str] = &[
    "www.google.com/recaptcha",
    "g-recaptcha",
    "/sorry/index",
    "unusual traffic from your computer",
    "confirm you're not a bot",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub response_time: Duration,
    /// `0` when no response arrived at all.
    pub status_code: u16,
    pub rate_limited: bool,
    pub captcha_triggered: bool,
    pub identity_used: u64,
}

impl TelemetrySample {
    /// Derives the rate-limit and challenge flags from what came back.
    /// `location` is the redirect target, if any; `body` is only inspected
    /// for text responses.
    pub fn from_response(
        status_code: u16,
        retry_after: bool,
        location: Option<&str>,
        body: Option<&str>,
        response_time: Duration,
        identity_used: u64,
    ) -> Self {
        let rate_limited = status_code == 429 || (status_code == 503 && retry_after);
        let captcha_triggered = location.map(|l| l.contains("/sorry/")).unwrap_or(false)
            || body.map(is_challenge_page).unwrap_or(false);

        Self {
            response_time,
            status_code,
            rate_limited,
            captcha_triggered,
            identity_used,
        }
    }

    fn is_error(&self) -> bool {
        self.status_code == 0 || self.status_code >= 400
    }
}

pub fn is_challenge_page(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub level: RiskLevel,
    pub samples: usize,
}

/// Scores a bounded window of samples into `[0, 1]`, recent samples
/// weighing more.
pub struct RiskScorer {
    config: RiskConfig,
    samples: Mutex<VecDeque<TelemetrySample>>,
}

impl RiskScorer {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(config.window)),
            config,
        }
    }

    pub fn record(&self, sample: TelemetrySample) {
        if sample.rate_limited || sample.captcha_triggered {
            debug!(
                "risk signal from identity {}: HTTP {} rate_limited={} captcha={}",
                sample.identity_used, sample.status_code, sample.rate_limited, sample.captcha_triggered
            );
        }
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.push_back(sample);
        while samples.len() > self.config.window.max(1) {
            samples.pop_front();
        }
    }

    pub fn calculate_risk_score(&self) -> f64 {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        self.score(&samples)
    }

    pub fn current_level(&self) -> RiskLevel {
        self.level(self.calculate_risk_score())
    }

    /// Score and level taken from the same snapshot.
    pub fn assess(&self) -> RiskAssessment {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let score = self.score(&samples);
        RiskAssessment {
            score,
            level: self.level(score),
            samples: samples.len(),
        }
    }

    fn score(&self, samples: &VecDeque<TelemetrySample>) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let cfg = &self.config;
        let decay = cfg.decay.clamp(0.0, 1.0);
        let slow = Duration::from_secs_f64(cfg.slow_response_secs.max(0.0));

        let (mut total, mut rl, mut captcha, mut errors, mut latency) = (0.0, 0.0, 0.0, 0.0, 0.0);
        let mut weight = 1.0;
        // Newest first so the newest sample weighs 1.0.
        for s in samples.iter().rev() {
            total += weight;
            if s.rate_limited {
                rl += weight;
            }
            if s.captcha_triggered {
                captcha += weight;
            }
            if s.is_error() {
                errors += weight;
            }
            if s.response_time > slow {
                latency += weight;
            }
            weight *= decay;
        }
        if total <= 0.0 {
            return 0.0;
        }

        let score = cfg.rate_limit_weight.max(0.0) * rl / total
            + cfg.captcha_weight.max(0.0) * captcha / total
            + cfg.error_weight.max(0.0) * errors / total
            + cfg.latency_weight.max(0.0) * latency / total;
        score.clamp(0.0, 1.0)
    }

    fn level(&self, score: f64) -> RiskLevel {
        let cfg = &self.config;
        if score >= cfg.critical_threshold {
            RiskLevel::Critical
        } else if score >= cfg.high_threshold {
            RiskLevel::High
        } else if score >= cfg.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}
