use std::{collections::HashMap, future::Future, sync::Mutex, time::Duration};

use tokio::time::Instant;
use tokio_retry::RetryIf;

use crate::{
    config::{BreakerConfig, RetryConfig},
    error::Error,
};

pub const OP_INNERTUBE: &str = "innertube_api";
pub const OP_PLAYER: &str = "player_fetch";
pub const OP_DOWNLOAD: &str = "download_chunk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Server(u16),
    RateLimited,
    Challenge,
    Client(u16),
}

impl FailureKind {
    /// Client errors other than 429 point at the request shape, not at
    /// platform load, so they never trip the circuit.
    pub fn is_qualifying(&self) -> bool {
        !matches!(self, FailureKind::Client(_))
    }
}

#[derive(Debug, Clone)]
struct CircuitState {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
}

impl CircuitState {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown: config.cooldown(),
            trial_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub state: State,
    pub consecutive_failures: u32,
    pub cooldown: Duration,
}

/// One CLOSED / OPEN / HALF_OPEN machine per operation class. Check
/// [`CircuitBreaker::allow`] before every attempt and report the outcome
/// afterwards.
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn with_circuit<R>(&self, op_class: &str, f: impl FnOnce(&mut CircuitState) -> R) -> R {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let circuit = circuits
            .entry(op_class.to_string())
            .or_insert_with(|| CircuitState::new(&self.config));
        f(circuit)
    }

    /// Whether a call of `op_class` may be attempted now. In HALF_OPEN this
    /// hands out a single trial slot.
    pub fn allow(&self, op_class: &str) -> bool {
        self.with_circuit(op_class, |c| match c.state {
            State::Closed => true,
            State::Open => {
                let elapsed = c.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed < c.cooldown {
                    return false;
                }
                info!("[breaker:{}] half-open, admitting a trial call", op_class);
                c.state = State::HalfOpen;
                c.trial_in_flight = true;
                true
            }
            State::HalfOpen => {
                if c.trial_in_flight {
                    false
                } else {
                    c.trial_in_flight = true;
                    true
                }
            }
        })
    }

    pub fn record_success(&self, op_class: &str) {
        let base = self.config.cooldown();
        self.with_circuit(op_class, |c| {
            if c.state != State::Closed {
                info!("[breaker:{}] closed", op_class);
            }
            c.state = State::Closed;
            c.consecutive_failures = 0;
            c.opened_at = None;
            c.cooldown = base;
            c.trial_in_flight = false;
        })
    }

    pub fn record_failure(&self, op_class: &str, kind: FailureKind) {
        if !kind.is_qualifying() {
            self.release(op_class);
            return;
        }
        let threshold = self.config.failure_threshold.max(1);
        let multiplier = self.config.cooldown_multiplier.max(1.0);
        let max_cooldown = self.config.max_cooldown();
        self.with_circuit(op_class, |c| {
            c.consecutive_failures = c.consecutive_failures.saturating_add(1);
            match c.state {
                State::HalfOpen => {
                    c.cooldown = c.cooldown.mul_f64(multiplier).min(max_cooldown);
                    c.state = State::Open;
                    c.opened_at = Some(Instant::now());
                    c.trial_in_flight = false;
                    warn!(
                        "[breaker:{}] trial failed ({:?}), reopened for {:?}",
                        op_class, kind, c.cooldown
                    );
                }
                State::Closed if c.consecutive_failures >= threshold => {
                    c.state = State::Open;
                    c.opened_at = Some(Instant::now());
                    warn!(
                        "[breaker:{}] opened after {} consecutive failures ({:?})",
                        op_class, c.consecutive_failures, kind
                    );
                }
                _ => (),
            }
        })
    }

    /// Returns a half-open trial slot when the call ended without telling us
    /// anything about the platform's health.
    pub fn release(&self, op_class: &str) {
        self.with_circuit(op_class, |c| c.trial_in_flight = false)
    }

    pub fn snapshot(&self, op_class: &str) -> CircuitSnapshot {
        self.with_circuit(op_class, |c| CircuitSnapshot {
            state: c.state,
            consecutive_failures: c.consecutive_failures,
            cooldown: c.cooldown,
        })
    }

    /// Runs `op` under this breaker, retrying retryable failures with
    /// exponential backoff. Every attempt goes through `allow`; an open
    /// circuit ends the loop with [`Error::CircuitOpen`].
    pub async fn run<T, F, Fut>(&self, op_class: &str, retry: &RetryConfig, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let action = move || {
            let attempt = if self.allow(op_class) { Some(op()) } else { None };
            async move {
                let Some(fut) = attempt else {
                    return Err(Error::CircuitOpen(op_class.to_string()));
                };
                let result = fut.await;
                match &result {
                    Ok(_) => self.record_success(op_class),
                    Err(e) => {
                        debug!("[breaker:{}] attempt failed: {}", op_class, e);
                        match e.failure_kind() {
                            Some(kind) => self.record_failure(op_class, kind),
                            None => self.release(op_class),
                        }
                    }
                }
                result
            }
        };

        RetryIf::spawn(retry.strategy(), action, Error::is_retryable).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn breaker(threshold: u32, cooldown_secs: f64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown_secs,
            cooldown_multiplier: 2.0,
            max_cooldown_secs: 600.0,
        })
    }

    #[test]
    fn sixth_through_tenth_attempts_are_rejected() {
        let cb = breaker(5, 60.0);
        let mut network_calls = 0;
        let mut rejected = 0;

        for _ in 0..10 {
            if cb.allow(OP_DOWNLOAD) {
                network_calls += 1;
                cb.record_failure(OP_DOWNLOAD, FailureKind::Network);
            } else {
                rejected += 1;
            }
        }

        assert_eq!(network_calls, 5);
        assert_eq!(rejected, 5);
        assert_eq!(cb.snapshot(OP_DOWNLOAD).state, State::Open);
    }

    #[test]
    fn client_errors_do_not_trip() {
        let cb = breaker(2, 60.0);
        for _ in 0..5 {
            assert!(cb.allow(OP_INNERTUBE));
            cb.record_failure(OP_INNERTUBE, FailureKind::Client(404));
        }
        assert_eq!(cb.snapshot(OP_INNERTUBE).state, State::Closed);

        cb.record_failure(OP_INNERTUBE, FailureKind::RateLimited);
        cb.record_failure(OP_INNERTUBE, FailureKind::Server(503));
        assert_eq!(cb.snapshot(OP_INNERTUBE).state, State::Open);
    }

    #[test]
    fn op_classes_are_independent() {
        let cb = breaker(1, 60.0);
        cb.record_failure(OP_DOWNLOAD, FailureKind::Network);

        assert!(!cb.allow(OP_DOWNLOAD));
        assert!(cb.allow(OP_INNERTUBE));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_resets_counter() {
        let cb = breaker(3, 30.0);
        for _ in 0..3 {
            cb.record_failure(OP_DOWNLOAD, FailureKind::Network);
        }
        assert!(!cb.allow(OP_DOWNLOAD));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!cb.allow(OP_DOWNLOAD));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cb.allow(OP_DOWNLOAD));
        assert_eq!(cb.snapshot(OP_DOWNLOAD).state, State::HalfOpen);
        // Exactly one trial.
        assert!(!cb.allow(OP_DOWNLOAD));

        cb.record_success(OP_DOWNLOAD);
        let snap = cb.snapshot(OP_DOWNLOAD);
        assert_eq!(snap.state, State::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(cb.allow(OP_DOWNLOAD));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_with_longer_cooldown() {
        let cb = breaker(1, 10.0);
        cb.record_failure(OP_PLAYER, FailureKind::Network);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cb.allow(OP_PLAYER));
        cb.record_failure(OP_PLAYER, FailureKind::Server(500));

        let snap = cb.snapshot(OP_PLAYER);
        assert_eq!(snap.state, State::Open);
        assert_eq!(snap.cooldown, Duration::from_secs(20));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!cb.allow(OP_PLAYER));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.allow(OP_PLAYER));
    }

    #[test]
    fn released_trial_can_be_retaken() {
        let cb = breaker(1, 0.0);
        cb.record_failure(OP_PLAYER, FailureKind::Network);
        assert!(cb.allow(OP_PLAYER));
        assert!(!cb.allow(OP_PLAYER));

        cb.record_failure(OP_PLAYER, FailureKind::Client(403));
        assert_eq!(cb.snapshot(OP_PLAYER).state, State::HalfOpen);
        assert!(cb.allow(OP_PLAYER));
    }

    #[test]
    fn concurrent_failures_are_not_lost() {
        let cb = Arc::new(breaker(10_000, 60.0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cb.record_failure(OP_DOWNLOAD, FailureKind::Network);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cb.snapshot(OP_DOWNLOAD).consecutive_failures, 800);
    }

    fn fast_retry(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff_base: 2,
            factor_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn run_stops_issuing_calls_once_open() {
        let cb = breaker(5, 60.0);
        let calls = AtomicUsize::new(0);

        let result: Result<(), Error> = cb
            .run(OP_DOWNLOAD, &fast_retry(9), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::TransientNetwork("connection reset".into())) }
            })
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn run_does_not_retry_permanent_errors() {
        let cb = breaker(5, 60.0);
        let calls = AtomicUsize::new(0);

        let result: Result<(), Error> = cb
            .run(OP_INNERTUBE, &fast_retry(3), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::PermanentClient(404)) }
            })
            .await;

        assert!(matches!(result, Err(Error::PermanentClient(404))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cb.snapshot(OP_INNERTUBE).consecutive_failures, 0);
    }

    #[tokio::test]
    async fn run_recovers_after_transient_failures() {
        let cb = breaker(5, 60.0);
        let calls = AtomicUsize::new(0);

        let result = cb
            .run(OP_INNERTUBE, &fast_retry(3), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::ServerError(502))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(cb.snapshot(OP_INNERTUBE).consecutive_failures, 0);
    }
}
