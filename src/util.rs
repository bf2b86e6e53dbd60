use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    breaker::CircuitBreaker,
    config::RetryConfig,
    error::{classify_status, Error},
    session::SessionIdentity,
    telemetry::{RiskScorer, TelemetrySample},
    transport::{self, read_text, Request, Response, Transport},
};

/// The transport plus everything that has to watch it: every response is
/// scored, challenge pages become errors and text fetches are gated by the
/// breaker.
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    breaker: Arc<CircuitBreaker>,
    telemetry: Arc<RiskScorer>,
    retry: RetryConfig,
}

impl HttpClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        breaker: Arc<CircuitBreaker>,
        telemetry: Arc<RiskScorer>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            breaker,
            telemetry,
            retry,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn telemetry(&self) -> &Arc<RiskScorer> {
        &self.telemetry
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Fetches a text resource under `op_class`, retrying transient failures.
    pub async fn fetch_text(
        &self,
        op_class: &str,
        identity: &SessionIdentity,
        url: &str,
    ) -> Result<String, Error> {
        self.breaker
            .run(op_class, &self.retry, || async move {
                let started = Instant::now();
                let Response {
                    status,
                    headers,
                    body,
                } = self.exchange(identity, Request::get(url)).await?;

                if !(200..300).contains(&status) {
                    self.observe(identity, status, &headers, started.elapsed(), None, false)?;
                    return Err(Error::PermanentClient(status));
                }
                match read_text(body).await {
                    Ok(text) => {
                        self.observe(identity, status, &headers, started.elapsed(), Some(&text), false)?;
                        Ok(text)
                    }
                    Err(e) => {
                        self.record_no_response(identity, started.elapsed());
                        Err(e)
                    }
                }
            })
            .await
    }

    /// One attempt at a media request. The caller owns breaker accounting
    /// and retries. A 2xx HTML answer is a challenge, not media.
    pub async fn open_media(
        &self,
        identity: &SessionIdentity,
        request: Request,
    ) -> Result<Response, Error> {
        let started = Instant::now();
        let resp = self.exchange(identity, request).await?;
        self.observe(identity, resp.status, &resp.headers, started.elapsed(), None, true)?;
        Ok(resp)
    }

    async fn exchange(&self, identity: &SessionIdentity, request: Request) -> Result<Response, Error> {
        let started = Instant::now();
        match self.transport.send(identity, request).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                self.record_no_response(identity, started.elapsed());
                Err(e)
            }
        }
    }

    fn record_no_response(&self, identity: &SessionIdentity, elapsed: Duration) {
        self.telemetry.record(TelemetrySample {
            response_time: elapsed,
            status_code: 0,
            rate_limited: false,
            captcha_triggered: false,
            identity_used: identity.id,
        });
    }

    /// Records the response and maps it onto the error taxonomy. Only 2xx
    /// responses that are not challenges come back as `Ok`.
    fn observe(
        &self,
        identity: &SessionIdentity,
        status: u16,
        headers: &HashMap<String, String>,
        elapsed: Duration,
        body: Option<&str>,
        media: bool,
    ) -> Result<(), Error> {
        let retry_after = headers
            .get("retry-after")
            .and_then(|v| v.trim().parse().ok())
            .map(Duration::from_secs);
        let mut sample = TelemetrySample::from_response(
            status,
            retry_after.is_some(),
            headers.get("location").map(String::as_str),
            body,
            elapsed,
            identity.id,
        );
        if media && (200..300).contains(&status) {
            sample.captcha_triggered |= transport::is_html(headers);
        }
        let challenged = sample.captcha_triggered;
        self.telemetry.record(sample);

        if challenged {
            warn!("challenge page served to identity {}", identity.id);
            return Err(Error::ChallengeDetected);
        }
        if let Some(e) = classify_status(status, retry_after) {
            return Err(e);
        }
        if !(200..300).contains(&status) {
            return Err(Error::PermanentClient(status));
        }
        Ok(())
    }
}

pub fn format_bytes(bytes: u64) -> String {
    let mut bytes = bytes as f64;
    let mut suffix = "B";

    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "KiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "MiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "GiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "TiB";
    }

    format!("{:.2} {}", bytes, suffix)
}

#[cfg(test)]
mod tests {
    use crate::{
        breaker::{State, OP_INNERTUBE},
        config::{BreakerConfig, RiskConfig},
        session::SessionFactory,
        testing::{fast_retry, MockTransport},
    };

    use super::*;

    fn client(transport: Arc<MockTransport>) -> HttpClient {
        HttpClient::new(
            transport,
            Arc::new(CircuitBreaker::new(BreakerConfig {
                failure_threshold: 3,
                ..Default::default()
            })),
            Arc::new(RiskScorer::new(RiskConfig::default())),
            fast_retry(5),
        )
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1_048_576), "1024.00 KiB");
        assert_eq!(format_bytes(1_000_000_000), "953.67 MiB");
    }

    #[tokio::test]
    async fn challenge_pages_are_errors_and_scored() {
        let transport = Arc::new(MockTransport::new());
        transport.add_page(
            "https://www.youtube.com/watch?v=V1",
            r#"<html><form action="/sorry/index"><div class="g-recaptcha"></div></form></html>"#,
        );
        let http = client(transport.clone());
        let identity = SessionFactory::new(Default::default(), Default::default()).get_session();

        let result = http
            .fetch_text(OP_INNERTUBE, &identity, "https://www.youtube.com/watch?v=V1")
            .await;

        assert!(matches!(result, Err(Error::ChallengeDetected)));
        // Challenges are not retried.
        assert_eq!(transport.request_count(), 1);
        assert!(http.telemetry().calculate_risk_score() > 0.0);
        assert_eq!(http.breaker().snapshot(OP_INNERTUBE).consecutive_failures, 1);
    }

    #[tokio::test]
    async fn sustained_server_errors_open_the_circuit() {
        let transport = Arc::new(MockTransport::new());
        transport.add_page("https://www.youtube.com/watch?v=V1", "<html></html>");
        transport.fail_next(10, 503);
        let http = client(transport.clone());
        let identity = SessionFactory::new(Default::default(), Default::default()).get_session();

        let result = http
            .fetch_text(OP_INNERTUBE, &identity, "https://www.youtube.com/watch?v=V1")
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen(_))));
        assert_eq!(transport.request_count(), 3);
        assert_eq!(http.breaker().snapshot(OP_INNERTUBE).state, State::Open);
    }

    #[tokio::test]
    async fn html_on_media_request_is_a_challenge() {
        let transport = Arc::new(MockTransport::new());
        transport.add_page("https://rr1.example/videoplayback", "<html>blocked</html>");
        let http = client(transport);
        let identity = SessionFactory::new(Default::default(), Default::default()).get_session();

        let result = http
            .open_media(&identity, Request::ranged("https://rr1.example/videoplayback", 0))
            .await;
        assert!(matches!(result, Err(Error::ChallengeDetected)));
    }
}
