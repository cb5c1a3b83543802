//! C1: RobustTransport — HTTP client wrapping GET/POST with retry,
//! exponential backoff, and a per-host circuit breaker (spec §4.1).

mod circuit_breaker;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerRegistry};

use crate::error::{OrchestratorError, Result};
use crate::models::CircuitState;
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub per_request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            per_request_timeout: Duration::from_secs(
                crate::constants::TRANSPORT_PER_REQUEST_TIMEOUT_SECONDS,
            ),
            max_attempts: crate::constants::TRANSPORT_MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(crate::constants::TRANSPORT_BACKOFF_BASE_SECONDS),
            backoff_cap: Duration::from_secs(crate::constants::TRANSPORT_BACKOFF_CAP_SECONDS),
        }
    }
}

pub struct RobustTransport {
    client: Client,
    config: TransportConfig,
    breaker: CircuitBreakerRegistry,
}

impl RobustTransport {
    pub fn new(config: TransportConfig, breaker_config: CircuitBreakerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.per_request_timeout)
            .build()
            .map_err(OrchestratorError::Reqwest)?;

        Ok(Self {
            client,
            config,
            breaker: CircuitBreakerRegistry::new(breaker_config),
        })
    }

    pub async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<ResponseBody> {
        self.request(Method::GET, url, headers, None, None).await
    }

    pub async fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: serde_json::Value,
        timeout_override: Option<Duration>,
    ) -> Result<ResponseBody> {
        self.request(Method::POST, url, headers, Some(body), timeout_override)
            .await
    }

    /// Operator-triggered manual circuit reset for a host (spec §4.1).
    pub async fn reset(&self, host: &str, port: u16) {
        self.breaker.reset(host, port).await;
    }

    pub async fn circuit_snapshot(&self, host: &str, port: u16) -> CircuitState {
        self.breaker.snapshot(host, port).await
    }

    /// Circuit breaker metrics snapshot for a host, mirroring the base
    /// crate's `CircuitBreaker::get_metrics` (SPEC_FULL.md §11).
    pub async fn metrics(&self, host: &str, port: u16) -> CircuitBreakerMetrics {
        self.breaker.metrics(host, port).await
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<serde_json::Value>,
        timeout_override: Option<Duration>,
    ) -> Result<ResponseBody> {
        let parsed = Url::parse(url)
            .map_err(|e| OrchestratorError::ConnectionFailed(format!("invalid url {url}: {e}")))?;
        let host = parsed.host_str().unwrap_or_default().to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);

        if self.breaker.check(&host, port).await.is_err() {
            return Err(OrchestratorError::CircuitOpen { host, port });
        }

        let mut last_error: Option<OrchestratorError> = None;

        for attempt in 1..=self.config.max_attempts {
            let mut req = self
                .client
                .request(method.clone(), url)
                .timeout(timeout_override.unwrap_or(self.config.per_request_timeout));
            for (k, v) in headers {
                req = req.header(*k, *v);
            }
            if let Some(ref b) = body {
                req = req.json(b);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.breaker.record_success(&host, port).await;
                        let text = response.text().await.unwrap_or_default();
                        return Ok(ResponseBody {
                            status: status.as_u16(),
                            body: text,
                        });
                    }

                    let text = response.text().await.unwrap_or_default();
                    let err = OrchestratorError::HttpError {
                        status: status.as_u16(),
                        body: text,
                    };

                    if status.as_u16() == 401 {
                        // Unauthorized is not retried (spec §7) and does not
                        // count against the circuit breaker as a transport
                        // failure.
                        return Err(OrchestratorError::Unauthorized);
                    }

                    if !err.is_retryable() || attempt == self.config.max_attempts {
                        self.breaker.record_failure(&host, port).await;
                        return Err(err);
                    }

                    last_error = Some(err);
                }
                Err(e) => {
                    let err = if e.is_timeout() {
                        OrchestratorError::Timeout
                    } else {
                        OrchestratorError::ConnectionFailed(e.to_string())
                    };

                    if attempt == self.config.max_attempts {
                        self.breaker.record_failure(&host, port).await;
                        return Err(OrchestratorError::TransportExhausted {
                            attempts: attempt,
                            last_error: err.to_string(),
                        });
                    }

                    last_error = Some(err);
                }
            }

            let delay = self.backoff_delay(attempt);
            debug!(attempt, ?delay, url, "retrying request after backoff");
            tokio::time::sleep(delay).await;
        }

        self.breaker.record_failure(&host, port).await;
        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        warn!(url, last, "transport exhausted all attempts");
        Err(OrchestratorError::TransportExhausted {
            attempts: self.config.max_attempts,
            last_error: last,
        })
    }

    /// `base * 2^(attempt-1)`, capped at `backoff_cap` (spec §4.1).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let millis = self.config.backoff_base.as_millis() as u64 * factor as u64;
        Duration::from_millis(millis).min(self.config.backoff_cap)
    }
}

#[derive(Debug, Clone)]
pub struct ResponseBody {
    pub status: u16,
    pub body: String,
}

impl ResponseBody {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(OrchestratorError::Serialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_doubles_and_caps() {
        let transport = RobustTransport::new(TransportConfig::default(), CircuitBreakerConfig::default())
            .unwrap();
        assert_eq!(transport.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(transport.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(transport.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(transport.backoff_delay(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn get_against_unreachable_host_exhausts_transport() {
        let config = TransportConfig {
            per_request_timeout: Duration::from_millis(200),
            max_attempts: 2,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
        };
        let transport = RobustTransport::new(config, CircuitBreakerConfig::default()).unwrap();
        let result = transport.get("http://127.0.0.1:1/health", &[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_failures() {
        let breaker_config = CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
        };
        let config = TransportConfig {
            per_request_timeout: Duration::from_millis(100),
            max_attempts: 1,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
        };
        let transport = RobustTransport::new(config, breaker_config).unwrap();

        for _ in 0..2 {
            let _ = transport.get("http://127.0.0.1:2/health", &[]).await;
        }

        let result = transport.get("http://127.0.0.1:2/health", &[]).await;
        assert!(matches!(result, Err(OrchestratorError::CircuitOpen { .. })));
    }
}
