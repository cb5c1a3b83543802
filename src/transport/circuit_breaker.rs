//! Per-host circuit breaker. Generalizes the single global breaker pattern
//! (`Closed -> Open -> HalfOpen` with failure/success thresholds) into a map
//! keyed by `(host, port)`, per spec §4.1.

use crate::models::{CircuitPhase, CircuitState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::constants::CIRCUIT_THRESHOLD,
            cooldown: Duration::from_secs(crate::constants::CIRCUIT_COOLDOWN_SECONDS),
        }
    }
}

/// Lifetime request/failure/success counters per host, independent of the
/// live breaker phase (SPEC_FULL.md §11: `/stats` and E2E-4 assertions need
/// totals that survive a circuit close resetting `CircuitState`).
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CircuitBreakerMetrics {
    pub phase: Option<CircuitPhase>,
    pub failure_count: u32,
    pub total_requests: u64,
    pub total_failures: u64,
}

/// Owns one [`CircuitState`] per remote host. A half-open probe is modeled
/// by letting exactly one call through once `open_until` has elapsed; its
/// outcome decides the next phase.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    states: Arc<RwLock<HashMap<(String, u16), CircuitState>>>,
    metrics: Arc<RwLock<HashMap<(String, u16), CircuitBreakerMetrics>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns `Ok(())` if a call to this host may proceed, `Err(())` if the
    /// circuit is open and the caller must fail fast with `CircuitOpen`.
    pub async fn check(&self, host: &str, port: u16) -> std::result::Result<(), ()> {
        let key = (host.to_string(), port);
        let mut states = self.states.write().await;
        let state = states.entry(key.clone()).or_default();

        match state.phase {
            CircuitPhase::Closed => Ok(()),
            CircuitPhase::HalfOpen => Ok(()),
            CircuitPhase::Open => {
                let open_until = state.open_until.unwrap_or_else(Instant::now);
                if Instant::now() >= open_until {
                    state.phase = CircuitPhase::HalfOpen;
                    info!(host, port, "circuit transitioned to half-open");
                    Ok(())
                } else {
                    Err(())
                }
            }
        }
    }

    pub async fn record_success(&self, host: &str, port: u16) {
        let key = (host.to_string(), port);
        self.bump_metrics(&key, false).await;
        let mut states = self.states.write().await;
        let state = states.entry(key).or_default();
        if state.phase != CircuitPhase::Closed {
            info!(host, port, "circuit closed after successful probe");
        }
        *state = CircuitState::default();
    }

    pub async fn record_failure(&self, host: &str, port: u16) {
        let key = (host.to_string(), port);
        self.bump_metrics(&key, true).await;
        let mut states = self.states.write().await;
        let state = states.entry(key).or_default();
        state.last_failure_at = Some(Instant::now());

        match state.phase {
            CircuitPhase::HalfOpen => {
                self.open(state, host, port);
            }
            CircuitPhase::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.open(state, host, port);
                }
            }
            CircuitPhase::Open => {
                // already open, just re-mark the failure time (handled above)
            }
        }
    }

    fn open(&self, state: &mut CircuitState, host: &str, port: u16) {
        state.phase = CircuitPhase::Open;
        state.open_until = Some(Instant::now() + self.config.cooldown);
        warn!(host, port, failures = state.failure_count, "circuit opened");
    }

    pub async fn snapshot(&self, host: &str, port: u16) -> CircuitState {
        let states = self.states.read().await;
        states
            .get(&(host.to_string(), port))
            .cloned()
            .unwrap_or_default()
    }

    /// Lifetime counters plus current phase, for the `/stats` endpoint and
    /// tests asserting E2E-4's "exactly N consecutive failures" behavior.
    pub async fn metrics(&self, host: &str, port: u16) -> CircuitBreakerMetrics {
        let key = (host.to_string(), port);
        let states = self.states.read().await;
        let metrics = self.metrics.read().await;
        let mut snapshot = metrics.get(&key).copied().unwrap_or_default();
        snapshot.phase = states.get(&key).map(|s| s.phase);
        snapshot.failure_count = states.get(&key).map(|s| s.failure_count).unwrap_or(0);
        snapshot
    }

    async fn bump_metrics(&self, key: &(String, u16), failure: bool) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(key.clone()).or_default();
        entry.total_requests += 1;
        if failure {
            entry.total_failures += 1;
        }
    }

    /// Operator-triggered manual reset (spec §4.1: `reset(host)`).
    pub async fn reset(&self, host: &str, port: u16) {
        let mut states = self.states.write().await;
        states.insert((host.to_string(), port), CircuitState::default());
    }
}
