//! Per-PLC health tracking, circuit breaker, and exponential-backoff
//! reconnection. Mirrors the connection health monitor pattern used
//! elsewhere in this codebase for protocol adapters, narrowed to the
//! single-PLC-per-connection model this crate uses.

use crate::mc3e::McError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Consecutive full reconnect-cycle failures before the PLC is marked
    /// inactive and polling for it fails fast until an operator resets it.
    pub inactivation_threshold: u32,
    pub circuit_breaker_timeout_secs: u64,
}

impl Default for ReconnectionConfig {
    /// 5s/10s/20s, per spec §4.2's `reconnect()` backoff schedule — not the
    /// writer's 1s/2s/4s commit-retry schedule (spec §4.11), a different
    /// subsystem with its own backoff.
    fn default() -> Self {
        Self {
            initial_backoff_ms: 5000,
            max_backoff_ms: 20000,
            backoff_multiplier: 2.0,
            inactivation_threshold: 3,
            circuit_breaker_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
struct HealthState {
    consecutive_cycle_failures: u32,
    circuit_breaker_state: CircuitBreakerState,
    circuit_breaker_opened_at: Option<DateTime<Utc>>,
    inactive: bool,
}

/// Tracks one PLC's reconnect-cycle failures and whether it has been
/// inactivated. Inactivation is sticky: only an explicit operator reset
/// (see [`HealthMonitor::reset`]) clears it.
pub struct HealthMonitor {
    plc_code: String,
    state: Arc<RwLock<HealthState>>,
    config: ReconnectionConfig,
}

impl HealthMonitor {
    pub fn new(plc_code: impl Into<String>, config: ReconnectionConfig) -> Self {
        Self {
            plc_code: plc_code.into(),
            state: Arc::new(RwLock::new(HealthState {
                consecutive_cycle_failures: 0,
                circuit_breaker_state: CircuitBreakerState::Closed,
                circuit_breaker_opened_at: None,
                inactive: false,
            })),
            config,
        }
    }

    pub async fn is_inactive(&self) -> bool {
        self.state.read().await.inactive
    }

    pub async fn record_cycle_success(&self) {
        let mut state = self.state.write().await;
        state.consecutive_cycle_failures = 0;
        if state.circuit_breaker_state != CircuitBreakerState::Closed {
            info!(plc_code = %self.plc_code, "circuit breaker closed after successful reconnect");
            state.circuit_breaker_state = CircuitBreakerState::Closed;
            state.circuit_breaker_opened_at = None;
        }
    }

    /// Record that a full reconnect cycle (not just one read) failed.
    /// Returns `true` if this failure caused the PLC to be inactivated.
    pub async fn record_cycle_failure(&self, err: &McError) -> bool {
        let mut state = self.state.write().await;
        state.consecutive_cycle_failures += 1;
        warn!(
            plc_code = %self.plc_code,
            consecutive_cycle_failures = state.consecutive_cycle_failures,
            error = %err,
            "PLC reconnect cycle failed"
        );

        state.circuit_breaker_state = CircuitBreakerState::Open;
        state.circuit_breaker_opened_at = Some(Utc::now());

        if state.consecutive_cycle_failures >= self.config.inactivation_threshold && !state.inactive {
            error!(
                plc_code = %self.plc_code,
                threshold = self.config.inactivation_threshold,
                "PLC inactivated after repeated reconnect-cycle failures; awaiting operator reset"
            );
            state.inactive = true;
            return true;
        }
        false
    }

    pub async fn can_attempt_connection(&self) -> bool {
        let state = self.state.read().await;
        if state.inactive {
            return false;
        }
        match state.circuit_breaker_state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => match state.circuit_breaker_opened_at {
                Some(opened_at) => {
                    let elapsed = Utc::now().signed_duration_since(opened_at).num_seconds() as u64;
                    elapsed >= self.config.circuit_breaker_timeout_secs
                }
                None => true,
            },
        }
    }

    /// The 3-attempt backoff schedule `PlcConnection::reconnect` sleeps
    /// between TCP reconnect attempts (spec §4.2: "exponential backoff of
    /// 5 s, 10 s, 20 s, capped at 3 attempts per call site"). Pure function
    /// of `config`, independent of any per-PLC failure-count state — each
    /// `reconnect()` call runs the same fixed schedule regardless of how
    /// many prior cycles have failed.
    pub fn reconnect_backoffs(&self) -> [Duration; 3] {
        let mut backoffs = [Duration::ZERO; 3];
        for (attempt, slot) in backoffs.iter_mut().enumerate() {
            let delay_ms = (self.config.initial_backoff_ms as f64
                * self.config.backoff_multiplier.powi(attempt as i32)) as u64;
            *slot = Duration::from_millis(delay_ms.min(self.config.max_backoff_ms));
        }
        backoffs
    }

    /// Operator-triggered reset: clears inactivation and reopens the
    /// circuit breaker for a fresh connection attempt.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        info!(plc_code = %self.plc_code, "PLC health reset by operator");
        state.consecutive_cycle_failures = 0;
        state.circuit_breaker_state = CircuitBreakerState::Closed;
        state.circuit_breaker_opened_at = None;
        state.inactive = false;
    }
}
