//! Group-status snapshots, published lock-free on the hot path: each worker
//! publishes an immutable snapshot on a `tokio::sync::watch` channel at the
//! end of every cycle; readers (the control surface) load the latest value
//! without contending with the polling loop (spec §9 design note).

use crate::config_store::PollMode;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    Running,
    Stopping,
    Error,
}

#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub name: String,
    pub mode: PollMode,
    pub state: GroupState,
    pub total_polls: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_poll: Option<DateTime<Utc>>,
    /// Exponential moving average of poll-cycle duration, milliseconds.
    pub avg_poll_duration_ms: f64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Fixed-mode groups only: the next scheduled tick.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl GroupStatus {
    pub fn new(name: impl Into<String>, mode: PollMode) -> Self {
        Self {
            name: name.into(),
            mode,
            state: GroupState::Idle,
            total_polls: 0,
            success_count: 0,
            error_count: 0,
            last_poll: None,
            avg_poll_duration_ms: 0.0,
            consecutive_failures: 0,
            last_error: None,
            next_retry_at: None,
        }
    }
}

/// EMA smoothing factor for the rolling poll-duration average.
const EMA_ALPHA: f64 = 0.2;

/// Mutable accumulator a worker owns exclusively; published as an immutable
/// [`GroupStatus`] snapshot on every cycle boundary.
pub struct StatusPublisher {
    current: GroupStatus,
    tx: watch::Sender<GroupStatus>,
}

impl StatusPublisher {
    pub fn new(name: impl Into<String>, mode: PollMode) -> (Self, watch::Receiver<GroupStatus>) {
        let current = GroupStatus::new(name, mode);
        let (tx, rx) = watch::channel(current.clone());
        (Self { current, tx }, rx)
    }

    pub fn set_state(&mut self, state: GroupState) {
        self.current.state = state;
        self.publish();
    }

    pub fn record_success(&mut self, duration_ms: f64, at: DateTime<Utc>) {
        self.current.total_polls += 1;
        self.current.success_count += 1;
        self.current.consecutive_failures = 0;
        self.current.last_error = None;
        self.current.last_poll = Some(at);
        self.update_ema(duration_ms);
        self.publish();
    }

    pub fn record_failure(&mut self, error: impl Into<String>, duration_ms: f64, at: DateTime<Utc>) {
        self.current.total_polls += 1;
        self.current.error_count += 1;
        self.current.consecutive_failures += 1;
        self.current.last_error = Some(error.into());
        self.current.last_poll = Some(at);
        self.update_ema(duration_ms);
        self.publish();
    }

    pub fn set_next_retry_at(&mut self, at: Option<DateTime<Utc>>) {
        self.current.next_retry_at = at;
        self.publish();
    }

    fn update_ema(&mut self, duration_ms: f64) {
        self.current.avg_poll_duration_ms = if self.current.total_polls <= 1 {
            duration_ms
        } else {
            EMA_ALPHA * duration_ms + (1.0 - EMA_ALPHA) * self.current.avg_poll_duration_ms
        };
    }

    fn publish(&self) {
        let _ = self.tx.send(self.current.clone());
    }

    pub fn snapshot(&self) -> GroupStatus {
        self.current.clone()
    }

    /// A clone of the publishing sender, retained by the engine so a status
    /// can still be published after the worker task that owns `self` is
    /// gone (e.g. detached on a stop timeout or panic).
    pub fn sender(&self) -> watch::Sender<GroupStatus> {
        self.tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_seeds_from_first_sample() {
        let (mut publisher, rx) = StatusPublisher::new("G1", PollMode::Fixed);
        publisher.record_success(100.0, Utc::now());
        assert_eq!(rx.borrow().avg_poll_duration_ms, 100.0);
    }

    #[test]
    fn failure_increments_consecutive_and_clears_on_success() {
        let (mut publisher, rx) = StatusPublisher::new("G1", PollMode::Fixed);
        publisher.record_failure("timeout", 50.0, Utc::now());
        publisher.record_failure("timeout", 50.0, Utc::now());
        assert_eq!(rx.borrow().consecutive_failures, 2);
        publisher.record_success(50.0, Utc::now());
        assert_eq!(rx.borrow().consecutive_failures, 0);
        assert!(rx.borrow().last_error.is_none());
    }

    #[test]
    fn readers_observe_state_transitions_without_torn_values() {
        let (mut publisher, rx) = StatusPublisher::new("G1", PollMode::Handshake);
        publisher.set_state(GroupState::Running);
        assert_eq!(rx.borrow().state, GroupState::Running);
        publisher.set_state(GroupState::Stopping);
        assert_eq!(rx.borrow().state, GroupState::Stopping);
    }
}
