//! Polling engine: owns one worker task per enabled polling group, and the
//! control surface's entry point for starting, stopping, restarting, and
//! triggering them (spec §4.13).

use crate::config_store::{Configuration, GroupConfig, PollMode};
use crate::failure_log::FailureLogger;
use crate::mc3e::DeviceAddress;
use crate::metrics::ACTIVE_POLLING_GROUPS;
use crate::plc::PlcManager;
use crate::polling::status::{GroupState, GroupStatus, StatusPublisher};
use crate::polling::worker::{run_fixed, run_handshake, trigger_channel, TriggerHandle};
use crate::queue::DataQueueSender;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("polling group {0:?} not found")]
    UnknownGroup(String),
    #[error("group {0:?} is not in Handshake mode")]
    NotHandshake(String),
    #[error("maximum of {0} concurrently running polling groups already reached")]
    CapacityExceeded(usize),
}

/// Default upper bound on concurrently running groups (spec §4.8: "at most
/// 10 groups may be simultaneously in state Running"), overridable via
/// `MAX_POLLING_GROUPS` (spec §6).
pub const DEFAULT_MAX_POLLING_GROUPS: usize = 10;

/// spec §4.7: `stop_group(name, timeout=5s)`.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningWorker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    status_rx: watch::Receiver<GroupStatus>,
    /// Kept alongside the handle so a timed-out or panicked worker's status
    /// can still be marked `Error` after it's removed from `running`.
    status_tx: watch::Sender<GroupStatus>,
    trigger: Option<TriggerHandle>,
    mode: PollMode,
}

/// Downcast a worker task's panic payload to a loggable message.
fn panic_message(join_err: tokio::task::JoinError) -> String {
    match join_err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "worker panicked with a non-string payload".to_string()
            }
        }
        Err(join_err) => format!("worker task cancelled: {join_err}"),
    }
}

/// Publish an `Error` status snapshot for a worker that was detached (either
/// because it panicked or because it never returned within the stop
/// timeout), so a subsequent `status`/`status_all` call reports `Error`
/// instead of falling back to a fresh `Idle` default (spec §5).
fn mark_detached_error(tx: &watch::Sender<GroupStatus>, reason: impl Into<String>) {
    let mut status = tx.borrow().clone();
    status.state = GroupState::Error;
    status.last_error = Some(reason.into());
    let _ = tx.send(status);
}

fn mode_label(mode: PollMode) -> &'static str {
    match mode {
        PollMode::Fixed => "fixed",
        PollMode::Handshake => "handshake",
    }
}

/// Coordinates every polling group's worker task. `start_group`/`stop_group`
/// are idempotent: starting an already-running group or stopping an already
/// stopped one is a no-op, not an error.
pub struct PollingEngine {
    plc_manager: Arc<PlcManager>,
    queue: DataQueueSender,
    failure_logger: Arc<FailureLogger>,
    groups: HashMap<String, GroupConfig>,
    running: tokio::sync::Mutex<HashMap<String, RunningWorker>>,
    /// Last known status of every group that has ever run, kept around
    /// after removal from `running` so a detached (panicked/timed-out)
    /// worker's final `Error` snapshot is still observable.
    last_status: tokio::sync::Mutex<HashMap<String, watch::Receiver<GroupStatus>>>,
    max_groups: usize,
}

impl PollingEngine {
    pub fn new(
        configuration: &Configuration,
        plc_manager: Arc<PlcManager>,
        queue: DataQueueSender,
        failure_logger: Arc<FailureLogger>,
    ) -> Self {
        Self::with_max_groups(
            configuration,
            plc_manager,
            queue,
            failure_logger,
            DEFAULT_MAX_POLLING_GROUPS,
        )
    }

    pub fn with_max_groups(
        configuration: &Configuration,
        plc_manager: Arc<PlcManager>,
        queue: DataQueueSender,
        failure_logger: Arc<FailureLogger>,
        max_groups: usize,
    ) -> Self {
        Self {
            plc_manager,
            queue,
            failure_logger,
            groups: configuration.groups.clone(),
            running: tokio::sync::Mutex::new(HashMap::new()),
            last_status: tokio::sync::Mutex::new(HashMap::new()),
            max_groups,
        }
    }

    /// Start every enabled group from the loaded configuration.
    pub async fn start_all(self: &Arc<Self>) {
        let names: Vec<String> = self
            .groups
            .values()
            .filter(|g| g.enabled)
            .map(|g| g.name.clone())
            .collect();
        for name in names {
            if let Err(e) = self.start_group(&name).await {
                warn!(group = %name, error = %e, "failed to start polling group");
            }
        }
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.running.lock().await.keys().cloned().collect();
        for name in names {
            self.stop_group(&name).await;
        }
    }

    pub async fn start_group(self: &Arc<Self>, name: &str) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        if running.contains_key(name) {
            return Ok(());
        }
        if running.len() >= self.max_groups {
            return Err(EngineError::CapacityExceeded(self.max_groups));
        }
        let group = self
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownGroup(name.to_string()))?;

        let (publisher, status_rx) = StatusPublisher::new(group.name.clone(), group.mode);
        let status_tx = publisher.sender();
        let cancel = CancellationToken::new();
        let plc_manager = self.plc_manager.clone();
        let queue = self.queue.clone();
        let failure_logger = self.failure_logger.clone();

        let (trigger, handle) = match group.mode {
            PollMode::Fixed => {
                let interval = Duration::from_millis(group.interval_ms.unwrap_or(1000));
                let cancel2 = cancel.clone();
                let group2 = group.clone();
                let handle = tokio::spawn(async move {
                    run_fixed(group2, interval, &plc_manager, queue, &failure_logger, publisher, cancel2).await;
                });
                (None, handle)
            }
            PollMode::Handshake => {
                let (trigger_handle, trigger_rx) = trigger_channel();
                let cancel2 = cancel.clone();
                let group2 = group.clone();
                let handle = tokio::spawn(async move {
                    run_handshake(
                        group2,
                        trigger_rx,
                        &plc_manager,
                        queue,
                        &failure_logger,
                        publisher,
                        cancel2,
                    )
                    .await;
                });
                (Some(trigger_handle), handle)
            }
        };

        self.last_status
            .lock()
            .await
            .insert(name.to_string(), status_rx.clone());
        running.insert(
            name.to_string(),
            RunningWorker {
                handle,
                cancel,
                status_rx,
                status_tx,
                trigger,
                mode: group.mode,
            },
        );
        ACTIVE_POLLING_GROUPS
            .with_label_values(&[mode_label(group.mode)])
            .inc();
        info!(group = name, "polling group started");
        Ok(())
    }

    pub async fn stop_group(&self, name: &str) {
        self.stop_group_with_timeout(name, DEFAULT_STOP_TIMEOUT).await;
    }

    /// Cancel and await the named group's worker, up to `timeout`. Returns
    /// `true` if it stopped cleanly; `false` if it panicked or never
    /// returned within `timeout`, in which case its worker is abandoned
    /// (never cancelled twice) and its last published status is marked
    /// `Error` rather than left to fall back to a fresh `Idle` default
    /// (spec §5 cancellation).
    pub async fn stop_group_with_timeout(&self, name: &str, timeout: Duration) -> bool {
        let worker = self.running.lock().await.remove(name);
        let Some(worker) = worker else {
            return true;
        };
        ACTIVE_POLLING_GROUPS
            .with_label_values(&[mode_label(worker.mode)])
            .dec();
        worker.cancel.cancel();
        match tokio::time::timeout(timeout, worker.handle).await {
            Ok(Ok(())) => {
                info!(group = name, "polling group stopped");
                true
            }
            Ok(Err(join_err)) => {
                let message = panic_message(join_err);
                error!(group = name, error = %message, "polling group worker panicked");
                mark_detached_error(&worker.status_tx, format!("worker panicked: {message}"));
                false
            }
            Err(_) => {
                warn!(group = name, timeout_secs = timeout.as_secs(), "polling group stop timed out, worker detached");
                mark_detached_error(
                    &worker.status_tx,
                    format!("stop timed out after {}s, worker detached", timeout.as_secs()),
                );
                false
            }
        }
    }

    pub async fn restart_group(self: &Arc<Self>, name: &str) -> Result<(), EngineError> {
        self.stop_group(name).await;
        self.start_group(name).await
    }

    /// Fire an external trigger for a Handshake-mode group. Returns `false`
    /// if the trigger was deduplicated (within 1s of the previous one).
    pub async fn trigger(&self, name: &str) -> Result<bool, EngineError> {
        let running = self.running.lock().await;
        let worker = running
            .get(name)
            .ok_or_else(|| EngineError::UnknownGroup(name.to_string()))?;
        let trigger = worker
            .trigger
            .as_ref()
            .ok_or_else(|| EngineError::NotHandshake(name.to_string()))?;
        Ok(trigger.trigger().await)
    }

    pub async fn status(&self, name: &str) -> Result<GroupStatus, EngineError> {
        let running = self.running.lock().await;
        if let Some(worker) = running.get(name) {
            return Ok(worker.status_rx.borrow().clone());
        }
        drop(running);

        if let Some(rx) = self.last_status.lock().await.get(name) {
            return Ok(rx.borrow().clone());
        }

        self.groups
            .get(name)
            .map(|g| GroupStatus::new(g.name.clone(), g.mode))
            .ok_or_else(|| EngineError::UnknownGroup(name.to_string()))
    }

    pub async fn status_all(&self) -> Vec<GroupStatus> {
        let running = self.running.lock().await;
        let mut statuses: Vec<GroupStatus> = running.values().map(|w| w.status_rx.borrow().clone()).collect();
        let last_status = self.last_status.lock().await;
        for group in self.groups.values() {
            if !running.contains_key(&group.name) {
                match last_status.get(&group.name) {
                    Some(rx) => statuses.push(rx.borrow().clone()),
                    None => statuses.push(GroupStatus::new(group.name.clone(), group.mode)),
                }
            }
        }
        statuses
    }

    /// Write-back helper used by the control surface's `plc.test` operation:
    /// a one-off single-word write outside any running group's cycle.
    pub async fn write_word(&self, plc_code: &str, address: DeviceAddress, value: u16) -> Result<(), crate::plc::ManagerError> {
        self.plc_manager.write_word(plc_code, address, value).await
    }

    /// Subscribe to a running group's live status (spec §6: push model, no
    /// internal polling by the consumer). Each worker publishes a new value
    /// on the watch channel at the end of every poll cycle, well under the
    /// 1s granularity the spec requires since Fixed intervals are ≥ 100ms
    /// and Handshake polls are triggered, not timed.
    pub async fn subscribe(&self, name: &str) -> Result<watch::Receiver<GroupStatus>, EngineError> {
        let running = self.running.lock().await;
        running
            .get(name)
            .map(|w| w.status_rx.clone())
            .ok_or_else(|| EngineError::UnknownGroup(name.to_string()))
    }
}
