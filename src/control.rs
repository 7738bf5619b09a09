//! The control surface (spec §4.13): lifecycle operations over polling
//! groups, the writer, and PLC pools, plus one-shot diagnostics. Wire
//! framing is a host concern; this is the plain async Rust API a host
//! binary or test calls directly.

use crate::config_store::PlcConfig;
use crate::failure_log::FailureLogger;
use crate::mc3e::{AddressRun, McError, ReadValues};
use crate::oracle::{OracleWriter, WriterMetricsSnapshot};
use crate::plc::{ManagerError, PlcConnection, PlcManager};
use crate::polling::{EngineError, GroupStatus, PollingEngine};
use crate::buffer::CircularBuffer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BufferStats {
    pub size: usize,
    pub capacity: usize,
    pub utilisation: f64,
    pub overflow_count: u64,
    pub overflow_rate: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub in_use: usize,
    pub idle: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Stopped,
    Running,
}

#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub state: SystemState,
    pub group_count: usize,
    pub writer_metrics: WriterMetricsSnapshot,
    pub buffer: BufferStats,
}

/// Result of a `plc.test` one-shot connect-and-read probe. Bypasses the
/// pool manager entirely — this never touches PLC inactivation state.
pub struct PlcTestResult {
    pub values: ReadValues,
}

/// Ties the polling engine, writer, buffer, and PLC manager together behind
/// the operation set of spec §4.13. Control handlers are brief and
/// non-blocking with respect to the engine: every snapshot read is O(groups).
pub struct ControlPlane {
    engine: Arc<PollingEngine>,
    writer: Arc<OracleWriter>,
    buffer: Arc<CircularBuffer>,
    plc_manager: Arc<PlcManager>,
    failure_logger: Arc<FailureLogger>,
    running: AtomicBool,
}

impl ControlPlane {
    pub fn new(
        engine: Arc<PollingEngine>,
        writer: Arc<OracleWriter>,
        buffer: Arc<CircularBuffer>,
        plc_manager: Arc<PlcManager>,
        failure_logger: Arc<FailureLogger>,
    ) -> Self {
        Self {
            engine,
            writer,
            buffer,
            plc_manager,
            failure_logger,
            running: AtomicBool::new(false),
        }
    }

    pub async fn group_start(&self, name: &str) -> Result<(), EngineError> {
        self.engine.start_group(name).await
    }

    /// Returns `true` if the group stopped within `timeout`; `false` if its
    /// worker was detached (spec §5: "the engine marks the group `Error`").
    pub async fn group_stop(&self, name: &str, timeout: Duration) -> bool {
        self.engine.stop_group_with_timeout(name, timeout).await
    }

    pub async fn group_restart(&self, name: &str) -> Result<(), EngineError> {
        self.engine.restart_group(name).await
    }

    pub async fn group_trigger(&self, name: &str) -> Result<bool, EngineError> {
        self.engine.trigger(name).await
    }

    pub async fn group_status(&self, name: &str) -> Result<GroupStatus, EngineError> {
        self.engine.status(name).await
    }

    pub async fn group_status_all(&self) -> Vec<GroupStatus> {
        self.engine.status_all().await
    }

    /// Live-status stream for a running group (spec §6): a push-model watch
    /// handle a host's transport layer fans out to subscribers, rather than
    /// a surface consumers must poll.
    pub async fn group_subscribe(
        &self,
        name: &str,
    ) -> Result<tokio::sync::watch::Receiver<GroupStatus>, EngineError> {
        self.engine.subscribe(name).await
    }

    /// Starts every configured polling group. Never called automatically at
    /// process boot — an explicit operator or host action (spec §4.13).
    pub async fn system_start(&self) {
        self.engine.start_all().await;
        self.running.store(true, Ordering::SeqCst);
    }

    pub async fn system_stop(&self) {
        self.engine.stop_all().await;
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn system_status(&self) -> SystemStatus {
        let state = if self.running.load(Ordering::SeqCst) {
            SystemState::Running
        } else {
            SystemState::Stopped
        };
        SystemStatus {
            state,
            group_count: self.engine.status_all().await.len(),
            writer_metrics: self.writer.metrics().snapshot(),
            buffer: self.buffer_stats(),
        }
    }

    pub fn buffer_stats(&self) -> BufferStats {
        BufferStats {
            size: self.buffer.size(),
            capacity: self.buffer.capacity(),
            utilisation: self.buffer.utilisation(),
            overflow_count: self.buffer.overflow_count(),
            overflow_rate: self.buffer.overflow_rate(),
        }
    }

    pub fn writer_metrics(&self) -> WriterMetricsSnapshot {
        self.writer.metrics().snapshot()
    }

    /// Nudge the writer to drain its next batch immediately rather than
    /// waiting out the rest of its interval.
    pub fn writer_wake(&self) {
        self.writer.wake_now();
    }

    pub async fn pool_stats(&self, plc_code: &str) -> Result<PoolStats, ManagerError> {
        let (in_use, idle) = self.plc_manager.pool_stats(plc_code).await?;
        Ok(PoolStats { in_use, idle })
    }

    /// Operator reset of an inactivated PLC.
    pub async fn plc_reset(&self, plc_code: &str) -> Result<(), ManagerError> {
        self.plc_manager.reset(plc_code).await
    }

    /// Delete failure-log files older than 30 days (spec §4.12). Only ever
    /// invoked from here, never on a timer.
    pub async fn reap_failure_logs(&self) -> usize {
        self.failure_logger.reap_older_than(chrono::Duration::days(30)).await
    }

    /// One-shot connect-and-read probe against a PLC that is not (or not
    /// yet) registered with the pool manager. Opens and closes its own
    /// connection; never touches pool/health/inactivation state.
    pub async fn plc_test(&self, plc: &PlcConfig, probe: &AddressRun) -> Result<PlcTestResult, McError> {
        let mut conn = PlcConnection::new(
            plc.code.clone(),
            plc.host.clone(),
            plc.port,
            plc.connect_timeout,
            plc.read_timeout,
        );
        conn.connect().await?;
        let result = conn.read_run(probe).await;
        conn.disconnect().await;
        result.map(|values| PlcTestResult { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::{Configuration, GroupConfig, PollMode};
    use crate::failure_log::FailureLogger;
    use crate::oracle::{FakeOracleStore, InMemoryOraclePool, OraclePoolConfig, OracleWriter, WriterConfig};
    use crate::queue::data_queue;

    fn plc(code: &str) -> PlcConfig {
        PlcConfig {
            code: code.to_string(),
            host: "127.0.0.1".to_string(),
            port: PlcConfig::DEFAULT_PORT,
            network: 0,
            station: 0xFF,
            connect_timeout: Duration::from_millis(50),
            read_timeout: Duration::from_millis(50),
            enabled: true,
            pool_size: 1,
        }
    }

    fn fixed_group(name: &str, plc_code: &str) -> GroupConfig {
        GroupConfig {
            name: name.to_string(),
            plc_code: plc_code.to_string(),
            mode: PollMode::Fixed,
            interval_ms: Some(100),
            trigger_address: None,
            auto_reset_trigger: false,
            priority: 0,
            enabled: true,
            tags: Vec::new(),
        }
    }

    async fn control_plane() -> Arc<ControlPlane> {
        let configuration = Configuration::build(vec![plc("PLC01")], vec![(fixed_group("G1", "PLC01"), vec![])]).unwrap();
        let manager = Arc::new(PlcManager::new());
        let (tx, _rx) = data_queue(16);
        let tmp = tempfile::tempdir().unwrap();
        let logger = Arc::new(FailureLogger::new(tmp.path()));
        let engine = Arc::new(PollingEngine::new(&configuration, manager.clone(), tx, logger.clone()));

        let buffer = Arc::new(CircularBuffer::new(1000));
        let store = FakeOracleStore::new();
        let pool = InMemoryOraclePool::new(store, OraclePoolConfig::default());
        let writer = Arc::new(OracleWriter::new(buffer.clone(), pool, WriterConfig::default()));

        Arc::new(ControlPlane::new(engine, writer, buffer, manager, logger))
    }

    #[tokio::test]
    async fn system_status_reports_stopped_before_start() {
        let cp = control_plane().await;
        let status = cp.system_status().await;
        assert_eq!(status.state, SystemState::Stopped);
        assert_eq!(status.group_count, 1);
    }

    #[tokio::test]
    async fn system_start_then_stop_flips_state() {
        let cp = control_plane().await;
        cp.system_start().await;
        assert_eq!(cp.system_status().await.state, SystemState::Running);
        cp.system_stop().await;
        assert_eq!(cp.system_status().await.state, SystemState::Stopped);
    }

    #[tokio::test]
    async fn buffer_stats_reflect_empty_buffer() {
        let cp = control_plane().await;
        let stats = cp.buffer_stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.capacity, 1000);
    }

    #[tokio::test]
    async fn pool_stats_for_unregistered_plc_is_an_error() {
        let cp = control_plane().await;
        let err = cp.pool_stats("NOPE").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn plc_test_against_unreachable_host_fails_without_registering() {
        let cp = control_plane().await;
        let probe = AddressRun {
            device: crate::mc3e::DeviceCode::D,
            start_offset: 0,
            count: 1,
        };
        let mut unreachable = plc("PROBE");
        unreachable.host = "192.0.2.1".to_string();
        let result = cp.plc_test(&unreachable, &probe).await;
        assert!(result.is_err());
        assert!(!cp.plc_manager.is_registered("PROBE").await);
    }
}
