//! PLC pool manager: a registry of per-PLC connection pools plus health
//! monitors, dispatching reads and writes and inactivating a PLC after
//! repeated full reconnect-cycle failures.

use super::health::{HealthMonitor, ReconnectionConfig};
use super::pool::{PlcPool, PoolConfig};
use crate::mc3e::{AddressRun, DeviceAddress, McError, ReadValues};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Default bound on how long `shutdown` waits for in-use PLC connections to
/// be returned before forcibly closing idle ones and moving on (spec §4.5).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("PLC {0:?} is not registered")]
    NotRegistered(String),
    #[error("PLC {0:?} is inactive pending operator reset")]
    Inactive(String),
    #[error(transparent)]
    Mc(#[from] McError),
}

struct PlcEntry {
    pool: Arc<PlcPool>,
    health: Arc<HealthMonitor>,
}

/// Registry of all known PLCs and their connection pools. The engine and
/// control surface both dispatch through this single point so inactivation
/// and reconnection accounting stay consistent across callers.
pub struct PlcManager {
    entries: RwLock<HashMap<String, PlcEntry>>,
}

impl Default for PlcManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PlcManager {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(
        &self,
        plc_code: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        pool_config: PoolConfig,
        reconnection_config: ReconnectionConfig,
    ) {
        let plc_code = plc_code.into();
        let pool = PlcPool::new(plc_code.clone(), host, port, pool_config);
        let health = Arc::new(HealthMonitor::new(plc_code.clone(), reconnection_config));
        self.entries
            .write()
            .await
            .insert(plc_code, PlcEntry { pool, health });
    }

    pub async fn is_registered(&self, plc_code: &str) -> bool {
        self.entries.read().await.contains_key(plc_code)
    }

    pub async fn is_inactive(&self, plc_code: &str) -> Result<bool, ManagerError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(plc_code)
            .ok_or_else(|| ManagerError::NotRegistered(plc_code.to_string()))?;
        Ok(entry.health.is_inactive().await)
    }

    /// Operator-triggered reset of a PLC marked inactive.
    pub async fn reset(&self, plc_code: &str) -> Result<(), ManagerError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(plc_code)
            .ok_or_else(|| ManagerError::NotRegistered(plc_code.to_string()))?;
        entry.health.reset().await;
        Ok(())
    }

    /// Read one contiguous address run from the named PLC, fast-failing if
    /// the PLC has been inactivated.
    pub async fn read_run(&self, plc_code: &str, run: &AddressRun) -> Result<ReadValues, ManagerError> {
        let (pool, health) = self.entry_handles(plc_code).await?;

        if health.is_inactive().await {
            return Err(ManagerError::Inactive(plc_code.to_string()));
        }
        if !health.can_attempt_connection().await {
            return Err(ManagerError::Mc(McError::Transport(
                "circuit breaker open".into(),
            )));
        }

        match pool.acquire().await {
            Ok(mut conn) => match conn.read_run(run).await {
                Ok(values) => {
                    health.record_cycle_success().await;
                    Ok(values)
                }
                Err(e) => {
                    // Three consecutive errors on this connection triggers a
                    // full reconnect cycle (spec §4.2); only once *that*
                    // exhausts its own retries does it count as one failed
                    // cycle against inactivation (spec §4.5) — a single read
                    // error never does.
                    if conn.should_reconnect() {
                        match conn.reconnect(&health.reconnect_backoffs()).await {
                            Ok(()) => health.record_cycle_success().await,
                            Err(reconnect_err) => {
                                let inactivated = health.record_cycle_failure(&reconnect_err).await;
                                if inactivated {
                                    info!(plc_code, "PLC read_run observed inactivation trigger");
                                }
                            }
                        }
                    }
                    Err(ManagerError::Mc(e))
                }
            },
            Err(e) => {
                health.record_cycle_failure(&e).await;
                Err(ManagerError::Mc(e))
            }
        }
    }

    /// Write one word back to the named PLC, a separate round trip from any
    /// preceding read (used for the handshake auto-reset trigger write-back).
    pub async fn write_word(
        &self,
        plc_code: &str,
        addr: DeviceAddress,
        value: u16,
    ) -> Result<(), ManagerError> {
        let (pool, health) = self.entry_handles(plc_code).await?;
        if health.is_inactive().await {
            return Err(ManagerError::Inactive(plc_code.to_string()));
        }

        let mut conn = pool.acquire().await.map_err(ManagerError::Mc)?;
        conn.write_word(addr, value)
            .await
            .map_err(ManagerError::Mc)
    }

    /// In-use and idle connection counts for one PLC's pool, for the control
    /// surface's `pool.stats` operation.
    pub async fn pool_stats(&self, plc_code: &str) -> Result<(usize, usize), ManagerError> {
        let (pool, _health) = self.entry_handles(plc_code).await?;
        Ok((pool.in_use_count().await, pool.idle_count().await))
    }

    async fn entry_handles(&self, plc_code: &str) -> Result<(Arc<PlcPool>, Arc<HealthMonitor>), ManagerError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(plc_code)
            .ok_or_else(|| ManagerError::NotRegistered(plc_code.to_string()))?;
        Ok((entry.pool.clone(), entry.health.clone()))
    }

    /// Reap idle connections across every registered PLC. Intended to be
    /// driven by a periodic background task.
    pub async fn reap_all(&self) {
        let entries = self.entries.read().await;
        for entry in entries.values() {
            entry.pool.reap_idle().await;
        }
    }

    /// Drain every pool on shutdown, using the default shutdown timeout.
    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await;
    }

    /// Drain every pool: wait up to `shutdown_timeout` for in-use
    /// connections to be returned, then forcibly close whatever idle
    /// connections remain (spec §4.4/§4.5). In-use connections that never
    /// return within the deadline are abandoned to their holding task; the
    /// pool's own bookkeeping no longer waits on them.
    pub async fn shutdown_with_timeout(&self, shutdown_timeout: Duration) {
        let entries = self.entries.read().await;
        for (plc_code, entry) in entries.iter() {
            if entry.pool.drain(shutdown_timeout).await {
                info!(plc_code, "PLC pool drained cleanly on shutdown");
            } else {
                warn!(
                    plc_code,
                    in_use = entry.pool.in_use_count().await,
                    "PLC pool drain timed out on shutdown; forcibly closed idle connections"
                );
            }
        }
    }
}
