//! Oracle session and pool abstraction.
//!
//! No native Oracle OCI driver is vendored (there is no such crate in this
//! workspace's dependency stack and fabricating one would violate the
//! no-stub-dependencies rule). The writer is built against this narrow
//! trait instead, the same shape as the MC3E [`crate::plc::pool`] does for
//! PLC connections: bounded pool, lazy construction, acquire-with-timeout.
//! A real OCI-backed `OracleSession` is a host concern; tests and the
//! composition root use [`InMemoryOracleSession`] unless a real driver is
//! wired in.

use crate::sample::{BufferEntry, Destination};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify};

#[derive(Error, Debug, Clone)]
pub enum OracleError {
    #[error("no session available within acquire timeout")]
    PoolExhausted,
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("row {index} failed to insert: {message}")]
    RowFailed { index: usize, message: String },
}

/// Per-row outcome of a multi-row INSERT, so the writer can distinguish a
/// whole-batch failure from a partial one (spec §4.11 step 5: "requesting
/// per-row error reporting").
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub failed_rows: Vec<(usize, String)>,
}

impl InsertOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed_rows.is_empty()
    }
}

/// One leased Oracle session. Implementations issue the parametrized
/// multi-row INSERT statements of spec §6 and commit or roll back.
#[async_trait]
pub trait OracleSession: Send {
    async fn insert_datatag_log(&mut self, entries: &[BufferEntry]) -> Result<InsertOutcome, OracleError>;
    async fn insert_operation(&mut self, entries: &[BufferEntry]) -> Result<InsertOutcome, OracleError>;
    async fn commit(&mut self) -> Result<(), OracleError>;
}

#[async_trait]
pub trait OraclePool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn OracleSession>, OracleError>;
}

#[derive(Debug, Clone)]
pub struct OraclePoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub connection_lifetime: Duration,
}

impl Default for OraclePoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 5,
            acquire_timeout: Duration::from_secs(5),
            connection_lifetime: Duration::from_secs(3600),
        }
    }
}

/// A row as committed into the in-memory fake store, used by tests to
/// assert exactly-once delivery.
#[derive(Debug, Clone)]
pub struct CommittedRow {
    pub destination: Destination,
    pub entry: BufferEntry,
}

struct FakeStoreInner {
    rows: Vec<CommittedRow>,
    reachable: bool,
}

/// Shared backing store for [`InMemoryOracleSession`]s lent out by
/// [`InMemoryOraclePool`]. Tests flip `reachable` to simulate the remote
/// store going down, exercising the writer's retry-then-spill path.
#[derive(Clone)]
pub struct FakeOracleStore {
    inner: Arc<Mutex<FakeStoreInner>>,
}

impl FakeOracleStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeStoreInner {
                rows: Vec::new(),
                reachable: true,
            })),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().expect("fake store mutex poisoned").reachable = reachable;
    }

    pub fn committed_rows(&self) -> Vec<CommittedRow> {
        self.inner.lock().expect("fake store mutex poisoned").rows.clone()
    }

    pub fn committed_count(&self) -> usize {
        self.inner.lock().expect("fake store mutex poisoned").rows.len()
    }
}

impl Default for FakeOracleStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InMemoryOracleSession {
    store: FakeOracleStore,
    pending: Vec<CommittedRow>,
}

#[async_trait]
impl OracleSession for InMemoryOracleSession {
    async fn insert_datatag_log(&mut self, entries: &[BufferEntry]) -> Result<InsertOutcome, OracleError> {
        self.insert(Destination::DatatagLog, entries)
    }

    async fn insert_operation(&mut self, entries: &[BufferEntry]) -> Result<InsertOutcome, OracleError> {
        self.insert(Destination::Operation, entries)
    }

    async fn commit(&mut self) -> Result<(), OracleError> {
        let reachable = self.store.inner.lock().expect("fake store mutex poisoned").reachable;
        if !reachable {
            self.pending.clear();
            return Err(OracleError::CommitFailed("remote store unreachable".into()));
        }
        let mut inner = self.store.inner.lock().expect("fake store mutex poisoned");
        inner.rows.append(&mut self.pending);
        Ok(())
    }
}

impl InMemoryOracleSession {
    fn insert(
        &mut self,
        destination: Destination,
        entries: &[BufferEntry],
    ) -> Result<InsertOutcome, OracleError> {
        for entry in entries {
            self.pending.push(CommittedRow {
                destination,
                entry: entry.clone(),
            });
        }
        Ok(InsertOutcome {
            failed_rows: Vec::new(),
        })
    }
}

/// A bounded in-memory Oracle-pool fake, enough to exercise the writer's
/// full batching/retry/spill logic without a real OCI driver, mirroring
/// [`crate::plc::pool::PlcPool`]'s acquire-with-timeout shape.
pub struct InMemoryOraclePool {
    store: FakeOracleStore,
    config: OraclePoolConfig,
    in_use: AsyncMutex<usize>,
    notify: Notify,
}

impl InMemoryOraclePool {
    pub fn new(store: FakeOracleStore, config: OraclePoolConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            in_use: AsyncMutex::new(0),
            notify: Notify::new(),
        })
    }
}

#[async_trait]
impl OraclePool for InMemoryOraclePool {
    async fn acquire(&self) -> Result<Box<dyn OracleSession>, OracleError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            {
                let mut in_use = self.in_use.lock().await;
                if *in_use < self.config.max_size {
                    *in_use += 1;
                    return Ok(Box::new(InMemoryOracleSession {
                        store: self.store.clone(),
                        pending: Vec::new(),
                    }));
                }
            }
            if Instant::now() >= deadline {
                return Err(OracleError::PoolExhausted);
            }
            let _ = tokio::time::timeout(Duration::from_millis(10), self.notify.notified()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mc3e::{DeviceAddress, DeviceCode};
    use crate::sample::{BufferEntry, Quality, RawValue, Sample, TagKind};

    fn entry() -> BufferEntry {
        let sample = Sample::new(
            "PLC01",
            DeviceAddress::new(DeviceCode::D, 1),
            "EQUIP0000000001",
            TagKind::WordHost,
            RawValue::Word(1),
            1.0,
            Quality::Good,
        );
        BufferEntry::new(sample)
    }

    #[tokio::test]
    async fn commit_persists_rows_into_the_fake_store() {
        let store = FakeOracleStore::new();
        let pool = InMemoryOraclePool::new(store.clone(), OraclePoolConfig::default());
        let mut session = pool.acquire().await.unwrap();
        session.insert_datatag_log(&[entry(), entry()]).await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(store.committed_count(), 2);
    }

    #[tokio::test]
    async fn commit_fails_and_clears_pending_when_store_unreachable() {
        let store = FakeOracleStore::new();
        store.set_reachable(false);
        let pool = InMemoryOraclePool::new(store.clone(), OraclePoolConfig::default());
        let mut session = pool.acquire().await.unwrap();
        session.insert_operation(&[entry()]).await.unwrap();
        let err = session.commit().await.unwrap_err();
        assert!(matches!(err, OracleError::CommitFailed(_)));
        assert_eq!(store.committed_count(), 0);
    }

    #[tokio::test]
    async fn pool_exhausts_when_max_size_reached() {
        let store = FakeOracleStore::new();
        let pool = InMemoryOraclePool::new(
            store,
            OraclePoolConfig {
                max_size: 1,
                acquire_timeout: Duration::from_millis(50),
                ..OraclePoolConfig::default()
            },
        );
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, OracleError::PoolExhausted));
    }
}
