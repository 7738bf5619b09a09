//! Bounded per-PLC connection pool: lazy construction up to a max size,
//! acquire-with-timeout, and a background reaper that closes connections
//! idle past their timeout.

use super::connection::PlcConnection;
use crate::mc3e::McError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
        }
    }
}

struct Idle {
    conn: PlcConnection,
    since: Instant,
}

struct Inner {
    idle: VecDeque<Idle>,
    in_use: usize,
}

/// A connection handle borrowed from the pool. Returns the connection to
/// the idle queue on drop via a detached task, mirroring the release
/// semantics of a bounded resource pool.
pub struct PooledConnection {
    conn: Option<PlcConnection>,
    pool: Arc<PlcPool>,
}

impl std::ops::Deref for PooledConnection {
    type Target = PlcConnection;
    fn deref(&self) -> &PlcConnection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut PlcConnection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release(conn).await;
            });
        }
    }
}

/// Bounded connection pool for a single PLC station.
pub struct PlcPool {
    plc_code: String,
    host: String,
    port: u16,
    config: PoolConfig,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl PlcPool {
    pub fn new(plc_code: impl Into<String>, host: impl Into<String>, port: u16, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            plc_code: plc_code.into(),
            host: host.into(),
            port,
            config,
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                in_use: 0,
            }),
            notify: Notify::new(),
        })
    }

    /// Acquire a connection, constructing a new one if below `max_size` and
    /// none are idle. Blocks up to `acquire_timeout` if the pool is saturated.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, McError> {
        tokio::time::timeout(self.config.acquire_timeout, self.acquire_inner())
            .await
            .map_err(|_| McError::Timeout)?
    }

    async fn acquire_inner(self: &Arc<Self>) -> Result<PooledConnection, McError> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(idle) = inner.idle.pop_front() {
                    inner.in_use += 1;
                    return Ok(PooledConnection {
                        conn: Some(idle.conn),
                        pool: self.clone(),
                    });
                }
                if inner.in_use < self.config.max_size {
                    inner.in_use += 1;
                    drop(inner);
                    let mut conn = PlcConnection::new(
                        self.plc_code.clone(),
                        self.host.clone(),
                        self.port,
                        self.config.connect_timeout,
                        self.config.read_timeout,
                    );
                    if let Err(e) = conn.connect().await {
                        let mut inner = self.inner.lock().await;
                        inner.in_use -= 1;
                        self.notify.notify_one();
                        return Err(e);
                    }
                    return Ok(PooledConnection {
                        conn: Some(conn),
                        pool: self.clone(),
                    });
                }
            }
            self.notify.notified().await;
        }
    }

    /// A connection returned in `Errored` state is discarded rather than
    /// re-pooled; the next `acquire` builds a fresh one.
    async fn release(&self, conn: PlcConnection) {
        let mut inner = self.inner.lock().await;
        inner.in_use -= 1;
        if conn.state() == super::connection::ConnectionState::Errored {
            debug!(plc_code = %self.plc_code, "discarding errored connection instead of re-pooling");
        } else {
            inner.idle.push_back(Idle {
                conn,
                since: Instant::now(),
            });
        }
        self.notify.notify_one();
    }

    /// Close idle connections past `idle_timeout`. Intended to be driven by
    /// a periodic background task (every 60s by default).
    pub async fn reap_idle(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.idle.len();
        let timeout = self.config.idle_timeout;
        let mut kept = VecDeque::new();
        while let Some(mut idle) = inner.idle.pop_front() {
            if idle.since.elapsed() >= timeout {
                idle.conn.disconnect().await;
            } else {
                kept.push_back(idle);
            }
        }
        inner.idle = kept;
        let reaped = before - inner.idle.len();
        if reaped > 0 {
            debug!(plc_code = %self.plc_code, reaped, "reaped idle PLC connections");
        }
        reaped
    }

    pub async fn in_use_count(&self) -> usize {
        self.inner.lock().await.in_use
    }

    pub async fn idle_count(&self) -> usize {
        self.inner.lock().await.idle.len()
    }

    /// Disconnect and drop every currently-idle connection.
    async fn close_all_idle(&self) {
        let mut inner = self.inner.lock().await;
        while let Some(mut idle) = inner.idle.pop_front() {
            idle.conn.disconnect().await;
        }
    }

    /// Wait up to `timeout` for every in-use connection to be returned,
    /// polling periodically, then forcibly close whatever is idle — whether
    /// or not the wait succeeded (spec §4.4/§4.5: the pool manager's
    /// shutdown drains every pool, waiting up to a shutdown timeout for
    /// in-use connections before forcibly closing them). Returns `true` if
    /// every connection was returned before the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        const POLL_INTERVAL: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_use_count().await == 0 {
                self.close_all_idle().await;
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    plc_code = %self.plc_code,
                    in_use = self.in_use_count().await,
                    "pool drain timed out, forcing close of idle connections"
                );
                self.close_all_idle().await;
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_fails_fast_against_unreachable_host() {
        let pool = PlcPool::new(
            "PLC1",
            "192.0.2.1",
            5007,
            PoolConfig {
                connect_timeout: Duration::from_millis(50),
                acquire_timeout: Duration::from_millis(200),
                ..PoolConfig::default()
            },
        );
        let result = pool.acquire().await;
        assert!(result.is_err());
        assert_eq!(pool.in_use_count().await, 0);
    }

    #[tokio::test]
    async fn reap_idle_is_noop_on_empty_pool() {
        let pool = PlcPool::new("PLC1", "127.0.0.1", 5007, PoolConfig::default());
        assert_eq!(pool.reap_idle().await, 0);
    }

    #[tokio::test]
    async fn drain_returns_true_immediately_on_an_empty_pool() {
        let pool = PlcPool::new("PLC1", "127.0.0.1", 5007, PoolConfig::default());
        assert!(pool.drain(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn drain_times_out_while_a_connection_is_held() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while listener.accept().await.is_ok() {}
        });
        let pool = PlcPool::new(
            "PLC1",
            "127.0.0.1",
            port,
            PoolConfig {
                connect_timeout: Duration::from_millis(200),
                acquire_timeout: Duration::from_millis(200),
                ..PoolConfig::default()
            },
        );
        let held = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use_count().await, 1);

        let drained = pool.drain(Duration::from_millis(50)).await;
        assert!(!drained);

        drop(held);
    }
}
