//! Single PLC TCP connection: connect/read/write lifecycle, dual-tier
//! timeouts, and consecutive-error tracking that feeds the reconnection
//! strategy in [`super::health`].

use crate::mc3e::{self, AddressRun, DeviceAddress, McError, ReadValues};
use crate::metrics::CONNECTION_ERRORS;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Consecutive read/write failures on one connection before the pool
/// manager tears it down and forces a full reconnect cycle.
pub const RECONNECT_ERROR_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

/// A single TCP connection to one PLC station.
///
/// `connect_timeout` bounds only the TCP handshake (`CONNECTION_TIMEOUT`);
/// `read_timeout` bounds each individual request/response round trip
/// (`READ_TIMEOUT`) and is applied per call, never amortized across a batch.
pub struct PlcConnection {
    pub plc_code: String,
    host: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    stream: Option<TcpStream>,
    state: ConnectionState,
    consecutive_errors: u32,
}

impl PlcConnection {
    pub fn new(
        plc_code: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            plc_code: plc_code.into(),
            host: host.into(),
            port,
            connect_timeout,
            read_timeout,
            stream: None,
            state: ConnectionState::Disconnected,
            consecutive_errors: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn should_reconnect(&self) -> bool {
        self.consecutive_errors >= RECONNECT_ERROR_THRESHOLD
    }

    pub async fn connect(&mut self) -> Result<(), McError> {
        self.state = ConnectionState::Connecting;
        let addr = format!("{}:{}", self.host, self.port);
        debug!(plc_code = %self.plc_code, addr = %addr, "connecting to PLC");

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let err = McError::Transport(e.to_string());
                self.note_connect_error(&err);
                return Err(err);
            }
            Err(_) => {
                self.note_connect_error(&McError::Timeout);
                return Err(McError::Timeout);
            }
        };

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        self.consecutive_errors = 0;
        Ok(())
    }

    /// Retry the TCP connect up to `backoffs.len()` times, sleeping the
    /// corresponding backoff before each attempt and logging every one
    /// (spec §4.2: "exponential backoff of 5 s, 10 s, 20 s, capped at 3
    /// attempts per call site"). Returns the last error if every attempt
    /// fails. Callers treat exhausting this as one failed reconnect cycle,
    /// distinct from a single read/connect error on an otherwise-healthy
    /// connection.
    pub async fn reconnect(&mut self, backoffs: &[Duration]) -> Result<(), McError> {
        self.disconnect().await;
        let mut last_err = McError::Transport("reconnect attempted with an empty backoff schedule".into());
        for (i, backoff) in backoffs.iter().enumerate() {
            tokio::time::sleep(*backoff).await;
            info!(
                plc_code = %self.plc_code,
                attempt = i + 1,
                max_attempts = backoffs.len(),
                backoff_ms = backoff.as_millis(),
                "attempting PLC reconnect"
            );
            match self.connect().await {
                Ok(()) => {
                    info!(plc_code = %self.plc_code, attempt = i + 1, "PLC reconnect succeeded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        plc_code = %self.plc_code,
                        attempt = i + 1,
                        error = %e,
                        "PLC reconnect attempt failed"
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn note_connect_error(&mut self, err: &McError) {
        self.state = ConnectionState::Errored;
        CONNECTION_ERRORS
            .with_label_values(&[&self.plc_code, error_type_label(err)])
            .inc();
    }

    pub async fn disconnect(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Batch-read one contiguous address run. Applies `READ_TIMEOUT` to the
    /// full request/response round trip, not just the socket read.
    pub async fn read_run(&mut self, run: &AddressRun) -> Result<ReadValues, McError> {
        let request = mc3e::ReadRequest::new(run.device, run.start_offset, run.count as u16);
        let kind = request.kind;
        let wire = mc3e::encode_read_request(&request);

        let result = timeout(self.read_timeout, self.round_trip(&wire)).await;
        match result {
            Ok(Ok(response)) => {
                match mc3e::decode_response(&response, kind, run.count as u16) {
                    Ok(values) => {
                        self.consecutive_errors = 0;
                        Ok(values)
                    }
                    Err(e) => {
                        self.note_error(&e);
                        Err(e)
                    }
                }
            }
            Ok(Err(e)) => {
                self.note_error(&e);
                Err(e)
            }
            Err(_) => {
                let e = McError::Timeout;
                self.note_error(&e);
                Err(e)
            }
        }
    }

    /// Write a single word. Always issued as its own round trip — used for
    /// the handshake-mode auto-reset trigger write-back, which must commit
    /// strictly after the preceding read batch, never folded into it.
    pub async fn write_word(&mut self, addr: DeviceAddress, value: u16) -> Result<(), McError> {
        let request = mc3e::WriteRequest::new(addr.device, addr.offset, value);
        let wire = mc3e::encode_write_request(&request);

        let result = timeout(self.read_timeout, self.round_trip(&wire)).await;
        match result {
            Ok(Ok(response)) => match mc3e::decode_write_response(&response) {
                Ok(()) => {
                    self.consecutive_errors = 0;
                    Ok(())
                }
                Err(e) => {
                    self.note_error(&e);
                    Err(e)
                }
            },
            Ok(Err(e)) => {
                self.note_error(&e);
                Err(e)
            }
            Err(_) => {
                let e = McError::Timeout;
                self.note_error(&e);
                Err(e)
            }
        }
    }

    async fn round_trip(&mut self, wire: &str) -> Result<String, McError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| McError::Transport("not connected".into()))?;

        stream
            .write_all(wire.as_bytes())
            .await
            .map_err(|e| McError::Transport(e.to_string()))?;

        let mut buf = vec![0u8; 2048];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| McError::Transport(e.to_string()))?;
        if n == 0 {
            return Err(McError::Transport("connection closed by peer".into()));
        }
        String::from_utf8(buf[..n].to_vec())
            .map_err(|e| McError::Malformed(format!("non-ASCII response: {e}")))
    }

    fn note_error(&mut self, err: &McError) {
        self.consecutive_errors += 1;
        self.state = ConnectionState::Errored;
        CONNECTION_ERRORS
            .with_label_values(&[&self.plc_code, error_type_label(err)])
            .inc();
        warn!(
            plc_code = %self.plc_code,
            consecutive_errors = self.consecutive_errors,
            error = %err,
            "PLC round trip failed"
        );
    }
}

fn error_type_label(err: &McError) -> &'static str {
    match err {
        McError::ProtocolError { .. } => "protocol",
        McError::Malformed(_) => "malformed",
        McError::Transport(_) => "transport",
        McError::Timeout => "timeout",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_starts_disconnected() {
        let conn = PlcConnection::new(
            "PLC1",
            "127.0.0.1",
            5007,
            Duration::from_secs(10),
            Duration::from_secs(5),
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.consecutive_errors(), 0);
        assert!(!conn.should_reconnect());
    }

    #[test]
    fn should_reconnect_at_threshold() {
        let mut conn = PlcConnection::new(
            "PLC1",
            "127.0.0.1",
            5007,
            Duration::from_secs(10),
            Duration::from_secs(5),
        );
        for _ in 0..RECONNECT_ERROR_THRESHOLD {
            conn.note_error(&McError::Timeout);
        }
        assert!(conn.should_reconnect());
    }

    #[tokio::test]
    async fn connect_times_out_against_unreachable_host() {
        let mut conn = PlcConnection::new(
            "PLC1",
            "192.0.2.1", // TEST-NET-1, reserved, guaranteed unreachable
            5007,
            Duration::from_millis(50),
            Duration::from_secs(5),
        );
        let result = conn.connect().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reconnect_exhausts_every_attempt_against_unreachable_host() {
        let mut conn = PlcConnection::new(
            "PLC1",
            "192.0.2.1",
            5007,
            Duration::from_millis(20),
            Duration::from_secs(5),
        );
        let backoffs = [
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(5),
        ];
        let result = conn.reconnect(&backoffs).await;
        assert!(result.is_err());
        assert_eq!(conn.state(), ConnectionState::Errored);
    }

    #[tokio::test]
    async fn reconnect_succeeds_once_the_peer_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let mut conn = PlcConnection::new(
            "PLC1",
            "127.0.0.1",
            port,
            Duration::from_millis(200),
            Duration::from_secs(5),
        );
        let backoffs = [Duration::from_millis(5)];
        let result = conn.reconnect(&backoffs).await;
        assert!(result.is_ok());
        assert_eq!(conn.state(), ConnectionState::Connected);
    }
}
