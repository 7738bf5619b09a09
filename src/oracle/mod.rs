//! The Oracle writer subsystem: batches buffer contents into parametrized
//! multi-row INSERTs against `XSCADA_DATATAG_LOG` / `XSCADA_OPERATION`,
//! retries with backoff, and spills to dated CSV files on permanent
//! failure.

pub mod csv_spill;
pub mod session;
pub mod writer;

pub use session::{
    FakeOracleStore, InMemoryOraclePool, InMemoryOracleSession, InsertOutcome, OracleError,
    OraclePool, OraclePoolConfig, OracleSession,
};
pub use writer::{OracleWriter, WriterConfig, WriterMetrics, WriterMetricsSnapshot};
