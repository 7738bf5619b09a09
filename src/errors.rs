//! Top-level error type for the ingestion core. Component boundaries
//! (codec, pool, writer, control plane) each keep their own `thiserror`
//! enum; this wraps them at the composition root, where `main.rs` reports
//! with `anyhow`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("configuration error: {0}")]
    Configuration(#[from] crate::config_store::ConfigError),

    #[error(transparent)]
    Protocol(#[from] crate::mc3e::McError),

    #[error(transparent)]
    Plc(#[from] crate::plc::ManagerError),

    #[error(transparent)]
    Oracle(#[from] crate::oracle::OracleError),

    #[error(transparent)]
    FailureLog(#[from] crate::failure_log::FailureLogError),

    #[error("engine error: {0}")]
    Engine(#[from] crate::polling::EngineError),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl IngestionError {
    /// Whether the lowest-owning component should retry this condition
    /// rather than surface it as a poll- or write-cycle failure (spec §7
    /// error kinds 2-7 are all locally recoverable; kinds 1, 8, 9 are not).
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestionError::Protocol(e) => matches!(
                e,
                crate::mc3e::McError::Transport(_) | crate::mc3e::McError::Timeout
            ),
            IngestionError::Plc(crate::plc::ManagerError::Mc(e)) => matches!(
                e,
                crate::mc3e::McError::Transport(_) | crate::mc3e::McError::Timeout
            ),
            IngestionError::Oracle(_) => true,
            _ => false,
        }
    }

    /// Whether this error should terminate the process after a best-effort
    /// shutdown (spec §7 error kind 9: out-of-memory, unrecoverable CSV
    /// spill directory I/O).
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestionError::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        let err = IngestionError::Protocol(crate::mc3e::McError::Timeout);
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        let err = IngestionError::Configuration(crate::config_store::ConfigError::DuplicatePlc("PLC01".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn fatal_variant_reports_fatal() {
        let err = IngestionError::Fatal("disk full".into());
        assert!(err.is_fatal());
    }
}
