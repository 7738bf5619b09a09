//! Configuration for the ingestion core, loaded once from environment
//! variables at start (spec §6). There is no reload path — the
//! configuration store itself is read once into [`crate::config_store`]'s
//! `Configuration`; what lives here are the tunables that shape how that
//! store is reached and how the runtime components are sized.

use anyhow::Result;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub host: String,
    pub port: u16,
    pub service_name: String,
    pub user: String,
    pub password: String,
    pub pool_min: usize,
    pub pool_max: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub pool_size_per_plc: usize,
    pub connection_timeout: Duration,
    pub read_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_polling_groups: usize,
    pub data_queue_size: usize,
    pub buffer_max_size: usize,
    pub buffer_batch_size: usize,
    pub buffer_write_interval: Duration,
    pub buffer_retry_count: u32,
    pub backup_file_path: PathBuf,
    pub failure_log_path: PathBuf,
    pub oracle: OracleConfig,
    pub metrics_port: u16,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid value for {name:?} ({raw:?}): {e}"))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Config {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./config/mc3e.sqlite".to_string()),
            pool_size_per_plc: env_parse("POOL_SIZE_PER_PLC", "5")?,
            connection_timeout: Duration::from_secs(env_parse("CONNECTION_TIMEOUT", "10")?),
            read_timeout: Duration::from_secs(env_parse("READ_TIMEOUT", "5")?),
            idle_timeout: Duration::from_secs(env_parse("IDLE_TIMEOUT", "600")?),
            max_polling_groups: env_parse("MAX_POLLING_GROUPS", "10")?,
            data_queue_size: env_parse("DATA_QUEUE_SIZE", "10000")?,
            buffer_max_size: env_parse("BUFFER_MAX_SIZE", "10000")?,
            buffer_batch_size: env_parse("BUFFER_BATCH_SIZE", "500")?,
            buffer_write_interval: Duration::from_secs(env_parse("BUFFER_WRITE_INTERVAL", "1")?),
            buffer_retry_count: env_parse("BUFFER_RETRY_COUNT", "3")?,
            backup_file_path: PathBuf::from(
                env::var("BACKUP_FILE_PATH").unwrap_or_else(|_| "backup".to_string()),
            ),
            failure_log_path: PathBuf::from(
                env::var("FAILURE_LOG_PATH").unwrap_or_else(|_| "polling_failures".to_string()),
            ),
            oracle: OracleConfig {
                host: env::var("ORACLE_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env_parse("ORACLE_PORT", "1521")?,
                service_name: env::var("ORACLE_SERVICE_NAME").unwrap_or_else(|_| "XE".to_string()),
                user: env::var("ORACLE_USER").unwrap_or_else(|_| "scada".to_string()),
                password: env::var("ORACLE_PASSWORD").unwrap_or_default(),
                pool_min: env_parse("ORACLE_POOL_MIN", "2")?,
                pool_max: env_parse("ORACLE_POOL_MAX", "5")?,
            },
            metrics_port: env_parse("METRICS_PORT", "9090")?,
        })
    }
}
