//! PLC connection lifecycle: single connections, bounded pools, per-PLC
//! health/reconnection, and the manager that ties a plant's PLC registry
//! together for the polling engine and control surface.

pub mod connection;
pub mod health;
pub mod manager;
pub mod pool;

pub use connection::{ConnectionState, PlcConnection};
pub use health::{CircuitBreakerState, HealthMonitor, ReconnectionConfig};
pub use manager::{ManagerError, PlcManager};
pub use pool::{PlcPool, PoolConfig, PooledConnection};
