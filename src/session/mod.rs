//! Session Management Module
//!
//! Provides the session lifecycle on top of the transport layer:
//! - State machine for session lifecycle
//! - Thread-safe session access via DashMap
//! - Silent reconnection with exponential backoff
//! - Warm connection pool with idle timeout
//! - Connection health monitoring

pub mod health;
mod manager;
mod pool;
mod reconnect;
mod registry;
pub mod types;

pub use health::{HealthMonitor, HealthStatus, HealthThresholds, QuickHealthCheck, SweepReport};
pub use manager::SessionManager;
pub use pool::ConnectionPool;
pub use reconnect::RetryPolicy;
pub use registry::{SessionEntry, SessionRegistry};
pub use types::{DisconnectOptions, PoolKey, Residency, SessionState, SessionStats};
