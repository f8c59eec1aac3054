//! Port Forwarding Module
//!
//! Provides local port forwarding (tunnels) over connected sessions.

mod local;
pub mod manager;

pub use local::{start_local_tunnel, LocalTunnel, TunnelConfig, TunnelStats};
pub use manager::{TunnelInfo, TunnelManager};
