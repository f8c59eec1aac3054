//! SSH module - handles SSH connections and sessions
//!
//! This module provides the transport layer using the russh library.
//!
//! # Features
//! - Connection config validation with defaults
//! - Password, key file, inline key and agent authentication
//! - Interactive shell with resize, stats and keepalive
//! - Host key fingerprint cache (trust on first use)
//! - Error classification into stable kinds

mod agent;
mod client;
mod config;
mod error;
mod handle_owner;
pub mod known_hosts;
mod session;
mod transport;

pub use client::{ClientHandler, RusshTransport};
pub use config::{
    validate, AuthMethod, ConnectionConfig, KeepaliveSettings, KeySource, PoolSettings,
    RawConnectionConfig, Timeouts, DEFAULT_COLS, DEFAULT_PORT, DEFAULT_ROWS,
};
pub use error::{classify_message, ErrorKind, SshError};
pub use known_hosts::{HostKeyCache, HostKeyStatus};
pub use session::{ShellWriter, SignalKind, TransportSession, TransportSignal, TransportStats};
pub use transport::{
    ForwardStream, ShellChannel, ShellCommand, ShellOutput, TransportHandle, TransportProvider,
};
