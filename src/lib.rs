//! OxideLink - client-side SSH connectivity core
//!
//! Session lifecycle with silent reconnection, a warm connection pool,
//! health sweeps, SFTP file sessions and local port forwarding, all behind
//! [`RemoteShellService`].

pub mod config;
pub mod events;
pub mod forwarding;
pub mod service;
pub mod session;
pub mod sftp;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::CoreConfig;
pub use events::{EventSink, SessionEvent};
pub use service::{CoreError, CoreResult, RemoteShellService};
pub use ssh::{RawConnectionConfig, RusshTransport, SshError};

/// Initialize logging. `RUST_LOG` overrides the default `info` filter.
///
/// Embedders that install their own subscriber can skip this; a second
/// call is a no-op.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
