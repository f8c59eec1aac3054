//! Transport abstraction
//!
//! The lifecycle manager, SFTP sessions and tunnels are written against
//! these traits. [`super::RusshTransport`] is the production provider; tests
//! plug in an in-memory one.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use super::config::ConnectionConfig;
use super::error::SshError;
use crate::sftp::FileChannel;

/// Opens authenticated transport connections.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Perform the handshake and authenticate. Deadlines are applied by the
    /// caller; implementations only enforce the auth timeout.
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn TransportHandle>, SshError>;
}

/// One live transport connection.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Open the interactive shell channel (PTY + shell request)
    async fn open_shell(&self, cols: u32, rows: u32) -> Result<ShellChannel, SshError>;

    /// Open a file-transfer subsystem channel
    async fn open_file_subsystem(&self) -> Result<Box<dyn FileChannel>, SshError>;

    /// Open a forwarded stream to `dst_host:dst_port` (direct-tcpip)
    async fn forward_out(
        &self,
        src_addr: &str,
        src_port: u16,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<Box<dyn ForwardStream>, SshError>;

    /// Protocol-level no-op liveness probe
    async fn ping(&self) -> Result<(), SshError>;

    /// Tear down the connection. Idempotent.
    async fn close(&self);
}

/// Byte stream of a forwarded channel
pub trait ForwardStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ForwardStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Commands accepted by a shell channel
#[derive(Debug)]
pub enum ShellCommand {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
    Close,
}

/// Output produced by a shell channel
#[derive(Debug)]
pub enum ShellOutput {
    Data(Vec<u8>),
    /// Channel closed (EOF/close from the remote side)
    Closed,
    /// Transport-level failure
    Error(SshError),
}

/// An open interactive shell: commands go in, output comes out
pub struct ShellChannel {
    pub commands: mpsc::Sender<ShellCommand>,
    pub output: mpsc::Receiver<ShellOutput>,
}
