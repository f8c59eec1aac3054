//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//! Example: Forward 127.0.0.1:8888 -> localhost:8888 on the remote side

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::SessionManager;
use crate::ssh::{ForwardStream, SshError};

/// Idle timeout for forwarded connections (5 minutes)
const FORWARD_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// Local port forwarding request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub local_port: u16,
    /// Remote host to connect to through SSH (e.g., "localhost")
    pub remote_host: String,
    pub remote_port: u16,
}

impl TunnelConfig {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// `"{session}:{localPort}->{remoteHost}:{remotePort}"`
    pub fn tunnel_id(&self, session_id: &str) -> String {
        format!(
            "{}:{}->{}:{}",
            session_id, self.local_port, self.remote_host, self.remote_port
        )
    }
}

/// Statistics for a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStats {
    /// Total connections accepted
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Connections dropped because the forwarded channel could not be opened
    pub failed_connections: u64,
    /// Total bytes sent (client -> server)
    pub bytes_sent: u64,
    /// Total bytes received (server -> client)
    pub bytes_received: u64,
}

/// A running tunnel
pub struct LocalTunnel {
    pub id: String,
    pub session_id: String,
    pub config: TunnelConfig,
    /// Actual bound address
    pub bound_addr: SocketAddr,
    token: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stats: Arc<parking_lot::RwLock<TunnelStats>>,
}

impl LocalTunnel {
    /// Close the listener and wait until the port is released.
    /// Connections already spliced keep running until either side closes.
    pub async fn stop(&self) {
        info!("Stopping tunnel {} on {}", self.id, self.bound_addr);
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Check if the listener is still running
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn stats(&self) -> TunnelStats {
        self.stats.read().clone()
    }
}

impl Drop for LocalTunnel {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Bind `bind_address:config.local_port` and start accepting.
///
/// Every accepted connection asks `sessions` for the current transport of
/// `session_id`, so a tunnel keeps working across reconnects.
pub async fn start_local_tunnel(
    sessions: Arc<SessionManager>,
    session_id: &str,
    config: TunnelConfig,
    bind_address: &str,
) -> Result<LocalTunnel, SshError> {
    let local_addr = format!("{}:{}", bind_address, config.local_port);
    let listener = TcpListener::bind(&local_addr)
        .await
        .map_err(|e| bind_error(&local_addr, e))?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| bind_error(&local_addr, e))?;

    let id = config.tunnel_id(session_id);
    info!(
        "Started tunnel {}: {} -> {}:{}",
        id, bound_addr, config.remote_host, config.remote_port
    );

    let token = CancellationToken::new();
    let stats = Arc::new(parking_lot::RwLock::new(TunnelStats::default()));

    let task = tokio::spawn(accept_loop(
        listener,
        sessions,
        session_id.to_string(),
        config.clone(),
        token.clone(),
        stats.clone(),
    ));

    Ok(LocalTunnel {
        id,
        session_id: session_id.to_string(),
        config,
        bound_addr,
        token,
        task: parking_lot::Mutex::new(Some(task)),
        stats,
    })
}

fn bind_error(local_addr: &str, e: std::io::Error) -> SshError {
    let reason = match e.kind() {
        std::io::ErrorKind::AddrInUse => {
            "Port already in use. Another application may be using this port.".to_string()
        }
        std::io::ErrorKind::PermissionDenied => {
            "Permission denied. Ports below 1024 require elevated privileges.".to_string()
        }
        std::io::ErrorKind::AddrNotAvailable => {
            "Address not available. The specified address is not valid on this system."
                .to_string()
        }
        _ => e.to_string(),
    };
    SshError::TunnelBindFailed {
        addr: local_addr.to_string(),
        reason,
    }
}

async fn accept_loop(
    listener: TcpListener,
    sessions: Arc<SessionManager>,
    session_id: String,
    config: TunnelConfig,
    token: CancellationToken,
    stats: Arc<parking_lot::RwLock<TunnelStats>>,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Tunnel on port {} stopped by request", config.local_port);
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        // Disable Nagle's algorithm for low-latency forwarding
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        debug!(
                            "Accepted connection from {} on port {}",
                            peer_addr, config.local_port
                        );

                        {
                            let mut s = stats.write();
                            s.connection_count += 1;
                            s.active_connections += 1;
                        }

                        let sessions = sessions.clone();
                        let session_id = session_id.clone();
                        let config = config.clone();
                        let stats = stats.clone();
                        tokio::spawn(async move {
                            let result = handle_tunnel_connection(
                                &sessions,
                                &session_id,
                                stream,
                                peer_addr,
                                &config,
                                &stats,
                            )
                            .await;

                            let mut s = stats.write();
                            s.active_connections = s.active_connections.saturating_sub(1);
                            if let Err(e) = result {
                                s.failed_connections += 1;
                                warn!("Tunnel connection from {} dropped: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        // Small delay before retrying
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    // listener dropped here, which releases the port
}

/// Open the forwarded channel for one local connection and splice the two.
/// If the channel cannot be opened the local socket is simply dropped.
async fn handle_tunnel_connection(
    sessions: &SessionManager,
    session_id: &str,
    local: TcpStream,
    peer_addr: SocketAddr,
    config: &TunnelConfig,
    stats: &parking_lot::RwLock<TunnelStats>,
) -> Result<(), SshError> {
    let handle = sessions.connected_handle(session_id)?;
    let remote = handle
        .forward_out(
            &peer_addr.ip().to_string(),
            peer_addr.port(),
            &config.remote_host,
            config.remote_port,
        )
        .await?;

    debug!(
        "Opened channel for forward to {}:{}",
        config.remote_host, config.remote_port
    );
    splice(local, remote, stats).await;
    debug!("Forward connection from {} closed", peer_addr);
    Ok(())
}

/// Copy both directions until either one ends, then shut both sides down
async fn splice(
    local: TcpStream,
    remote: Box<dyn ForwardStream>,
    stats: &parking_lot::RwLock<TunnelStats>,
) {
    let (mut local_read, mut local_write) = local.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    tokio::select! {
        _ = pump(&mut local_read, &mut remote_write, |n| stats.write().bytes_sent += n) => {}
        _ = pump(&mut remote_read, &mut local_write, |n| stats.write().bytes_received += n) => {}
    }

    let _ = remote_write.shutdown().await;
    let _ = local_write.shutdown().await;
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, count: impl Fn(u64)) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 32768];
    loop {
        let n = match tokio::time::timeout(FORWARD_IDLE_TIMEOUT, reader.read(&mut buf)).await {
            Ok(Ok(0)) => return Ok(()), // EOF
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("Forward read error: {}", e);
                return Err(e);
            }
            Err(_) => {
                debug!(
                    "Forward idle timeout ({}s), closing connection",
                    FORWARD_IDLE_TIMEOUT.as_secs()
                );
                return Ok(());
            }
        };
        writer.write_all(&buf[..n]).await?;
        count(n as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_id_is_deterministic() {
        let config = TunnelConfig::new(8080, "db.internal", 5432);
        assert_eq!(config.tunnel_id("s1"), "s1:8080->db.internal:5432");
        assert_eq!(config.tunnel_id("s1"), config.clone().tunnel_id("s1"));
    }

    #[test]
    fn test_config_wire_shape() {
        let config: TunnelConfig = serde_json::from_str(
            r#"{"localPort": 8888, "remoteHost": "localhost", "remotePort": 8888}"#,
        )
        .unwrap();
        assert_eq!(config, TunnelConfig::new(8888, "localhost", 8888));
    }

    #[tokio::test]
    async fn test_bind_error_names_the_address() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| bind_error(&format!("127.0.0.1:{}", port), e))
            .unwrap_err();
        match err {
            SshError::TunnelBindFailed { addr, reason } => {
                assert_eq!(addr, format!("127.0.0.1:{}", port));
                assert!(reason.contains("already in use"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
