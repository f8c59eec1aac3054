//! russh transport provider
//!
//! [`RusshTransport`] performs the TCP connect, SSH handshake and
//! authentication, then hands the `Handle` to its owner task. Everything
//! after that goes through [`RusshHandle`], which implements
//! [`TransportHandle`] on top of the [`HandleController`].

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::ChannelMsg;
use russh_sftp::client::SftpSession as RusshSftpSession;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::agent::authenticate_with_agent;
use super::config::{AuthMethod, ConnectionConfig, KeySource};
use super::error::SshError;
use super::handle_owner::{ChannelTarget, HandleController};
use super::known_hosts::{HostKeyCache, HostKeyStatus};
use super::transport::{
    ForwardStream, ShellChannel, ShellCommand, ShellOutput, TransportHandle, TransportProvider,
};
use crate::sftp::{FileChannel, RusshFileChannel};

/// Client handler for russh callbacks
pub struct ClientHandler {
    host: String,
    port: u16,
    host_keys: Arc<HostKeyCache>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, host_keys: Arc<HostKeyCache>) -> Self {
        Self {
            host,
            port,
            host_keys,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.host_keys.check(&self.host, self.port, server_public_key) {
            HostKeyStatus::Verified | HostKeyStatus::Learned { .. } => Ok(true),
            HostKeyStatus::Changed { actual, .. } => Err(SshError::HostKeyMismatch {
                host: format!("{}:{}", self.host, self.port),
                fingerprint: actual,
            }),
        }
    }
}

/// Production transport provider backed by russh
#[derive(Clone, Default)]
pub struct RusshTransport {
    host_keys: Arc<HostKeyCache>,
}

impl RusshTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host_keys(&self) -> &Arc<HostKeyCache> {
        &self.host_keys
    }
}

#[async_trait]
impl TransportProvider for RusshTransport {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn TransportHandle>, SshError> {
        let address = config.address();
        info!("Connecting to {}@{}", config.username, address);

        let ssh_config = client::Config {
            // liveness is handled by keepalives and the health monitor
            inactivity_timeout: None,
            keepalive_interval: Some(config.keepalive.interval),
            keepalive_max: config.keepalive.count_max as usize,
            ..Default::default()
        };

        let handler = ClientHandler::new(config.host.clone(), config.port, self.host_keys.clone());
        let mut handle = client::connect(
            Arc::new(ssh_config),
            (config.host.as_str(), config.port),
            handler,
        )
        .await?;

        debug!("SSH handshake completed with {}", address);

        match timeout(config.timeouts.auth, authenticate(&mut handle, config)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SshError::ConnectTimeout(format!(
                    "authentication did not complete within {}ms",
                    config.timeouts.auth.as_millis()
                )))
            }
        }

        info!("SSH authentication successful for {}@{}", config.username, address);

        let controller = HandleController::spawn(handle, address);
        Ok(Arc::new(RusshHandle { controller }))
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    config: &ConnectionConfig,
) -> Result<(), SshError> {
    let username = config.username.as_str();
    let accepted = match &config.auth {
        AuthMethod::Password { password } => handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| SshError::AuthFailed(e.to_string()))?
            .success(),
        AuthMethod::Key { source, passphrase } => {
            let passphrase = passphrase.as_deref();
            let key = match source {
                KeySource::Path(path) => russh::keys::load_secret_key(path, passphrase)?,
                KeySource::Inline(text) => russh::keys::decode_secret_key(text, passphrase)?,
            };
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(username, key)
                .await
                .map_err(|e| SshError::AuthFailed(e.to_string()))?
                .success()
        }
        AuthMethod::Agent => {
            authenticate_with_agent(handle, username).await?;
            true
        }
    };

    if accepted {
        Ok(())
    } else {
        Err(SshError::AuthFailed(format!(
            "{} authentication rejected by server",
            config.auth.label()
        )))
    }
}

/// A connected russh session
pub struct RusshHandle {
    controller: HandleController,
}

#[async_trait]
impl TransportHandle for RusshHandle {
    async fn open_shell(&self, cols: u32, rows: u32) -> Result<ShellChannel, SshError> {
        let mut channel = self.controller.open(ChannelTarget::Session).await?;

        channel
            .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
            .await
            .map_err(|e| SshError::Channel(format!("PTY request failed: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::Channel(format!("shell request failed: {}", e)))?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(1024);
        let (out_tx, out_rx) = mpsc::channel::<ShellOutput>(1024);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ShellCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                let _ = out_tx.send(ShellOutput::Error(e.into())).await;
                                break;
                            }
                        }
                        Some(ShellCommand::Resize { cols, rows }) => {
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                warn!("Failed to resize PTY to {}x{}: {}", cols, rows, e);
                            }
                        }
                        Some(ShellCommand::Close) | None => {
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    },

                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if out_tx.send(ShellOutput::Data(data.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        // stderr is merged into the terminal stream
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            if out_tx.send(ShellOutput::Data(data.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            let _ = out_tx.send(ShellOutput::Closed).await;
                            break;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            debug!("Shell exited with status {}", exit_status);
                        }
                        Some(_) => {}
                    },
                }
            }
        });

        Ok(ShellChannel {
            commands: cmd_tx,
            output: out_rx,
        })
    }

    async fn open_file_subsystem(&self) -> Result<Box<dyn FileChannel>, SshError> {
        let channel = self.controller.open(ChannelTarget::Session).await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::Channel(format!("sftp subsystem request failed: {}", e)))?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Channel(format!("sftp init failed: {}", e)))?;

        Ok(Box::new(RusshFileChannel::new(sftp)))
    }

    async fn forward_out(
        &self,
        src_addr: &str,
        src_port: u16,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<Box<dyn ForwardStream>, SshError> {
        let channel = self
            .controller
            .open(ChannelTarget::DirectTcpip {
                host: dst_host.to_string(),
                port: dst_port,
                origin_addr: src_addr.to_string(),
                origin_port: src_port,
            })
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn ping(&self) -> Result<(), SshError> {
        self.controller.keepalive().await
    }

    async fn close(&self) {
        if self.controller.is_open() {
            self.controller.close().await;
        }
    }
}
