//! Remote shell service
//!
//! The one object an application constructs. It owns the lifecycle manager,
//! the file-session and tunnel managers and the health monitor, and exposes
//! the command surface: connections, file transfer and tunnels.
//! Call [`RemoteShellService::shutdown`] before dropping it.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::CoreConfig;
use crate::events::EventSink;
use crate::forwarding::{TunnelConfig, TunnelInfo, TunnelManager};
use crate::session::{
    DisconnectOptions, HealthMonitor, HealthThresholds, QuickHealthCheck, SessionManager,
    SessionStats,
};
use crate::sftp::{FileEntry, FileSessionManager, SftpError};
use crate::ssh::{RawConnectionConfig, SshError, TransportProvider};

/// Error returned by the command surface
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Sftp(#[from] SftpError),
}

impl serde::Serialize for CoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

pub struct RemoteShellService {
    sessions: Arc<SessionManager>,
    files: FileSessionManager,
    tunnels: TunnelManager,
    health: Option<HealthMonitor>,
    thresholds: HealthThresholds,
}

impl RemoteShellService {
    /// Build the service on `provider`. Must be called within a tokio runtime.
    pub fn new(provider: Arc<dyn TransportProvider>, config: CoreConfig) -> Self {
        let sessions = SessionManager::new(provider);
        let health = config
            .health
            .enabled
            .then(|| HealthMonitor::start(&sessions, &config.health));

        Self {
            files: FileSessionManager::new(sessions.clone()),
            tunnels: TunnelManager::new(sessions.clone(), config.tunnels.clone()),
            sessions,
            health,
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub async fn test_connection(&self, config: &RawConnectionConfig) -> CoreResult<()> {
        Ok(self.sessions.test_connection(config).await?)
    }

    pub async fn connect(
        &self,
        config: &RawConnectionConfig,
        sink: Arc<dyn EventSink>,
    ) -> CoreResult<String> {
        Ok(self.sessions.create_connection(config, sink).await?)
    }

    pub async fn write(&self, session_id: &str, data: &[u8]) -> CoreResult<()> {
        Ok(self.sessions.write(session_id, data).await?)
    }

    pub async fn resize(&self, session_id: &str, cols: u32, rows: u32) -> CoreResult<()> {
        Ok(self.sessions.resize(session_id, cols, rows).await?)
    }

    /// Disconnect a session, closing its file sessions and tunnels first
    pub async fn disconnect(&self, session_id: &str, options: DisconnectOptions) -> CoreResult<()> {
        // surface SessionNotFound before touching anything else
        self.sessions.stats(session_id)?;

        let files = self.files.close_for_session(session_id).await;
        let tunnels = self.tunnels.stop_for_session(session_id).await;
        if files > 0 || tunnels > 0 {
            info!(
                "Closed {} file sessions and {} tunnels of {}",
                files, tunnels, session_id
            );
        }
        Ok(self.sessions.disconnect(session_id, options).await?)
    }

    /// Stats for one session, or for every active session when `session_id` is `None`
    pub fn get_stats(&self, session_id: Option<&str>) -> CoreResult<Vec<SessionStats>> {
        match session_id {
            Some(id) => Ok(vec![self.sessions.stats(id)?]),
            None => Ok(self.sessions.all_stats()),
        }
    }

    pub fn health_check(&self) -> Vec<QuickHealthCheck> {
        self.sessions
            .all_stats()
            .iter()
            .map(|stats| QuickHealthCheck::assess(stats, &self.thresholds))
            .collect()
    }

    // ========================================================================
    // File sessions
    // ========================================================================

    pub async fn open_file_session(&self, session_id: &str) -> CoreResult<String> {
        Ok(self.files.open(session_id).await?)
    }

    pub async fn list_directory(
        &self,
        file_session_id: &str,
        path: &str,
    ) -> CoreResult<Vec<FileEntry>> {
        Ok(self.files.list_directory(file_session_id, path).await?)
    }

    pub async fn download(
        &self,
        file_session_id: &str,
        remote_path: &str,
        local_path: impl AsRef<Path>,
    ) -> CoreResult<u64> {
        Ok(self
            .files
            .download(file_session_id, remote_path, local_path)
            .await?)
    }

    pub async fn upload(
        &self,
        file_session_id: &str,
        local_path: impl AsRef<Path>,
        remote_path: &str,
    ) -> CoreResult<u64> {
        Ok(self
            .files
            .upload(file_session_id, local_path, remote_path)
            .await?)
    }

    pub async fn mkdir(&self, file_session_id: &str, path: &str) -> CoreResult<()> {
        Ok(self.files.mkdir(file_session_id, path).await?)
    }

    pub async fn delete(&self, file_session_id: &str, path: &str) -> CoreResult<()> {
        Ok(self.files.delete(file_session_id, path).await?)
    }

    pub async fn close_file_session(&self, file_session_id: &str) -> CoreResult<()> {
        Ok(self.files.close(file_session_id).await?)
    }

    // ========================================================================
    // Tunnels
    // ========================================================================

    pub async fn start_tunnel(&self, session_id: &str, config: TunnelConfig) -> CoreResult<String> {
        Ok(self.tunnels.start(session_id, config).await?)
    }

    pub async fn stop_tunnel(&self, tunnel_id: &str) -> CoreResult<()> {
        Ok(self.tunnels.stop(tunnel_id).await?)
    }

    pub async fn list_tunnels(&self) -> Vec<TunnelInfo> {
        self.tunnels.list().await
    }

    /// Stop the health monitor, then close tunnels, file sessions and
    /// sessions (pooled ones included)
    pub async fn shutdown(&self) {
        info!("Shutting down remote shell service");
        if let Some(health) = &self.health {
            health.stop().await;
        }
        self.tunnels.stop_all().await;
        self.files.close_all().await;
        self.sessions.shutdown().await;
    }
}
