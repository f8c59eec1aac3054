//! Port Forwarding Manager
//!
//! Centralized management for local port forwards across all sessions.
//! Tunnel ids are derived from the request, so starting the same tunnel
//! twice returns the running one.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use super::local::{start_local_tunnel, LocalTunnel, TunnelConfig, TunnelStats};
use crate::config::TunnelSettings;
use crate::events::SessionEvent;
use crate::session::SessionManager;
use crate::ssh::SshError;

/// Tunnel summary for listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub session_id: String,
    pub config: TunnelConfig,
    pub bound_addr: String,
    pub stats: TunnelStats,
}

pub struct TunnelManager {
    sessions: Arc<SessionManager>,
    settings: TunnelSettings,
    /// Held across bind so two starts of the same id cannot race
    tunnels: Mutex<HashMap<String, Arc<LocalTunnel>>>,
}

impl TunnelManager {
    pub fn new(sessions: Arc<SessionManager>, settings: TunnelSettings) -> Self {
        Self {
            sessions,
            settings,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Start forwarding `127.0.0.1:local_port` to `remote_host:remote_port`
    /// through `session_id`. Returns the tunnel id.
    pub async fn start(&self, session_id: &str, config: TunnelConfig) -> Result<String, SshError> {
        let id = config.tunnel_id(session_id);
        let mut tunnels = self.tunnels.lock().await;
        if let Some(existing) = tunnels.get(&id) {
            if existing.is_running() {
                info!("Tunnel {} already running", id);
                return Ok(id);
            }
        }

        // fail early if the session is not usable
        self.sessions.connected_handle(session_id)?;

        let tunnel = start_local_tunnel(
            self.sessions.clone(),
            session_id,
            config.clone(),
            &self.settings.bind_address,
        )
        .await?;
        tunnels.insert(id.clone(), Arc::new(tunnel));
        drop(tunnels);

        // the session may have gone away since the check above
        let _ = self.sessions.emit(
            session_id,
            SessionEvent::TunnelStarted {
                tunnel_id: id.clone(),
                config,
            },
        );
        info!("Tunnel created: {}", id);
        Ok(id)
    }

    /// Stop a tunnel. Connections already spliced drain on their own.
    pub async fn stop(&self, tunnel_id: &str) -> Result<(), SshError> {
        let tunnel = self
            .tunnels
            .lock()
            .await
            .remove(tunnel_id)
            .ok_or_else(|| SshError::SessionNotFound(tunnel_id.to_string()))?;
        tunnel.stop().await;
        info!("Stopped tunnel: {}", tunnel_id);
        Ok(())
    }

    /// Stop every tunnel of `session_id`
    pub async fn stop_for_session(&self, session_id: &str) -> usize {
        let stopping: Vec<Arc<LocalTunnel>> = {
            let mut tunnels = self.tunnels.lock().await;
            let ids: Vec<String> = tunnels
                .values()
                .filter(|t| t.session_id == session_id)
                .map(|t| t.id.clone())
                .collect();
            ids.iter().filter_map(|id| tunnels.remove(id)).collect()
        };

        for tunnel in &stopping {
            tunnel.stop().await;
        }
        stopping.len()
    }

    pub async fn list(&self) -> Vec<TunnelInfo> {
        let tunnels = self.tunnels.lock().await;
        let mut list: Vec<TunnelInfo> = tunnels
            .values()
            .map(|t| TunnelInfo {
                tunnel_id: t.id.clone(),
                session_id: t.session_id.clone(),
                config: t.config.clone(),
                bound_addr: t.bound_addr.to_string(),
                stats: t.stats(),
            })
            .collect();
        list.sort_by(|a, b| a.tunnel_id.cmp(&b.tunnel_id));
        list
    }

    pub async fn stats(&self, tunnel_id: &str) -> Option<TunnelStats> {
        self.tunnels.lock().await.get(tunnel_id).map(|t| t.stats())
    }

    /// Stop all tunnels (for shutdown)
    pub async fn stop_all(&self) {
        let stopping: Vec<Arc<LocalTunnel>> = {
            let mut tunnels = self.tunnels.lock().await;
            tunnels.drain().map(|(_, t)| t).collect()
        };

        info!("Stopping {} tunnels", stopping.len());
        for tunnel in &stopping {
            tunnel.stop().await;
        }
    }
}
