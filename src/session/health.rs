//! Connection Health Check Module
//!
//! A periodic sweep that probes quiet sessions and evicts stale pooled ones,
//! plus the per-session health report shown next to connection stats.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::SessionManager;
use super::types::{SessionState, SessionStats};
use crate::config::HealthConfig;

/// Connection health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Connected but silent for too long
    Idle,
    /// Connected but accumulating errors
    Degraded,
    /// Not connected
    Disconnected,
}

/// Health check thresholds
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Inactivity above this is unhealthy (ms)
    pub max_idle_ms: u64,
    /// More errors than this is unhealthy
    pub max_errors: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_idle_ms: 60_000,
            max_errors: 10,
        }
    }
}

/// Quick health check result for UI display
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickHealthCheck {
    pub session_id: String,
    pub healthy: bool,
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub message: String,
}

impl QuickHealthCheck {
    pub fn assess(stats: &SessionStats, thresholds: &HealthThresholds) -> Self {
        let (status, message) = if stats.state != SessionState::Connected {
            (HealthStatus::Disconnected, format!("Session is {}", stats.state))
        } else if stats.idle_ms > thresholds.max_idle_ms {
            (
                HealthStatus::Idle,
                format!("No activity for {}s", stats.idle_ms / 1000),
            )
        } else if stats.errors > thresholds.max_errors {
            (
                HealthStatus::Degraded,
                format!("{} errors since connect", stats.errors),
            )
        } else if let Some(lat) = stats.latency_ms {
            (HealthStatus::Healthy, format!("Connected • {}ms", lat))
        } else {
            (HealthStatus::Healthy, "Connected".to_string())
        };

        Self {
            session_id: stats.id.clone(),
            healthy: status == HealthStatus::Healthy,
            status,
            latency_ms: stats.latency_ms,
            message,
        }
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub failed: usize,
    pub evicted: usize,
}

/// Probe every active session idle for longer than `2 × period`, then evict
/// pooled sessions idle for as long.
pub async fn sweep(
    manager: &Arc<SessionManager>,
    period: Duration,
    probe_timeout: Duration,
) -> SweepReport {
    let threshold = period * 2;
    let stale = manager.stale_sessions(threshold);

    let mut probes = JoinSet::new();
    for id in &stale {
        let manager = Arc::clone(manager);
        let id = id.clone();
        probes.spawn(async move { manager.probe(&id, probe_timeout).await.is_ok() });
    }

    let mut report = SweepReport {
        probed: stale.len(),
        ..Default::default()
    };
    while let Some(result) = probes.join_next().await {
        if !matches!(result, Ok(true)) {
            report.failed += 1;
        }
    }

    report.evicted = manager.pool().evict_idle(threshold).await;
    if report.probed > 0 || report.evicted > 0 {
        debug!("Health sweep: {:?}", report);
    }
    report
}

/// Background task running [`sweep`] every period until stopped
pub struct HealthMonitor {
    token: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn start(manager: &Arc<SessionManager>, config: &HealthConfig) -> Self {
        let token = CancellationToken::new();
        let period = Duration::from_millis(config.period_ms);
        let probe_timeout = Duration::from_millis(config.probe_timeout_ms);

        let task = {
            let token = token.clone();
            let manager: Weak<SessionManager> = Arc::downgrade(manager);
            tokio::spawn(async move {
                info!("Health monitor started (period={:?})", period);
                let mut interval = tokio::time::interval(period);
                // Skip the immediate first tick
                interval.tick().await;

                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let Some(manager) = manager.upgrade() else {
                                break;
                            };
                            let report = sweep(&manager, period, probe_timeout).await;
                            if report.failed > 0 {
                                warn!("{} of {} probes failed", report.failed, report.probed);
                            }
                        }
                    }
                }
                info!("Health monitor stopped");
            })
        };

        Self {
            token,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop the sweep and wait for an in-progress one to finish
    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
