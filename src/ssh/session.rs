//! Transport session
//!
//! A [`TransportSession`] owns one transport connection and its interactive
//! shell. Shell output is pumped into the lifecycle manager as
//! [`TransportSignal`]s tagged with the session's generation, so output from
//! a replaced or closed transport can be told apart and dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use super::config::ConnectionConfig;
use super::error::SshError;
use super::transport::{ShellChannel, ShellCommand, ShellOutput, TransportHandle, TransportProvider};

/// Byte counters and activity clock, shared by every transport a session
/// has had so the numbers stay cumulative across reconnects.
#[derive(Debug)]
pub struct TransportStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl Default for TransportStats {
    fn default() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// What a transport reports back to its owner
#[derive(Debug)]
pub enum SignalKind {
    Data(Vec<u8>),
    Closed,
    Error(SshError),
}

#[derive(Debug)]
pub struct TransportSignal {
    pub session_id: String,
    pub generation: u64,
    pub kind: SignalKind,
}

/// Cheap handle for writing to and resizing the shell
#[derive(Clone)]
pub struct ShellWriter {
    commands: mpsc::Sender<ShellCommand>,
    stats: Arc<TransportStats>,
}

impl ShellWriter {
    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.commands
            .send(ShellCommand::Data(data.to_vec()))
            .await
            .map_err(|_| SshError::Disconnected)?;
        self.stats.record_sent(data.len());
        Ok(())
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.commands
            .send(ShellCommand::Resize { cols, rows })
            .await
            .map_err(|_| SshError::Disconnected)
    }
}

pub struct TransportSession {
    session_id: String,
    generation: u64,
    handle: Arc<dyn TransportHandle>,
    writer: ShellWriter,
    closed: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl TransportSession {
    /// Connect, authenticate and open the shell.
    ///
    /// The connect deadline covers handshake and auth; the ready deadline
    /// covers shell open. A transport whose shell fails to open is closed
    /// before the error is returned.
    pub async fn establish(
        provider: &dyn TransportProvider,
        config: &ConnectionConfig,
        session_id: &str,
        generation: u64,
        stats: Arc<TransportStats>,
        signals: mpsc::UnboundedSender<TransportSignal>,
    ) -> Result<Self, SshError> {
        let handle = match timeout(config.timeouts.connect, provider.connect(config)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SshError::ConnectTimeout(format!(
                    "connect to {} did not complete within {}ms",
                    config.address(),
                    config.timeouts.connect.as_millis()
                )))
            }
        };

        let opening = handle.open_shell(config.cols, config.rows);
        let shell = match timeout(config.timeouts.ready, opening).await {
            Ok(Ok(shell)) => shell,
            Ok(Err(e)) => {
                handle.close().await;
                return Err(e);
            }
            Err(_) => {
                handle.close().await;
                return Err(SshError::ConnectTimeout(format!(
                    "shell on {} did not open within {}ms",
                    config.address(),
                    config.timeouts.ready.as_millis()
                )));
            }
        };

        stats.touch();
        info!("Transport ready for session {} (generation {})", session_id, generation);
        Ok(Self::start(
            session_id.to_string(),
            generation,
            handle,
            shell,
            stats,
            signals,
        ))
    }

    fn start(
        session_id: String,
        generation: u64,
        handle: Arc<dyn TransportHandle>,
        shell: ShellChannel,
        stats: Arc<TransportStats>,
        signals: mpsc::UnboundedSender<TransportSignal>,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let ShellChannel {
            commands,
            mut output,
        } = shell;

        let pump = {
            let closed = closed.clone();
            let stats = stats.clone();
            let sid = session_id.clone();
            tokio::spawn(async move {
                let signal = |kind| TransportSignal {
                    session_id: sid.clone(),
                    generation,
                    kind,
                };

                let terminal = loop {
                    let Some(out) = output.recv().await else {
                        break SignalKind::Closed;
                    };
                    if closed.load(Ordering::Acquire) {
                        return;
                    }
                    match out {
                        ShellOutput::Data(data) => {
                            stats.record_received(data.len());
                            if signals.send(signal(SignalKind::Data(data))).is_err() {
                                return;
                            }
                        }
                        ShellOutput::Closed => break SignalKind::Closed,
                        ShellOutput::Error(e) => break SignalKind::Error(e),
                    }
                };

                if !closed.load(Ordering::Acquire) {
                    debug!("Shell for session {} ended: {:?}", sid, terminal);
                    let _ = signals.send(signal(terminal));
                }
            })
        };

        Self {
            session_id,
            generation,
            handle,
            writer: ShellWriter { commands, stats },
            closed,
            pump,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&self) -> Arc<dyn TransportHandle> {
        self.handle.clone()
    }

    pub fn writer(&self) -> ShellWriter {
        self.writer.clone()
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.writer.write(data).await
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.writer.resize(cols, rows).await
    }

    /// Stop the output pump, close the shell and the transport.
    /// No signal is delivered for this generation afterwards.
    pub async fn close(self) {
        self.stop_pump();
        self.handle.close().await;
        debug!(
            "Transport closed for session {} (generation {})",
            self.session_id, self.generation
        );
    }

    fn stop_pump(&self) {
        self.closed.store(true, Ordering::Release);
        self.pump.abort();
        let _ = self.writer.commands.try_send(ShellCommand::Close);
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        // dropping the handle releases the connection once its last clone goes
        self.stop_pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::config::{validate, RawConnectionConfig};
    use crate::testing::{ConnectStep, MockProvider};

    fn config() -> ConnectionConfig {
        let mut raw = RawConnectionConfig::password("h", "u", "p");
        raw.connect_timeout = Some(1000);
        raw.ready_timeout = Some(1000);
        validate(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_data_flows_and_stops_after_close() {
        let provider = MockProvider::new();
        let stats = Arc::new(TransportStats::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session = TransportSession::establish(&provider, &config(), "s1", 7, stats.clone(), tx)
            .await
            .unwrap();
        let remote = provider.last_handle();

        remote.push_output(b"hello").await;
        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.generation, 7);
        assert!(matches!(signal.kind, SignalKind::Data(ref d) if d == b"hello"));
        assert_eq!(stats.bytes_received(), 5);

        session.write(b"ls\n").await.unwrap();
        assert_eq!(stats.bytes_sent(), 3);

        session.close().await;
        assert!(remote.is_closed());

        remote.push_output(b"late").await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_close_is_signalled() {
        let provider = MockProvider::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _session = TransportSession::establish(
            &provider,
            &config(),
            "s1",
            1,
            Arc::new(TransportStats::new()),
            tx,
        )
        .await
        .unwrap();

        provider.last_handle().drop_shell();
        let signal = rx.recv().await.unwrap();
        assert!(matches!(signal.kind, SignalKind::Closed));
    }

    #[tokio::test]
    async fn test_shell_failure_closes_transport() {
        let provider = MockProvider::with_script([ConnectStep::ShellFails]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = TransportSession::establish(
            &provider,
            &config(),
            "s1",
            1,
            Arc::new(TransportStats::new()),
            tx,
        )
        .await;

        assert!(result.is_err());
        assert!(provider.last_handle().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_deadline() {
        let provider = MockProvider::with_script([ConnectStep::Hang]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = TransportSession::establish(
            &provider,
            &config(),
            "s1",
            1,
            Arc::new(TransportStats::new()),
            tx,
        )
        .await;

        assert!(matches!(result, Err(SshError::ConnectTimeout(_))));
        assert_eq!(provider.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_deadline_closes_transport() {
        let provider = MockProvider::with_script([ConnectStep::ShellHang]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let started = tokio::time::Instant::now();
        let result = TransportSession::establish(
            &provider,
            &config(),
            "s1",
            1,
            Arc::new(TransportStats::new()),
            tx,
        )
        .await;

        match result {
            Err(SshError::ConnectTimeout(message)) => assert!(message.contains("shell")),
            other => panic!("expected a ready timeout, got {:?}", other.err()),
        }
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert!(provider.last_handle().is_closed());
    }
}
