//! In-memory transport provider for tests
//!
//! Connect attempts follow a script of [`ConnectStep`]s (then succeed),
//! shells are plain channels the test can push output into, forwarded
//! streams are echo servers over `tokio::io::duplex`, and the file
//! subsystem is a map of paths.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};

use crate::sftp::{FileChannel, RemoteEntry, SftpError};
use crate::ssh::{
    ConnectionConfig, ForwardStream, ShellChannel, ShellCommand, ShellOutput, SshError,
    TransportHandle, TransportProvider,
};

pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStep {
    Succeed,
    /// Fail with a host-unreachable error
    Unreachable,
    AuthFail,
    /// Never complete (exercises deadlines)
    Hang,
    /// Connect, then fail to open the shell
    ShellFails,
    /// Connect, then never finish opening the shell
    ShellHang,
}

#[derive(Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<ConnectStep>>,
    connects: AtomicUsize,
    handles: Mutex<Vec<Arc<MockHandle>>>,
    pub fs: Arc<MockFs>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(steps: impl IntoIterator<Item = ConnectStep>) -> Self {
        let provider = Self::default();
        provider.script.lock().extend(steps);
        provider
    }

    pub fn push_steps(&self, steps: impl IntoIterator<Item = ConnectStep>) {
        self.script.lock().extend(steps);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn handles(&self) -> Vec<Arc<MockHandle>> {
        self.handles.lock().clone()
    }

    pub fn last_handle(&self) -> Arc<MockHandle> {
        self.handles
            .lock()
            .last()
            .cloned()
            .expect("no transport was opened")
    }
}

#[async_trait]
impl TransportProvider for MockProvider {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
    ) -> Result<Arc<dyn TransportHandle>, SshError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front().unwrap_or(ConnectStep::Succeed);
        match step {
            ConnectStep::Unreachable => {
                Err(SshError::HostUnreachable("connect ECONNREFUSED".into()))
            }
            ConnectStep::AuthFail => Err(SshError::AuthFailed("password rejected".into())),
            ConnectStep::Hang => std::future::pending().await,
            ConnectStep::Succeed | ConnectStep::ShellFails | ConnectStep::ShellHang => {
                let handle = Arc::new(MockHandle::new(step, self.fs.clone()));
                self.handles.lock().push(handle.clone());
                Ok(handle)
            }
        }
    }
}

pub struct MockHandle {
    shell: ConnectStep,
    shell_output: Mutex<Option<mpsc::Sender<ShellOutput>>>,
    written: Arc<Mutex<Vec<u8>>>,
    resizes: Arc<Mutex<Vec<(u32, u32)>>>,
    closed: AtomicBool,
    pings: AtomicUsize,
    pub ping_fails: AtomicBool,
    /// Pings never answer
    pub ping_hangs: AtomicBool,
    pub forward_fails: AtomicBool,
    forwards: AtomicUsize,
    close_gate: Mutex<Option<Arc<Notify>>>,
    fs: Arc<MockFs>,
}

impl MockHandle {
    fn new(shell: ConnectStep, fs: Arc<MockFs>) -> Self {
        Self {
            shell,
            shell_output: Mutex::new(None),
            written: Arc::default(),
            resizes: Arc::default(),
            closed: AtomicBool::new(false),
            pings: AtomicUsize::new(0),
            ping_fails: AtomicBool::new(false),
            ping_hangs: AtomicBool::new(false),
            forward_fails: AtomicBool::new(false),
            forwards: AtomicUsize::new(0),
            close_gate: Mutex::new(None),
            fs,
        }
    }

    /// Deliver shell output as if the remote side had sent it
    pub async fn push_output(&self, data: &[u8]) {
        let tx = self.shell_output.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(ShellOutput::Data(data.to_vec())).await;
        }
    }

    /// Fail the shell with a transport error
    pub async fn push_error(&self, err: SshError) {
        let tx = self.shell_output.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(ShellOutput::Error(err)).await;
        }
    }

    /// Simulate the remote end closing the shell
    pub fn drop_shell(&self) {
        self.shell_output.lock().take();
    }

    /// Make the next `close()` wait until the returned gate is notified
    pub fn hold_close(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.close_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.resizes.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn forward_count(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportHandle for MockHandle {
    async fn open_shell(&self, _cols: u32, _rows: u32) -> Result<ShellChannel, SshError> {
        match self.shell {
            ConnectStep::ShellFails => {
                return Err(SshError::Channel("shell request refused".into()))
            }
            ConnectStep::ShellHang => std::future::pending::<()>().await,
            _ => {}
        }

        let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        *self.shell_output.lock() = Some(out_tx);

        let written = self.written.clone();
        let resizes = self.resizes.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    ShellCommand::Data(data) => written.lock().extend_from_slice(&data),
                    ShellCommand::Resize { cols, rows } => resizes.lock().push((cols, rows)),
                    ShellCommand::Close => break,
                }
            }
        });

        Ok(ShellChannel {
            commands: cmd_tx,
            output: out_rx,
        })
    }

    async fn open_file_subsystem(&self) -> Result<Box<dyn FileChannel>, SshError> {
        if self.is_closed() {
            return Err(SshError::Disconnected);
        }
        Ok(Box::new(MockFileChannel {
            fs: self.fs.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn forward_out(
        &self,
        _src_addr: &str,
        _src_port: u16,
        _dst_host: &str,
        _dst_port: u16,
    ) -> Result<Box<dyn ForwardStream>, SshError> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        if self.forward_fails.load(Ordering::SeqCst) || self.is_closed() {
            return Err(SshError::Channel("open failed: connect refused".into()));
        }

        let (local, mut remote) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match remote.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if remote.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(local))
    }

    async fn ping(&self) -> Result<(), SshError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.ping_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.ping_fails.load(Ordering::SeqCst) {
            Err(SshError::Disconnected)
        } else {
            Ok(())
        }
    }

    async fn close(&self) {
        let gate = self.close_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.shell_output.lock().take();
    }
}

#[derive(Debug, Clone)]
pub enum MockNode {
    Dir,
    File(Vec<u8>),
    Link,
}

/// Flat path → node map standing in for a remote filesystem
#[derive(Debug, Default)]
pub struct MockFs {
    nodes: Mutex<BTreeMap<String, MockNode>>,
}

impl MockFs {
    pub fn insert(&self, path: &str, node: MockNode) {
        self.nodes.lock().insert(path.to_string(), node);
    }

    pub fn get(&self, path: &str) -> Option<MockNode> {
        self.nodes.lock().get(path).cloned()
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.get(path)? {
            MockNode::File(data) => Some(data),
            _ => None,
        }
    }
}

struct MockFileChannel {
    fs: Arc<MockFs>,
    closed: AtomicBool,
}

impl MockFileChannel {
    fn check_open(&self) -> Result<(), SftpError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SftpError::Channel("channel closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FileChannel for MockFileChannel {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError> {
        self.check_open()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let nodes = self.fs.nodes.lock();
        if !matches!(nodes.get(path.trim_end_matches('/')), Some(MockNode::Dir)) && path != "/" {
            return Err(SftpError::NotFound(path.to_string()));
        }

        let mut entries: Vec<RemoteEntry> = nodes
            .iter()
            .filter_map(|(p, node)| {
                let name = p.strip_prefix(&prefix)?;
                if name.is_empty() || name.contains('/') {
                    return None;
                }
                let (size, mode) = match node {
                    MockNode::Dir => (0, S_IFDIR | 0o755),
                    MockNode::File(data) => (data.len() as u64, S_IFREG | 0o644),
                    MockNode::Link => (0, S_IFLNK | 0o777),
                };
                Some(RemoteEntry {
                    name: name.to_string(),
                    size,
                    mode: Some(mode),
                    mtime: Some(1_700_000_000),
                })
            })
            .collect();
        entries.push(RemoteEntry {
            name: ".".into(),
            size: 0,
            mode: Some(S_IFDIR | 0o755),
            mtime: None,
        });
        Ok(entries)
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, SftpError> {
        self.check_open()?;
        match self.fs.get(path) {
            Some(MockNode::File(data)) => Ok(Box::new(io::Cursor::new(data))),
            Some(_) => Err(SftpError::Channel(format!("{} is not a file", path))),
            None => Err(SftpError::NotFound(path.to_string())),
        }
    }

    async fn create(&self, path: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>, SftpError> {
        self.check_open()?;
        Ok(Box::new(MockWriter {
            fs: self.fs.clone(),
            path: path.to_string(),
            buf: Vec::new(),
        }))
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.check_open()?;
        let mut nodes = self.fs.nodes.lock();
        if nodes.contains_key(path) {
            return Err(SftpError::Channel(format!("{} already exists", path)));
        }
        nodes.insert(path.to_string(), MockNode::Dir);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), SftpError> {
        self.check_open()?;
        match self.fs.nodes.lock().remove(path) {
            Some(_) => Ok(()),
            None => Err(SftpError::NotFound(path.to_string())),
        }
    }

    async fn close(&self) -> Result<(), SftpError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Buffers writes and only publishes the file on shutdown, so a caller that
/// forgets to finish the upload leaves nothing behind.
struct MockWriter {
    fs: Arc<MockFs>,
    path: String,
    buf: Vec<u8>,
}

impl AsyncWrite for MockWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let data = self.buf.clone();
        self.fs.insert(&self.path, MockNode::File(data));
        Poll::Ready(Ok(()))
    }
}
