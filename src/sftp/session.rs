//! SFTP Session management
//!
//! File sessions are SFTP sub-channels opened over a connected SSH session.
//! Each one is addressed by its own id and serializes its operations behind
//! an async lock, so a long download and a listing on the same file session
//! never interleave on the wire.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::channel::FileChannel;
use super::error::SftpError;
use super::types::FileEntry;
use crate::session::SessionManager;

/// One open SFTP sub-channel
pub struct FileSession {
    pub id: String,
    /// SSH session this channel was opened on
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    channel: tokio::sync::Mutex<Box<dyn FileChannel>>,
}

/// Registry of file sessions
pub struct FileSessionManager {
    sessions: Arc<SessionManager>,
    files: RwLock<HashMap<String, Arc<FileSession>>>,
}

impl FileSessionManager {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Open a file-transfer channel on a `Connected` session
    pub async fn open(&self, session_id: &str) -> Result<String, SftpError> {
        let handle = self.sessions.connected_handle(session_id)?;
        info!("Opening SFTP subsystem for session {}", session_id);
        let channel = handle.open_file_subsystem().await?;

        let id = uuid::Uuid::new_v4().to_string();
        let file = Arc::new(FileSession {
            id: id.clone(),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            channel: tokio::sync::Mutex::new(channel),
        });
        self.files.write().insert(id.clone(), file);
        info!("File session {} opened on {}", id, session_id);
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Arc<FileSession>, SftpError> {
        self.files
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SftpError::SessionNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.files.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// List a directory, without the `.` and `..` entries
    pub async fn list_directory(&self, id: &str, path: &str) -> Result<Vec<FileEntry>, SftpError> {
        let file = self.get(id)?;
        let channel = file.channel.lock().await;
        let entries = channel.read_dir(path).await?;

        let entries: Vec<FileEntry> = entries
            .into_iter()
            .filter(|e| e.name != "." && e.name != "..")
            .map(FileEntry::from)
            .collect();
        debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    /// Copy a remote file to `local_path`. Returns once the local file has
    /// been flushed and synced to disk.
    pub async fn download(
        &self,
        id: &str,
        remote_path: &str,
        local_path: impl AsRef<Path>,
    ) -> Result<u64, SftpError> {
        let local_path = local_path.as_ref();
        let file = self.get(id)?;
        let channel = file.channel.lock().await;

        let mut reader = channel.open_read(remote_path).await?;
        let mut local = tokio::fs::File::create(local_path).await?;
        let bytes = tokio::io::copy(&mut reader, &mut local).await?;
        local.flush().await?;
        local.sync_all().await?;

        info!(
            "Downloaded {} -> {} ({} bytes)",
            remote_path,
            local_path.display(),
            bytes
        );
        Ok(bytes)
    }

    /// Copy `local_path` to a remote file. Returns once the remote handle
    /// has been flushed and shut down.
    pub async fn upload(
        &self,
        id: &str,
        local_path: impl AsRef<Path>,
        remote_path: &str,
    ) -> Result<u64, SftpError> {
        let local_path = local_path.as_ref();
        let file = self.get(id)?;
        let channel = file.channel.lock().await;

        let mut local = tokio::fs::File::open(local_path).await?;
        let mut writer = channel.create(remote_path).await?;
        let bytes = tokio::io::copy(&mut local, &mut writer).await?;
        writer.flush().await?;
        writer.shutdown().await?;

        info!(
            "Uploaded {} -> {} ({} bytes)",
            local_path.display(),
            remote_path,
            bytes
        );
        Ok(bytes)
    }

    pub async fn mkdir(&self, id: &str, path: &str) -> Result<(), SftpError> {
        let file = self.get(id)?;
        let channel = file.channel.lock().await;
        channel.mkdir(path).await?;
        debug!("Created directory {}", path);
        Ok(())
    }

    pub async fn delete(&self, id: &str, path: &str) -> Result<(), SftpError> {
        let file = self.get(id)?;
        let channel = file.channel.lock().await;
        channel.remove(path).await?;
        debug!("Deleted {}", path);
        Ok(())
    }

    /// Close a file session. Closing an unknown or closed id is a no-op.
    pub async fn close(&self, id: &str) -> Result<(), SftpError> {
        let Some(file) = self.files.write().remove(id) else {
            return Ok(());
        };
        Self::release(&file).await;
        Ok(())
    }

    /// Close every file session opened on `session_id`
    pub async fn close_for_session(&self, session_id: &str) -> usize {
        let closing: Vec<Arc<FileSession>> = {
            let mut files = self.files.write();
            let ids: Vec<String> = files
                .values()
                .filter(|f| f.session_id == session_id)
                .map(|f| f.id.clone())
                .collect();
            ids.iter().filter_map(|id| files.remove(id)).collect()
        };

        for file in &closing {
            Self::release(file).await;
        }
        closing.len()
    }

    /// Close all file sessions (for shutdown)
    pub async fn close_all(&self) {
        let closing: Vec<Arc<FileSession>> = {
            let mut files = self.files.write();
            files.drain().map(|(_, f)| f).collect()
        };

        info!("Closing {} SFTP sessions on shutdown", closing.len());
        for file in &closing {
            Self::release(file).await;
        }
    }

    /// Waits for an in-flight operation on the channel to finish first
    async fn release(file: &FileSession) {
        let channel = file.channel.lock().await;
        if let Err(e) = channel.close().await {
            warn!("Failed to close file session {}: {}", file.id, e);
        }
        info!("File session {} closed", file.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopSink;
    use crate::session::DisconnectOptions;
    use crate::ssh::{RawConnectionConfig, SshError};
    use crate::testing::{MockNode, MockProvider};

    async fn setup() -> (Arc<MockProvider>, Arc<SessionManager>, FileSessionManager, String) {
        let provider = Arc::new(MockProvider::new());
        let sessions = SessionManager::new(provider.clone());
        let session_id = sessions
            .create_connection(&RawConnectionConfig::password("h", "u", "p"), Arc::new(NoopSink))
            .await
            .unwrap();
        let files = FileSessionManager::new(sessions.clone());
        (provider, sessions, files, session_id)
    }

    #[tokio::test]
    async fn test_list_directory_classifies_by_mode() {
        let (provider, _sessions, files, session_id) = setup().await;
        provider.fs.insert("/home", MockNode::Dir);
        provider.fs.insert("/home/docs", MockNode::Dir);
        provider.fs.insert("/home/notes.txt", MockNode::File(b"hello".to_vec()));
        provider.fs.insert("/home/latest", MockNode::Link);

        let id = files.open(&session_id).await.unwrap();
        let mut entries = files.list_directory(&id, "/home").await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "latest", "notes.txt"]);
        for entry in &entries {
            assert!(!(entry.is_directory && entry.is_file));
        }
        assert!(entries[0].is_directory);
        assert!(!entries[1].is_directory && !entries[1].is_file);
        assert!(entries[2].is_file);
        assert_eq!(entries[2].size, 5);
        assert_eq!(entries[2].modified_time, 1_700_000_000);
    }

    #[tokio::test]
    async fn test_transfer_round_trip() {
        let (provider, _sessions, files, session_id) = setup().await;
        let dir = tempfile::tempdir().unwrap();
        let local_in = dir.path().join("in.bin");
        let local_out = dir.path().join("out.bin");
        tokio::fs::write(&local_in, vec![7u8; 10_000]).await.unwrap();

        let id = files.open(&session_id).await.unwrap();
        let sent = files.upload(&id, &local_in, "/data.bin").await.unwrap();
        assert_eq!(sent, 10_000);
        assert_eq!(provider.fs.contents("/data.bin").unwrap().len(), 10_000);

        let received = files.download(&id, "/data.bin", &local_out).await.unwrap();
        assert_eq!(received, 10_000);
        assert_eq!(tokio::fs::read(&local_out).await.unwrap(), vec![7u8; 10_000]);
    }

    #[tokio::test]
    async fn test_mkdir_and_delete() {
        let (provider, _sessions, files, session_id) = setup().await;
        provider.fs.insert("/tmp/old.log", MockNode::File(vec![]));

        let id = files.open(&session_id).await.unwrap();
        files.mkdir(&id, "/tmp/new").await.unwrap();
        assert!(matches!(provider.fs.get("/tmp/new"), Some(MockNode::Dir)));

        files.delete(&id, "/tmp/old.log").await.unwrap();
        assert!(provider.fs.get("/tmp/old.log").is_none());

        let err = files.delete(&id, "/tmp/old.log").await.unwrap_err();
        assert!(matches!(err, SftpError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_closed_id_is_not_found() {
        let (_provider, _sessions, files, session_id) = setup().await;
        let id = files.open(&session_id).await.unwrap();

        files.close(&id).await.unwrap();
        files.close(&id).await.unwrap();
        assert!(files.is_empty());

        let err = files.list_directory(&id, "/").await.unwrap_err();
        assert!(matches!(err, SftpError::SessionNotFound(_)));
        let err = files.mkdir("nope", "/x").await.unwrap_err();
        assert!(matches!(err, SftpError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_open_requires_connected_session() {
        let (_provider, sessions, files, session_id) = setup().await;

        let err = files.open("missing").await.unwrap_err();
        assert!(matches!(err, SftpError::Transport(SshError::SessionNotFound(_))));

        let id = files.open(&session_id).await.unwrap();
        sessions
            .disconnect(&session_id, DisconnectOptions::default())
            .await
            .unwrap();
        assert_eq!(files.close_for_session(&session_id).await, 1);
        assert!(!files.contains(&id));
        assert!(files.open(&session_id).await.is_err());
    }
}
