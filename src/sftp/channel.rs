//! File-transfer sub-channel
//!
//! [`FileChannel`] is the set of SFTP requests the file-session manager
//! needs. [`RusshFileChannel`] implements it over a russh-sftp session.

use async_trait::async_trait;
use russh_sftp::client::SftpSession as RusshSftpSession;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::SftpError;
use super::types::RemoteEntry;

#[async_trait]
pub trait FileChannel: Send + Sync {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError>;

    async fn open_read(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, SftpError>;

    /// Create or truncate `path`. The upload is durable once the returned
    /// writer has been shut down.
    async fn create(&self, path: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>, SftpError>;

    async fn mkdir(&self, path: &str) -> Result<(), SftpError>;

    async fn remove(&self, path: &str) -> Result<(), SftpError>;

    async fn close(&self) -> Result<(), SftpError>;
}

pub struct RusshFileChannel {
    sftp: RusshSftpSession,
}

impl RusshFileChannel {
    pub fn new(sftp: RusshSftpSession) -> Self {
        Self { sftp }
    }
}

#[async_trait]
impl FileChannel for RusshFileChannel {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError> {
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;

        Ok(read_dir
            .map(|entry| {
                let metadata = entry.metadata();
                RemoteEntry {
                    name: entry.file_name(),
                    size: metadata.size.unwrap_or(0),
                    mode: metadata.permissions,
                    mtime: metadata.mtime.map(u64::from),
                }
            })
            .collect())
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, SftpError> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>, SftpError> {
        let file = self
            .sftp
            .create(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;
        Ok(Box::new(file))
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))
    }

    async fn remove(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))
    }

    async fn close(&self) -> Result<(), SftpError> {
        self.sftp
            .close()
            .await
            .map_err(|e| SftpError::Channel(e.to_string()))
    }
}
