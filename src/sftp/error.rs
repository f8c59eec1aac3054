//! SFTP error types

use thiserror::Error;

use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum SftpError {
    /// Unknown or already closed file session id
    #[error("File session not found: {0}")]
    SessionNotFound(String),

    #[error("No such file: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("SFTP error: {0}")]
    Channel(String),

    /// The owning SSH session is missing or not connected
    #[error(transparent)]
    Transport(#[from] SshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SftpError {
    /// Map a russh-sftp failure for `path` by its status text
    pub(crate) fn from_sftp(err: russh_sftp::client::error::Error, path: &str) -> Self {
        let text = err.to_string();
        let lower = text.to_lowercase();
        if lower.contains("no such file") || lower.contains("not found") {
            SftpError::NotFound(path.to_string())
        } else if lower.contains("permission denied") {
            SftpError::PermissionDenied(path.to_string())
        } else {
            SftpError::Channel(format!("{}: {}", path, text))
        }
    }
}

impl serde::Serialize for SftpError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
