//! SSH Error types
//!
//! Every failure the connectivity core surfaces is an [`SshError`]. For the
//! event sink and the retry policy an error is reduced to an [`ErrorKind`]
//! via [`SshError::kind`].

use std::io;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    ConfigInvalid(Vec<String>),

    #[error("Connection timed out: {0}")]
    ConnectTimeout(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {id} is not connected (state: {state})")]
    NotConnected { id: String, state: String },

    #[error("Failed to bind {addr}: {reason}")]
    TunnelBindFailed { addr: String, reason: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Host key for {host} has changed (presented {fingerprint})")]
    HostKeyMismatch { host: String, fingerprint: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Disconnected")]
    Disconnected,

    #[error("{0}")]
    Unknown(String),
}

/// Error class reported to the event sink and consulted by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthFailed,
    Timeout,
    HostUnreachable,
    PermissionDenied,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::HostUnreachable => "host_unreachable",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SshError {
    /// Classify this error.
    ///
    /// Structured information wins: the variant itself, then the
    /// `io::ErrorKind` of wrapped socket errors. Only errors that carry
    /// nothing but provider text fall back to [`classify_message`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            SshError::AuthFailed(_) | SshError::Key(_) => ErrorKind::AuthFailed,
            SshError::ConnectTimeout(_) => ErrorKind::Timeout,
            SshError::HostUnreachable(_) => ErrorKind::HostUnreachable,
            SshError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SshError::Io(e) => classify_io(e).unwrap_or_else(|| classify_message(&e.to_string())),
            SshError::Channel(msg) | SshError::Unknown(msg) => classify_message(msg),
            SshError::ConfigInvalid(_)
            | SshError::SessionNotFound(_)
            | SshError::NotConnected { .. }
            | SshError::TunnelBindFailed { .. }
            | SshError::HostKeyMismatch { .. }
            | SshError::Disconnected => ErrorKind::Unknown,
        }
    }

    /// Wrap a provider error, promoting it to a structured variant when the
    /// text or the io kind makes the class obvious.
    pub fn from_transport(err: impl std::fmt::Display) -> Self {
        let message = err.to_string();
        match classify_message(&message) {
            ErrorKind::AuthFailed => SshError::AuthFailed(message),
            ErrorKind::Timeout => SshError::ConnectTimeout(message),
            ErrorKind::HostUnreachable => SshError::HostUnreachable(message),
            ErrorKind::PermissionDenied => SshError::PermissionDenied(message),
            ErrorKind::Unknown => SshError::Unknown(message),
        }
    }
}

fn classify_io(err: &io::Error) -> Option<ErrorKind> {
    match err.kind() {
        io::ErrorKind::TimedOut => Some(ErrorKind::Timeout),
        io::ErrorKind::PermissionDenied => Some(ErrorKind::PermissionDenied),
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable => Some(ErrorKind::HostUnreachable),
        _ => None,
    }
}

/// Text heuristics for errors that arrive without a usable code.
///
/// This is the only place error text is inspected. The needles cover the
/// messages produced by russh, the OS resolver and the socket layer:
///
/// | class | needles |
/// |---|---|
/// | auth_failed | `authentication`, `auth fail`, `no authentication methods`, `publickey`, `bad passphrase` |
/// | timeout | `timed out`, `timeout`, `etimedout` |
/// | host_unreachable | `econnrefused`, `connection refused`, `enotfound`, `ehostunreach`, `no route to host`, `network is unreachable`, `failed to lookup`, `name or service not known`, `could not resolve` |
/// | permission_denied | `permission denied`, `eacces` |
///
/// Auth needles are checked first because OpenSSH reports rejected
/// credentials as "Permission denied (publickey,password)".
pub fn classify_message(message: &str) -> ErrorKind {
    const AUTH: &[&str] = &[
        "authentication",
        "auth fail",
        "no authentication methods",
        "publickey",
        "bad passphrase",
    ];
    const TIMEOUT: &[&str] = &["timed out", "timeout", "etimedout"];
    const UNREACHABLE: &[&str] = &[
        "econnrefused",
        "connection refused",
        "enotfound",
        "ehostunreach",
        "no route to host",
        "network is unreachable",
        "failed to lookup",
        "name or service not known",
        "could not resolve",
    ];
    const PERMISSION: &[&str] = &["permission denied", "eacces"];

    let lower = message.to_lowercase();
    let hit = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if hit(AUTH) {
        ErrorKind::AuthFailed
    } else if hit(TIMEOUT) {
        ErrorKind::Timeout
    } else if hit(UNREACHABLE) {
        ErrorKind::HostUnreachable
    } else if hit(PERMISSION) {
        ErrorKind::PermissionDenied
    } else {
        ErrorKind::Unknown
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => SshError::Io(e),
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::from_transport(other),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::Key(err.to_string())
    }
}

// Errors cross the application boundary as plain strings
impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
