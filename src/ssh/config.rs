//! SSH Configuration
//!
//! [`RawConnectionConfig`] is what the application hands us; [`validate`]
//! turns it into a fully defaulted [`ConnectionConfig`] or reports every
//! violated rule at once.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::SshError;
use crate::session::RetryPolicy;

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_KEEPALIVE_COUNT_MAX: u32 = 3;
pub const DEFAULT_COLS: u32 = 80;
pub const DEFAULT_ROWS: u32 = 24;
pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_POOL_TIMEOUT_MS: u64 = 300_000;

/// Connection parameters as supplied by the caller. Durations are milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConnectionConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub username: String,
    /// `password`, `privateKey` or `agent`
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Inline PEM/OpenSSH key text or a path to a key file
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Display name, carried through to stats
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub connect_timeout: Option<u64>,
    #[serde(default)]
    pub ready_timeout: Option<u64>,
    #[serde(default)]
    pub auth_timeout: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay: Option<u64>,
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
    #[serde(default)]
    pub keepalive_interval: Option<u64>,
    #[serde(default)]
    pub keepalive_count_max: Option<u32>,
    #[serde(default)]
    pub cols: Option<u32>,
    #[serde(default)]
    pub rows: Option<u32>,
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default)]
    pub pool_timeout: Option<u64>,
}

impl RawConnectionConfig {
    /// Password-authenticated config with every other field defaulted.
    pub fn password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            auth_type: Some("password".to_string()),
            password: Some(password.into()),
            ..Default::default()
        }
    }

    /// Port as it will be used for the pool key (invalid values fall back to 22).
    pub fn effective_port(&self) -> u16 {
        self.port
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .unwrap_or(DEFAULT_PORT)
    }
}

/// Where private key material comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Readable key file on disk
    Path(PathBuf),
    /// Key text supplied directly
    Inline(String),
}

/// Authentication methods supported
#[derive(Debug, Clone)]
pub enum AuthMethod {
    Password { password: String },
    Key { source: KeySource, passphrase: Option<String> },
    Agent,
}

impl AuthMethod {
    pub fn label(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "privateKey",
            AuthMethod::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub ready: Duration,
    pub auth: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveSettings {
    pub interval: Duration,
    pub count_max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub size: usize,
    pub idle_timeout: Duration,
}

/// Fully populated connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub name: Option<String>,
    pub auth: AuthMethod,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub keepalive: KeepaliveSettings,
    pub cols: u32,
    pub rows: u32,
    pub pool: PoolSettings,
}

impl ConnectionConfig {
    /// `host:port`, as used in logs and the host key cache
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Validate and normalize a raw configuration.
///
/// Every violated rule is reported, not just the first one.
pub fn validate(raw: &RawConnectionConfig) -> Result<ConnectionConfig, SshError> {
    let mut errors = Vec::new();

    let host = raw.host.trim();
    if host.is_empty() {
        errors.push("host is required".to_string());
    }

    let username = raw.username.trim();
    if username.is_empty() {
        errors.push("username is required".to_string());
    }

    let port = match raw.port {
        None => DEFAULT_PORT,
        Some(p) if (1..=65535).contains(&p) => p as u16,
        Some(p) => {
            errors.push(format!("port must be between 1 and 65535 (got {})", p));
            DEFAULT_PORT
        }
    };

    let auth = match raw.auth_type.as_deref().map(str::trim) {
        None | Some("") => {
            errors.push("authType is required".to_string());
            None
        }
        Some("password") => match raw.password.as_deref() {
            Some(pw) if !pw.is_empty() => Some(AuthMethod::Password {
                password: pw.to_string(),
            }),
            _ => {
                errors.push("password is required for password authentication".to_string());
                None
            }
        },
        Some("privateKey") | Some("key") => match raw.private_key.as_deref() {
            Some(key) if !key.trim().is_empty() => {
                resolve_key_source(key, &mut errors).map(|source| AuthMethod::Key {
                    source,
                    passphrase: raw.passphrase.clone().filter(|p| !p.is_empty()),
                })
            }
            _ => {
                errors.push("privateKey is required for key authentication".to_string());
                None
            }
        },
        Some("agent") => Some(AuthMethod::Agent),
        Some(other) => {
            errors.push(format!("unrecognized authType '{}'", other));
            None
        }
    };

    let mut positive_ms = |field: &str, value: Option<u64>, default: u64| -> Duration {
        match value {
            Some(0) => {
                errors.push(format!("{} must be greater than zero", field));
                Duration::from_millis(default)
            }
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(default),
        }
    };

    let timeouts = Timeouts {
        connect: positive_ms("connectTimeout", raw.connect_timeout, DEFAULT_CONNECT_TIMEOUT_MS),
        ready: positive_ms("readyTimeout", raw.ready_timeout, DEFAULT_READY_TIMEOUT_MS),
        auth: positive_ms("authTimeout", raw.auth_timeout, DEFAULT_AUTH_TIMEOUT_MS),
    };
    let retry_delay = positive_ms("retryDelay", raw.retry_delay, DEFAULT_RETRY_DELAY_MS);
    let keepalive_interval = positive_ms(
        "keepaliveInterval",
        raw.keepalive_interval,
        DEFAULT_KEEPALIVE_INTERVAL_MS,
    );
    let pool_timeout = positive_ms("poolTimeout", raw.pool_timeout, DEFAULT_POOL_TIMEOUT_MS);

    let backoff_multiplier = match raw.backoff_multiplier {
        Some(m) if !m.is_finite() || m < 1.0 => {
            errors.push(format!("backoffMultiplier must be at least 1 (got {})", m));
            DEFAULT_BACKOFF_MULTIPLIER
        }
        Some(m) => m,
        None => DEFAULT_BACKOFF_MULTIPLIER,
    };

    let cols = raw.cols.unwrap_or(DEFAULT_COLS);
    let rows = raw.rows.unwrap_or(DEFAULT_ROWS);
    if cols == 0 || rows == 0 {
        errors.push(format!("terminal size must be non-zero (got {}x{})", cols, rows));
    }

    match auth {
        Some(auth) if errors.is_empty() => Ok(ConnectionConfig {
            host: host.to_string(),
            port,
            username: username.to_string(),
            name: raw.name.clone(),
            auth,
            timeouts,
            retry: RetryPolicy {
                max_retries: raw.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                retry_delay,
                backoff_multiplier,
            },
            keepalive: KeepaliveSettings {
                interval: keepalive_interval,
                count_max: raw.keepalive_count_max.unwrap_or(DEFAULT_KEEPALIVE_COUNT_MAX),
            },
            cols,
            rows,
            pool: PoolSettings {
                size: raw.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
                idle_timeout: pool_timeout,
            },
        }),
        _ => Err(SshError::ConfigInvalid(errors)),
    }
}

/// `~/id_ed25519` -> `$HOME/id_ed25519`
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// A key value naming an existing regular file must be readable; anything
/// else is treated as inline key text.
fn resolve_key_source(value: &str, errors: &mut Vec<String>) -> Option<KeySource> {
    if value.contains("-----BEGIN") {
        return Some(KeySource::Inline(value.to_string()));
    }

    let path = expand_tilde(value.trim());
    let path = path.as_path();
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => match fs::File::open(path) {
            Ok(_) => Some(KeySource::Path(path.to_path_buf())),
            Err(e) => {
                errors.push(format!(
                    "privateKey file {} is not readable: {}",
                    path.display(),
                    e
                ));
                None
            }
        },
        _ => Some(KeySource::Inline(value.to_string())),
    }
}
