//! In-process host key pinning
//!
//! Trust on first use: the first key a `host:port` presents is remembered
//! for the lifetime of the process, and any later connection presenting a
//! different key is refused. Nothing is written to disk.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Result of checking a presented host key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// Same key as last time
    Verified,
    /// First contact, key pinned now
    Learned { fingerprint: String },
    /// Key differs from the pinned one
    Changed { expected: String, actual: String },
}

#[derive(Debug, Default)]
pub struct HostKeyCache {
    pinned: DashMap<String, String>,
}

impl HostKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_key(host: &str, port: u16) -> String {
        format!("{}:{}", host.to_lowercase(), port)
    }

    /// SHA256 fingerprint in OpenSSH format (`SHA256:<base64, unpadded>`)
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(key_bytes: &[u8]) -> String {
        let hash = Sha256::digest(key_bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        self.check_fingerprint(host, port, Self::fingerprint(key))
    }

    fn check_fingerprint(&self, host: &str, port: u16, fingerprint: String) -> HostKeyStatus {
        let lookup = Self::make_key(host, port);
        match self.pinned.entry(lookup) {
            Entry::Vacant(slot) => {
                info!("Pinned host key for {} ({})", slot.key(), fingerprint);
                slot.insert(fingerprint.clone());
                HostKeyStatus::Learned { fingerprint }
            }
            Entry::Occupied(pinned) if *pinned.get() == fingerprint => HostKeyStatus::Verified,
            Entry::Occupied(pinned) => {
                warn!(
                    "Host key for {} changed: expected {}, got {}",
                    pinned.key(),
                    pinned.get(),
                    fingerprint
                );
                HostKeyStatus::Changed {
                    expected: pinned.get().clone(),
                    actual: fingerprint,
                }
            }
        }
    }

    /// Forget a pinned key (user accepted a rotated host key)
    pub fn forget(&self, host: &str, port: u16) {
        if self.pinned.remove(&Self::make_key(host, port)).is_some() {
            info!("Forgot pinned host key for {}:{}", host, port);
        }
    }

    pub fn is_pinned(&self, host: &str, port: u16) -> bool {
        self.pinned.contains_key(&Self::make_key(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_use_then_verify() {
        let cache = HostKeyCache::new();
        let fp = HostKeyCache::fingerprint_bytes(b"key-a");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));

        assert_eq!(
            cache.check_fingerprint("Example.com", 22, fp.clone()),
            HostKeyStatus::Learned { fingerprint: fp.clone() }
        );
        assert_eq!(
            cache.check_fingerprint("example.com", 22, fp.clone()),
            HostKeyStatus::Verified
        );
        assert!(cache.is_pinned("example.com", 22));
        assert!(!cache.is_pinned("example.com", 2222));
    }

    #[test]
    fn test_changed_key_rejected_until_forgotten() {
        let cache = HostKeyCache::new();
        let a = HostKeyCache::fingerprint_bytes(b"key-a");
        let b = HostKeyCache::fingerprint_bytes(b"key-b");

        cache.check_fingerprint("h", 22, a.clone());
        assert_eq!(
            cache.check_fingerprint("h", 22, b.clone()),
            HostKeyStatus::Changed { expected: a, actual: b.clone() }
        );

        cache.forget("h", 22);
        assert!(matches!(
            cache.check_fingerprint("h", 22, b),
            HostKeyStatus::Learned { .. }
        ));
    }
}
