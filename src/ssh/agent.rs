//! ssh-agent authentication
//!
//! The agent holds the keys; we list its identities and let it sign the
//! server challenge for each one until the server accepts.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// `Signer` over a borrowed agent.
///
/// The presented key is cloned before the async block so the returned
/// future only captures owned data and stays `Send`.
struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            self.agent
                .sign_request(&key, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

async fn connect_agent() -> Result<DynAgent, SshError> {
    #[cfg(unix)]
    {
        let agent = AgentClient::connect_env().await.map_err(|e| {
            SshError::AuthFailed(format!(
                "ssh-agent unavailable ({}); is SSH_AUTH_SOCK set?",
                e
            ))
        })?;
        Ok(agent.dynamic())
    }

    #[cfg(windows)]
    {
        let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
            .await
            .map_err(|e| SshError::AuthFailed(format!("ssh-agent pipe unavailable ({})", e)))?;
        Ok(agent.dynamic())
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(SshError::AuthFailed(
            "ssh-agent is not supported on this platform".to_string(),
        ))
    }
}

/// Try every agent identity against the server.
pub(super) async fn authenticate_with_agent(
    handle: &mut Handle<ClientHandler>,
    username: &str,
) -> Result<(), SshError> {
    let mut agent = connect_agent().await?;

    let keys = agent
        .request_identities()
        .await
        .map_err(|e| SshError::AuthFailed(format!("failed to list agent keys: {}", e)))?;

    if keys.is_empty() {
        return Err(SshError::AuthFailed("ssh-agent has no keys loaded".to_string()));
    }

    info!("ssh-agent offers {} key(s)", keys.len());

    let mut last_error = None;
    for key in &keys {
        debug!("Trying agent key {} ({})", key.algorithm(), key.comment());
        let mut signer = AgentSigner { agent: &mut agent };
        match handle
            .authenticate_publickey_with(username, key.clone(), None, &mut signer)
            .await
        {
            Ok(result) if result.success() => {
                info!("Agent authentication succeeded with {}", key.comment());
                return Ok(());
            }
            Ok(_) => debug!("Agent key {} rejected", key.comment()),
            Err(e) => {
                warn!("Agent signing failed for {}: {}", key.comment(), e);
                last_error = Some(e.to_string());
            }
        }
    }

    Err(SshError::AuthFailed(match last_error {
        Some(e) => format!("no agent key accepted ({} tried, last error: {})", keys.len(), e),
        None => format!("no agent key accepted ({} tried)", keys.len()),
    }))
}
