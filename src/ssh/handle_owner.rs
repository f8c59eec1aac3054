//! Handle Owner Task
//!
//! A russh `Handle` lives inside a single task. [`RusshHandle`](super::client::RusshHandle)
//! only holds a [`HandleController`], a cheap sender of requests. Every
//! request carries its own reply slot. Requests queued when the owner stops
//! are answered with `Disconnected`.

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::client::ClientHandler;
use super::error::SshError;

/// Queued requests per transport
const REQUEST_QUEUE: usize = 64;

/// Kind of channel to open on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChannelTarget {
    /// Session channel (shell or subsystem)
    Session,
    /// `direct-tcpip` to `host:port`, on behalf of `origin`
    DirectTcpip {
        host: String,
        port: u16,
        origin_addr: String,
        origin_port: u16,
    },
}

enum Request {
    Open {
        target: ChannelTarget,
        reply: oneshot::Sender<Result<Channel<Msg>, SshError>>,
    },
    Keepalive {
        reply: oneshot::Sender<Result<(), SshError>>,
    },
    Close,
}

impl Request {
    fn reject(self) {
        match self {
            Request::Open { reply, .. } => {
                let _ = reply.send(Err(SshError::Disconnected));
            }
            Request::Keepalive { reply } => {
                let _ = reply.send(Err(SshError::Disconnected));
            }
            Request::Close => {}
        }
    }
}

#[derive(Clone)]
pub struct HandleController {
    requests: mpsc::Sender<Request>,
}

impl HandleController {
    /// Move `handle` into its owner task
    pub(crate) fn spawn(handle: Handle<ClientHandler>, label: String) -> Self {
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE);
        tokio::spawn(own_handle(handle, rx, label));
        Self { requests }
    }

    pub(crate) async fn open(&self, target: ChannelTarget) -> Result<Channel<Msg>, SshError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Open { target, reply }).await?;
        rx.await.map_err(|_| SshError::Disconnected)?
    }

    /// `keepalive@openssh.com` with a reply. The caller applies the deadline.
    pub async fn keepalive(&self) -> Result<(), SshError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Keepalive { reply }).await?;
        rx.await.map_err(|_| SshError::Disconnected)?
    }

    pub async fn close(&self) {
        let _ = self.requests.send(Request::Close).await;
    }

    pub fn is_open(&self) -> bool {
        !self.requests.is_closed()
    }

    async fn send(&self, request: Request) -> Result<(), SshError> {
        self.requests.send(request).await.map_err(|rejected| {
            rejected.0.reject();
            SshError::Disconnected
        })
    }
}

async fn own_handle(
    handle: Handle<ClientHandler>,
    mut rx: mpsc::Receiver<Request>,
    label: String,
) {
    debug!("Handle owner started for {}", label);

    while let Some(request) = rx.recv().await {
        match request {
            Request::Open { target, reply } => {
                let result = match &target {
                    ChannelTarget::Session => handle.channel_open_session().await,
                    ChannelTarget::DirectTcpip {
                        host,
                        port,
                        origin_addr,
                        origin_port,
                    } => {
                        handle
                            .channel_open_direct_tcpip(
                                host.as_str(),
                                u32::from(*port),
                                origin_addr.as_str(),
                                u32::from(*origin_port),
                            )
                            .await
                    }
                };
                if reply.send(result.map_err(SshError::from)).is_err() {
                    debug!("Requester of {:?} on {} went away", target, label);
                }
            }

            Request::Keepalive { reply } => {
                let result = handle.send_keepalive(true).await.map_err(SshError::from);
                let _ = reply.send(result);
            }

            Request::Close => {
                info!("Closing transport {}", label);
                break;
            }
        }
    }

    rx.close();
    while let Ok(pending) = rx.try_recv() {
        pending.reject();
    }

    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
        .await;
    debug!("Handle owner stopped for {}", label);
}
