//! Leaf node: connects outward to one ultrapeer, registers its identity and
//! derived port, queries for other leaves, and opens direct peer sessions.
//!
//! Connection lifecycle: Disconnected → ConnectingToUltrapeer →
//! AwaitingRegisterAck → Registered → {Idle, Querying, PeerConnected}.
//! Any failure drops the control connection; retry policy belongs to the
//! caller, not here. While registered, an independent accept loop (see
//! [`Leaf::listen`]) serves inbound peer sessions at the leaf's own derived
//! port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::{client, TlsConnector};

use grove_core::{AckStatus, Identity, LeafInfo, Message, QueryStatus};

use crate::events::{self, EventSender, PeerEvent};
use crate::framing::{read_frame, write_frame, FrameError};
use crate::tls;

/// Bound on every wait for an ultrapeer response. A timed-out wait is a
/// failure, never a silent hang.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafState {
    Disconnected,
    ConnectingToUltrapeer,
    AwaitingRegisterAck,
    Registered,
    Querying,
    PeerConnected,
}

#[derive(Debug, thiserror::Error)]
pub enum LeafError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("unexpected response from ultrapeer")]
    UnexpectedResponse,
}

/// A leaf's control connection to its ultrapeer. After an error the
/// connection is unusable; drop the value and connect again.
pub struct Leaf {
    identity: Arc<Identity>,
    connector: TlsConnector,
    stream: client::TlsStream<TcpStream>,
    state: LeafState,
    events: EventSender,
    max_frame_len: u32,
}

impl Leaf {
    /// Dial the ultrapeer over TLS and register this identity. Returns only
    /// once the ultrapeer acknowledged the registration; a failure ack, a
    /// timeout, or a dial error leaves nothing behind.
    pub async fn connect(
        identity: Arc<Identity>,
        ultrapeer_addr: SocketAddr,
        max_frame_len: u32,
    ) -> Result<Self, LeafError> {
        let connector = tls::connector()?;
        let mut stream = tls::connect(&connector, ultrapeer_addr).await?;

        let register = Message::RegisterLeaf {
            public_key: Some(identity.public_key_pem().to_string()),
            p2p_port: Some(serde_json::Value::from(identity.p2p_port())),
        };
        write_frame(&mut stream, &register, max_frame_len).await?;

        let reply = timeout(REQUEST_TIMEOUT, read_frame(&mut stream, max_frame_len))
            .await
            .map_err(|_| LeafError::Timeout("registration acknowledgement"))??;

        match reply {
            Some(Message::RegisterAck {
                status: AckStatus::Success,
                ..
            }) => {
                tracing::info!(%ultrapeer_addr, "registered with ultrapeer");
                Ok(Self {
                    identity,
                    connector,
                    stream,
                    state: LeafState::Registered,
                    events: events::channel(),
                    max_frame_len,
                })
            }
            Some(Message::RegisterAck {
                status: AckStatus::Failure,
                reason,
            }) => Err(LeafError::RegistrationRejected(
                reason.unwrap_or_else(|| "no reason given".to_string()),
            )),
            _ => Err(LeafError::UnexpectedResponse),
        }
    }

    pub fn state(&self) -> LeafState {
        self.state
    }

    pub fn public_key_pem(&self) -> &str {
        self.identity.public_key_pem()
    }

    /// Subscribe to query outcomes as peer found/lost events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Ask the ultrapeer where `target_public_key` is. `Ok(None)` is a
    /// normal miss: the peer may be registered at a sibling the gossip has
    /// not reached yet, or not at all.
    pub async fn query(
        &mut self,
        target_public_key: &str,
    ) -> Result<Option<LeafInfo>, LeafError> {
        self.state = LeafState::Querying;
        let query = Message::QueryLeaf {
            target_public_key: target_public_key.to_string(),
        };
        if let Err(e) = write_frame(&mut self.stream, &query, self.max_frame_len).await {
            self.state = LeafState::Disconnected;
            return Err(e.into());
        }

        let reply = match timeout(
            REQUEST_TIMEOUT,
            read_frame(&mut self.stream, self.max_frame_len),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.state = LeafState::Disconnected;
                return Err(e.into());
            }
            Err(_) => {
                self.state = LeafState::Disconnected;
                return Err(LeafError::Timeout("query response"));
            }
        };

        self.state = LeafState::Registered;
        match reply {
            Some(Message::QueryLeafResponse {
                status: QueryStatus::Found,
                peer_info: Some(info),
                ..
            }) => {
                let _ = self.events.send(PeerEvent::Found(info.clone()));
                Ok(Some(info))
            }
            Some(Message::QueryLeafResponse { .. }) => {
                let _ = self.events.send(PeerEvent::Lost {
                    public_key: target_public_key.to_string(),
                });
                Ok(None)
            }
            _ => {
                self.state = LeafState::Disconnected;
                Err(LeafError::UnexpectedResponse)
            }
        }
    }

    /// Open a direct TLS session to a located peer. The registered
    /// `p2p_port` is authoritative, since it is the listener the peer
    /// actually bound; this node never re-derives it from the peer's key.
    pub async fn connect_to_peer(
        &mut self,
        info: &LeafInfo,
    ) -> Result<client::TlsStream<TcpStream>, LeafError> {
        let addr = SocketAddr::new(info.ip, info.p2p_port);
        let stream = tls::connect(&self.connector, addr).await?;
        self.state = LeafState::PeerConnected;
        tracing::info!(%addr, "peer session established");
        Ok(stream)
    }

    /// Bind this leaf's own listener at its derived port and serve inbound
    /// peer sessions. A second, independent accept loop, not a state of the
    /// control connection.
    pub async fn listen(&self, host: &str) -> Result<PeerListener, LeafError> {
        let acceptor = tls::acceptor(&self.identity)?;
        let listener = TcpListener::bind((host, self.identity.p2p_port())).await?;
        let addr = listener.local_addr()?;
        let (shutdown, mut stop) = broadcast::channel(1);
        let max_frame_len = self.max_frame_len;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    res = listener.accept() => match res {
                        Ok((stream, peer_addr)) => {
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        handle_peer(tls_stream, peer_addr, max_frame_len).await;
                                    }
                                    Err(e) => {
                                        tracing::warn!(%peer_addr, error = %e, "peer TLS accept failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "peer accept failed");
                        }
                    }
                }
            }
            tracing::debug!(%addr, "peer listener stopped");
        });

        tracing::info!(%addr, "listening for peer sessions");
        Ok(PeerListener {
            addr,
            shutdown,
            task,
        })
    }
}

/// Handle to the leaf's inbound peer-session listener.
pub struct PeerListener {
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl PeerListener {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// Inbound peer session: answer PING with PONG, ignore the rest.
async fn handle_peer<S>(mut stream: S, peer_addr: SocketAddr, max_frame_len: u32)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::debug!(%peer_addr, "peer session started");
    loop {
        match read_frame(&mut stream, max_frame_len).await {
            Ok(Some(Message::Ping { data })) => {
                let pong = Message::Pong { data };
                if write_frame(&mut stream, &pong, max_frame_len).await.is_err() {
                    break;
                }
            }
            Ok(Some(other)) => {
                tracing::debug!(%peer_addr, kind = other.kind(), "ignoring message in peer session");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "peer session error");
                break;
            }
        }
    }
    tracing::debug!(%peer_addr, "peer session ended");
}
