//! Ultrapeer node: accepts leaf registrations into a registry, answers
//! queries, and replicates the registry to sibling ultrapeers via gossip
//! (full snapshot on link establishment, incremental events after).
//!
//! One task per connection. The registry and the link table each sit behind
//! their own mutex; where both are needed the registry lock is taken first.
//! No lock is ever held across network I/O: broadcasts enqueue pre-encoded
//! frames into per-link unbounded channels and dedicated writer tasks drain
//! them onto the sockets, so a stalled sibling cannot block registration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use grove_core::protocol::{parse_p2p_port, AckStatus, QueryStatus};
use grove_core::{wire, Identity, LeafInfo, Message, Registry};

use crate::config::Config;
use crate::events::{self, EventSender, PeerEvent};
use crate::framing::{read_frame, write_frame};
use crate::tls;

/// One sibling-ultrapeer connection. Frames pushed into `tx` are written to
/// the socket by the link's writer task, in order.
struct Link {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    #[allow(dead_code)]
    initiated: bool,
}

/// State shared by every connection worker. Lock order: registry, then links.
struct Shared {
    registry: Mutex<Registry>,
    links: Mutex<HashMap<u64, Link>>,
    next_link_id: AtomicU64,
    events: EventSender,
    max_frame_len: u32,
}

impl Shared {
    fn new(events: EventSender, max_frame_len: u32) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            links: Mutex::new(HashMap::new()),
            next_link_id: AtomicU64::new(0),
            events,
            max_frame_len,
        }
    }

    /// Enqueue `msg` on every link except `exclude`. Callers hold the
    /// registry lock so the mutation and its broadcast are atomic with
    /// respect to other mutations; the enqueue itself never blocks.
    async fn enqueue_broadcast(&self, msg: &Message, exclude: Option<u64>) {
        let frame = match wire::encode_frame_limited(msg, self.max_frame_len) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, kind = msg.kind(), "failed to encode gossip frame");
                return;
            }
        };
        let links = self.links.lock().await;
        for (id, link) in links.iter() {
            if Some(*id) == exclude {
                continue;
            }
            if link.tx.send(frame.clone()).is_err() {
                tracing::debug!(link = *id, addr = %link.addr, "gossip writer gone");
            }
        }
    }

    /// A leaf registered directly with this node.
    async fn register_leaf(&self, info: LeafInfo) {
        let mut registry = self.registry.lock().await;
        let replaced = registry.upsert(info.clone());
        self.enqueue_broadcast(
            &Message::SyncLeafJoined {
                leaf_info: info.clone(),
            },
            None,
        )
        .await;
        drop(registry);
        if replaced.is_none() {
            let _ = self.events.send(PeerEvent::Found(info));
        }
    }

    /// The connection owning `public_key` closed; drop its entry.
    async fn remove_leaf(&self, public_key: &str) {
        let mut registry = self.registry.lock().await;
        if registry.remove(public_key).is_some() {
            self.enqueue_broadcast(
                &Message::SyncLeafLeft {
                    public_key: public_key.to_string(),
                },
                None,
            )
            .await;
            drop(registry);
            let _ = self.events.send(PeerEvent::Lost {
                public_key: public_key.to_string(),
            });
        }
    }

    /// A sibling gossiped a join. Insert-if-new; only a new entry is
    /// re-broadcast, and never back to the link it arrived on.
    async fn apply_join(&self, info: LeafInfo, origin: u64) {
        let mut registry = self.registry.lock().await;
        if registry.insert_if_absent(info.clone()) {
            self.enqueue_broadcast(
                &Message::SyncLeafJoined {
                    leaf_info: info.clone(),
                },
                Some(origin),
            )
            .await;
            drop(registry);
            let _ = self.events.send(PeerEvent::Found(info));
        }
    }

    /// A sibling gossiped a leave. Symmetric to `apply_join`.
    async fn apply_leave(&self, public_key: &str, origin: u64) {
        let mut registry = self.registry.lock().await;
        if registry.remove(public_key).is_some() {
            self.enqueue_broadcast(
                &Message::SyncLeafLeft {
                    public_key: public_key.to_string(),
                },
                Some(origin),
            )
            .await;
            drop(registry);
            let _ = self.events.send(PeerEvent::Lost {
                public_key: public_key.to_string(),
            });
        }
    }

    /// Merge a sibling's full snapshot. Existing entries win; a full sync is
    /// never re-broadcast.
    async fn merge_full(&self, incoming: HashMap<String, LeafInfo>) {
        let mut registry = self.registry.lock().await;
        let added = registry.merge(incoming);
        drop(registry);
        for info in added {
            let _ = self.events.send(PeerEvent::Found(info));
        }
    }

    async fn lookup(&self, public_key: &str) -> Option<LeafInfo> {
        self.registry.lock().await.get(public_key).cloned()
    }

    /// Register a new link and enqueue the full-registry snapshot as its
    /// first frame, under the registry lock: any registration that follows
    /// is ordered after the snapshot, so the new sibling misses nothing and
    /// sees exactly one snapshot before any incremental event.
    async fn attach_link(
        &self,
        addr: SocketAddr,
        initiated: bool,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Option<u64> {
        let registry = self.registry.lock().await;
        let full = Message::SyncFullRegistry {
            registry: registry.snapshot(),
        };
        let frame = match wire::encode_frame_limited(&full, self.max_frame_len) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, %addr, "registry snapshot exceeds frame limit");
                return None;
            }
        };
        let _ = tx.send(frame);
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        self.links.lock().await.insert(id, Link { addr, tx, initiated });
        Some(id)
    }

    async fn detach_link(&self, id: u64) {
        self.links.lock().await.remove(&id);
    }
}

/// A running ultrapeer. Dropping the handle does not stop the node; call
/// [`Ultrapeer::shutdown`].
pub struct Ultrapeer {
    shared: Arc<Shared>,
    leaf_addr: SocketAddr,
    gossip_addr: Option<SocketAddr>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Ultrapeer {
    /// Bind the leaf listener (and the gossip listener if configured), start
    /// the accept loops, and dial the configured siblings. Bind failures are
    /// fatal; sibling dial failures are logged and skipped.
    pub async fn start(identity: Arc<Identity>, config: Config) -> anyhow::Result<Self> {
        let acceptor = tls::acceptor(&identity).context("build TLS acceptor")?;
        let connector = tls::connector().context("build TLS connector")?;

        let leaf_listener = TcpListener::bind((config.host.as_str(), config.leaf_port))
            .await
            .context("bind leaf listener")?;
        let leaf_addr = leaf_listener.local_addr().context("leaf listener addr")?;

        let gossip_listener = match config.gossip_port {
            Some(port) => Some(
                TcpListener::bind((config.host.as_str(), port))
                    .await
                    .context("bind gossip listener")?,
            ),
            None => None,
        };
        let gossip_addr = match &gossip_listener {
            Some(l) => Some(l.local_addr().context("gossip listener addr")?),
            None => None,
        };

        let shared = Arc::new(Shared::new(events::channel(), config.max_frame_len));
        let (shutdown, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(leaf_accept_loop(
            shared.clone(),
            acceptor.clone(),
            leaf_listener,
            shutdown.clone(),
        )));

        if let Some(listener) = gossip_listener {
            tasks.push(tokio::spawn(gossip_accept_loop(
                shared.clone(),
                acceptor,
                listener,
                shutdown.clone(),
            )));
        }

        for sibling in config.siblings {
            tasks.push(tokio::spawn(dial_sibling(
                shared.clone(),
                connector.clone(),
                sibling,
                shutdown.clone(),
            )));
        }

        tracing::info!(%leaf_addr, gossip_addr = ?gossip_addr, "ultrapeer listening");
        Ok(Self {
            shared,
            leaf_addr,
            gossip_addr,
            shutdown,
            tasks,
        })
    }

    /// Address the leaf listener is bound to.
    pub fn leaf_addr(&self) -> SocketAddr {
        self.leaf_addr
    }

    /// Address of the gossip listener, if enabled.
    pub fn gossip_addr(&self) -> Option<SocketAddr> {
        self.gossip_addr
    }

    /// Subscribe to registry join/leave events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    /// Point-in-time copy of the registry.
    pub async fn registry_snapshot(&self) -> HashMap<String, LeafInfo> {
        self.shared.registry.lock().await.snapshot()
    }

    /// Number of live sibling links.
    pub async fn link_count(&self) -> usize {
        self.shared.links.lock().await.len()
    }

    /// Stop accepting first, then let every connection worker observe the
    /// signal (or EOF) and exit its loop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn leaf_accept_loop(
    shared: Arc<Shared>,
    acceptor: TlsAcceptor,
    listener: TcpListener,
    shutdown: broadcast::Sender<()>,
) {
    let mut stop = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            res = listener.accept() => match res {
                Ok((stream, peer_addr)) => {
                    let shared = shared.clone();
                    let acceptor = acceptor.clone();
                    let stop = shutdown.subscribe();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                handle_leaf(shared, tls_stream, peer_addr, stop).await;
                            }
                            Err(e) => {
                                tracing::warn!(%peer_addr, error = %e, "leaf TLS accept failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "leaf accept failed");
                }
            }
        }
    }
    tracing::info!("leaf listener stopped");
}

async fn gossip_accept_loop(
    shared: Arc<Shared>,
    acceptor: TlsAcceptor,
    listener: TcpListener,
    shutdown: broadcast::Sender<()>,
) {
    let mut stop = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            res = listener.accept() => match res {
                Ok((stream, peer_addr)) => {
                    let shared = shared.clone();
                    let acceptor = acceptor.clone();
                    let stop = shutdown.subscribe();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                run_link(shared, tls_stream, peer_addr, false, stop).await;
                            }
                            Err(e) => {
                                tracing::warn!(%peer_addr, error = %e, "gossip TLS accept failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "gossip accept failed");
                }
            }
        }
    }
    tracing::info!("gossip listener stopped");
}

async fn dial_sibling(
    shared: Arc<Shared>,
    connector: TlsConnector,
    sibling: String,
    shutdown: broadcast::Sender<()>,
) {
    let addr = match tokio::net::lookup_host(sibling.as_str()).await {
        Ok(mut addrs) => match addrs.next() {
            Some(a) => a,
            None => {
                tracing::warn!(sibling = %sibling, "sibling address resolved to nothing");
                return;
            }
        },
        Err(e) => {
            tracing::warn!(sibling = %sibling, error = %e, "sibling address resolution failed");
            return;
        }
    };
    match tls::connect(&connector, addr).await {
        Ok(stream) => {
            tracing::info!(%addr, "connected to sibling ultrapeer");
            run_link(shared, stream, addr, true, shutdown.subscribe()).await;
        }
        Err(e) => {
            tracing::warn!(%addr, error = %e, "sibling dial failed");
        }
    }
}

/// Per-leaf-connection handler: reads framed messages until the connection
/// closes or errors, then deregisters whatever key the session registered.
async fn handle_leaf<S>(
    shared: Arc<Shared>,
    mut stream: S,
    peer_addr: SocketAddr,
    mut stop: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::debug!(%peer_addr, "leaf connected");
    // LeafSession: which key this connection registered, for cleanup.
    let mut session_key: Option<String> = None;

    loop {
        let msg = tokio::select! {
            _ = stop.recv() => break,
            res = read_frame(&mut stream, shared.max_frame_len) => match res {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(%peer_addr, error = %e, "leaf connection error");
                    break;
                }
            }
        };

        match msg {
            Message::RegisterLeaf {
                public_key,
                p2p_port,
            } => {
                let port = p2p_port.as_ref().and_then(parse_p2p_port);
                match (public_key, port) {
                    (Some(pk), Some(port)) if !pk.is_empty() => {
                        let info = LeafInfo {
                            public_key: pk.clone(),
                            ip: peer_addr.ip(),
                            p2p_port: port,
                            registered_at: unix_now(),
                        };
                        shared.register_leaf(info).await;
                        session_key = Some(pk.clone());
                        tracing::info!(%peer_addr, key = short_key(&pk), p2p_port = port, "leaf registered");
                        let ack = Message::RegisterAck {
                            status: AckStatus::Success,
                            reason: None,
                        };
                        if write_frame(&mut stream, &ack, shared.max_frame_len)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ => {
                        tracing::warn!(%peer_addr, "invalid registration");
                        let ack = Message::RegisterAck {
                            status: AckStatus::Failure,
                            reason: Some("missing or invalid registration fields".to_string()),
                        };
                        let _ = write_frame(&mut stream, &ack, shared.max_frame_len).await;
                        let _ = stream.shutdown().await;
                        break;
                    }
                }
            }
            Message::QueryLeaf { target_public_key } => {
                // Response is computed under the registry lock inside
                // lookup; the socket write happens after release. A miss is
                // a normal outcome and never fails the connection.
                let response = match shared.lookup(&target_public_key).await {
                    Some(info) => Message::QueryLeafResponse {
                        status: QueryStatus::Found,
                        peer_info: Some(info),
                        reason: None,
                    },
                    None => Message::QueryLeafResponse {
                        status: QueryStatus::NotFound,
                        peer_info: None,
                        reason: Some("peer not in registry".to_string()),
                    },
                };
                if write_frame(&mut stream, &response, shared.max_frame_len)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            other => {
                tracing::debug!(%peer_addr, kind = other.kind(), "ignoring message from leaf");
            }
        }
    }

    if let Some(pk) = session_key {
        shared.remove_leaf(&pk).await;
        tracing::info!(%peer_addr, key = short_key(&pk), "leaf deregistered");
    }
    tracing::debug!(%peer_addr, "leaf disconnected");
}

/// Per-sibling-link handler, either direction. The full-registry snapshot is
/// enqueued before the link becomes visible to broadcasts, so it is always
/// the first frame on the wire; after that the link is in steady state.
///
/// Entries are not tagged with the link that contributed them, so link loss
/// does not retract them; they remain until a SYNC_LEAF_LEFT arrives.
async fn run_link<S>(
    shared: Arc<Shared>,
    stream: S,
    addr: SocketAddr,
    initiated: bool,
    mut stop: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let Some(link_id) = shared.attach_link(addr, initiated, tx).await else {
        return;
    };
    tracing::info!(%addr, link = link_id, initiated, "gossip link established");

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            _ = stop.recv() => break,
            res = read_frame(&mut reader, shared.max_frame_len) => match res {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(%addr, link = link_id, error = %e, "gossip link error");
                    break;
                }
            }
        };

        match msg {
            Message::SyncFullRegistry { registry } => {
                tracing::debug!(%addr, link = link_id, entries = registry.len(), "full registry sync");
                shared.merge_full(registry).await;
            }
            Message::SyncLeafJoined { leaf_info } => {
                shared.apply_join(leaf_info, link_id).await;
            }
            Message::SyncLeafLeft { public_key } => {
                shared.apply_leave(&public_key, link_id).await;
            }
            other => {
                tracing::debug!(%addr, link = link_id, kind = other.kind(), "ignoring message on gossip link");
            }
        }
    }

    shared.detach_link(link_id).await;
    writer_task.abort();
    tracing::info!(%addr, link = link_id, "gossip link closed");
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Compact form of a PEM key for log lines: the first characters of the
/// base64 body, past the header.
fn short_key(pk: &str) -> String {
    pk.lines()
        .find(|l| !l.starts_with("-----"))
        .unwrap_or("")
        .chars()
        .take(16)
        .collect()
}
