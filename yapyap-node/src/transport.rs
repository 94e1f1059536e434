//! Transport for the message protocol.
//!
//! The real backend runs over iroh's QUIC-based encrypted transport:
//! long-lived connections per peer, one envelope per bidirectional stream,
//! length-prefixed frames. Each accepted stream forwards
//! `(authenticated peer id, frame bytes)` to the inbound processor over a
//! channel; the processor replies (ACK/NAK) on a freshly opened stream via
//! `deliver`, never on the request stream.
//!
//! An in-memory backend with the same surface wires nodes together inside
//! one process for integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::envelope;
use crate::error::TransportError;
use crate::events::{EventBus, NodeEvent};
use crate::identity::NodeIdentity;

/// ALPN / protocol identifier for message streams.
pub const ALPN: &[u8] = b"/yapyap/msg/1.0.0";

/// One inbound frame with its transport-authenticated sender.
#[derive(Debug)]
pub struct RawInbound {
    /// Peer id verified by the transport layer (QUIC endpoint identity for
    /// iroh); payload fields cannot spoof it.
    pub peer_id: String,
    pub frame: Vec<u8>,
}

/// Transport backend. Enum dispatch keeps the call sites monomorphic and
/// lets tests swap in the in-memory network.
pub enum Transport {
    Iroh(IrohTransport),
    Mem(MemTransport),
}

impl Transport {
    pub fn local_peer_id(&self) -> &str {
        match self {
            Transport::Iroh(t) => &t.local_peer_id,
            Transport::Mem(t) => &t.local_peer_id,
        }
    }

    /// Snapshot of currently connected peers.
    pub fn connected_peers(&self) -> Vec<String> {
        match self {
            Transport::Iroh(t) => t.conns.lock().keys().cloned().collect(),
            Transport::Mem(t) => t.network.online_peers(&t.local_peer_id),
        }
    }

    /// Open a stream to the peer and write one envelope frame.
    pub async fn deliver(&self, peer_id: &str, frame: &[u8]) -> Result<(), TransportError> {
        match self {
            Transport::Iroh(t) => t.deliver(peer_id, frame).await,
            Transport::Mem(t) => t.deliver(peer_id, frame).await,
        }
    }

    /// Dial a peer if no live connection exists (bootstrap path).
    pub async fn ensure_connected(&self, peer_id: &str) -> Result<(), TransportError> {
        match self {
            Transport::Iroh(t) => t.ensure_connected(peer_id).await.map(|_| ()),
            Transport::Mem(_) => Ok(()),
        }
    }

    pub async fn close(&self) {
        match self {
            Transport::Iroh(t) => t.close().await,
            Transport::Mem(_) => {}
        }
    }
}

// ── Iroh backend ───────────────────────────────────────────────────────

struct ConnEntry {
    conn: iroh::endpoint::Connection,
    conn_gen: u64,
}

pub struct IrohTransport {
    endpoint: iroh::Endpoint,
    local_peer_id: String,
    conns: Arc<Mutex<HashMap<String, ConnEntry>>>,
    conn_gen: Arc<AtomicU64>,
    inbound_tx: mpsc::Sender<RawInbound>,
    events: Arc<EventBus>,
    dial_timeout: Duration,
    write_timeout: Duration,
}

impl IrohTransport {
    /// Bind the endpoint with the node's identity key and start the accept
    /// loop.
    pub async fn start(
        identity: &NodeIdentity,
        bind_port: Option<u16>,
        inbound_tx: mpsc::Sender<RawInbound>,
        events: Arc<EventBus>,
        dial_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut builder = iroh::Endpoint::builder()
            .secret_key(identity.secret_key().clone())
            .alpns(vec![ALPN.to_vec()]);

        if let Some(port) = bind_port.filter(|p| *p != 0) {
            builder = builder
                .bind_addr(std::net::SocketAddrV4::new(
                    std::net::Ipv4Addr::UNSPECIFIED,
                    port,
                ))
                .map_err(|e| TransportError::Bind(e.to_string()))?;
        }

        let endpoint = builder
            .bind()
            .await
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        let local_peer_id = endpoint.id().to_string();
        tracing::info!(peer = %local_peer_id, "transport endpoint bound");

        let transport = Self {
            endpoint: endpoint.clone(),
            local_peer_id,
            conns: Arc::new(Mutex::new(HashMap::new())),
            conn_gen: Arc::new(AtomicU64::new(0)),
            inbound_tx,
            events,
            dial_timeout,
            write_timeout,
        };

        // Accept loop: one task per incoming connection.
        let conns = Arc::clone(&transport.conns);
        let conn_gen = Arc::clone(&transport.conn_gen);
        let inbound = transport.inbound_tx.clone();
        let bus = Arc::clone(&transport.events);
        let ep = endpoint;
        tokio::spawn(async move {
            while let Some(incoming) = ep.accept().await {
                let conns = Arc::clone(&conns);
                let conn_gen = Arc::clone(&conn_gen);
                let inbound = inbound.clone();
                let bus = Arc::clone(&bus);
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => {
                            run_connection(conn, conns, conn_gen, inbound, bus).await;
                        }
                        Err(e) => tracing::warn!("incoming connection failed: {e}"),
                    }
                });
            }
            tracing::debug!("transport accept loop ended");
        });

        Ok(transport)
    }

    /// Get the live connection for a peer, dialing if necessary.
    async fn ensure_connected(
        &self,
        peer_id: &str,
    ) -> Result<iroh::endpoint::Connection, TransportError> {
        if let Some(entry) = self.conns.lock().get(peer_id) {
            return Ok(entry.conn.clone());
        }

        let endpoint_id: iroh::EndpointId = peer_id
            .parse()
            .map_err(|_| TransportError::InvalidPeerId(peer_id.to_string()))?;
        let addr = iroh::EndpointAddr::new(endpoint_id);

        tracing::debug!(peer = %peer_id, "dialing peer");
        let conn = tokio::time::timeout(self.dial_timeout, self.endpoint.connect(addr, ALPN))
            .await
            .map_err(|_| TransportError::Dial {
                peer: peer_id.to_string(),
                reason: "dial timeout".to_string(),
            })?
            .map_err(|e| TransportError::Dial {
                peer: peer_id.to_string(),
                reason: e.to_string(),
            })?;

        // The dialed connection also serves reverse ACK streams, so it gets
        // the same per-connection loop as accepted ones.
        let conns = Arc::clone(&self.conns);
        let conn_gen = Arc::clone(&self.conn_gen);
        let inbound = self.inbound_tx.clone();
        let bus = Arc::clone(&self.events);
        let task_conn = conn.clone();
        tokio::spawn(async move {
            run_connection(task_conn, conns, conn_gen, inbound, bus).await;
        });

        Ok(conn)
    }

    async fn deliver(&self, peer_id: &str, frame: &[u8]) -> Result<(), TransportError> {
        let conn = self.ensure_connected(peer_id).await?;

        let write = async {
            let (mut send, _recv) = conn
                .open_bi()
                .await
                .map_err(|e| TransportError::Write {
                    peer: peer_id.to_string(),
                    reason: e.to_string(),
                })?;
            envelope::write_frame_bytes(&mut send, frame)
                .await
                .map_err(|e| TransportError::Write {
                    peer: peer_id.to_string(),
                    reason: e.to_string(),
                })?;
            send.finish().map_err(|e| TransportError::Write {
                peer: peer_id.to_string(),
                reason: e.to_string(),
            })?;
            Ok::<(), TransportError>(())
        };

        tokio::time::timeout(self.write_timeout, write)
            .await
            .map_err(|_| TransportError::Write {
                peer: peer_id.to_string(),
                reason: "write timeout".to_string(),
            })?
    }

    async fn close(&self) {
        for (_, entry) in self.conns.lock().drain() {
            entry.conn.close(0u32.into(), b"node shutting down");
        }
        self.endpoint.close().await;
    }
}

/// Register a connection and serve its streams until it dies. Each stream
/// carries exactly one envelope; the read side forwards the frame with the
/// QUIC-verified remote id attached.
async fn run_connection(
    conn: iroh::endpoint::Connection,
    conns: Arc<Mutex<HashMap<String, ConnEntry>>>,
    conn_gen: Arc<AtomicU64>,
    inbound_tx: mpsc::Sender<RawInbound>,
    events: Arc<EventBus>,
) {
    let peer_id = conn.remote_id().to_string();
    let my_gen = conn_gen.fetch_add(1, Ordering::Relaxed);
    {
        let mut guard = conns.lock();
        if guard.contains_key(&peer_id) {
            tracing::debug!(peer = %peer_id, gen = my_gen, "replacing existing connection");
        }
        guard.insert(
            peer_id.clone(),
            ConnEntry {
                conn: conn.clone(),
                conn_gen: my_gen,
            },
        );
    }
    tracing::info!(peer = %peer_id, "peer connected");
    events.emit(NodeEvent::PeerConnected {
        peer_id: peer_id.clone(),
    });

    loop {
        match conn.accept_bi().await {
            Ok((_send, mut recv)) => {
                let peer = peer_id.clone();
                let tx = inbound_tx.clone();
                tokio::spawn(async move {
                    match envelope::read_frame_bytes(&mut recv).await {
                        Ok(frame) => {
                            if tx.send(RawInbound { peer_id: peer, frame }).await.is_err() {
                                tracing::debug!("inbound channel closed, dropping frame");
                            }
                        }
                        Err(e) => {
                            // Oversize or malformed framing: drop the stream
                            // without a reply; the id was never decodable.
                            tracing::warn!(peer = %peer, "bad inbound frame: {e}");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::debug!(peer = %peer_id, "connection ended: {e}");
                break;
            }
        }
    }

    // Only remove our own entry; a replacement connection may have taken
    // the slot already.
    let mut guard = conns.lock();
    if let Some(entry) = guard.get(&peer_id) {
        if entry.conn_gen == my_gen {
            guard.remove(&peer_id);
            tracing::info!(peer = %peer_id, "peer disconnected");
        }
    }
}

// ── In-memory backend (tests) ──────────────────────────────────────────

struct MemPeer {
    inbound_tx: mpsc::Sender<RawInbound>,
    online: bool,
}

/// Process-local registry wiring [`MemTransport`] instances together.
#[derive(Clone, Default)]
pub struct MemNetwork {
    peers: Arc<Mutex<HashMap<String, MemPeer>>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node to the network.
    pub fn register(&self, peer_id: &str, inbound_tx: mpsc::Sender<RawInbound>) {
        self.peers.lock().insert(
            peer_id.to_string(),
            MemPeer {
                inbound_tx,
                online: true,
            },
        );
    }

    /// Toggle a peer's reachability (simulates the peer going offline).
    pub fn set_online(&self, peer_id: &str, online: bool) {
        if let Some(peer) = self.peers.lock().get_mut(peer_id) {
            peer.online = online;
        }
    }

    fn online_peers(&self, except: &str) -> Vec<String> {
        self.peers
            .lock()
            .iter()
            .filter(|(id, peer)| peer.online && id.as_str() != except)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn sender_for(&self, peer_id: &str) -> Option<mpsc::Sender<RawInbound>> {
        let peers = self.peers.lock();
        peers
            .get(peer_id)
            .filter(|peer| peer.online)
            .map(|peer| peer.inbound_tx.clone())
    }

    /// Test helper: push a raw frame at a node as if `from` had sent it.
    pub async fn inject(&self, from: &str, to: &str, frame: Vec<u8>) -> bool {
        match self.sender_for(to) {
            Some(tx) => tx
                .send(RawInbound {
                    peer_id: from.to_string(),
                    frame,
                })
                .await
                .is_ok(),
            None => false,
        }
    }
}

pub struct MemTransport {
    network: MemNetwork,
    local_peer_id: String,
}

impl MemTransport {
    pub fn new(network: MemNetwork, peer_id: &str, inbound_tx: mpsc::Sender<RawInbound>) -> Self {
        network.register(peer_id, inbound_tx);
        Self {
            network,
            local_peer_id: peer_id.to_string(),
        }
    }

    async fn deliver(&self, peer_id: &str, frame: &[u8]) -> Result<(), TransportError> {
        let tx = self
            .network
            .sender_for(peer_id)
            .ok_or_else(|| TransportError::Dial {
                peer: peer_id.to_string(),
                reason: "peer unreachable".to_string(),
            })?;
        tx.send(RawInbound {
            peer_id: self.local_peer_id.clone(),
            frame: frame.to_vec(),
        })
        .await
        .map_err(|_| TransportError::Write {
            peer: peer_id.to_string(),
            reason: "inbound channel closed".to_string(),
        })
    }
}
