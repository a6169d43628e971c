//! A flipmesh node: one TCP listener, one link per known peer, and the
//! replicated boolean.
//!
//! Tasks owned by a node:
//!   - accept loop: one handshake task per inbound connection, which then
//!     becomes that connection's receive task
//!   - dialer: connects to peers announced by AddPeer
//!   - receive task per outbound connection
//!
//! Every task races the `Closing` status, so `close()` ends all of them.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashSet;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use flipmesh_core::config::{FlipmeshConfig, SeedPeer, SeedPolicy};
use flipmesh_core::{AddPeer, ChangeState, Packet, Peer, PeerError, Timestamp};
use flipmesh_services::{Connection, ConnectionError, PeerRegistry, StateRegister};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: IpAddr,
    /// 0 = OS-assigned; the bound port is what gets announced.
    pub listen_port: u16,
    pub seeds: Vec<SeedPeer>,
    pub seed_policy: SeedPolicy,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl NodeConfig {
    /// Loopback-only node with no seeds.
    pub fn local(listen_port: u16) -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, address: impl Into<String>, port: impl Into<String>) -> Self {
        self.seeds.push(SeedPeer::new(address, port));
        self
    }

    pub fn with_seed_policy(mut self, policy: SeedPolicy) -> Self {
        self.seed_policy = policy;
        self
    }
}

impl From<&FlipmeshConfig> for NodeConfig {
    fn from(config: &FlipmeshConfig) -> Self {
        Self {
            bind_address: config.network.bind_address,
            listen_port: config.network.listen_port,
            seeds: config.seeds.peers.clone(),
            seed_policy: config.seeds.policy,
            connect_timeout: config.network.connect_timeout(),
            handshake_timeout: config.network.handshake_timeout(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::from(&FlipmeshConfig::default())
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Starting,
    Listening,
    Running,
    Closing,
    Closed,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to listen on {addr}: {source}")]
    ListenFailed { addr: SocketAddr, source: io::Error },

    #[error("none of the seed peers could be reached")]
    NoPeersReachable,

    #[error("already connected to {0}")]
    AlreadyConnected(Peer),

    #[error("{0} is this node's own listener")]
    SelfConnect(Peer),

    #[error("invalid peer: {0}")]
    InvalidPeer(#[from] PeerError),

    #[error("connection failed: {0}")]
    Connection(ConnectionError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<ConnectionError> for NodeError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Timeout(after) => NodeError::Timeout(after),
            other => NodeError::Connection(other),
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

/// Handle to a running node. Cheap to clone; all clones drive the same node.
///
/// Dropping handles does not stop the node. Call `close()`.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    config: NodeConfig,
    local_addr: SocketAddr,
    registry: PeerRegistry,
    state: StateRegister,
    status: watch::Sender<NodeState>,
    dial_queue: mpsc::UnboundedSender<Peer>,
    /// Peers with an outbound dial in flight.
    dialing: DashSet<Peer>,
    /// Each tracked task holds a clone; `None` once closing.
    task_guard: Mutex<Option<mpsc::Sender<()>>>,
    tasks_done: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl Node {
    /// Bind the listener, start background tasks, and dial the seeds.
    ///
    /// With seeds configured, fails with `NoPeersReachable` (after closing
    /// the node) if none of them ends up registered.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let bind_addr = SocketAddr::new(config.bind_address, config.listen_port);
        let listen_failed = |source: io::Error| NodeError::ListenFailed {
            addr: bind_addr,
            source,
        };
        let listener = TcpListener::bind(bind_addr).await.map_err(listen_failed)?;
        let local_addr = listener.local_addr().map_err(listen_failed)?;

        let (status, _) = watch::channel(NodeState::Starting);
        let (dial_queue, dial_rx) = mpsc::unbounded_channel();
        let (task_guard, tasks_done) = mpsc::channel(1);

        let node = Node {
            inner: Arc::new(Inner {
                config,
                local_addr,
                registry: PeerRegistry::new(),
                state: StateRegister::new(),
                status,
                dial_queue,
                dialing: DashSet::new(),
                task_guard: Mutex::new(Some(task_guard)),
                tasks_done: tokio::sync::Mutex::new(tasks_done),
            }),
        };

        node.set_status(NodeState::Listening);
        tracing::info!(%local_addr, "listening");

        node.spawn_tracked(node.clone().accept_loop(listener));
        node.spawn_tracked(node.clone().dial_loop(dial_rx));

        let starting = CloseOnDrop(Some(node.clone()));
        if !node.inner.config.seeds.is_empty() {
            node.connect_seeds().await;
            if node.peer_count() == 0 {
                tracing::error!("no seed peer reachable");
                node.close().await;
                return Err(NodeError::NoPeersReachable);
            }
        }
        starting.disarm();

        node.set_status(NodeState::Running);
        Ok(node)
    }

    // ── Observer interface ───────────────────────────────────────────────────

    /// Install the state-change handler, replacing any previous one.
    ///
    /// Runs synchronously inside the update, for local and remote changes.
    pub fn on_change(&self, handler: impl Fn(bool) + Send + Sync + 'static) {
        self.inner.state.set_event(handler);
    }

    /// Set the shared value, stamped with the current time. Broadcast to
    /// every peer if it was applied.
    pub async fn set_state(&self, value: bool) -> bool {
        let timestamp = Timestamp::now();
        if !self.inner.state.update(value, timestamp) {
            return false;
        }
        let reached = self
            .inner
            .registry
            .broadcast(&ChangeState::new(value, timestamp).into())
            .await;
        tracing::info!(value, peers = reached, "state set locally");
        true
    }

    pub fn state(&self) -> bool {
        self.inner.state.get_state()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.inner.state.get_time()
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn listen_port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.registry.peers()
    }

    pub fn status(&self) -> NodeState {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<NodeState> {
        self.inner.status.subscribe()
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Connect to `address:port` as written by an operator.
    pub async fn connect(&self, address: &str, port: &str) -> Result<(), NodeError> {
        let peer = Peer::parse(address, port)?;
        self.connect_peer(peer).await
    }

    /// Dial `peer`, announce our listen port, and register the link.
    pub async fn connect_peer(&self, peer: Peer) -> Result<(), NodeError> {
        if self.is_own_listener(&peer) {
            return Err(NodeError::SelfConnect(peer));
        }
        if self.inner.registry.contains(&peer) || !self.inner.dialing.insert(peer) {
            return Err(NodeError::AlreadyConnected(peer));
        }
        let _dialing = DialGuard {
            dialing: &self.inner.dialing,
            peer,
        };
        self.dial_and_register(peer).await
    }

    async fn dial_and_register(&self, peer: Peer) -> Result<(), NodeError> {
        let timeout = self.inner.config.connect_timeout;
        let dialed = tokio::select! {
            biased;
            _ = self.closing() => Err(ConnectionError::ConnectionClosed),
            result = Connection::dial(peer.socket_addr(), timeout) => result,
        };
        let conn = Arc::new(dialed?);

        if let Err(e) = conn.send_preamble(self.listen_port()).await {
            conn.close().await;
            return Err(e.into());
        }

        let registered = self.inner.registry.add(peer, conn.clone());
        // The remote may have registered this link even if we lost the race
        // locally, so a duplicate keeps its receive task running.
        if !self.spawn_tracked(self.clone().receive_loop(peer, conn.clone())) {
            self.inner.registry.remove_connection(&peer, &conn).await;
            conn.close().await;
            return Err(NodeError::Connection(ConnectionError::ConnectionClosed));
        }
        if !registered {
            tracing::debug!(%peer, "outbound link duplicates a registered one");
            return Err(NodeError::AlreadyConnected(peer));
        }

        tracing::info!(%peer, peers = self.peer_count(), "connected to peer");
        Ok(())
    }

    async fn connect_seeds(&self) {
        for seed in &self.inner.config.seeds {
            let peer = match Peer::parse(&seed.address, &seed.port) {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::warn!(address = %seed.address, port = %seed.port, error = %e, "skipping invalid seed");
                    continue;
                }
            };
            match self.connect_peer(peer).await {
                Ok(()) => {}
                // Learned from an earlier seed in the meantime.
                Err(NodeError::AlreadyConnected(_)) => {}
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "unable to connect to seed");
                    if self.inner.config.seed_policy == SeedPolicy::StopAtFirstFailure {
                        break;
                    }
                }
            }
        }
    }

    /// Whether `peer` would dial our own listener.
    fn is_own_listener(&self, peer: &Peer) -> bool {
        let ip = peer.ip();
        peer.port() == self.listen_port()
            && (ip.is_loopback() || ip.is_unspecified() || ip == self.inner.local_addr.ip())
    }

    // ── Background tasks ─────────────────────────────────────────────────────

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            tokio::select! {
                biased;
                _ = self.closing() => {
                    tracing::debug!("accept loop shutting down");
                    return;
                }
                result = listener.accept() => {
                    let (stream, remote_addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(%remote_addr, "inbound connection");
                    self.spawn_tracked(self.clone().handle_inbound(stream, remote_addr));
                }
            }
        }
    }

    async fn handle_inbound(self, stream: TcpStream, remote_addr: SocketAddr) {
        let conn = match Connection::from_stream(stream) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                tracing::debug!(%remote_addr, error = %e, "dropping inbound connection");
                return;
            }
        };

        let handshake = tokio::select! {
            biased;
            _ = self.closing() => Err(NodeError::Connection(ConnectionError::ConnectionClosed)),
            result = self.inbound_handshake(&conn, remote_addr) => result,
        };
        let peer = match handshake {
            Ok(peer) => peer,
            Err(e) => {
                tracing::debug!(%remote_addr, error = %e, "inbound handshake failed");
                conn.close().await;
                return;
            }
        };

        if self.inner.registry.add(peer, conn.clone()) {
            tracing::info!(%peer, peers = self.peer_count(), "peer joined");
        } else {
            tracing::debug!(%peer, "inbound link duplicates a registered one");
        }
        self.receive_loop(peer, conn).await;
    }

    /// Read the remote's listen port, then tell it everyone we know and our
    /// current state.
    async fn inbound_handshake(
        &self,
        conn: &Connection,
        remote_addr: SocketAddr,
    ) -> Result<Peer, NodeError> {
        let timeout = self.inner.config.handshake_timeout;
        let port = tokio::time::timeout(timeout, conn.receive_preamble())
            .await
            .map_err(|_| NodeError::Timeout(timeout))??;
        let peer = Peer::new(remote_addr.ip(), port);

        // Registration happens after this exchange, so a change applied in
        // between reaches this peer only with the next broadcast.
        for known in self.inner.registry.peers() {
            if known != peer {
                conn.send_packet(&AddPeer { peer: known }.into()).await?;
            }
        }
        let current = self.inner.state.snapshot();
        conn.send_packet(&ChangeState::new(current.value, current.timestamp).into())
            .await?;
        Ok(peer)
    }

    /// Serve one link until it fails or the node closes.
    async fn receive_loop(self, peer: Peer, conn: Arc<Connection>) {
        loop {
            let packet = tokio::select! {
                biased;
                _ = self.closing() => break,
                result = conn.receive_packet() => match result {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::debug!(%peer, error = %e, "link ended");
                        break;
                    }
                },
            };

            match packet {
                Packet::AddPeer(AddPeer { peer: announced }) => {
                    tracing::trace!(from = %peer, %announced, "peer announced");
                    let _ = self.inner.dial_queue.send(announced);
                }
                Packet::ChangeState(change) => {
                    let timestamp = change.timestamp.unwrap_or(Timestamp::EPOCH);
                    if self.inner.state.update(change.state, timestamp) {
                        let forward = ChangeState::new(change.state, timestamp);
                        self.inner.registry.broadcast(&forward.into()).await;
                    }
                }
            }
        }

        if self.inner.registry.remove_connection(&peer, &conn).await {
            tracing::info!(%peer, peers = self.peer_count(), "peer left");
        } else {
            conn.close().await;
        }
    }

    async fn dial_loop(self, mut queue: mpsc::UnboundedReceiver<Peer>) {
        loop {
            let peer = tokio::select! {
                biased;
                _ = self.closing() => return,
                next = queue.recv() => match next {
                    Some(peer) => peer,
                    None => return,
                },
            };
            let node = self.clone();
            self.spawn_tracked(async move {
                match node.connect_peer(peer).await {
                    Ok(()) => {}
                    Err(e @ (NodeError::AlreadyConnected(_) | NodeError::SelfConnect(_))) => {
                        tracing::debug!(%peer, error = %e, "announced peer skipped");
                    }
                    Err(e) => tracing::warn!(%peer, error = %e, "unable to connect to announced peer"),
                }
            });
        }
    }

    /// Spawn `task` so that `close()` waits for it. Returns false (without
    /// spawning) once the node is closing.
    fn spawn_tracked<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self
            .inner
            .task_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match guard {
            Some(guard) => {
                tokio::spawn(async move {
                    task.await;
                    drop(guard);
                });
                true
            }
            None => false,
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Stop the node: close every link and wait for all tasks to finish.
    ///
    /// Idempotent. Concurrent callers all return once the node is `Closed`.
    pub async fn close(&self) {
        let first = self.inner.status.send_if_modified(|status| {
            if *status < NodeState::Closing {
                *status = NodeState::Closing;
                true
            } else {
                false
            }
        });
        if !first {
            self.wait_closed().await;
            return;
        }
        tracing::info!(listen_port = self.listen_port(), "node closing");

        drop(
            self.inner
                .task_guard
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.inner.registry.close_all().await;

        let mut tasks_done = self.inner.tasks_done.lock().await;
        while tasks_done.recv().await.is_some() {}
        drop(tasks_done);

        // Anything registered while the first sweep ran.
        self.inner.registry.close_all().await;

        self.set_status(NodeState::Closed);
        tracing::info!(listen_port = self.listen_port(), "node closed");
    }

    /// Resolves once the node has fully closed.
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.status.subscribe();
        let _ = rx.wait_for(|status| *status == NodeState::Closed).await;
    }

    async fn closing(&self) {
        let mut rx = self.inner.status.subscribe();
        let _ = rx.wait_for(|status| *status >= NodeState::Closing).await;
    }

    fn set_status(&self, status: NodeState) {
        tracing::debug!(?status, "node status");
        self.inner.status.send_replace(status);
    }
}

/// Holds `peer` in the in-flight dial set until dropped, including when the
/// dialing future is cancelled.
struct DialGuard<'a> {
    dialing: &'a DashSet<Peer>,
    peer: Peer,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.dialing.remove(&self.peer);
    }
}

/// Closes a node whose `start` future was dropped before it returned.
struct CloseOnDrop(Option<Node>);

impl CloseOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let Some(node) = self.0.take() else { return };
        if node.status() >= NodeState::Closing {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            tracing::debug!(listen_port = node.listen_port(), "start cancelled, closing node");
            runtime.spawn(async move { node.close().await });
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local_addr", &self.inner.local_addr)
            .field("status", &self.status())
            .field("peers", &self.peer_count())
            .finish()
    }
}
