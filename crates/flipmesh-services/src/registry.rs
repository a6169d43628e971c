//! Peer registry: live connections keyed by peer.
//!
//! Shared by the accept loop, every receive task, and outbound dials.
//! Each key is present at most once; `len()` is the DashMap entry count, so
//! it always matches the set of keys actually present. A peer leaves the
//! registry only through removal, which also closes its connection.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;

use flipmesh_core::{Packet, Peer};

use crate::connection::Connection;

#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<Peer, Arc<Connection>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under `peer` unless the peer is already present.
    ///
    /// Returns false (and keeps the existing entry) on a duplicate. The
    /// rejected connection stays the caller's to close.
    pub fn add(&self, peer: Peer, conn: Arc<Connection>) -> bool {
        match self.peers.entry(peer) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(conn);
                tracing::debug!(%peer, peers = self.peers.len(), "peer registered");
                true
            }
        }
    }

    /// Remove `peer` and close its connection. No-op if absent.
    pub async fn remove(&self, peer: &Peer) -> bool {
        match self.peers.remove(peer) {
            Some((_, conn)) => {
                conn.close().await;
                tracing::debug!(%peer, "peer removed");
                true
            }
            None => false,
        }
    }

    /// Remove `peer` only while it is registered with this exact connection.
    ///
    /// A receive task ending on a duplicate link must not evict the link
    /// that won registration.
    pub async fn remove_connection(&self, peer: &Peer, conn: &Arc<Connection>) -> bool {
        match self.peers.remove_if(peer, |_, registered| Arc::ptr_eq(registered, conn)) {
            Some((_, conn)) => {
                conn.close().await;
                tracing::debug!(%peer, "peer removed");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer: &Peer) -> Result<Arc<Connection>, RegistryError> {
        self.peers
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or(RegistryError::PeerNotFound(*peer))
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Registered peers at this instant.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// Write `packet` to every registered connection.
    ///
    /// Sends run concurrently. Any peer whose send fails is removed (and
    /// closed) before this returns. Returns the number of peers reached.
    pub async fn broadcast(&self, packet: &Packet) -> usize {
        let bytes = packet.encode();
        // Snapshot first: no shard lock may be held across an await.
        let targets: Vec<(Peer, Arc<Connection>)> = self
            .peers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        tracing::debug!(tag = ?packet.tag(), peers = targets.len(), "broadcasting packet");

        let results = join_all(targets.iter().map(|(_, conn)| conn.send(&bytes))).await;

        let mut delivered = 0;
        for ((peer, conn), result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "broadcast send failed, dropping peer");
                    if !self.remove_connection(peer, conn).await {
                        conn.close().await;
                    }
                }
            }
        }
        delivered
    }

    /// Remove and close every entry.
    pub async fn close_all(&self) {
        loop {
            let peers = self.peers();
            if peers.is_empty() {
                return;
            }
            for peer in &peers {
                self.remove(peer).await;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("peer not found: {0}")]
    PeerNotFound(Peer),
}
