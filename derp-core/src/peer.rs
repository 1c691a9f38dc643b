//! Per-child connection state and downstream fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::json;

use crate::error::DerpError;
use crate::hello::HelloResponse;
use crate::idset::{Idset, Rank};
use crate::transport::{ReplyFrame, ReplyHandle};

/// Connection state for one immediate child.
pub struct PeerRecord {
    pub rank: Rank,
    pub subtree_idset: Idset,
    connected: bool,
    connect_envelope: Option<Arc<dyn ReplyHandle>>,
    pending: VecDeque<Arc<HelloResponse>>,
}

impl PeerRecord {
    fn new(rank: Rank, subtree_idset: Idset) -> Self {
        Self {
            rank,
            subtree_idset,
            connected: false,
            connect_envelope: None,
            pending: VecDeque::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// The set of immediate children of a rank, keyed by rank, plus the
/// downstream fan-out logic that restricts each child to its own subtree.
pub struct PeerTable {
    peers: HashMap<Rank, PeerRecord>,
}

impl PeerTable {
    /// Construct one peer per `children`, each pre-loaded with its subtree
    /// idset from the topology.
    pub fn from_children(children: impl IntoIterator<Item = (Rank, Idset)>) -> Self {
        let peers = children
            .into_iter()
            .map(|(rank, subtree)| (rank, PeerRecord::new(rank, subtree)))
            .collect();
        Self { peers }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, rank: Rank) -> Option<&PeerRecord> {
        self.peers.get(&rank)
    }

    /// Register an inbound `hello` attach from `rank`; replays any pending
    /// responses queued while disconnected, in FIFO order, before returning.
    pub async fn connect(
        &mut self,
        rank: Rank,
        envelope: Arc<dyn ReplyHandle>,
    ) -> Result<(), DerpError> {
        let peer = self
            .peers
            .get_mut(&rank)
            .ok_or(DerpError::UnknownPeer(rank))?;
        peer.connect_envelope = Some(envelope.clone());
        peer.connected = true;

        while let Some(hresp) = peer.pending.pop_front() {
            let restricted = hresp.idset.intersect(&peer.subtree_idset);
            envelope
                .respond(ReplyFrame::new(
                    hresp.type_.clone(),
                    json!({ "idset": restricted.encode(), "data": hresp.data.clone() }),
                ))
                .await?;
        }
        Ok(())
    }

    /// Mark `rank` disconnected. In-flight and future fan-out for this
    /// child is queued rather than dropped.
    pub fn disconnect(&mut self, rank: Rank) {
        if let Some(peer) = self.peers.get_mut(&rank) {
            peer.connected = false;
            peer.connect_envelope = None;
        }
    }

    /// Fan a hello response out to every child whose subtree intersects its
    /// target idset, restricting each child's copy to that intersection —
    /// "never broader, so downstream ranks never see messages for peers
    /// they cannot reach".
    pub async fn forward_response(&mut self, hresp: &Arc<HelloResponse>) -> Result<(), DerpError> {
        let mut first_err = None;
        for peer in self.peers.values_mut() {
            let restricted = hresp.idset.intersect(&peer.subtree_idset);
            if restricted.is_empty() {
                continue;
            }
            if peer.connected {
                let envelope = peer.connect_envelope.clone().expect("connected implies envelope");
                let result = envelope
                    .respond(ReplyFrame::new(
                        hresp.type_.clone(),
                        json!({ "idset": restricted.encode(), "data": hresp.data.clone() }),
                    ))
                    .await;
                if let Err(e) = result {
                    first_err.get_or_insert(e);
                }
            } else {
                peer.pending.push_back(hresp.clone());
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::RecordingReply;

    fn table() -> PeerTable {
        PeerTable::from_children([
            (1, Idset::singleton(1)),
            (2, Idset::singleton(2)),
            (3, Idset::singleton(3)),
        ])
    }

    #[tokio::test]
    async fn connect_rejects_unknown_peer() {
        let mut t = table();
        let reply = Arc::new(RecordingReply::default());
        let err = t.connect(99, reply).await.unwrap_err();
        assert!(matches!(err, DerpError::UnknownPeer(99)));
    }

    #[tokio::test]
    async fn forward_restricts_to_child_subtree() {
        let mut t = table();
        let r1 = Arc::new(RecordingReply::default());
        let r2 = Arc::new(RecordingReply::default());
        t.connect(1, r1.clone()).await.unwrap();
        t.connect(2, r2.clone()).await.unwrap();

        let hresp = HelloResponse::state_update(Idset::from_ranks([1, 2]), vec![]);
        t.forward_response(&hresp).await.unwrap();

        assert_eq!(r1.last_idset(), Some("1".to_string()));
        assert_eq!(r2.last_idset(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn disconnect_queues_then_replays_in_order() {
        let mut t = table();
        let a = HelloResponse::state_update(Idset::singleton(2), vec![]);
        let b = HelloResponse::state_update(Idset::singleton(2), vec![]);
        t.forward_response(&a).await.unwrap();
        t.forward_response(&b).await.unwrap();
        assert_eq!(t.get(2).unwrap().pending_len(), 2);

        let reply = Arc::new(RecordingReply::default());
        t.connect(2, reply.clone()).await.unwrap();
        assert_eq!(t.get(2).unwrap().pending_len(), 0);
        assert_eq!(reply.frame_count(), 2);
    }
}
