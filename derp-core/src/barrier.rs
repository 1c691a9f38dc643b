//! Distributed barrier used to synchronize a job's shells across ranks.
//!
//! A barrier converges locally when every rank in this rank's subtree has
//! entered; it converges cluster-wide when that happens at the job's LCA.
//! Sequencing guards against a `barrier-enter` notify arriving for a cycle
//! this rank has already moved past.

use std::sync::Arc;

use serde_json::json;

use crate::error::DerpError;
use crate::idset::Idset;
use crate::transport::{ReplyFrame, ReplyHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierStatus {
    /// Not every subtree rank has entered yet; nothing to do.
    Waiting,
    /// Every subtree rank entered, but this rank is not the job's LCA —
    /// the caller must notify upstream and wait for the reply before
    /// calling `complete`.
    NotifyUpstream,
    /// Every subtree rank entered and this rank *is* the job's LCA — the
    /// caller should call `complete(Ok(()))` immediately.
    CompleteHere,
}

/// Per-job, per-rank barrier state.
pub struct Barrier {
    sequence: u32,
    ranks_entered: Idset,
    pending: Vec<Arc<dyn ReplyHandle>>,
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Barrier {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            ranks_entered: Idset::new(),
            pending: Vec::new(),
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn ranks_entered(&self) -> &Idset {
        &self.ranks_entered
    }

    /// The local shell entered the barrier.
    pub fn enter_local(&mut self, rank: crate::idset::Rank) {
        self.ranks_entered.add(rank);
    }

    /// A child reported `barrier-enter` for `ranks` at sequence `seq`,
    /// carrying `envelope` as the downstream request awaiting reply.
    pub fn enter(
        &mut self,
        envelope: Arc<dyn ReplyHandle>,
        ranks: Idset,
        seq: u32,
    ) -> Result<(), DerpError> {
        if seq != self.sequence {
            return Err(DerpError::Mismatch {
                expected: self.sequence,
                got: seq,
            });
        }
        self.ranks_entered.union_with(&ranks);
        self.pending.push(envelope);
        Ok(())
    }

    /// Re-evaluate the completion predicate. `subtree_ranks` is
    /// this rank's responsibility for the job; `is_lca` is whether this
    /// rank is the job's lowest common ancestor.
    pub fn check(&self, subtree_ranks: &Idset, is_lca: bool) -> BarrierStatus {
        if self.ranks_entered == *subtree_ranks {
            if is_lca {
                BarrierStatus::CompleteHere
            } else {
                BarrierStatus::NotifyUpstream
            }
        } else {
            BarrierStatus::Waiting
        }
    }

    /// Declare the barrier complete (or cancelled, if `outcome` carries an
    /// error): reply to every queued envelope, then advance to the next
    /// sequence. Does not release the local shell — the caller does that
    /// only on success, since a cancelled barrier must not release it.
    pub async fn complete(&mut self, outcome: Result<(), String>) -> Result<(), DerpError> {
        let pending = std::mem::take(&mut self.pending);
        let frame = match &outcome {
            Ok(()) => ReplyFrame::new("barrier-complete", json!({ "ok": true })),
            Err(e) => ReplyFrame::new("barrier-complete", json!({ "ok": false, "error": e })),
        };
        let mut first_err = None;
        for envelope in pending {
            if let Err(e) = envelope.respond(frame.clone()).await {
                first_err.get_or_insert(e);
            }
        }
        self.reset();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn reset(&mut self) {
        self.sequence += 1;
        self.ranks_entered = Idset::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::RecordingReply;

    #[test]
    fn completion_predicate() {
        let mut b = Barrier::new();
        let subtree = Idset::from_ranks([0, 1, 2, 3]);
        b.enter_local(0);
        assert_eq!(b.check(&subtree, true), BarrierStatus::Waiting);
        b.ranks_entered.union_with(&Idset::from_ranks([1, 2]));
        assert_eq!(b.check(&subtree, true), BarrierStatus::Waiting);
        b.enter_local(3);
        assert_eq!(b.check(&subtree, true), BarrierStatus::CompleteHere);
        assert_eq!(b.check(&subtree, false), BarrierStatus::NotifyUpstream);
    }

    #[test]
    fn enter_rejects_stale_sequence() {
        let mut b = Barrier::new();
        let reply = Arc::new(RecordingReply::default());
        assert!(b.enter(reply, Idset::singleton(1), 1).is_err());
    }

    #[tokio::test]
    async fn complete_replies_and_advances_sequence() {
        let mut b = Barrier::new();
        let r1 = Arc::new(RecordingReply::default());
        let r2 = Arc::new(RecordingReply::default());
        b.enter(r1.clone(), Idset::singleton(1), 0).unwrap();
        b.enter(r2.clone(), Idset::singleton(2), 0).unwrap();
        b.complete(Ok(())).await.unwrap();
        assert_eq!(r1.frame_count(), 1);
        assert_eq!(r2.frame_count(), 1);
        assert_eq!(b.sequence(), 1);
        assert!(b.ranks_entered().is_empty());
    }

    #[tokio::test]
    async fn cancellation_carries_error_and_still_resets() {
        let mut b = Barrier::new();
        let r1 = Arc::new(RecordingReply::default());
        b.enter(r1.clone(), Idset::singleton(1), 0).unwrap();
        b.complete(Err("upstream failed".to_string())).await.unwrap();
        let last = r1.last_frame().unwrap();
        assert_eq!(last.data["ok"], false);
        assert_eq!(b.sequence(), 1);
    }
}
