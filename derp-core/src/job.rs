//! Per-job, per-rank record and the rank-local view of the job state
//! machine.

use std::sync::Arc;

use crate::barrier::Barrier;
use crate::idset::{Idset, Rank};
use crate::shell::JobShell;
use crate::transport::ReplyHandle;

/// The state a single rank's view of a job is in. Not
/// every rank passes through every state: a rank outside the job's rank
/// set goes straight to `Skip`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Init,
    Running,
    Barrier(u32),
    Finished,
    Skip,
}

/// Per-job, per-rank record. Lifecycle: created when a
/// `state-update{add}` for this job is applied on a rank; the release
/// side of the lifecycle is an open question this crate resolves in
/// `DESIGN.md` rather than guessing silently.
pub struct JobRecord {
    pub id: u64,
    pub userid: u32,
    /// Full set of ranks the job runs on, cluster-wide.
    pub ranks: Idset,
    /// `ranks ∩ this_rank.subtree` — the set this rank is responsible for.
    pub subtree_ranks: Idset,
    pub start_ranks: Idset,
    pub finish_ranks: Idset,
    pub release_ranks: Idset,
    pub barrier: Barrier,
    /// Highest exit code observed within `subtree_ranks` so far.
    pub status: u32,
    pub state: JobState,
    pub local_shell: Option<Box<dyn JobShell>>,
    /// The originating client request envelope. Root only; `None` on every
    /// other rank.
    pub request: Option<Arc<dyn ReplyHandle>>,
    start_reported: bool,
    finish_reported: bool,
}

impl JobRecord {
    pub fn new(id: u64, userid: u32, ranks: Idset, own_rank: Rank, own_subtree: &Idset) -> Self {
        let subtree_ranks = ranks.intersect(own_subtree);
        let state = if ranks.contains(own_rank) {
            JobState::Init
        } else {
            JobState::Skip
        };
        Self {
            id,
            userid,
            ranks,
            subtree_ranks,
            start_ranks: Idset::new(),
            finish_ranks: Idset::new(),
            release_ranks: Idset::new(),
            barrier: Barrier::new(),
            status: 0,
            state,
            local_shell: None,
            request: None,
            start_reported: false,
            finish_reported: false,
        }
    }

    pub fn is_local_target(&self, own_rank: Rank) -> bool {
        self.ranks.contains(own_rank)
    }

    /// Fold a local spawn failure's exit-code-shaped status into the `max`
    /// reduction.
    pub fn record_status(&mut self, status: u32) {
        self.status = self.status.max(status);
    }

    /// Union `ranks` into `start_ranks`. Returns `true` exactly once, the
    /// first time the union reaches `subtree_ranks` — idempotent against replayed/duplicate `start` events.
    pub fn record_start(&mut self, ranks: &Idset) -> bool {
        self.start_ranks.union_with(ranks);
        if !self.start_reported && self.start_ranks == self.subtree_ranks {
            self.start_reported = true;
            return true;
        }
        false
    }

    /// Same as `record_start` but for `finish_ranks`.
    pub fn record_finish(&mut self, ranks: &Idset, status: u32) -> bool {
        self.finish_ranks.union_with(ranks);
        self.record_status(status);
        if !self.finish_reported && self.finish_ranks == self.subtree_ranks {
            self.finish_reported = true;
            return true;
        }
        false
    }

    pub fn record_release(&mut self, ranks: &Idset) {
        self.release_ranks.union_with(ranks);
    }

    pub fn is_lca(&self, lca_rank: Option<Rank>, own_rank: Rank) -> bool {
        lca_rank == Some(own_rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_vs_skip_on_construction() {
        let subtree = Idset::from_ranks([1, 2, 3]);
        let local = JobRecord::new(1, 1000, Idset::from_ranks([1, 2]), 1, &subtree);
        assert_eq!(local.state, JobState::Init);
        assert_eq!(local.subtree_ranks, Idset::from_ranks([1, 2]));

        let skip = JobRecord::new(2, 1000, Idset::from_ranks([2, 3]), 1, &subtree);
        assert_eq!(skip.state, JobState::Skip);
    }

    #[test]
    fn start_and_finish_converge_once() {
        let subtree = Idset::from_ranks([0, 1]);
        let mut job = JobRecord::new(1, 1000, Idset::from_ranks([0, 1]), 0, &subtree);
        assert!(!job.record_start(&Idset::singleton(0)));
        assert!(job.record_start(&Idset::singleton(1)));
        // Replaying the same event must not re-trigger convergence.
        assert!(!job.record_start(&Idset::singleton(1)));

        assert!(!job.record_finish(&Idset::singleton(0), 0));
        assert!(job.record_finish(&Idset::singleton(1), 7));
        assert_eq!(job.status, 7);
    }

    #[test]
    fn invariant_start_subset_subtree_subset_ranks() {
        let subtree = Idset::from_ranks([0, 1, 2, 3]);
        let mut job = JobRecord::new(1, 1000, Idset::from_ranks([0, 1, 2]), 0, &subtree);
        job.record_start(&Idset::from_ranks([0, 1]));
        assert!(job.start_ranks.is_subset(&job.subtree_ranks));
        assert!(job.subtree_ranks.is_subset(&job.ranks));
    }
}
