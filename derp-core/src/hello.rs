//! Batched downstream fan-out payload and the accumulator that builds it.
//!
//! `HelloResponder` coalesces per-rank job additions behind a short timer so
//! a burst of `exec.start` calls produces one `state-update` frame instead
//! of one per job.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::idset::Idset;

/// One job-added record accumulated by the responder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobAddedRecord {
    pub job_id: u64,
    pub userid: u32,
    pub ranks: Idset,
}

/// A batched, type-tagged payload streamed from parent to child. Shared
/// across multiple children's pending queues as a reference-counted
/// immutable carrier via `Arc` rather than a hand-rolled refcount field —
/// nothing in this crate ever mutates one after construction, so `Arc`'s
/// own strong count *is* the refcount.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloResponse {
    pub type_: String,
    pub idset: Idset,
    pub data: serde_json::Value,
}

impl HelloResponse {
    pub fn state_update(idset: Idset, jobs: Vec<JobAddedRecord>) -> Arc<HelloResponse> {
        Arc::new(HelloResponse {
            type_: "state-update".to_string(),
            idset,
            data: json!({ "jobs": jobs }),
        })
    }

    /// Construct a one-off hello response of any type, e.g. the `kill` /
    /// `start` / `finish` / `ping` frames `Router::forward` fans out
    /// outside of the `state-update` aggregation path.
    pub fn generic(type_: impl Into<String>, idset: Idset, data: serde_json::Value) -> Arc<HelloResponse> {
        Arc::new(HelloResponse {
            type_: type_.into(),
            idset,
            data,
        })
    }
}

/// Accumulates per-rank additions between coalescing windows.
#[derive(Default)]
pub struct HelloResponder {
    aggregate: Idset,
    jobs: Vec<JobAddedRecord>,
}

impl HelloResponder {
    pub fn new() -> Self {
        Self {
            aggregate: Idset::new(),
            jobs: Vec::new(),
        }
    }

    /// Append a job-added record, unioning `ranks` into the running
    /// aggregate. Returns `true` if this is the first record since the
    /// last `pop` — the caller should arm the coalescing timer in that
    /// case (this module owns no timer itself; see `ExecEngine::push_job_added`).
    pub fn push(&mut self, job_id: u64, userid: u32, ranks: Idset) -> bool {
        let first = self.jobs.is_empty();
        self.aggregate.union_with(&ranks);
        self.jobs.push(JobAddedRecord {
            job_id,
            userid,
            ranks,
        });
        first
    }

    /// Emit the accumulated `state-update` and clear the accumulator, or
    /// `None` if nothing has been pushed since the last pop.
    pub fn pop(&mut self) -> Option<Arc<HelloResponse>> {
        if self.jobs.is_empty() {
            return None;
        }
        let idset = std::mem::take(&mut self.aggregate);
        let jobs = std::mem::take(&mut self.jobs);
        Some(HelloResponse::state_update(idset, jobs))
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_aggregates_order_preserving() {
        let mut r = HelloResponder::new();
        assert!(r.push(1, 1000, Idset::from_ranks([0, 1])));
        assert!(!r.push(2, 1001, Idset::from_ranks([2])));
        let resp = r.pop().unwrap();
        assert_eq!(resp.idset, Idset::from_ranks([0, 1, 2]));
        assert_eq!(resp.type_, "state-update");
        let jobs = resp.data["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["job_id"], 1);
        assert_eq!(jobs[1]["job_id"], 2);
        assert!(r.is_empty());
        assert!(r.pop().is_none());
    }

    #[test]
    fn shared_via_arc_refcount() {
        let mut r = HelloResponder::new();
        r.push(1, 1000, Idset::singleton(0));
        let resp = r.pop().unwrap();
        let a = resp.clone();
        let b = resp.clone();
        assert_eq!(Arc::strong_count(&resp), 3);
        drop(a);
        drop(b);
        assert_eq!(Arc::strong_count(&resp), 1);
    }
}
