//! Error taxonomy for the execution core.
//!
//! These are kinds, not a grab-bag of ad-hoc messages: every failure path
//! in this crate resolves to exactly one of these variants, which in turn
//! tells the caller (router, engine, client response) how to react.

use crate::idset::Rank;

#[derive(thiserror::Error, Debug, Clone)]
pub enum DerpError {
    /// Malformed payload, unknown message type, idset decode failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation referenced an unknown job id, peer rank, or pending wait.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate job add or duplicate action/notify registration.
    #[error("already exists: {0}")]
    Exists(String),

    /// Operation not implemented on this path (e.g. `release` delivery).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Out-of-memory or downstream send failure; in-memory state stays
    /// consistent and the reactor keeps running.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Job-level failure (spawn failed, barrier failed upstream). Carries
    /// enough to become an `exception` notify upstream.
    #[error("job {job} fatal on rank {rank}: {message}")]
    JobFatal {
        job: u64,
        rank: Rank,
        severity: u32,
        message: String,
    },

    /// A peer rank rejected a `connect`/`disconnect` because the sender is
    /// not one of its registered children.
    #[error("unknown peer rank {0}")]
    UnknownPeer(Rank),

    /// A barrier `enter` request carried a sequence number that does not
    /// match the barrier's current sequence.
    #[error("barrier sequence mismatch: expected {expected}, got {got}")]
    Mismatch { expected: u32, got: u32 },
}

impl DerpError {
    pub fn job_fatal(job: u64, rank: Rank, severity: u32, message: impl Into<String>) -> Self {
        DerpError::JobFatal {
            job,
            rank,
            severity,
            message: message.into(),
        }
    }

    /// Maps a local spawn failure to the exit-code-shaped status the
    /// status-aggregation `max` reduction expects.
    pub fn spawn_failure_status(&self) -> u32 {
        match self {
            DerpError::Unsupported(_) => 126,
            DerpError::NotFound(_) => 127,
            DerpError::Transient(_) => 68,
            _ => 1,
        }
    }
}
