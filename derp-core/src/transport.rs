//! The contract this crate requires from the message-broker transport.
//!
//! The transport itself — the RPC/event pub-sub handle — is an external
//! collaborator and is not implemented here. This module
//! only specifies the shape it must expose: a route handle requests arrive
//! on ([`ReplyHandle`]), a way to notify a parent ([`Upstream`]), and a way
//! to attach as a child ([`HelloChannel`]). `derp_core::testkit` ships an
//! in-process reference implementation of all three for this crate's own
//! tests — `LocalMesh::attach` drives the real `HelloChannel::hello` call
//! for every rank's initial attach and for post-disconnect reconnection —
//! the same one-trait-many-backends shape as an in-memory store standing
//! in for a real backend behind a common trait.

use async_trait::async_trait;

use crate::error::DerpError;
use crate::idset::Idset;

/// An inbound request, kept alive across `await` points so a reply can be
/// sent once the engine has finished reacting to it. Implementations are
/// the route handle a real broker's RPC layer hands back on receipt
/// (analogous to `connect_envelope` on a [`crate::peer::PeerRecord`] and to
/// the `pending` envelopes queued by a [`crate::barrier::Barrier`]).
#[async_trait]
pub trait ReplyHandle: Send + Sync {
    /// Send one streamed frame back along this request's reply channel.
    /// May be called more than once for a streaming request (e.g.
    /// `exec.start`'s `start` / `finish` / `exception` / `release` frames).
    async fn respond(&self, frame: ReplyFrame) -> Result<(), DerpError>;
}

/// One frame sent back to a request's originator.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ReplyFrame {
    pub type_: String,
    pub data: serde_json::Value,
}

impl ReplyFrame {
    pub fn new(type_: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            type_: type_.into(),
            data,
        }
    }
}

/// Send a single-shot notification toward the parent. No business-level
/// reply is awaited by the caller, but the
/// call is still fallible at the transport layer (e.g. parent unreachable).
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn notify(&self, type_: &str, data: serde_json::Value) -> Result<(), DerpError>;

    /// Report local barrier convergence for `job_id` and block until the
    /// parent's own barrier for it completes or is cancelled. `Err` carries the cancellation reason.
    async fn barrier_enter(&self, job_id: u64, ranks: Idset, seq: u32) -> Result<(), DerpError>;
}

/// The long-lived child-to-parent `hello` attachment. Every non-root rank
/// calls `hello` once at module load; the parent then streams
/// `(type, idset, data)` frames back, each of which the child hands to
/// [`crate::engine::ExecEngine::on_hello_frame`].
#[async_trait]
pub trait HelloChannel: Send + Sync {
    async fn hello(&self, rank: crate::idset::Rank) -> Result<(), DerpError>;
}
