//! Tree-overlay hello/forward protocol, distributed barrier, and per-rank
//! job execution state machine for a cluster resource manager's runtime
//! core.
//!
//! This crate is the piece that runs identically on every rank of the
//! overlay: the topology and idset primitives, the hello/forward wire
//! protocol, the per-job state machine, and the distributed barrier. What
//! it deliberately does not implement — the broker transport itself,
//! subprocess spawn/IO, and cluster scheduling — are external collaborators
//! whose contracts live in [`transport`] and [`shell`]; [`testkit`] ships
//! in-process reference implementations of both for this crate's own
//! tests and for any downstream integration test.

pub mod barrier;
pub mod engine;
pub mod error;
pub mod hello;
pub mod idset;
pub mod job;
pub mod peer;
pub mod router;
pub mod shell;
pub mod testkit;
pub mod topology;
pub mod transport;
pub mod wire;

pub use engine::ExecEngine;
pub use error::DerpError;
pub use idset::{Idset, Rank};
pub use topology::{Context, Topology, TopologyNode};
