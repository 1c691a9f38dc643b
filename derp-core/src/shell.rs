//! The seam between the exec engine and the per-node subprocess layer.
//! This module only defines what that collaborator must expose;
//! `derp_core::testkit::InMemoryShell` is the reference implementation
//! used by this crate's own tests.

use async_trait::async_trait;

use crate::error::DerpError;
use crate::idset::Rank;

/// A POSIX-ish signal number, as carried on the wire by `exec.kill`.
pub type Signal = i32;

pub const SIGTERM: Signal = 15;
pub const SIGKILL: Signal = 9;

/// A namespace-scoped environment handed to a spawned job shell.
#[derive(Clone, Debug, Default)]
pub struct ShellEnv {
    pub job_id: u64,
    pub rank: Rank,
    pub vars: Vec<(String, String)>,
}

/// What the local job shell is telling the engine right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellEvent {
    Running,
    /// The shell wrote `enter\n` on its barrier channel.
    BarrierEnter,
    Completed { status: u32 },
    Failed { status: u32 },
}

/// A spawned local job shell. Exists only if this rank is a target of the
/// job.
#[async_trait]
pub trait JobShell: Send + Sync {
    /// Deliver a signal, as dispatched by the `kill` action.
    async fn signal(&self, signal: Signal) -> Result<(), DerpError>;

    /// Release the shell past a barrier it reported entering, or cancel it
    /// with an error if the barrier failed upstream.
    async fn release_barrier(&self, outcome: Result<(), String>) -> Result<(), DerpError>;

    /// True only if this job spans more than one rank — single-rank jobs
    /// never attach a barrier channel.
    fn has_barrier_channel(&self) -> bool;
}

/// Spawns job shells. A real implementation forks/execs the job's
/// executable and wires its stdio and barrier-release pipe; that is
/// explicitly out of scope here.
#[async_trait]
pub trait ShellSpawner: Send + Sync {
    async fn spawn(
        &self,
        env: ShellEnv,
        with_barrier_channel: bool,
    ) -> Result<Box<dyn JobShell>, DerpError>;
}
