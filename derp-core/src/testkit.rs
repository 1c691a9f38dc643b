//! In-process reference implementations of the transport and job-shell
//! seams, for this crate's own tests — the same one-trait-many-backends
//! shape as a `MemoryStore` standing in for a real store behind a common
//! trait.
//!
//! [`LocalMesh`] wires one [`ExecEngine`] per rank behind its own `tokio`
//! task and an unbounded `mpsc` channel: different ranks are different OS
//! processes communicating only via message passing, and this is the
//! in-process analogue. Every call into the mesh round-trips through
//! an acknowledgement channel, so `await`ing it means the whole affected
//! subtree has finished reacting — no sleeps needed to make these tests
//! deterministic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::engine::ExecEngine;
use crate::error::DerpError;
use crate::idset::{Idset, Rank};
use crate::job::JobState;
use crate::peer::PeerTable;
use crate::shell::{JobShell, ShellEnv, ShellEvent, ShellSpawner, Signal};
use crate::topology::{Context, Topology};
use crate::transport::{HelloChannel, ReplyFrame, ReplyHandle, Upstream};
use crate::wire::{ExecKillRequest, ExecStartRequest, PingRequest};

// ───────────────────────────── RecordingReply ────────────────────────────

/// A [`ReplyHandle`] that just remembers every frame sent to it, for test
/// assertions.
#[derive(Default)]
pub struct RecordingReply {
    frames: StdMutex<Vec<ReplyFrame>>,
}

#[async_trait]
impl ReplyHandle for RecordingReply {
    async fn respond(&self, frame: ReplyFrame) -> Result<(), DerpError> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

impl RecordingReply {
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn last_frame(&self) -> Option<ReplyFrame> {
        self.frames.lock().unwrap().last().cloned()
    }

    /// Pulls `data.idset` out of the last frame, for hello fan-out
    /// assertions (the shape `forward_response` always sends).
    pub fn last_idset(&self) -> Option<String> {
        self.last_frame()
            .and_then(|f| f.data.get("idset").and_then(Value::as_str).map(str::to_string))
    }
}

// ───────────────────────────── InMemoryShell ─────────────────────────────

#[derive(Default)]
struct InMemoryShellState {
    signals: StdMutex<Vec<Signal>>,
    releases: StdMutex<Vec<Result<(), String>>>,
    barrier_channel: bool,
}

/// A reference job shell: records every signal and barrier release it
/// receives instead of actually spawning a subprocess. Cheaply `Clone`
/// (shared state behind an `Arc`), so [`InMemoryShellSpawner`] can retain a
/// handle to the same shell it hands off as a job's `local_shell` for test
/// assertions.
#[derive(Clone, Default)]
pub struct InMemoryShell {
    state: Arc<InMemoryShellState>,
}

#[async_trait]
impl JobShell for InMemoryShell {
    async fn signal(&self, signal: Signal) -> Result<(), DerpError> {
        self.state.signals.lock().unwrap().push(signal);
        Ok(())
    }

    async fn release_barrier(&self, outcome: Result<(), String>) -> Result<(), DerpError> {
        self.state.releases.lock().unwrap().push(outcome);
        Ok(())
    }

    fn has_barrier_channel(&self) -> bool {
        self.state.barrier_channel
    }
}

impl InMemoryShell {
    pub fn signals(&self) -> Vec<Signal> {
        self.state.signals.lock().unwrap().clone()
    }

    pub fn releases(&self) -> Vec<Result<(), String>> {
        self.state.releases.lock().unwrap().clone()
    }
}

/// Spawns [`InMemoryShell`]s and keeps a handle to each by job id, so tests
/// can inspect what a job's local shell received. `fail_job` simulates a
/// local spawn failure for one job id, exercising the INIT -> FINISHED
/// direct transition.
#[derive(Default)]
pub struct InMemoryShellSpawner {
    fail_job: StdMutex<Option<u64>>,
    shells: StdMutex<HashMap<u64, InMemoryShell>>,
}

impl InMemoryShellSpawner {
    pub fn fail_next(&self, job_id: u64) {
        *self.fail_job.lock().unwrap() = Some(job_id);
    }

    pub fn shell(&self, job_id: u64) -> Option<InMemoryShell> {
        self.shells.lock().unwrap().get(&job_id).cloned()
    }
}

#[async_trait]
impl ShellSpawner for InMemoryShellSpawner {
    async fn spawn(&self, env: ShellEnv, with_barrier_channel: bool) -> Result<Box<dyn JobShell>, DerpError> {
        if *self.fail_job.lock().unwrap() == Some(env.job_id) {
            return Err(DerpError::Transient(format!(
                "simulated spawn failure for job {}",
                env.job_id
            )));
        }
        let shell = InMemoryShell {
            state: Arc::new(InMemoryShellState {
                barrier_channel: with_barrier_channel,
                ..Default::default()
            }),
        };
        self.shells.lock().unwrap().insert(env.job_id, shell.clone());
        Ok(Box::new(shell))
    }
}

// ───────────────────────────── LocalMesh ─────────────────────────────────

type Ack = oneshot::Sender<Result<(), DerpError>>;

enum Cmd {
    Connect(Rank, Arc<dyn ReplyHandle>, Ack),
    Disconnect(Rank),
    HelloFrame(String, Idset, Value, Ack),
    Notify(String, Value, Ack),
    BarrierEnter(Arc<dyn ReplyHandle>, u64, Idset, u32, Ack),
    ShellEvent(u64, ShellEvent, Ack),
    RaiseException(u64, u32, String, String, Ack),
    FlushHello(Ack),
    ExecStart(ExecStartRequest, Arc<dyn ReplyHandle>, Ack),
    ExecKill(ExecKillRequest, Ack),
    Ping(PingRequest, Arc<dyn ReplyHandle>, Ack),
    Inspect(u64, oneshot::Sender<Option<(JobState, u32)>>),
}

/// The downstream push handle for one rank: wraps the hello-fan-out shape
/// `peer::PeerTable::forward_response` always sends (`{idset, data}`) and
/// round-trips it into the target rank's actor.
struct MeshReplyHandle {
    tx: mpsc::UnboundedSender<Cmd>,
}

#[async_trait]
impl ReplyHandle for MeshReplyHandle {
    async fn respond(&self, frame: ReplyFrame) -> Result<(), DerpError> {
        let idset = frame
            .data
            .get("idset")
            .and_then(Value::as_str)
            .ok_or_else(|| DerpError::Protocol("hello push missing 'idset'".into()))?;
        let ranks = Idset::decode(idset)?;
        let data = frame.data.get("data").cloned().unwrap_or(Value::Null);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Cmd::HelloFrame(frame.type_, ranks, data, ack_tx))
            .map_err(|_| DerpError::Transient("rank actor closed".into()))?;
        ack_rx.await.map_err(|_| DerpError::Transient("rank actor dropped ack".into()))?
    }
}

/// A one-shot completion route for exactly one `barrier_enter` call.
struct OneshotReply {
    tx: StdMutex<Option<oneshot::Sender<ReplyFrame>>>,
}

impl OneshotReply {
    fn new(tx: oneshot::Sender<ReplyFrame>) -> Self {
        Self {
            tx: StdMutex::new(Some(tx)),
        }
    }
}

#[async_trait]
impl ReplyHandle for OneshotReply {
    async fn respond(&self, frame: ReplyFrame) -> Result<(), DerpError> {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(frame);
        }
        Ok(())
    }
}

/// A rank's handle to its parent's actor, implementing the blocking
/// `barrier_enter` call: on the upstream reply, the caller runs `complete`.
struct MeshUpstream {
    parent_tx: mpsc::UnboundedSender<Cmd>,
    from_rank: Rank,
}

#[async_trait]
impl Upstream for MeshUpstream {
    async fn notify(&self, type_: &str, data: Value) -> Result<(), DerpError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.parent_tx
            .send(Cmd::Notify(type_.to_string(), data, ack_tx))
            .map_err(|_| DerpError::Transient("parent actor closed".into()))?;
        ack_rx.await.map_err(|_| DerpError::Transient("parent actor dropped ack".into()))?
    }

    async fn barrier_enter(&self, job_id: u64, ranks: Idset, seq: u32) -> Result<(), DerpError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let envelope = Arc::new(OneshotReply::new(done_tx));
        self.parent_tx
            .send(Cmd::BarrierEnter(envelope, job_id, ranks, seq, ack_tx))
            .map_err(|_| DerpError::Transient("parent actor closed".into()))?;
        ack_rx.await.map_err(|_| DerpError::Transient("parent actor dropped ack".into()))??;
        let frame = done_rx
            .await
            .map_err(|_| DerpError::Transient("parent actor dropped completion".into()))?;
        if frame.data.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            Ok(())
        } else {
            let message = frame
                .data
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("barrier cancelled upstream")
                .to_string();
            Err(DerpError::job_fatal(job_id, self.from_rank, 1, message))
        }
    }
}

/// A rank's handle to its parent's actor for the `hello` attach call
/// itself (spec.md §4.6's "external init lifecycle"): carries both the
/// parent's sender and the envelope the parent should store as this
/// child's `connect_envelope` — the same [`MeshReplyHandle`] the child
/// hands out for the parent's own downstream fan-out.
struct MeshHelloChannel {
    parent_tx: mpsc::UnboundedSender<Cmd>,
    own_rank: Rank,
    own_envelope: Arc<dyn ReplyHandle>,
}

#[async_trait]
impl HelloChannel for MeshHelloChannel {
    async fn hello(&self, rank: Rank) -> Result<(), DerpError> {
        debug_assert_eq!(rank, self.own_rank, "a rank only ever calls hello with its own rank");
        let (ack_tx, ack_rx) = oneshot::channel();
        self.parent_tx
            .send(Cmd::Connect(self.own_rank, self.own_envelope.clone(), ack_tx))
            .map_err(|_| DerpError::Transient("parent actor closed".into()))?;
        ack_rx.await.map_err(|_| DerpError::Transient("parent actor dropped ack".into()))?
    }
}

async fn run_rank(mut engine: ExecEngine, mut rx: mpsc::UnboundedReceiver<Cmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Cmd::Connect(rank, reply, ack) => {
                let _ = ack.send(engine.on_connect(rank, reply).await);
            }
            Cmd::Disconnect(rank) => engine.on_disconnect(rank),
            Cmd::HelloFrame(type_, ranks, data, ack) => {
                let result = engine.on_hello_frame(type_, ranks, data).await;
                if let Err(e) = &result {
                    warn!(error = %e, "hello frame handling failed");
                }
                let _ = ack.send(result);
            }
            Cmd::Notify(type_, data, ack) => {
                let _ = ack.send(engine.on_notify(&type_, data).await);
            }
            Cmd::BarrierEnter(envelope, job_id, ranks, seq, ack) => {
                let _ = ack.send(engine.on_barrier_enter(job_id, Some(envelope), ranks, seq).await);
            }
            Cmd::ShellEvent(job_id, event, ack) => {
                let _ = ack.send(engine.on_shell_event(job_id, event).await);
            }
            Cmd::RaiseException(job_id, severity, exception_type, note, ack) => {
                let _ = ack.send(engine.raise_exception(job_id, severity, exception_type, note).await);
            }
            Cmd::FlushHello(ack) => {
                let _ = ack.send(engine.flush_hello().await);
            }
            Cmd::ExecStart(req, client, ack) => {
                let _ = ack.send(engine.exec_start(req, client).await);
            }
            Cmd::ExecKill(req, ack) => {
                let _ = ack.send(engine.exec_kill(req).await);
            }
            Cmd::Ping(req, client, ack) => {
                let _ = ack.send(engine.ping(req, client).await);
            }
            Cmd::Inspect(job_id, tx) => {
                let _ = tx.send(engine.job(job_id).map(|j| (j.state.clone(), j.status)));
            }
        }
    }
}

/// A running in-process cluster: one actor task per rank, wired according
/// to `topology`. Every rank gets its own [`InMemoryShellSpawner`], so
/// `spawn_failing` lets a test arrange a spawn failure on a specific rank
/// before triggering it.
pub struct LocalMesh {
    senders: HashMap<Rank, mpsc::UnboundedSender<Cmd>>,
    shells: HashMap<Rank, Arc<InMemoryShellSpawner>>,
}

impl LocalMesh {
    /// Spawns one actor task per rank and, for every non-root rank, drives
    /// the real `HelloChannel::hello` attach call against its parent's
    /// actor (spec.md §4.6) rather than fabricating the parent's
    /// connection state directly.
    pub async fn spawn(topology: Topology) -> Self {
        let all = topology.subtree_of(topology.root_rank()).unwrap().clone();
        let mut senders = HashMap::new();
        let mut shells = HashMap::new();

        for rank in all.iter() {
            let (tx, _rx) = mpsc::unbounded_channel();
            senders.insert(rank, tx);
            shells.insert(rank, Arc::new(InMemoryShellSpawner::default()));
        }

        // Channels are created up front so every rank's upstream/peer
        // wiring can reference a sibling's sender before that sibling's
        // own task exists yet.
        let mut receivers = HashMap::new();
        for rank in all.iter() {
            let (tx, rx) = mpsc::unbounded_channel();
            *senders.get_mut(&rank).unwrap() = tx;
            receivers.insert(rank, rx);
        }

        for rank in all.iter() {
            let upstream: Option<Arc<dyn Upstream>> = topology.parent_of(rank).map(|parent| {
                Arc::new(MeshUpstream {
                    parent_tx: senders[&parent].clone(),
                    from_rank: rank,
                }) as Arc<dyn Upstream>
            });
            let peers = PeerTable::from_children(
                topology
                    .children_of(rank)
                    .iter()
                    .map(|&c| (c, topology.subtree_of(c).unwrap().clone())),
            );
            let ctx = Context::new(rank, topology.clone());
            let engine = ExecEngine::new(ctx, peers, upstream, shells[&rank].clone())
                .expect("module registration never conflicts on a fresh engine");
            let rx = receivers.remove(&rank).unwrap();
            tokio::spawn(run_rank(engine, rx));
        }

        let mesh = Self { senders, shells };
        for rank in all.iter() {
            if let Some(parent) = topology.parent_of(rank) {
                mesh.attach(parent, rank)
                    .await
                    .expect("initial hello attach never fails in-process");
            }
        }

        mesh
    }

    pub fn shell_spawner(&self, rank: Rank) -> Arc<InMemoryShellSpawner> {
        self.shells[&rank].clone()
    }

    async fn call<F>(&self, rank: Rank, build: F) -> Result<(), DerpError>
    where
        F: FnOnce(Ack) -> Cmd,
    {
        let tx = self.senders.get(&rank).ok_or(DerpError::UnknownPeer(rank))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(build(ack_tx))
            .map_err(|_| DerpError::Transient("rank actor closed".into()))?;
        ack_rx.await.map_err(|_| DerpError::Transient("rank actor dropped ack".into()))?
    }

    pub async fn exec_start(
        &self,
        rank: Rank,
        req: ExecStartRequest,
        client: Arc<dyn ReplyHandle>,
    ) -> Result<(), DerpError> {
        self.call(rank, |ack| Cmd::ExecStart(req, client, ack)).await
    }

    pub async fn exec_kill(&self, rank: Rank, req: ExecKillRequest) -> Result<(), DerpError> {
        self.call(rank, |ack| Cmd::ExecKill(req, ack)).await
    }

    pub async fn ping(&self, rank: Rank, req: PingRequest, client: Arc<dyn ReplyHandle>) -> Result<(), DerpError> {
        self.call(rank, |ack| Cmd::Ping(req, client, ack)).await
    }

    pub async fn flush_hello(&self, rank: Rank) -> Result<(), DerpError> {
        self.call(rank, Cmd::FlushHello).await
    }

    pub async fn shell_event(&self, rank: Rank, job_id: u64, event: ShellEvent) -> Result<(), DerpError> {
        self.call(rank, |ack| Cmd::ShellEvent(job_id, event, ack)).await
    }

    pub async fn raise_exception(
        &self,
        rank: Rank,
        job_id: u64,
        severity: u32,
        exception_type: impl Into<String>,
        note: impl Into<String>,
    ) -> Result<(), DerpError> {
        let exception_type = exception_type.into();
        let note = note.into();
        self.call(rank, |ack| Cmd::RaiseException(job_id, severity, exception_type, note, ack))
            .await
    }

    pub fn disconnect(&self, parent: Rank, child: Rank) {
        if let Some(tx) = self.senders.get(&parent) {
            let _ = tx.send(Cmd::Disconnect(child));
        }
    }

    /// Drive `child`'s real [`HelloChannel::hello`] attach call against
    /// `parent`'s actor. `LocalMesh::spawn` uses this for every non-root
    /// rank's initial attach; `reconnect` replays the same call after a
    /// disconnect, since re-attaching is how a real child would recover
    /// its `connect_envelope` on the parent.
    pub async fn attach(&self, parent: Rank, child: Rank) -> Result<(), DerpError> {
        let parent_tx = self.senders.get(&parent).ok_or(DerpError::UnknownPeer(parent))?.clone();
        let child_tx = self.senders.get(&child).ok_or(DerpError::UnknownPeer(child))?.clone();
        let hello = MeshHelloChannel {
            parent_tx,
            own_rank: child,
            own_envelope: Arc::new(MeshReplyHandle { tx: child_tx }),
        };
        hello.hello(child).await
    }

    pub async fn reconnect(&self, parent: Rank, child: Rank) -> Result<(), DerpError> {
        self.attach(parent, child).await
    }

    pub async fn job_status(&self, rank: Rank, job_id: u64) -> Option<(JobState, u32)> {
        let tx = self.senders.get(&rank)?;
        let (tx_reply, rx_reply) = oneshot::channel();
        tx.send(Cmd::Inspect(job_id, tx_reply)).ok()?;
        rx_reply.await.ok()?
    }
}
