//! The exec engine: drives the per-job state machine on a single rank,
//! spawns local job shells, and reacts to upstream/downstream events.
//!
//! `ExecEngine` is the single per-rank facade other modules wire handlers
//! through: it owns the topology context, peer table, router, hello
//! responder, and job shell spawner, and the transport layer delegates to
//! it for every inbound request and event.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::barrier::BarrierStatus;
use crate::error::DerpError;
use crate::hello::HelloResponse;
use crate::idset::{Idset, Rank};
use crate::job::{JobRecord, JobState};
use crate::peer::PeerTable;
use crate::router::Router;
use crate::shell::{ShellEnv, ShellEvent, ShellSpawner, Signal, SIGTERM};
use crate::topology::Context;
use crate::transport::{ReplyFrame, ReplyHandle, Upstream};
use crate::wire::{ExecKillRequest, ExecStartFrame, ExecStartRequest, PingRequest, PingResponse};

/// Transient per-ping-round reachability tracker. Not a job: never enters
/// the job table, never persisted, dropped once `replied == targeted`.
struct PingRound {
    targeted: Idset,
    replied: Idset,
    /// Present only on the rank that originated the request, i.e. root.
    client: Option<Arc<dyn ReplyHandle>>,
}

pub struct ExecEngine {
    ctx: Context,
    peers: PeerTable,
    router: Router,
    responder: crate::hello::HelloResponder,
    /// `None` on root — root has no parent to notify.
    upstream: Option<Arc<dyn Upstream>>,
    shells: Arc<dyn ShellSpawner>,
    jobs: HashMap<u64, JobRecord>,
    pings: HashMap<u64, PingRound>,
    next_ping_id: u64,
}

impl ExecEngine {
    /// Construct the engine and register this module's closed set of
    /// action/notify types.
    pub fn new(
        ctx: Context,
        peers: PeerTable,
        upstream: Option<Arc<dyn Upstream>>,
        shells: Arc<dyn ShellSpawner>,
    ) -> Result<Self, DerpError> {
        assert_eq!(
            upstream.is_none(),
            ctx.is_root(),
            "root must have no upstream handle and non-root ranks must have one"
        );
        let mut router = Router::new();
        router.register_action("state-update")?;
        router.register_action("kill")?;
        router.register_action("ping")?;
        router.register_notify("start")?;
        router.register_notify("finish")?;
        router.register_notify("barrier-enter")?;
        router.register_notify("release")?;
        router.register_notify("exception")?;
        router.register_notify("ping-reply")?;

        Ok(Self {
            ctx,
            peers,
            router,
            responder: crate::hello::HelloResponder::new(),
            upstream,
            shells,
            jobs: HashMap::new(),
            pings: HashMap::new(),
            next_ping_id: 0,
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn own_rank(&self) -> Rank {
        self.ctx.rank
    }

    pub fn job(&self, id: u64) -> Option<&JobRecord> {
        self.jobs.get(&id)
    }

    // ───────────────────────── connection lifecycle ─────────────────────

    pub async fn on_connect(&mut self, rank: Rank, envelope: Arc<dyn ReplyHandle>) -> Result<(), DerpError> {
        self.peers.connect(rank, envelope).await
    }

    pub fn on_disconnect(&mut self, rank: Rank) {
        self.peers.disconnect(rank);
    }

    // ───────────────────────── hello coalescing ──────────────────────────

    /// Push an `add` record for `job_id`/`userid`/`ranks` into the hello
    /// responder. Returns `true` the first time since the last flush —
    /// the caller (the reactor loop) should arm the coalescing timer in
    /// that case.
    fn push_job_added(&mut self, job_id: u64, userid: u32, ranks: Idset) -> bool {
        self.responder.push(job_id, userid, ranks)
    }

    /// Pop the accumulated `state-update` (if any) and fan it out. Only
    /// root ever has something to pop, since only root pushes into the
    /// hello responder.
    pub async fn flush_hello(&mut self) -> Result<(), DerpError> {
        let Some(hresp) = self.responder.pop() else {
            return Ok(());
        };
        self.fan_and_maybe_invoke(hresp).await
    }

    async fn fan_and_maybe_invoke(&mut self, hresp: Arc<HelloResponse>) -> Result<(), DerpError> {
        let fanout = self.peers.forward_response(&hresp).await;
        let local = if self.ctx.is_root() && self.router.has_action(&hresp.type_) {
            self.invoke_action(&hresp.type_, &hresp.idset, &hresp.data).await
        } else {
            Ok(())
        };
        fanout?;
        local
    }

    // ───────────────────────── router forward/receive ────────────────────

    /// Fan `(type_, ranks, data)` downstream and, only on root, invoke the
    /// locally-registered action too.
    pub async fn forward(&mut self, type_: &str, ranks: Idset, data: Value) -> Result<(), DerpError> {
        let hresp = HelloResponse::generic(type_, ranks, data);
        self.fan_and_maybe_invoke(hresp).await
    }

    /// A non-root rank's receipt of a frame streamed from its parent's
    /// hello channel: forward it further downstream, then invoke the local
    /// action handler.
    pub async fn on_hello_frame(&mut self, type_: String, ranks: Idset, data: Value) -> Result<(), DerpError> {
        debug_assert!(!self.ctx.is_root(), "root never receives hello frames");
        let hresp = HelloResponse::generic(type_.clone(), ranks.clone(), data.clone());
        let fanout = self.peers.forward_response(&hresp).await;

        let local = if self.router.has_action(&type_) {
            self.invoke_action(&type_, &ranks, &data).await
        } else {
            warn!(type_ = %type_, "no action handler registered; dropping frame");
            Ok(())
        };
        fanout?;
        local
    }

    async fn invoke_action(&mut self, type_: &str, ranks: &Idset, data: &Value) -> Result<(), DerpError> {
        match type_ {
            "state-update" => self.handle_state_update(data).await,
            "kill" => self.handle_kill_action(ranks, data).await,
            "ping" => self.handle_ping_action(ranks, data).await,
            other => Err(DerpError::Protocol(format!("unknown action type '{other}'"))),
        }
    }

    // ───────────────────────── action: state-update ─────────────────────

    async fn handle_state_update(&mut self, data: &Value) -> Result<(), DerpError> {
        let jobs = data
            .get("jobs")
            .and_then(Value::as_array)
            .ok_or_else(|| DerpError::Protocol("state-update missing 'jobs' array".into()))?;

        for entry in jobs {
            let id = entry
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| DerpError::Protocol("job entry missing 'id'".into()))?;
            let userid = entry
                .get("userid")
                .and_then(Value::as_u64)
                .ok_or_else(|| DerpError::Protocol("job entry missing 'userid'".into()))? as u32;
            let ranks = entry
                .get("ranks")
                .and_then(Value::as_str)
                .ok_or_else(|| DerpError::Protocol("job entry missing 'ranks'".into()))
                .and_then(Idset::decode)?;

            if self.jobs.contains_key(&id) {
                // Replayed add (reconnect, duplicate dispatch) — idempotent no-op.
                continue;
            }

            let own_rank = self.own_rank();
            let subtree = self.ctx.subtree().clone();
            let mut job = JobRecord::new(id, userid, ranks.clone(), own_rank, &subtree);
            info!(job = id, rank = own_rank, state = ?job.state, "job created");

            let mut finish_converged = false;
            if job.is_local_target(own_rank) {
                finish_converged = self.spawn_local_shell(&mut job, ranks.len() > 1).await;
            }
            self.jobs.insert(id, job);
            if finish_converged {
                self.check_finish_converged(id).await?;
            }
        }
        Ok(())
    }

    /// Returns `true` if the local spawn failed *and* that failure alone
    /// converged this rank's `finish_ranks` (the caller must then run
    /// [`Self::check_finish_converged`] — it does not happen implicitly).
    async fn spawn_local_shell(&mut self, job: &mut JobRecord, with_barrier_channel: bool) -> bool {
        let env = ShellEnv {
            job_id: job.id,
            rank: self.own_rank(),
            vars: Vec::new(),
        };
        match self.shells.spawn(env, with_barrier_channel).await {
            Ok(shell) => {
                job.local_shell = Some(shell);
                false
            }
            Err(e) => {
                warn!(job = job.id, error = %e, "local spawn failed");
                job.state = JobState::Finished;
                let status = e.spawn_failure_status();
                job.record_finish(&Idset::singleton(self.own_rank()), status)
            }
        }
    }

    // ───────────────────────── action: kill ──────────────────────────────

    async fn handle_kill_action(&mut self, ranks: &Idset, data: &Value) -> Result<(), DerpError> {
        let own_rank = self.own_rank();
        if !ranks.contains(own_rank) {
            return Ok(());
        }
        let id = data
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| DerpError::Protocol("kill missing 'id'".into()))?;
        let signal = data.get("signal").and_then(Value::as_i64).unwrap_or(SIGTERM as i64) as Signal;

        let job = self
            .jobs
            .get(&id)
            .ok_or_else(|| DerpError::NotFound(format!("job {id}")))?;
        if let Some(shell) = &job.local_shell {
            shell.signal(signal).await?;
        }
        Ok(())
    }

    // ───────────────────────── action: ping ──────────────────────────────

    async fn handle_ping_action(&mut self, ranks: &Idset, data: &Value) -> Result<(), DerpError> {
        let ping_id = data
            .get("ping_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| DerpError::Protocol("ping missing 'ping_id'".into()))?;
        let own_rank = self.own_rank();
        let targeted = ranks.intersect(self.ctx.subtree());

        let round = self.pings.entry(ping_id).or_insert_with(|| PingRound {
            targeted: targeted.clone(),
            replied: Idset::new(),
            client: None,
        });
        if targeted.contains(own_rank) {
            round.replied.add(own_rank);
        }
        self.check_ping_converged(ping_id).await
    }

    async fn check_ping_converged(&mut self, ping_id: u64) -> Result<(), DerpError> {
        let Some(round) = self.pings.get(&ping_id) else {
            return Ok(());
        };
        if round.targeted.is_empty() || round.replied != round.targeted {
            return Ok(());
        }
        let replied = round.replied.clone();
        if self.ctx.is_root() {
            if let Some(round) = self.pings.remove(&ping_id) {
                if let Some(client) = round.client {
                    let value = serde_json::to_value(PingResponse { ranks: replied })
                        .expect("PingResponse always serializes");
                    client.respond(ReplyFrame::new("ping", value)).await?;
                }
            }
        } else {
            self.pings.remove(&ping_id);
            self.notify_upstream(
                "ping-reply",
                json!({ "ping_id": ping_id, "ranks": replied.encode() }),
            )
            .await?;
        }
        Ok(())
    }

    // ───────────────────────── notify receipt (upstream) ─────────────────

    /// A child reported `type_` upstream via a one-way notify; react and
    /// possibly re-notify our own parent, or — on root — respond to the
    /// originating client request. `barrier-enter` is handled
    /// separately by [`Self::on_barrier_enter`]: unlike the others it blocks
    /// on a reply, so the
    /// transport layer routes it there directly rather than through this
    /// fire-and-forget dispatch.
    pub async fn on_notify(&mut self, type_: &str, data: Value) -> Result<(), DerpError> {
        match type_ {
            "start" => self.handle_start_notify(data).await,
            "finish" => self.handle_finish_notify(data).await,
            "release" => self.handle_release_notify(data).await,
            "exception" => self.handle_exception_notify(data).await,
            "ping-reply" => self.handle_ping_reply_notify(data).await,
            "barrier-enter" => Err(DerpError::Protocol(
                "barrier-enter must be routed through on_barrier_enter".into(),
            )),
            other => Err(DerpError::Protocol(format!("unknown notify type '{other}'"))),
        }
    }

    fn parse_id_and_ranks(data: &Value) -> Result<(u64, Idset), DerpError> {
        let id = data
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| DerpError::Protocol("notify missing 'id'".into()))?;
        let ranks = data
            .get("ranks")
            .and_then(Value::as_str)
            .ok_or_else(|| DerpError::Protocol("notify missing 'ranks'".into()))
            .and_then(Idset::decode)?;
        Ok((id, ranks))
    }

    async fn handle_start_notify(&mut self, data: Value) -> Result<(), DerpError> {
        let (id, ranks) = Self::parse_id_and_ranks(&data)?;
        let converged = self
            .jobs
            .get_mut(&id)
            .map(|job| job.record_start(&ranks))
            .unwrap_or(false);
        if converged {
            self.check_start_converged(id).await
        } else {
            Ok(())
        }
    }

    async fn handle_finish_notify(&mut self, data: Value) -> Result<(), DerpError> {
        let (id, ranks) = Self::parse_id_and_ranks(&data)?;
        let status = data.get("status").and_then(Value::as_u64).unwrap_or(0) as u32;
        let converged = self
            .jobs
            .get_mut(&id)
            .map(|job| job.record_finish(&ranks, status))
            .unwrap_or(false);
        if converged {
            self.check_finish_converged(id).await
        } else {
            Ok(())
        }
    }

    async fn handle_release_notify(&mut self, _data: Value) -> Result<(), DerpError> {
        // `release` is accepted as a registered notify type but its
        // lifecycle is an explicit open question this crate resolves as
        // "do not guess" rather than silently inventing semantics — see
        // DESIGN.md.
        Err(DerpError::Unsupported("release".into()))
    }

    async fn handle_exception_notify(&mut self, data: Value) -> Result<(), DerpError> {
        let id = data
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| DerpError::Protocol("exception missing 'id'".into()))?;
        let severity = data.get("severity").and_then(Value::as_u64).unwrap_or(1) as u32;

        if self.ctx.is_root() {
            let Some(job) = self.jobs.get(&id) else {
                return Err(DerpError::NotFound(format!("job {id}")));
            };
            let exception_type = data
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let note = data.get("note").and_then(Value::as_str).unwrap_or("").to_string();
            if let Some(client) = job.request.clone() {
                client
                    .respond(
                        ExecStartFrame::Exception {
                            id,
                            severity,
                            exception_type,
                            note,
                        }
                        .into_reply(),
                    )
                    .await?;
            }
            if severity == 0 {
                let ranks = job.ranks.clone();
                self.forward("kill", ranks, json!({ "id": id, "signal": SIGTERM })).await?;
            }
            Ok(())
        } else {
            // Relay unchanged toward our own parent; only root acts on it.
            self.notify_upstream("exception", data).await
        }
    }

    async fn handle_ping_reply_notify(&mut self, data: Value) -> Result<(), DerpError> {
        let ping_id = data
            .get("ping_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| DerpError::Protocol("ping-reply missing 'ping_id'".into()))?;
        let ranks = data
            .get("ranks")
            .and_then(Value::as_str)
            .ok_or_else(|| DerpError::Protocol("ping-reply missing 'ranks'".into()))
            .and_then(Idset::decode)?;
        if let Some(round) = self.pings.get_mut(&ping_id) {
            round.replied.union_with(&ranks);
        }
        self.check_ping_converged(ping_id).await
    }

    // ───────────────────────── convergence predicates ────────────────────

    /// Emit the "start converged" reaction. Only called right after
    /// `JobRecord::record_start` itself reports the transition, so the
    /// equality this name implies is established by the caller, not
    /// re-checked here — re-checking would fire a second time on a
    /// replayed `start` notify for a job that already converged.
    async fn check_start_converged(&mut self, job_id: u64) -> Result<(), DerpError> {
        let Some(job) = self.jobs.get(&job_id) else {
            return Ok(());
        };
        if self.ctx.is_root() {
            if let Some(client) = job.request.clone() {
                client
                    .respond(ExecStartFrame::Start { id: job_id }.into_reply())
                    .await?;
            }
            Ok(())
        } else {
            let ranks = job.start_ranks.clone();
            self.notify_upstream("start", json!({ "id": job_id, "ranks": ranks.encode() })).await
        }
    }

    /// Emit the "finish converged" reaction. Same one-shot contract as
    /// [`Self::check_start_converged`]: call only when `record_finish` just
    /// reported the transition.
    async fn check_finish_converged(&mut self, job_id: u64) -> Result<(), DerpError> {
        let Some(job) = self.jobs.get(&job_id) else {
            return Ok(());
        };
        let status = job.status;
        if self.ctx.is_root() {
            if let Some(client) = job.request.clone() {
                client
                    .respond(ExecStartFrame::Finish { id: job_id, status }.into_reply())
                    .await?;
            }
            Ok(())
        } else {
            let ranks = job.finish_ranks.clone();
            self.notify_upstream(
                "finish",
                json!({ "id": job_id, "ranks": ranks.encode(), "status": status }),
            )
            .await
        }
    }

    async fn check_barrier(&mut self, job_id: u64) -> Result<(), DerpError> {
        let Some(job) = self.jobs.get(&job_id) else {
            return Ok(());
        };
        if job.subtree_ranks.is_empty() {
            return Ok(());
        }
        let own_rank = self.own_rank();
        let is_lca = job.is_lca(self.ctx.topology.lca(&job.ranks), own_rank);
        match job.barrier.check(&job.subtree_ranks, is_lca) {
            BarrierStatus::Waiting => Ok(()),
            BarrierStatus::CompleteHere => self.complete_barrier(job_id, Ok(())).await,
            BarrierStatus::NotifyUpstream => {
                let seq = job.barrier.sequence();
                let ranks = job.subtree_ranks.clone();
                let upstream = self
                    .upstream
                    .clone()
                    .expect("non-root rank always has an upstream handle");
                let outcome = upstream.barrier_enter(job_id, ranks, seq).await.map_err(|e| e.to_string());
                self.complete_barrier(job_id, outcome).await
            }
        }
    }

    async fn complete_barrier(&mut self, job_id: u64, outcome: Result<(), String>) -> Result<(), DerpError> {
        let ok = outcome.is_ok();
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| DerpError::NotFound(format!("job {job_id}")))?;
        job.barrier.complete(outcome).await?;
        if ok {
            if let Some(shell) = &job.local_shell {
                shell.release_barrier(Ok(())).await?;
            }
            job.state = JobState::Running;
        }
        Ok(())
    }

    /// The local shell `enter\n`'d its barrier channel, or a direct child
    /// reported entering via its own blocking `barrier_enter` call.
    /// `envelope` is the handle the transport
    /// layer hands us for this specific call — the route back to whichever
    /// child is blocked waiting on it — and is `None` for the local-shell
    /// path, which has nothing waiting on a reply.
    pub async fn on_barrier_enter(
        &mut self,
        job_id: u64,
        envelope: Option<Arc<dyn ReplyHandle>>,
        ranks: Idset,
        seq: u32,
    ) -> Result<(), DerpError> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| DerpError::NotFound(format!("job {job_id}")))?;
        job.state = JobState::Barrier(seq);
        match envelope {
            Some(envelope) => job.barrier.enter(envelope, ranks, seq)?,
            None => {
                for rank in ranks.iter() {
                    job.barrier.enter_local(rank);
                }
            }
        }
        self.check_barrier(job_id).await
    }

    /// Deliver a local job shell event.
    pub async fn on_shell_event(&mut self, job_id: u64, event: ShellEvent) -> Result<(), DerpError> {
        match event {
            ShellEvent::Running => {
                let own_rank = self.own_rank();
                let converged = if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.state = JobState::Running;
                    job.record_start(&Idset::singleton(own_rank))
                } else {
                    false
                };
                if converged {
                    self.check_start_converged(job_id).await
                } else {
                    Ok(())
                }
            }
            ShellEvent::BarrierEnter => {
                let own_rank = self.own_rank();
                self.on_barrier_enter(job_id, None, Idset::singleton(own_rank), 0).await
            }
            ShellEvent::Completed { status } | ShellEvent::Failed { status } => {
                let own_rank = self.own_rank();
                let converged = if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.state = JobState::Finished;
                    job.record_finish(&Idset::singleton(own_rank), status)
                } else {
                    false
                };
                if converged {
                    self.check_finish_converged(job_id).await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// A rank originates an `exception` itself rather than relaying one
    /// reported by a child. Shares [`Self::handle_exception_notify`]'s
    /// root-vs-relay logic since both cases just differ in where the
    /// `{id, severity, type, note}` payload first appears.
    pub async fn raise_exception(
        &mut self,
        job_id: u64,
        severity: u32,
        exception_type: impl Into<String>,
        note: impl Into<String>,
    ) -> Result<(), DerpError> {
        let data = json!({
            "id": job_id,
            "severity": severity,
            "type": exception_type.into(),
            "note": note.into(),
        });
        self.handle_exception_notify(data).await
    }

    // ───────────────────────── upstream notify helper ────────────────────

    async fn notify_upstream(&self, type_: &str, data: Value) -> Result<(), DerpError> {
        match &self.upstream {
            Some(up) => up.notify(type_, data).await,
            None => {
                debug!(type_, "root has no upstream to notify; dropping");
                Ok(())
            }
        }
    }

    // ───────────────────────── root-only client entry points ─────────────

    /// `exec.start`. Root only.
    pub async fn exec_start(
        &mut self,
        req: ExecStartRequest,
        client: Arc<dyn ReplyHandle>,
    ) -> Result<(), DerpError> {
        assert!(self.ctx.is_root(), "exec.start only valid on root");
        if self.jobs.contains_key(&req.id) {
            return Err(DerpError::Exists(format!("job {}", req.id)));
        }
        let own_rank = self.own_rank();
        let subtree = self.ctx.subtree().clone();
        let mut job = JobRecord::new(req.id, req.userid, req.ranks.clone(), own_rank, &subtree);
        job.request = Some(client);

        let mut finish_converged = false;
        if job.is_local_target(own_rank) {
            finish_converged = self.spawn_local_shell(&mut job, req.ranks.len() > 1).await;
        }
        self.jobs.insert(req.id, job);
        self.push_job_added(req.id, req.userid, req.ranks);
        if finish_converged {
            self.check_finish_converged(req.id).await
        } else {
            Ok(())
        }
    }

    /// `exec.kill`. Root only.
    pub async fn exec_kill(&mut self, req: ExecKillRequest) -> Result<(), DerpError> {
        assert!(self.ctx.is_root(), "exec.kill only valid on root");
        self.forward(
            "kill",
            req.ranks,
            json!({ "id": req.id, "signal": req.signal }),
        )
        .await
    }

    /// `ping`. Root only.
    pub async fn ping(&mut self, req: PingRequest, client: Arc<dyn ReplyHandle>) -> Result<(), DerpError> {
        assert!(self.ctx.is_root(), "ping only valid on root");
        let ping_id = self.next_ping_id;
        self.next_ping_id += 1;
        self.pings.insert(
            ping_id,
            PingRound {
                targeted: req.ranks.intersect(self.ctx.subtree()),
                replied: Idset::new(),
                client: Some(client),
            },
        );
        self.forward("ping", req.ranks, json!({ "ping_id": ping_id, "data": req.data }))
            .await
    }
}
