//! End-to-end scenarios against an in-process cluster.

use std::sync::Arc;

use derp_core::idset::Idset;
use derp_core::job::JobState;
use derp_core::shell::ShellEvent;
use derp_core::testkit::{LocalMesh, RecordingReply};
use derp_core::topology::{Topology, TopologyNode};
use derp_core::wire::{ExecKillRequest, ExecStartRequest, PingRequest};

fn four_rank_topology() -> Topology {
    Topology::new(TopologyNode::with_children(
        0,
        vec![TopologyNode::leaf(1), TopologyNode::leaf(2), TopologyNode::leaf(3)],
    ))
}

#[tokio::test]
async fn single_node_run() {
    let topology = Topology::new(TopologyNode::leaf(0));
    let mesh = LocalMesh::spawn(topology).await;
    let client = Arc::new(RecordingReply::default());

    mesh.exec_start(
        0,
        ExecStartRequest {
            id: 1,
            userid: 1000,
            ranks: Idset::singleton(0),
        },
        client.clone(),
    )
    .await
    .unwrap();

    mesh.shell_event(0, 1, ShellEvent::Running).await.unwrap();
    assert_eq!(client.frame_count(), 1);
    assert_eq!(client.last_frame().unwrap().type_, "start");

    mesh.shell_event(0, 1, ShellEvent::Completed { status: 0 }).await.unwrap();
    let finish = client.last_frame().unwrap();
    assert_eq!(finish.type_, "finish");
    assert_eq!(finish.data["status"], 0);
}

#[tokio::test]
async fn four_rank_barrier_converges_at_lca_then_finishes() {
    let mesh = LocalMesh::spawn(four_rank_topology()).await;
    let client = Arc::new(RecordingReply::default());

    mesh.exec_start(
        0,
        ExecStartRequest {
            id: 1,
            userid: 1000,
            ranks: Idset::from_ranks([0, 1, 2, 3]),
        },
        client.clone(),
    )
    .await
    .unwrap();
    mesh.flush_hello(0).await.unwrap();

    // Each rank's local shell reports RUNNING; start converges bottom-up.
    for rank in [1, 2, 3, 0] {
        mesh.shell_event(rank, 1, ShellEvent::Running).await.unwrap();
    }
    assert_eq!(client.last_frame().unwrap().type_, "start");
    assert_eq!(mesh.job_status(0, 1).await, Some((JobState::Running, 0)));

    // All four shells enter the barrier concurrently: ranks 1-3's entries
    // block on their own `barrier_enter` upstream call until rank 0 (the
    // job's LCA) has seen every entry, so they must be driven concurrently
    // rather than one `.await` at a time.
    let (r0, r1, r2, r3) = tokio::join!(
        mesh.shell_event(0, 1, ShellEvent::BarrierEnter),
        mesh.shell_event(1, 1, ShellEvent::BarrierEnter),
        mesh.shell_event(2, 1, ShellEvent::BarrierEnter),
        mesh.shell_event(3, 1, ShellEvent::BarrierEnter),
    );
    r0.unwrap();
    r1.unwrap();
    r2.unwrap();
    r3.unwrap();

    for rank in [0, 1, 2, 3] {
        assert_eq!(mesh.job_status(rank, 1).await, Some((JobState::Running, 0)));
    }

    for rank in [1, 2, 3, 0] {
        mesh.shell_event(rank, 1, ShellEvent::Completed { status: 0 }).await.unwrap();
    }
    let finish = client.last_frame().unwrap();
    assert_eq!(finish.type_, "finish");
    assert_eq!(finish.data["status"], 0);
}

#[tokio::test]
async fn hello_attach_replays_queued_state_before_live_traffic() {
    // Drives the real `HelloChannel::hello` attach call (spec.md §4.6)
    // directly, rather than relying on `LocalMesh::spawn`'s own use of it:
    // disconnect a child, queue a `state-update` behind it, then attach
    // fresh via `mesh.attach` and check the queued frame lands before any
    // job event sent afterward.
    let mesh = LocalMesh::spawn(four_rank_topology()).await;
    let client = Arc::new(RecordingReply::default());

    mesh.disconnect(0, 3);
    mesh.exec_start(
        0,
        ExecStartRequest {
            id: 7,
            userid: 1000,
            ranks: Idset::from_ranks([0, 3]),
        },
        client.clone(),
    )
    .await
    .unwrap();
    mesh.flush_hello(0).await.unwrap();
    assert_eq!(mesh.job_status(3, 7).await, None, "rank 3 has not attached yet");

    mesh.attach(0, 3).await.unwrap();
    assert!(
        mesh.job_status(3, 7).await.is_some(),
        "hello attach must replay the queued state-update onto the reattached child"
    );
}

#[tokio::test]
async fn child_disconnect_mid_job_delays_start_until_reconnect() {
    let mesh = LocalMesh::spawn(four_rank_topology()).await;
    let client = Arc::new(RecordingReply::default());

    mesh.disconnect(0, 2);
    mesh.exec_start(
        0,
        ExecStartRequest {
            id: 1,
            userid: 1000,
            ranks: Idset::from_ranks([0, 1, 2, 3]),
        },
        client.clone(),
    )
    .await
    .unwrap();
    mesh.flush_hello(0).await.unwrap();

    // Rank 2 never saw the state-update; its job was never created there.
    assert_eq!(mesh.job_status(2, 1).await, None);

    for rank in [0, 1, 3] {
        mesh.shell_event(rank, 1, ShellEvent::Running).await.unwrap();
    }
    assert_eq!(client.frame_count(), 0, "start must not fire without rank 2");

    mesh.reconnect(0, 2).await.unwrap();
    assert!(mesh.job_status(2, 1).await.is_some(), "reconnect must replay the queued state-update");

    mesh.shell_event(2, 1, ShellEvent::Running).await.unwrap();
    assert_eq!(client.frame_count(), 1);
    assert_eq!(client.last_frame().unwrap().type_, "start");
}

#[tokio::test]
async fn exception_propagation_triggers_kill_fanout() {
    let mesh = LocalMesh::spawn(four_rank_topology()).await;
    let client = Arc::new(RecordingReply::default());

    mesh.exec_start(
        0,
        ExecStartRequest {
            id: 1,
            userid: 1000,
            ranks: Idset::from_ranks([0, 1, 2, 3]),
        },
        client.clone(),
    )
    .await
    .unwrap();
    mesh.flush_hello(0).await.unwrap();

    // Rank 3 raises a severity-0 exception; it notifies upstream through
    // its own chain of ranks (here directly to its parent, rank 0, since
    // rank 3 is a leaf).
    mesh.shell_event(3, 1, ShellEvent::Running).await.unwrap();
    mesh.raise_exception(3, 1, 0, "segv", "job raised SIGSEGV")
        .await
        .unwrap();

    let frame = client.last_frame().unwrap();
    assert_eq!(frame.type_, "exception");
    assert_eq!(frame.data["severity"], 0);

    // Severity 0 makes root fan out a SIGTERM kill to the whole job rank
    // set, including the rank that raised the exception.
    for rank in [0, 1, 2, 3] {
        let signals = mesh.shell_spawner(rank).shell(1).unwrap().signals();
        assert_eq!(signals.len(), 1, "rank {rank} should have received exactly one signal");
    }
}

#[tokio::test]
async fn kill_fanout_targets_only_named_ranks() {
    let mesh = LocalMesh::spawn(four_rank_topology()).await;
    let client = Arc::new(RecordingReply::default());

    mesh.exec_start(
        0,
        ExecStartRequest {
            id: 1,
            userid: 1000,
            ranks: Idset::from_ranks([0, 1, 2, 3]),
        },
        client.clone(),
    )
    .await
    .unwrap();
    mesh.flush_hello(0).await.unwrap();

    mesh.exec_kill(
        0,
        ExecKillRequest {
            id: 1,
            signal: 15,
            ranks: Idset::from_ranks([1, 3]),
        },
    )
    .await
    .unwrap();

    // Ranks 1 and 3 are in the target set and have a running local shell;
    // ranks 0 and 2 must not be signalled.
    for rank in [1, 3] {
        assert_eq!(mesh.shell_spawner(rank).shell(1).unwrap().signals().len(), 1);
    }
    for rank in [0, 2] {
        assert!(mesh.shell_spawner(rank).shell(1).unwrap().signals().is_empty());
    }
}

#[tokio::test]
async fn ping_reachability_responds_once_with_full_rank_set() {
    let mesh = LocalMesh::spawn(four_rank_topology()).await;
    let client = Arc::new(RecordingReply::default());

    mesh.ping(
        0,
        PingRequest {
            ranks: Idset::from_ranks([0, 1, 2, 3]),
            data: serde_json::Value::Null,
        },
        client.clone(),
    )
    .await
    .unwrap();

    assert_eq!(client.frame_count(), 1);
    let frame = client.last_frame().unwrap();
    assert_eq!(frame.type_, "ping");
    assert_eq!(frame.data["ranks"], "0-3");
}
