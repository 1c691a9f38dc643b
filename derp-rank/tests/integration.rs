//! Exercises the same wiring `main.rs` does for a standalone (single-rank,
//! root-only) deployment: construct the engine the way `parse_topology`
//! would for an unset `DERP_TOPOLOGY`, then drive it through a single-node
//! job start and finish.

use std::sync::Arc;

use derp_core::engine::ExecEngine;
use derp_core::idset::Idset;
use derp_core::peer::PeerTable;
use derp_core::shell::ShellEvent;
use derp_core::testkit::{InMemoryShellSpawner, RecordingReply};
use derp_core::topology::{Context, Topology, TopologyNode};
use derp_core::wire::ExecStartRequest;

#[tokio::test]
async fn standalone_single_rank_start_and_finish() {
    let topology = Topology::new(TopologyNode::leaf(0));
    let ctx = Context::new(0, topology);
    let peers = PeerTable::from_children([]);
    let shells = Arc::new(InMemoryShellSpawner::default());
    let mut engine = ExecEngine::new(ctx, peers, None, shells).unwrap();

    let client = Arc::new(RecordingReply::default());
    engine
        .exec_start(
            ExecStartRequest {
                id: 1,
                userid: 1000,
                ranks: Idset::singleton(0),
            },
            client.clone(),
        )
        .await
        .unwrap();

    engine.on_shell_event(1, ShellEvent::Running).await.unwrap();
    assert_eq!(client.frame_count(), 1);
    assert_eq!(client.last_frame().unwrap().type_, "start");

    engine
        .on_shell_event(1, ShellEvent::Completed { status: 0 })
        .await
        .unwrap();
    assert_eq!(client.frame_count(), 2);
    let finish = client.last_frame().unwrap();
    assert_eq!(finish.type_, "finish");
    assert_eq!(finish.data["status"], 0);
}
