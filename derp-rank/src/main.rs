use std::sync::Arc;
use std::time::Duration;

use derp_core::engine::ExecEngine;
use derp_core::peer::PeerTable;
use derp_core::testkit::InMemoryShellSpawner;
use derp_core::topology::{Context, Topology, TopologyNode};
use tracing_subscriber::EnvFilter;

/// Per-rank process entry point. Wires a [`derp_core::engine::ExecEngine`]
/// to a topology, a job-shell backend, and the hello-coalescing reactor
/// loop. Wiring the engine to the cluster's actual broker transport — the
/// inbound `state-update`/`notify`/`exec.*` RPC surface — is an external
/// collaborator this crate does not implement; without it configured this
/// binary runs standalone, falling back to an in-memory shell the way a
/// store-backed service falls back to an in-memory store when no external
/// backend is configured.
///
/// Single-threaded cooperative per rank, driven by a reactor event loop:
/// this is why the runtime below is `current_thread` rather than
/// multi-thread, so two callbacks never run concurrently against the same
/// engine.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let rank = parse_rank();
    let topology = parse_topology(rank)?;

    tracing::info!(rank, root = topology.is_root(rank), "starting derp-rank");

    let ctx = Context::new(rank, topology.clone());
    let peers = PeerTable::from_children(
        topology
            .children_of(rank)
            .iter()
            .map(|&c| (c, topology.subtree_of(c).unwrap().clone())),
    );
    let shells = Arc::new(InMemoryShellSpawner::default());

    // Non-root ranks need a live `Upstream` handle into the broker
    // transport to report `start`/`finish`/`barrier-enter`/... — that
    // transport integration is not implemented in this binary, so only
    // standalone (single-rank, root) topologies run today.
    if !topology.is_root(rank) {
        return Err("multi-rank operation requires a broker transport, which is not wired into this binary yet".into());
    }

    let mut engine = ExecEngine::new(ctx, peers, None, shells)?;

    let mut ticker = tokio::time::interval(Duration::from_millis(15));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = engine.flush_hello().await {
                    tracing::warn!(error = %e, "hello flush failed");
                }
            }
        }
    }

    Ok(())
}

fn parse_rank() -> derp_core::idset::Rank {
    std::env::var("DERP_RANK")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Builds this process's view of the topology from `DERP_TOPOLOGY`
/// (`parent:child1,child2;parent:child3`), or a single standalone root node
/// if unset.
fn parse_topology(own_rank: derp_core::idset::Rank) -> Result<Topology, Box<dyn std::error::Error>> {
    let Some(spec) = std::env::var("DERP_TOPOLOGY").ok() else {
        return Ok(Topology::new(TopologyNode::leaf(own_rank)));
    };

    let mut children_of: std::collections::HashMap<derp_core::idset::Rank, Vec<derp_core::idset::Rank>> =
        std::collections::HashMap::new();
    let mut all_ranks = std::collections::HashSet::new();
    let mut has_parent = std::collections::HashSet::new();

    for entry in spec.split(';').filter(|s| !s.trim().is_empty()) {
        let (parent, children) = entry
            .split_once(':')
            .ok_or("DERP_TOPOLOGY entry missing ':'")?;
        let parent: derp_core::idset::Rank = parent.trim().parse()?;
        all_ranks.insert(parent);
        let mut kids = Vec::new();
        for child in children.split(',').filter(|s| !s.trim().is_empty()) {
            let child: derp_core::idset::Rank = child.trim().parse()?;
            all_ranks.insert(child);
            has_parent.insert(child);
            kids.push(child);
        }
        children_of.entry(parent).or_default().extend(kids);
    }

    let root_rank = all_ranks
        .iter()
        .copied()
        .find(|r| !has_parent.contains(r))
        .ok_or("DERP_TOPOLOGY has no rank without a parent")?;

    fn build(rank: derp_core::idset::Rank, children_of: &std::collections::HashMap<derp_core::idset::Rank, Vec<derp_core::idset::Rank>>) -> TopologyNode {
        let children = children_of
            .get(&rank)
            .map(|kids| kids.iter().map(|&c| build(c, children_of)).collect())
            .unwrap_or_default();
        TopologyNode::with_children(rank, children)
    }

    let root = build(root_rank, &children_of);
    let topology = Topology::new(root);
    if !topology.contains_rank(own_rank) {
        return Err(format!("rank {own_rank} is not part of DERP_TOPOLOGY").into());
    }
    Ok(topology)
}
