//! Gossip fan-out.
//!
//! Accepted transactions, accepted blocks, and newly learned peers are
//! propagated to a random subset of the registry: up to
//! [`PROPAGATE_RECENT`] recent peers plus [`PROPAGATE_ZERO`] never-seen
//! ones. Requests run concurrently; a peer that answers garbage is
//! removed, one that merely times out is only left un-promoted.

use futures::future::join_all;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::client::{NodeInterface, PeerError};
use crate::registry::NodeRegistry;

/// Recent peers contacted per gossip round.
pub const PROPAGATE_RECENT: usize = 7;
/// Zero (never-contacted) peers contacted per gossip round.
pub const PROPAGATE_ZERO: usize = 3;

fn pick(mut nodes: Vec<String>, count: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    nodes.shuffle(&mut rng);
    nodes.truncate(count);
    nodes
}

/// Sends `body` to `path` on a random peer subset, skipping ourselves and
/// the peer the payload came from.
pub async fn propagate(
    registry: &NodeRegistry,
    self_url: Option<&str>,
    ignore_url: Option<&str>,
    path: &str,
    body: serde_json::Value,
) {
    let mut targets = pick(registry.get_recent_nodes(), PROPAGATE_RECENT);
    targets.extend(pick(registry.get_zero_nodes(), PROPAGATE_ZERO));
    targets.retain(|url| {
        Some(url.as_str()) != self_url.map(|u| u.trim_end_matches('/'))
            && Some(url.as_str()) != ignore_url.map(|u| u.trim_end_matches('/'))
    });
    if targets.is_empty() {
        return;
    }
    trace!(path, peers = targets.len(), "propagating");
    metrics::counter!("network.gossip.rounds", 1);

    let requests = targets.iter().map(|url| {
        let node = NodeInterface::new(url, self_url.map(str::to_string));
        let body = body.clone();
        let path = path.to_string();
        async move { (url.clone(), node.post(&path, body).await) }
    });
    for (url, result) in join_all(requests).await {
        match result {
            Ok(_) => registry.update_last_contact(&url),
            Err(PeerError::Malformed(e)) => {
                debug!(%url, %e, "peer sent garbage, dropping it");
                registry.remove_node(&url);
            }
            Err(e) => debug!(%url, %e, "gossip target unreachable"),
        }
    }
}
