//! The known-node registry.
//!
//! A set of peer URLs with last-contact timestamps, persisted as JSON next
//! to the data directory. "Recent" peers answered within the last seven
//! days and get most of the gossip; "zero" peers were never contacted and
//! get a trickle so they can graduate. Peers idle for ninety days are
//! pruned, and the registry never grows past [`MAX_NODES`] entries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, warn};

/// Upper bound on registry size.
pub const MAX_NODES: usize = 100;

/// Seconds within which a peer counts as recent: seven days.
const RECENT_WINDOW_SECS: u32 = 7 * 24 * 60 * 60;

/// Seconds of silence after which a contacted peer is pruned: ninety days.
const PRUNE_WINDOW_SECS: u32 = 90 * 24 * 60 * 60;

pub struct NodeRegistry {
    path: PathBuf,
    /// url → last contact timestamp; 0 means never contacted.
    nodes: Mutex<HashMap<String, u32>>,
}

fn normalize(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

impl NodeRegistry {
    /// Loads the registry file, seeding it with `bootstrap` when empty.
    pub fn load(path: PathBuf, bootstrap: Option<&str>) -> NodeRegistry {
        let mut nodes: HashMap<String, u32> = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        if nodes.is_empty() {
            if let Some(bootstrap) = bootstrap {
                nodes.insert(normalize(bootstrap), 0);
            }
        }
        NodeRegistry {
            path,
            nodes: Mutex::new(nodes),
        }
    }

    fn sync_to_disk(&self, nodes: &HashMap<String, u32>) {
        match serde_json::to_vec(nodes) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    warn!(path = %self.path.display(), %e, "could not persist the node registry");
                }
            }
            Err(e) => warn!(%e, "could not serialize the node registry"),
        }
    }

    /// Registers a peer URL. New peers start as zero nodes. No-op when the
    /// registry is full or the peer is known.
    pub fn add_node(&self, url: &str) -> bool {
        let url = normalize(url);
        if url.is_empty() {
            return false;
        }
        let mut nodes = self.nodes.lock().expect("registry lock is never poisoned");
        if nodes.contains_key(&url) || nodes.len() >= MAX_NODES {
            return false;
        }
        debug!(%url, "registered node");
        nodes.insert(url, 0);
        self.sync_to_disk(&nodes);
        true
    }

    pub fn contains(&self, url: &str) -> bool {
        self.nodes
            .lock()
            .expect("registry lock is never poisoned")
            .contains_key(&normalize(url))
    }

    /// Records a successful exchange with a peer, registering it if needed.
    pub fn update_last_contact(&self, url: &str) {
        let url = normalize(url);
        let mut nodes = self.nodes.lock().expect("registry lock is never poisoned");
        if !nodes.contains_key(&url) && nodes.len() >= MAX_NODES {
            return;
        }
        nodes.insert(url, denaro_chain::timestamp());
        self.sync_to_disk(&nodes);
    }

    /// Drops a peer that returned garbage. Timeouts do not remove.
    pub fn remove_node(&self, url: &str) {
        let mut nodes = self.nodes.lock().expect("registry lock is never poisoned");
        if nodes.remove(&normalize(url)).is_some() {
            debug!(%url, "removed node");
            self.sync_to_disk(&nodes);
        }
    }

    /// Peers contacted within the recent window.
    pub fn get_recent_nodes(&self) -> Vec<String> {
        let now = denaro_chain::timestamp();
        self.nodes
            .lock()
            .expect("registry lock is never poisoned")
            .iter()
            .filter(|(_, &last)| last != 0 && now.saturating_sub(last) < RECENT_WINDOW_SECS)
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Peers that never answered anything yet.
    pub fn get_zero_nodes(&self) -> Vec<String> {
        self.nodes
            .lock()
            .expect("registry lock is never poisoned")
            .iter()
            .filter(|(_, &last)| last == 0)
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn get_nodes(&self) -> Vec<String> {
        self.nodes
            .lock()
            .expect("registry lock is never poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Removes peers whose last contact is older than the prune window.
    pub fn prune(&self) {
        let now = denaro_chain::timestamp();
        let mut nodes = self.nodes.lock().expect("registry lock is never poisoned");
        let before = nodes.len();
        nodes.retain(|_, &mut last| last == 0 || now.saturating_sub(last) < PRUNE_WINDOW_SECS);
        if nodes.len() != before {
            debug!(removed = before - nodes.len(), "pruned idle nodes");
            self.sync_to_disk(&nodes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn registry(dir: &TempDir) -> NodeRegistry {
        NodeRegistry::load(dir.path().join("nodes.json"), None)
    }

    #[test]
    fn new_nodes_start_as_zero_nodes() {
        let dir = TempDir::new("registry").unwrap();
        let registry = registry(&dir);
        assert!(registry.add_node("http://peer.example:3006/"));
        assert!(!registry.add_node("http://peer.example:3006"));

        assert_eq!(registry.get_zero_nodes(), vec!["http://peer.example:3006"]);
        assert!(registry.get_recent_nodes().is_empty());

        registry.update_last_contact("http://peer.example:3006");
        assert!(registry.get_zero_nodes().is_empty());
        assert_eq!(
            registry.get_recent_nodes(),
            vec!["http://peer.example:3006"]
        );
    }

    #[test]
    fn the_registry_is_capped() {
        let dir = TempDir::new("registry").unwrap();
        let registry = registry(&dir);
        for i in 0..MAX_NODES {
            assert!(registry.add_node(&format!("http://peer{}.example", i)));
        }
        assert!(!registry.add_node("http://one-too-many.example"));
        assert_eq!(registry.get_nodes().len(), MAX_NODES);
    }

    #[test]
    fn registry_survives_a_reload() {
        let dir = TempDir::new("registry").unwrap();
        {
            let registry = registry(&dir);
            registry.add_node("http://peer.example");
            registry.update_last_contact("http://peer.example");
        }
        let reloaded = registry(&dir);
        assert!(reloaded.contains("http://peer.example"));
        assert_eq!(reloaded.get_recent_nodes().len(), 1);
    }

    #[test]
    fn garbage_peers_are_removed() {
        let dir = TempDir::new("registry").unwrap();
        let registry = registry(&dir);
        registry.add_node("http://peer.example");
        registry.remove_node("http://peer.example/");
        assert!(!registry.contains("http://peer.example"));
    }
}
