//! The shared membership roster: a JSON file mapping node id to address,
//! read-modify-written whole on join and on graceful shutdown.
//!
//! Grounded on `original_source/**/main.go`'s `readNodesList` /
//! `json.Marshal(nodesList)` round trip. The protocol core never re-reads
//! this file during an experiment (spec.md §9): it is initialization-time
//! input and shutdown-time bookkeeping only.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::warn;

use crate::BASE_PORT;

/// `id -> addr` roster, kept sorted for deterministic iteration (and a
/// readable `Debug`/log rendering, mirroring the `%v` dumps in the source).
#[derive(Debug, Default, Clone)]
pub struct Membership {
    peers: BTreeMap<u32, SocketAddr>,
}

impl Membership {
    pub fn addr_for(&self, id: u32) -> Option<SocketAddr> {
        self.peers.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn insert(&mut self, id: u32, addr: SocketAddr) {
        self.peers.insert(id, addr);
    }

    pub fn remove(&mut self, id: u32) {
        self.peers.remove(&id);
    }

    /// Every peer except `excluding`, in id order — the shape SPQ and Voting
    /// broadcast to.
    pub fn peers_excluding(&self, excluding: u32) -> Vec<(u32, SocketAddr)> {
        self.peers
            .iter()
            .filter(|(&id, _)| id != excluding)
            .map(|(&id, &addr)| (id, addr))
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.peers.keys().copied()
    }

    /// Address this node should bind to once it is assigned `id`.
    pub fn addr_for_new_id(id: u32) -> SocketAddr {
        format!("127.0.0.1:{}", BASE_PORT + id as u16)
            .parse()
            .expect("constructed loopback address is always valid")
    }
}

/// Every algorithm's bootstrap is node 0, always reachable here — used by
/// completing nodes to post NOTIFY-FINISHED (spec.md §4.1/§4.2/§4.3).
pub fn bootstrap_addr() -> SocketAddr {
    Membership::addr_for_new_id(0)
}

/// Default location of the roster file, matching `nodes-list.json` in
/// `original_source`.
pub fn default_path() -> PathBuf {
    PathBuf::from("nodes-list.json")
}

/// Load the roster. A missing or unreadable file is logged and treated as an
/// empty membership (spec.md §7: bootstrap errors are logged, not fatal —
/// this is the behavior that lets the genuinely-first node start cleanly).
pub async fn load(path: impl AsRef<Path>) -> Membership {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Err(err) => {
            warn!("could not open {}: {err}", path.display());
            Membership::default()
        }
        Ok(contents) => match serde_json::from_str::<BTreeMap<u32, SocketAddr>>(&contents) {
            Ok(peers) => Membership { peers },
            Err(err) => {
                warn!("could not parse {}: {err}", path.display());
                Membership::default()
            }
        },
    }
}

/// Overwrite the roster file whole with the current membership.
pub async fn store(path: impl AsRef<Path>, membership: &Membership) -> anyhow::Result<()> {
    let json = serde_json::to_string(&membership.peers).context("encode membership roster")?;
    tokio::fs::write(path.as_ref(), json)
        .await
        .with_context(|| format!("write {}", path.as_ref().display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_excluding_drops_self() {
        let mut m = Membership::default();
        m.insert(0, "127.0.0.1:8000".parse().unwrap());
        m.insert(1, "127.0.0.1:8001".parse().unwrap());
        m.insert(2, "127.0.0.1:8002".parse().unwrap());
        let peers = m.peers_excluding(1);
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|(id, _)| *id != 1));
    }

    #[tokio::test]
    async fn load_missing_file_is_empty_not_fatal() {
        let m = load("/nonexistent/path/does-not-exist.json").await;
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn store_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("lamport-mutex-lab-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("nodes-list.json");

        let mut m = Membership::default();
        m.insert(0, "127.0.0.1:8000".parse().unwrap());
        m.insert(1, "127.0.0.1:8001".parse().unwrap());
        store(&path, &m).await.unwrap();

        let loaded = load(&path).await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.addr_for(1), m.addr_for(1));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
