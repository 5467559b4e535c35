//! Consistent-hash ring over cluster node addresses.
//!
//! Each node maps to a fixed number of virtual points; a tenant's owner is
//! the successor of its hash on the ring. Membership changes move only the
//! tenants between a departed node and its neighbors.
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

const VNODES_PER_NODE: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: BTreeMap<u64, String>,
    nodes: BTreeSet<String>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: &str) -> bool {
        if !self.nodes.insert(node.to_string()) {
            return false;
        }
        for replica in 0..VNODES_PER_NODE {
            self.points
                .insert(point_hash(node, replica), node.to_string());
        }
        true
    }

    pub fn remove(&mut self, node: &str) -> bool {
        if !self.nodes.remove(node) {
            return false;
        }
        for replica in 0..VNODES_PER_NODE {
            self.points.remove(&point_hash(node, replica));
        }
        true
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node owning `key`: the first ring point at or after the key's
    /// hash, wrapping at the top.
    pub fn owner(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = key_hash(key);
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, node)| node.as_str())
    }
}

fn key_hash(key: &str) -> u64 {
    digest_prefix(key.as_bytes())
}

fn point_hash(node: &str, replica: usize) -> u64 {
    digest_prefix(format!("{node}#{replica}").as_bytes())
}

fn digest_prefix(input: &[u8]) -> u64 {
    let digest = Sha256::digest(input);
    u64::from_be_bytes(digest[..8].try_into().expect("8-byte prefix"))
}
