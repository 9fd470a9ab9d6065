//! Consistent hash ring.
//!
//! Maps keys onto node addresses through virtual nodes, so removing a
//! member relocates only the keys it owned instead of reshuffling the
//! whole space. The queue uses it to decide which node serves each
//! partition.

use std::collections::BTreeMap;

/// 128-bit ring position of a key.
pub(crate) fn hash_position(key: &str) -> u128 {
    u128::from_be_bytes(md5::compute(key.as_bytes()).0)
}

/// Hash ring over node addresses. Each node occupies `virtual_nodes`
/// positions; a lookup walks clockwise to the first occupied position.
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    virtual_nodes: u32,
    ring: BTreeMap<u128, String>,
}

impl ConsistentHashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes,
            ring: BTreeMap::new(),
        }
    }

    pub fn with_nodes<I, S>(virtual_nodes: u32, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = Self::new(virtual_nodes);
        for node in nodes {
            ring.add_node(node.as_ref());
        }
        ring
    }

    pub fn add_node(&mut self, node: &str) {
        for replica in 0..self.virtual_nodes {
            let position = hash_position(&format!("{node}:{replica}"));
            self.ring.insert(position, node.to_string());
        }
    }

    pub fn remove_node(&mut self, node: &str) {
        self.ring.retain(|_, occupant| occupant != node);
    }

    /// The node a key maps to, or `None` while the ring is empty.
    pub fn node_for(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let position = hash_position(key);
        self.ring
            .range(position..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
