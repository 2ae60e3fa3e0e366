use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::Policy;
use crate::lock::HolderInfo;
use crate::state::access_tree::NodeId;

/// One live access node as seen by a status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub path: String,
    pub id: NodeId,
    /// In-flight walks per child name.
    pub accessors: BTreeMap<String, usize>,
    pub holders: Vec<HolderInfo>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub policy: Policy,
    pub timeout_ms: u64,
    pub live_nodes: usize,
    pub nodes: Vec<NodeStatus>,
}

impl ManagerStatus {
    /// Total holds across all nodes, counting each owner/mode pair once.
    pub fn held_locks(&self) -> usize {
        self.nodes.iter().map(|n| n.holders.len()).sum()
    }
}
