use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Policy;
use crate::lock::{new_lock_node, LockNode};
use crate::status::NodeStatus;

/// Name of the root node, and the path separator.
pub const SEPARATOR: &str = "/";

/// Arena index of an access node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NodeId(u64);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Links {
    children: HashMap<String, Arc<AccessNode>>,
    /// Walks currently passing through each child.
    accessors: HashMap<String, usize>,
}

/// One path segment in the tree, owning the lock node that guards it.
#[derive(Debug)]
pub struct AccessNode {
    id: NodeId,
    name: String,
    parent: Option<NodeId>,
    lock: Box<dyn LockNode>,
    links: Mutex<Links>,
    created_at: DateTime<Utc>,
}

impl AccessNode {
    fn new(id: NodeId, name: String, parent: Option<NodeId>, policy: Policy) -> Self {
        Self {
            id,
            name,
            parent,
            lock: new_lock_node(policy),
            links: Mutex::new(Links::default()),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn lock(&self) -> &dyn LockNode {
        self.lock.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Names of the live children, unordered.
    pub fn child_names(&self) -> Vec<String> {
        self.links.lock().children.keys().cloned().collect()
    }

    /// Number of in-flight walks through the child called `name`.
    pub fn accessors(&self, name: &str) -> usize {
        self.links.lock().accessors.get(name).copied().unwrap_or(0)
    }
}

/// Tree of access nodes, created lazily by walks and pruned when the last
/// walk through a node is released.
///
/// Each node's child links are guarded by that node's own mutex; there is no
/// tree-wide lock. A walk holds at most one node mutex at a time.
pub struct AccessTree {
    policy: Policy,
    root: Arc<AccessNode>,
    /// Live nodes by id, for upward traversal through parent indices.
    nodes: DashMap<NodeId, Arc<AccessNode>>,
    next_id: AtomicU64,
}

impl AccessTree {
    pub fn new(policy: Policy) -> Self {
        let root = Arc::new(AccessNode::new(
            NodeId::ROOT,
            SEPARATOR.to_string(),
            None,
            policy,
        ));
        let nodes = DashMap::new();
        nodes.insert(NodeId::ROOT, Arc::clone(&root));
        Self {
            policy,
            root,
            nodes,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn root(&self) -> &Arc<AccessNode> {
        &self.root
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<AccessNode>> {
        self.nodes.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Number of live nodes, root included.
    pub fn live_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Walk `segments` from the root, creating missing nodes and registering
    /// this walk with every parent on the way.
    ///
    /// Returns the chain root..leaf; the last element is the leaf. Every call
    /// must be paired with one [`release_access`](Self::release_access) on
    /// that leaf.
    pub fn get_access<S: AsRef<str>>(&self, segments: &[S]) -> Vec<Arc<AccessNode>> {
        let mut chain = Vec::with_capacity(segments.len() + 1);
        let mut current = Arc::clone(&self.root);
        for segment in segments {
            let segment = segment.as_ref();
            let child = {
                let mut links = current.links.lock();
                let child = match links.children.get(segment) {
                    Some(child) => Arc::clone(child),
                    None => {
                        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
                        let child = Arc::new(AccessNode::new(
                            id,
                            segment.to_string(),
                            Some(current.id),
                            self.policy,
                        ));
                        self.nodes.insert(id, Arc::clone(&child));
                        links
                            .children
                            .insert(segment.to_string(), Arc::clone(&child));
                        debug!("Created {} for {:?} under {}", id, segment, current.id);
                        child
                    }
                };
                *links.accessors.entry(segment.to_string()).or_insert(0) += 1;
                child
            };
            chain.push(std::mem::replace(&mut current, child));
        }
        chain.push(current);
        chain
    }

    /// Undo one [`get_access`](Self::get_access) that ended at `leaf`,
    /// pruning every node whose accessor count drops to zero.
    pub fn release_access(&self, leaf: &Arc<AccessNode>) {
        let mut node = Arc::clone(leaf);
        while let Some(parent_id) = node.parent {
            let parent = match self.get(parent_id) {
                Some(parent) => parent,
                None => {
                    warn!("Release walk from {} reached missing parent {}", node.id, parent_id);
                    return;
                }
            };
            {
                let mut links = parent.links.lock();
                let linked = links
                    .children
                    .get(&node.name)
                    .is_some_and(|child| child.id == node.id);
                if !linked {
                    warn!(
                        "Release walk found {} ({:?}) detached from {}",
                        node.id, node.name, parent.id
                    );
                    return;
                }
                let remaining = match links.accessors.get_mut(&node.name) {
                    Some(count) => {
                        *count -= 1;
                        *count
                    }
                    None => 0,
                };
                if remaining == 0 {
                    links.accessors.remove(&node.name);
                    links.children.remove(&node.name);
                    self.nodes.remove(&node.id);
                    debug!("Pruned {} ({:?}) from {}", node.id, node.name, parent.id);
                }
            }
            node = parent;
        }
    }

    /// Look up the node for `segments` without registering a walk.
    pub fn find<S: AsRef<str>>(&self, segments: &[S]) -> Option<Arc<AccessNode>> {
        let mut current = Arc::clone(&self.root);
        for segment in segments {
            let next = current.links.lock().children.get(segment.as_ref()).cloned()?;
            current = next;
        }
        Some(current)
    }

    /// Notify every live lock node's waiters.
    pub fn wake_all(&self) {
        for entry in self.nodes.iter() {
            entry.value().lock.wake_all();
        }
    }

    /// Depth-first report of every live node.
    pub fn snapshot(&self) -> Vec<NodeStatus> {
        let mut out = Vec::new();
        let mut stack = vec![(SEPARATOR.to_string(), Arc::clone(&self.root))];
        while let Some((path, node)) = stack.pop() {
            let mut children: Vec<(String, Arc<AccessNode>, usize)> = {
                let links = node.links.lock();
                links
                    .children
                    .iter()
                    .map(|(name, child)| {
                        let count = links.accessors.get(name).copied().unwrap_or(0);
                        (name.clone(), Arc::clone(child), count)
                    })
                    .collect()
            };
            children.sort_by(|a, b| b.0.cmp(&a.0));
            out.push(NodeStatus {
                path: path.clone(),
                id: node.id,
                accessors: children
                    .iter()
                    .map(|(name, _, count)| (name.clone(), *count))
                    .collect(),
                holders: node.lock.holders(),
                created_at: node.created_at.to_rfc3339(),
            });
            for (name, child, _) in children {
                let child_path = if path == SEPARATOR {
                    format!("{}{}", SEPARATOR, name)
                } else {
                    format!("{}{}{}", path, SEPARATOR, name)
                };
                stack.push((child_path, child));
            }
        }
        out
    }
}
