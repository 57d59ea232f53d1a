use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{assert_node_invariants, FileAttachment, ModelError, Node, NodeClassifier, NodeId, NodeKind};

/// In-memory node graph. Tracks nodes, parent/child edges and which nodes were
/// touched since the last commit.
///
/// Persistence is abstracted; callers can serialize/deserialize the store or
/// rehydrate it from a database of their choice using the public accessors.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct NodeStore {
    root: Option<NodeId>,
    nodes: HashMap<NodeId, Node>,
    children: HashMap<NodeId, BTreeSet<NodeId>>,
    parents: HashMap<NodeId, BTreeSet<NodeId>>,
    #[serde(skip)]
    pending: BTreeSet<NodeId>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeStoreError {
    #[error("node {0} not found")]
    NotFound(NodeId),
    #[error("no root node")]
    NoRoot,
    #[error("root node already exists: {0}")]
    RootExists(NodeId),
    #[error("node {0} cannot be its own child")]
    SelfLink(NodeId),
    #[error("root node {0} cannot be linked as a child")]
    RootAsChild(NodeId),
    #[error("linking {child} below {parent} would create a cycle")]
    Cycle { parent: NodeId, child: NodeId },
    #[error("file {path} already attached to node {owner}")]
    FileAlreadyAttached { path: String, owner: NodeId },
    #[error("node {node} has no file {path}")]
    FileNotFound { node: NodeId, path: String },
    #[error("edge {parent} -> {child} references a missing node")]
    DanglingEdge { parent: NodeId, child: NodeId },
    #[error("parent and child indexes disagree on edge {parent} -> {child}")]
    InconsistentEdge { parent: NodeId, child: NodeId },
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the root node. Every other node must be reachable from it.
    pub fn create_root(&mut self, name: impl Into<String>) -> Result<NodeId, NodeStoreError> {
        if let Some(root) = self.root {
            return Err(NodeStoreError::RootExists(root));
        }
        let node = Node::new("root", name);
        let id = node.id;
        self.insert_node(node)?;
        self.root = Some(id);
        Ok(id)
    }

    pub fn root_id(&self) -> Result<NodeId, NodeStoreError> {
        self.root.ok_or(NodeStoreError::NoRoot)
    }

    /// Insert a node after validating invariants. The node stays unreachable
    /// until it is linked below a reachable parent.
    pub fn insert_node(&mut self, node: Node) -> Result<NodeId, NodeStoreError> {
        assert_node_invariants(&node)?;
        self.check_file_ownership(node.id, &node.files)?;
        let id = node.id;
        self.nodes.insert(id, node);
        self.pending.insert(id);
        Ok(id)
    }

    pub fn create_node(
        &mut self,
        node_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<NodeId, NodeStoreError> {
        self.insert_node(Node::new(node_type, name))
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, NodeStoreError> {
        self.nodes.get(&id).ok_or(NodeStoreError::NotFound(id))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Mutate a node. The change is validated on a copy and only then applied,
    /// so a rejected update leaves the node untouched.
    pub fn update<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut Node) -> R,
    ) -> Result<R, NodeStoreError> {
        let mut draft = self.node(id)?.clone();
        let out = f(&mut draft);
        draft.id = id;
        assert_node_invariants(&draft)?;
        self.check_file_ownership(id, &draft.files)?;
        self.nodes.insert(id, draft);
        self.pending.insert(id);
        Ok(out)
    }

    /// Add a child edge. Returns `false` if the edge already existed.
    pub fn link(&mut self, parent: NodeId, child: NodeId) -> Result<bool, NodeStoreError> {
        self.node(parent)?;
        self.node(child)?;
        if parent == child {
            return Err(NodeStoreError::SelfLink(child));
        }
        if self.root == Some(child) {
            return Err(NodeStoreError::RootAsChild(child));
        }
        if self.is_descendant(child, parent) {
            return Err(NodeStoreError::Cycle { parent, child });
        }

        let inserted = self.children.entry(parent).or_default().insert(child);
        if inserted {
            self.parents.entry(child).or_default().insert(parent);
            self.pending.insert(parent);
            debug!(%parent, %child, "linked node");
        }
        Ok(inserted)
    }

    /// Remove a child edge. Returns `false` if there was nothing to remove.
    pub fn unlink(&mut self, parent: NodeId, child: NodeId) -> Result<bool, NodeStoreError> {
        self.node(parent)?;
        let removed = self
            .children
            .get_mut(&parent)
            .map(|set| set.remove(&child))
            .unwrap_or(false);
        if removed {
            if let Some(set) = self.parents.get_mut(&child) {
                set.remove(&parent);
            }
            self.pending.insert(parent);
            debug!(%parent, %child, "unlinked node");
        }
        Ok(removed)
    }

    /// Move `child` from `from` to `to` in one step.
    pub fn relink(
        &mut self,
        from: NodeId,
        to: NodeId,
        child: NodeId,
    ) -> Result<(), NodeStoreError> {
        self.link(to, child)?;
        if from != to {
            self.unlink(from, child)?;
        }
        Ok(())
    }

    /// Child ids in edge order (by id).
    pub fn child_ids(&self, id: NodeId) -> Vec<NodeId> {
        self.children
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn parent_ids(&self, id: NodeId) -> Vec<NodeId> {
        self.parents
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Children ordered by position, then name.
    pub fn children(&self, id: NodeId) -> Vec<&Node> {
        let mut nodes = self.resolve(self.children.get(&id));
        sort_by_orderpos(&mut nodes, false);
        nodes
    }

    pub fn parents(&self, id: NodeId) -> Vec<&Node> {
        self.resolve(self.parents.get(&id))
    }

    pub fn container_children(&self, id: NodeId, types: &dyn NodeClassifier) -> Vec<&Node> {
        self.children_of_kind(id, NodeKind::Container, types)
    }

    pub fn content_children(&self, id: NodeId, types: &dyn NodeClassifier) -> Vec<&Node> {
        self.children_of_kind(id, NodeKind::Content, types)
    }

    pub fn child_by_name(&self, id: NodeId, name: &str) -> Option<&Node> {
        self.children(id).into_iter().find(|n| n.name == name)
    }

    /// True if `descendant` can be reached from `ancestor` through child edges.
    pub fn is_descendant(&self, ancestor: NodeId, descendant: NodeId) -> bool {
        let mut stack = vec![ancestor];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == descendant {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.iter().copied());
            }
        }
        false
    }

    pub fn add_file(&mut self, id: NodeId, file: FileAttachment) -> Result<(), NodeStoreError> {
        self.update(id, |node| {
            node.files.retain(|f| f.path != file.path);
            node.files.push(file);
        })
    }

    pub fn remove_file(&mut self, id: NodeId, path: &str) -> Result<FileAttachment, NodeStoreError> {
        let position = self
            .node(id)?
            .files
            .iter()
            .position(|f| f.path == path)
            .ok_or_else(|| NodeStoreError::FileNotFound {
                node: id,
                path: path.to_string(),
            })?;
        self.update(id, |node| node.files.remove(position))
    }

    pub fn replace_files(
        &mut self,
        id: NodeId,
        files: Vec<FileAttachment>,
    ) -> Result<(), NodeStoreError> {
        self.update(id, |node| node.files = files)
    }

    /// The node owning the attachment at `path`, if any.
    pub fn file_owner(&self, path: &str) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| n.files.iter().any(|f| f.path == path))
            .map(|n| n.id)
    }

    /// Root plus every node reachable from it through child edges.
    pub fn reachable_ids(&self) -> HashSet<NodeId> {
        let mut reachable = HashSet::new();
        let Some(root) = self.root else {
            return reachable;
        };
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            if !reachable.insert(current) {
                continue;
            }
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.iter().copied());
            }
        }
        reachable
    }

    pub fn unreachable_ids(&self) -> Vec<NodeId> {
        let reachable = self.reachable_ids();
        let mut ids: Vec<NodeId> = self
            .nodes
            .keys()
            .filter(|id| !reachable.contains(id))
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// Delete every node not reachable from the root, together with its edges
    /// and files. Returns the purged ids.
    pub fn purge_unreachable(&mut self) -> Vec<NodeId> {
        let purged = self.unreachable_ids();
        for id in &purged {
            self.nodes.remove(id);
            self.pending.remove(id);
            for child in self.children.remove(id).unwrap_or_default() {
                if let Some(set) = self.parents.get_mut(&child) {
                    set.remove(id);
                }
            }
            for parent in self.parents.remove(id).unwrap_or_default() {
                if let Some(set) = self.children.get_mut(&parent) {
                    set.remove(id);
                }
            }
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "purged unreachable nodes");
        }
        purged
    }

    pub fn mark_pending(&mut self, id: NodeId) {
        if self.nodes.contains_key(&id) {
            self.pending.insert(id);
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &NodeId> {
        self.pending.iter()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn take_pending(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    /// Validate graph invariants:
    ///
    /// - Every edge references existing nodes.
    /// - Parent and child indexes mirror each other.
    /// - No node is its own descendant.
    pub fn assert_graph_invariants(&self) -> Result<(), NodeStoreError> {
        for (parent, children) in &self.children {
            for child in children {
                if !self.nodes.contains_key(parent) || !self.nodes.contains_key(child) {
                    return Err(NodeStoreError::DanglingEdge {
                        parent: *parent,
                        child: *child,
                    });
                }
                let mirrored = self
                    .parents
                    .get(child)
                    .map(|p| p.contains(parent))
                    .unwrap_or(false);
                if !mirrored {
                    return Err(NodeStoreError::InconsistentEdge {
                        parent: *parent,
                        child: *child,
                    });
                }
            }
        }
        for (child, parents) in &self.parents {
            for parent in parents {
                let mirrored = self
                    .children
                    .get(parent)
                    .map(|c| c.contains(child))
                    .unwrap_or(false);
                if !mirrored {
                    return Err(NodeStoreError::InconsistentEdge {
                        parent: *parent,
                        child: *child,
                    });
                }
            }
        }
        for (parent, children) in &self.children {
            for child in children {
                if self.is_descendant(*child, *parent) {
                    return Err(NodeStoreError::Cycle {
                        parent: *parent,
                        child: *child,
                    });
                }
            }
        }
        for node in self.nodes.values() {
            assert_node_invariants(node)?;
        }
        Ok(())
    }

    fn resolve(&self, ids: Option<&BTreeSet<NodeId>>) -> Vec<&Node> {
        ids.map(|set| set.iter().filter_map(|id| self.nodes.get(id)).collect())
            .unwrap_or_default()
    }

    fn children_of_kind(
        &self,
        id: NodeId,
        kind: NodeKind,
        types: &dyn NodeClassifier,
    ) -> Vec<&Node> {
        self.children(id)
            .into_iter()
            .filter(|n| n.kind(types) == kind)
            .collect()
    }

    fn check_file_ownership(
        &self,
        id: NodeId,
        files: &[FileAttachment],
    ) -> Result<(), NodeStoreError> {
        for file in files {
            if let Some(owner) = self.file_owner(&file.path) {
                if owner != id {
                    return Err(NodeStoreError::FileAlreadyAttached {
                        path: file.path.clone(),
                        owner,
                    });
                }
            }
        }
        Ok(())
    }
}

pub fn sort_by_orderpos(nodes: &mut [&Node], descending: bool) {
    nodes.sort_by(|a, b| {
        let ord = a.orderpos.cmp(&b.orderpos).then_with(|| a.name.cmp(&b.name));
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
}

pub fn sort_by_name(nodes: &mut [&Node], descending: bool) {
    nodes.sort_by(|a, b| {
        let ord = a.name.cmp(&b.name);
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
}

/// Sort by a list of fields. A leading `-` sorts that field descending.
/// `name` and `orderpos` address node fields, anything else an attribute
/// (missing attributes sort as empty strings).
pub fn sort_by_fields(nodes: &mut [&Node], fields: &[&str]) {
    nodes.sort_by(|a, b| {
        for field in fields {
            let (name, descending) = match field.strip_prefix('-') {
                Some(stripped) => (stripped, true),
                None => (*field, false),
            };
            let ord = match name {
                "orderpos" => a.orderpos.cmp(&b.orderpos),
                "name" => a.name.cmp(&b.name),
                attr => a.get_or(attr, "").cmp(b.get_or(attr, "")),
            };
            let ord = if descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}
