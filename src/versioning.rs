use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::node_store::{NodeStore, NodeStoreError};
use crate::{FileAttachment, Node, NodeId, TransactionId, UserId, VersionId};

/// Retention policy for the automatic version window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRetention {
    /// Keep at most this many versions per node (latest and tagged versions
    /// are always kept).
    pub max_versions: usize,
    /// Optionally drop versions older than this age (relative to now).
    pub max_age: Option<Duration>,
}

/// Unit of commit. Meta carries `tag`, `comment` and free-form keys such as
/// `workflow_step`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub timestamp: DateTime<Utc>,
    pub user: Option<UserId>,
    pub meta: BTreeMap<String, String>,
}

impl Transaction {
    pub fn new(user: Option<UserId>) -> Self {
        Self {
            id: Ulid::new(),
            timestamp: Utc::now(),
            user,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.meta.get("tag").map(String::as_str)
    }

    pub fn comment(&self) -> Option<&str> {
        self.meta.get("comment").map(String::as_str)
    }
}

/// Captured state of a node at commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_type: String,
    pub schema: Option<String>,
    pub name: String,
    pub orderpos: i64,
    pub attrs: BTreeMap<String, String>,
    pub system_attrs: BTreeMap<String, String>,
    pub children: Vec<NodeId>,
    pub files: Vec<FileAttachment>,
}

impl NodeState {
    pub fn capture(store: &NodeStore, node: &Node) -> Self {
        Self {
            node_type: node.node_type.clone(),
            schema: node.schema.clone(),
            name: node.name.clone(),
            orderpos: node.orderpos,
            attrs: node.attrs.clone(),
            system_attrs: node.system_attrs.clone(),
            children: store.child_ids(node.id),
            files: node.files.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueChange {
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Field-level diff against the previous version. Map fields are rendered as
/// JSON objects, lists as comma-separated values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset(BTreeMap<String, ValueChange>);

impl Changeset {
    pub fn between(old: Option<&NodeState>, new: &NodeState) -> Self {
        let mut changes = BTreeMap::new();
        let mut record = |key: &str, old: Option<String>, new: Option<String>| {
            if old != new {
                changes.insert(key.to_string(), ValueChange { old, new });
            }
        };

        record("name", old.map(|o| o.name.clone()), Some(new.name.clone()));
        record(
            "orderpos",
            old.map(|o| o.orderpos.to_string()),
            Some(new.orderpos.to_string()),
        );
        record("schema", old.and_then(|o| o.schema.clone()), new.schema.clone());
        record(
            "attrs",
            old.map(|o| render_map(&o.attrs)),
            Some(render_map(&new.attrs)),
        );
        record(
            "system_attrs",
            old.map(|o| render_map(&o.system_attrs)),
            Some(render_map(&new.system_attrs)),
        );
        record(
            "files",
            old.map(|o| render_files(&o.files)),
            Some(render_files(&new.files)),
        );
        record(
            "children",
            old.map(|o| render_ids(&o.children)),
            Some(render_ids(&new.children)),
        );

        Self(changes)
    }

    pub fn get(&self, key: &str) -> Option<&ValueChange> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

fn render_map(map: &BTreeMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_default()
}

fn render_files(files: &[FileAttachment]) -> String {
    files
        .iter()
        .map(|f| f.path.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_ids(ids: &[NodeId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Immutable snapshot of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub node_id: NodeId,
    pub transaction_id: TransactionId,
    /// 1-based, monotonic per node; survives pruning.
    pub number: u64,
    pub timestamp: DateTime<Utc>,
    pub user: Option<UserId>,
    pub tag: Option<String>,
    pub comment: Option<String>,
    pub state: NodeState,
    pub changeset: Changeset,
}

impl Version {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.state.attrs.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.attrs.contains_key(key)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersioningError {
    #[error("version {0} not found")]
    MissingVersion(VersionId),
    #[error("node {0} has no versions")]
    NoVersions(NodeId),
    #[error("Refusing to create a tagged version: the store has uncommitted changes")]
    DirtyStore,
    #[error("node {0} did not change, no version created")]
    NoChanges(NodeId),
    #[error("node {0} already carries the highest numeric tag")]
    TagOverflow(NodeId),
    #[error(transparent)]
    Store(#[from] NodeStoreError),
}

/// Version history of all nodes plus the transactions that produced it.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct VersionStore {
    versions: HashMap<NodeId, Vec<Version>>,
    transactions: Vec<Transaction>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot every pending node whose state differs from its latest
    /// version. Returns the ids of the versions created.
    pub fn commit(
        &mut self,
        store: &mut NodeStore,
        tx: Transaction,
    ) -> Result<Vec<VersionId>, VersioningError> {
        let mut created = Vec::new();
        for node_id in store.take_pending() {
            let Some(node) = store.get(&node_id) else {
                continue;
            };
            let state = NodeState::capture(store, node);
            let history = self.versions.entry(node_id).or_default();
            let previous = history.last();
            if previous.map(|v| v.state == state).unwrap_or(false) {
                continue;
            }

            let version = Version {
                id: Ulid::new(),
                node_id,
                transaction_id: tx.id,
                number: previous.map(|v| v.number + 1).unwrap_or(1),
                timestamp: tx.timestamp,
                user: tx.user,
                tag: None,
                comment: tx.comment().map(str::to_string),
                changeset: Changeset::between(previous.map(|v| &v.state), &state),
                state,
            };
            debug!(node = %node_id, number = version.number, "new version");
            created.push(version.id);
            history.push(version);
        }

        if !created.is_empty() {
            info!(tx = %tx.id, versions = created.len(), "committed transaction");
            self.transactions.push(tx);
        }
        Ok(created)
    }

    /// Versions ordered oldest first.
    pub fn versions(&self, node: NodeId) -> &[Version] {
        self.versions.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Version at `index` in the node's history, oldest first.
    pub fn version(&self, node: NodeId, index: usize) -> Option<&Version> {
        self.versions(node).get(index)
    }

    pub fn latest(&self, node: NodeId) -> Option<&Version> {
        self.versions(node).last()
    }

    pub fn find(&self, id: VersionId) -> Option<&Version> {
        self.versions
            .values()
            .flat_map(|history| history.iter())
            .find(|v| v.id == id)
    }

    pub fn transaction(&self, id: TransactionId) -> Option<&Transaction> {
        self.transactions.iter().find(|t| t.id == id)
    }

    pub fn is_active_version(&self, version: &Version) -> bool {
        self.latest(version.node_id)
            .map(|latest| latest.id == version.id)
            .unwrap_or(false)
    }

    /// The live node a version belongs to.
    pub fn active_node<'s>(&self, store: &'s NodeStore, version: &Version) -> Option<&'s Node> {
        store.get(&version.node_id)
    }

    /// Tagged versions, oldest first.
    pub fn tagged_versions(&self, node: NodeId) -> Vec<&Version> {
        self.versions(node)
            .iter()
            .filter(|v| v.tag.is_some())
            .collect()
    }

    /// Next numeric tag. Untagged history counts as tag 1.
    pub fn next_tag(&self, node: NodeId) -> Result<String, VersioningError> {
        let max = self
            .tagged_versions(node)
            .iter()
            .filter_map(|v| v.tag.as_deref()?.parse::<u64>().ok())
            .max()
            .unwrap_or(1);
        max.checked_add(1)
            .map(|t| t.to_string())
            .ok_or(VersioningError::TagOverflow(node))
    }

    pub fn set_tag(&mut self, version_id: VersionId, tag: impl Into<String>) -> Result<(), VersioningError> {
        let version = self
            .versions
            .values_mut()
            .flat_map(|history| history.iter_mut())
            .find(|v| v.id == version_id)
            .ok_or(VersioningError::MissingVersion(version_id))?;
        version.tag = Some(tag.into());
        Ok(())
    }

    /// Apply `f` to the node and commit the result as a tagged version.
    ///
    /// Refuses to run while the store holds uncommitted changes, so the new
    /// version contains nothing but this edit. `updatetime` is stamped.
    pub fn new_tagged_version<R>(
        &mut self,
        store: &mut NodeStore,
        node: NodeId,
        tag: Option<String>,
        comment: Option<String>,
        user: Option<UserId>,
        f: impl FnOnce(&mut Node) -> R,
    ) -> Result<(R, VersionId), VersioningError> {
        if store.has_pending() {
            return Err(VersioningError::DirtyStore);
        }
        let tag = match tag {
            Some(tag) => tag,
            None => self.next_tag(node)?,
        };
        let now = Utc::now();

        let out = store.update(node, |n| {
            let out = f(n);
            n.set("updatetime", now.to_rfc3339_opts(SecondsFormat::Micros, true));
            out
        })?;

        let mut tx = Transaction::new(user).with_meta("tag", tag.clone());
        tx.timestamp = now;
        if let Some(comment) = comment {
            tx = tx.with_meta("comment", comment);
        }
        let tx_id = tx.id;
        self.commit(store, tx)?;

        let version = self
            .versions
            .get_mut(&node)
            .and_then(|history| history.last_mut())
            .filter(|v| v.transaction_id == tx_id)
            .ok_or(VersioningError::NoChanges(node))?;
        version.tag = Some(tag);
        Ok((out, version.id))
    }

    /// Restore a node to the state of `version_id`. The restore itself becomes
    /// a new version at the next commit; history is preserved.
    ///
    /// With `include_children`, remembered children that no longer exist are
    /// skipped. A child that can no longer be linked below the node (it became
    /// an ancestor, or is the root) rejects the whole revert before anything
    /// changes.
    pub fn revert(
        &self,
        store: &mut NodeStore,
        version_id: VersionId,
        include_children: bool,
    ) -> Result<(), VersioningError> {
        let version = self
            .find(version_id)
            .ok_or(VersioningError::MissingVersion(version_id))?;
        let node_id = version.node_id;
        let state = version.state.clone();
        store.node(node_id)?;

        let mut restored = Vec::new();
        if include_children {
            let root = store.root_id().ok();
            for &child in &state.children {
                if !store.contains(&child) {
                    warn!(node = %node_id, %child, "child of reverted version no longer exists");
                    continue;
                }
                if root == Some(child) {
                    return Err(NodeStoreError::RootAsChild(child).into());
                }
                if child == node_id || store.is_descendant(child, node_id) {
                    return Err(NodeStoreError::Cycle {
                        parent: node_id,
                        child,
                    }
                    .into());
                }
                restored.push(child);
            }
        }

        store.update(node_id, |node| {
            node.schema = state.schema.clone();
            node.name = state.name.clone();
            node.orderpos = state.orderpos;
            node.attrs = state.attrs.clone();
            node.system_attrs = state.system_attrs.clone();
            node.files = state.files.clone();
        })?;

        if include_children {
            for child in store.child_ids(node_id) {
                if !restored.contains(&child) {
                    store.unlink(node_id, child)?;
                }
            }
            for child in restored {
                store.link(node_id, child)?;
            }
        }
        info!(node = %node_id, version = %version_id, "reverted node");
        Ok(())
    }

    /// Apply retention: keeps the latest and all tagged versions, then prunes
    /// by age and count.
    pub fn apply_retention(
        &mut self,
        node: NodeId,
        policy: &VersionRetention,
        now: DateTime<Utc>,
    ) -> Result<usize, VersioningError> {
        let history = self
            .versions
            .get_mut(&node)
            .ok_or(VersioningError::NoVersions(node))?;
        let latest_id = history.last().map(|v| v.id);
        let protected = |v: &Version| Some(v.id) == latest_id || v.tag.is_some();
        let before = history.len();

        if let Some(max_age) = policy.max_age.and_then(|a| chrono::Duration::from_std(a).ok()) {
            let cutoff = now - max_age;
            history.retain(|v| protected(v) || v.timestamp >= cutoff);
        }

        // History is ordered by time, so the first unprotected entries are the oldest.
        while history.len() > policy.max_versions {
            match history.iter().position(|v| !protected(v)) {
                Some(oldest) => {
                    history.remove(oldest);
                }
                None => break,
            }
        }

        Ok(before - history.len())
    }

    /// Drop the history of a purged node.
    pub fn forget_node(&mut self, node: NodeId) -> usize {
        self.versions.remove(&node).map(|h| h.len()).unwrap_or(0)
    }
}
