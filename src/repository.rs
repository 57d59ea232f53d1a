//! Repository facade.
//!
//! Owns the node graph and its companions and keeps them consistent: content
//! type hooks fire on edits, commits apply retention, purges clean versions
//! and access data alongside the nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::access::{AccessContext, AccessControl, AccessRule, RuleType};
use crate::attachment_monitor::{AttachmentChangeKind, AttachmentEvent, AttachmentIndex};
use crate::config::RepositoryConfig;
use crate::contenttypes::ContentTypeRegistry;
use crate::error::RepositoryError;
use crate::identity::{User, UserDirectory};
use crate::node_store::NodeStore;
use crate::versioning::{Transaction, VersionStore};
use crate::{FileAttachment, Node, NodeId, RuleId, UserId, VersionId};

/// System attribute listing attachment paths that disappeared from disk.
pub const MISSING_ATTR: &str = "missing";

/// Who is asking, from where and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub user: Option<UserId>,
    pub ip: Option<IpAddr>,
    pub date: NaiveDate,
}

impl AccessRequest {
    pub fn now(user: Option<UserId>, ip: Option<IpAddr>) -> Self {
        Self {
            user,
            ip,
            date: Utc::now().date_naive(),
        }
    }
}

/// Summary of a node for inspection tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub node_type: String,
    pub name: String,
    pub parents: Vec<String>,
    pub children: Vec<String>,
    pub attributes: BTreeMap<String, String>,
    pub system_attributes: BTreeMap<String, String>,
    pub files: Vec<String>,
    pub read_rules: Vec<String>,
    pub write_rules: Vec<String>,
    pub data_rules: Vec<String>,
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Node {} ({}) {}", self.id, self.node_type, self.name)?;
        section(f, "Parents", &self.parents)?;
        section(f, "Children", &self.children)?;
        let attrs: Vec<String> = self.attributes.iter().map(|(k, v)| format!("{k}: {v}")).collect();
        section(f, "Attributes", &attrs)?;
        let sys: Vec<String> = self
            .system_attributes
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();
        section(f, "System Attributes", &sys)?;
        section(f, "Files", &self.files)?;
        section(f, "Read Rules", &self.read_rules)?;
        section(f, "Write Rules", &self.write_rules)?;
        section(f, "Data Rules", &self.data_rules)
    }
}

fn section(f: &mut fmt::Formatter<'_>, title: &str, lines: &[String]) -> fmt::Result {
    writeln!(f, "{title}:")?;
    for line in lines {
        writeln!(f, "  {line}")?;
    }
    Ok(())
}

fn describe_node(node: &Node) -> String {
    format!("{} ({}, {})", node.name, node.node_type, node.id)
}

#[derive(Debug)]
pub struct Repository {
    config: RepositoryConfig,
    root: NodeId,
    store: NodeStore,
    access: AccessControl,
    versions: VersionStore,
    users: UserDirectory,
    content_types: ContentTypeRegistry,
}

impl Repository {
    /// Create an empty repository with a root node and the guest account,
    /// and commit that initial state.
    pub fn open(config: RepositoryConfig) -> Result<Self, RepositoryError> {
        config.validate()?;
        let mut store = NodeStore::new();
        let root = store.create_root(config.root_name.clone())?;
        let mut users = UserDirectory::new();
        users.add_user(User::new(config.guest_login.clone()))?;

        let mut repo = Self {
            config,
            root,
            store,
            access: AccessControl::new(),
            versions: VersionStore::new(),
            users,
            content_types: ContentTypeRegistry::new(),
        };
        repo.commit_transaction(Transaction::new(None).with_meta("comment", "initial"))?;
        info!(root = %root, name = %repo.config.root_name, "opened repository");
        Ok(repo)
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut NodeStore {
        &mut self.store
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub fn access_mut(&mut self) -> &mut AccessControl {
        &mut self.access
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn users_mut(&mut self) -> &mut UserDirectory {
        &mut self.users
    }

    pub fn content_types(&self) -> &ContentTypeRegistry {
        &self.content_types
    }

    pub fn content_types_mut(&mut self) -> &mut ContentTypeRegistry {
        &mut self.content_types
    }

    /// Insert `node` below `parent`. Content hooks run when the node arrives
    /// with files.
    pub fn create_node(&mut self, parent: NodeId, node: Node) -> Result<NodeId, RepositoryError> {
        self.store.node(parent)?;
        let has_files = !node.files.is_empty();
        let id = self.store.insert_node(node)?;
        self.store.link(parent, id)?;
        if has_files {
            self.fire_files_changed(id)?;
        }
        Ok(id)
    }

    pub fn update_node<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut Node) -> R,
    ) -> Result<R, RepositoryError> {
        Ok(self.store.update(id, f)?)
    }

    /// Set metadata attributes and run the type's metadata hook.
    pub fn set_attrs<K, V>(
        &mut self,
        id: NodeId,
        attrs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), RepositoryError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let node_type = self.store.node(id)?.node_type.clone();
        let plugin = self.content_types.get(&node_type);
        self.store.update(id, |node| {
            for (k, v) in attrs {
                node.set(k, v);
            }
            plugin.on_metadata_changed(node);
        })?;
        Ok(())
    }

    pub fn attach_file(&mut self, id: NodeId, file: FileAttachment) -> Result<(), RepositoryError> {
        self.store.add_file(id, file)?;
        self.fire_files_changed(id)
    }

    pub fn detach_file(&mut self, id: NodeId, path: &str) -> Result<FileAttachment, RepositoryError> {
        let removed = self.store.remove_file(id, path)?;
        self.fire_files_changed(id)?;
        Ok(removed)
    }

    fn fire_files_changed(&mut self, id: NodeId) -> Result<(), RepositoryError> {
        let node_type = self.store.node(id)?.node_type.clone();
        let plugin = self.content_types.get(&node_type);
        self.store.update(id, |node| plugin.on_files_changed(node))?;
        Ok(())
    }

    /// Commit pending changes on behalf of `user`.
    pub fn commit(&mut self, user: Option<UserId>) -> Result<Vec<VersionId>, RepositoryError> {
        self.commit_transaction(Transaction::new(user))
    }

    /// Commit pending changes and prune the touched histories when a
    /// retention policy is configured.
    pub fn commit_transaction(&mut self, tx: Transaction) -> Result<Vec<VersionId>, RepositoryError> {
        let created = self.versions.commit(&mut self.store, tx)?;
        if let Some(policy) = &self.config.retention {
            let touched: BTreeSet<NodeId> = created
                .iter()
                .filter_map(|v| self.versions.find(*v).map(|v| v.node_id))
                .collect();
            let now = Utc::now();
            for node in touched {
                let pruned = self.versions.apply_retention(node, policy, now)?;
                if pruned > 0 {
                    debug!(%node, pruned, "pruned versions");
                }
            }
        }
        Ok(created)
    }

    pub fn new_tagged_version<R>(
        &mut self,
        node: NodeId,
        tag: Option<String>,
        comment: Option<String>,
        user: Option<UserId>,
        f: impl FnOnce(&mut Node) -> R,
    ) -> Result<(R, VersionId), RepositoryError> {
        Ok(self
            .versions
            .new_tagged_version(&mut self.store, node, tag, comment, user, f)?)
    }

    /// Restore a node to an earlier version. The restore is pending until the
    /// next commit.
    pub fn revert(&mut self, version: VersionId, include_children: bool) -> Result<(), RepositoryError> {
        self.versions.revert(&mut self.store, version, include_children)?;
        Ok(())
    }

    /// Resolve the access context of a request. Requests without a user run
    /// as the configured guest account.
    pub fn access_context(&self, request: &AccessRequest) -> Result<AccessContext, RepositoryError> {
        let user = match request.user {
            Some(id) => Some(self.users.user(id)?),
            None => self.users.guest(&self.config.guest_login),
        };
        Ok(match user {
            Some(user) => AccessContext::for_user(&self.users, user, request.ip, request.date),
            None => AccessContext::anonymous(request.ip, request.date),
        })
    }

    pub fn has_access(
        &self,
        node: NodeId,
        ruletype: RuleType,
        request: &AccessRequest,
    ) -> Result<bool, RepositoryError> {
        let ctx = self.access_context(request)?;
        Ok(self.access.has_access(&self.store, node, ruletype, &ctx)?)
    }

    /// Children of `node` the request may access, in display order.
    pub fn accessible_children(
        &self,
        node: NodeId,
        ruletype: RuleType,
        request: &AccessRequest,
    ) -> Result<Vec<&Node>, RepositoryError> {
        let ctx = self.access_context(request)?;
        let children = self.store.children(node);
        let allowed: BTreeSet<NodeId> = self
            .access
            .filter_accessible(&self.store, children.iter().map(|n| n.id), ruletype, &ctx)
            .into_iter()
            .collect();
        Ok(children.into_iter().filter(|n| allowed.contains(&n.id)).collect())
    }

    pub fn link_ruleset(
        &mut self,
        node: NodeId,
        ruleset: &str,
        ruletype: RuleType,
        invert: bool,
        blocking: bool,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .access
            .link_ruleset(&self.store, node, ruleset, ruletype, invert, blocking)?)
    }

    pub fn add_node_rule(
        &mut self,
        node: NodeId,
        ruletype: RuleType,
        rule: AccessRule,
        invert: bool,
        blocking: bool,
    ) -> Result<RuleId, RepositoryError> {
        Ok(self
            .access
            .add_node_rule(&self.store, node, ruletype, rule, invert, blocking)?)
    }

    /// Create the user's home directory below the `home` container, creating
    /// that container on first use.
    pub fn create_home_dir(&mut self, user: UserId) -> Result<NodeId, RepositoryError> {
        let existing = self
            .store
            .child_by_name(self.root, "home")
            .filter(|n| n.node_type == "home")
            .map(|n| n.id);
        let container = match existing {
            Some(home) => home,
            None => self.create_node(self.root, Node::new("home", "home"))?,
        };
        Ok(self.users.create_home_dir(user, &mut self.store, container)?)
    }

    /// Delete nodes no longer reachable from the root together with their
    /// versions and access data.
    pub fn purge_unreachable(&mut self) -> Vec<NodeId> {
        let purged = self.store.purge_unreachable();
        for id in &purged {
            let versions = self.versions.forget_node(*id);
            self.access.forget_node(*id);
            self.users.forget_node(*id);
            debug!(node = %id, versions, "forgot purged node");
        }
        purged
    }

    pub fn node_info(&self, id: NodeId) -> Result<NodeInfo, RepositoryError> {
        let node = self.store.node(id)?;
        let rules = |ruletype| self.access.describe_rules(&self.store, id, ruletype);
        Ok(NodeInfo {
            id,
            node_type: node.node_type.clone(),
            name: node.name.clone(),
            parents: self.store.parents(id).into_iter().map(describe_node).collect(),
            children: self.store.children(id).into_iter().map(describe_node).collect(),
            attributes: node.attrs.clone(),
            system_attributes: node.system_attrs.clone(),
            files: self.file_lines(node),
            read_rules: rules(RuleType::Read),
            write_rules: rules(RuleType::Write),
            data_rules: rules(RuleType::Data),
        })
    }

    /// One line per file, sorted by filetype and mimetype, with the size or a
    /// `missing!` marker. System-managed files are flagged.
    fn file_lines(&self, node: &Node) -> Vec<String> {
        let missing: BTreeSet<&str> = node
            .system_attr(MISSING_ATTR)
            .map(|m| m.split(';').collect())
            .unwrap_or_default();
        let mut files: Vec<&FileAttachment> = node.files.iter().collect();
        files.sort_by(|a, b| (&a.filetype, &a.mimetype).cmp(&(&b.filetype, &b.mimetype)));
        files
            .into_iter()
            .map(|f| {
                let state = if missing.contains(f.path.as_str()) {
                    "missing!".to_string()
                } else {
                    f.size
                        .map(|s| format!("{s} bytes"))
                        .unwrap_or_else(|| "size unknown".to_string())
                };
                let system = if self.content_types.is_system_file(&node.node_type, &f.filetype) {
                    " [system]"
                } else {
                    ""
                };
                format!("{} {} {} ({state}){system}", f.filetype, f.mimetype, f.path)
            })
            .collect()
    }

    pub fn is_container(&self, id: NodeId) -> Result<bool, RepositoryError> {
        Ok(self.store.node(id)?.is_container(&self.content_types))
    }

    /// Container children, classified by the registered content types.
    pub fn container_children(&self, id: NodeId) -> Vec<&Node> {
        self.store.container_children(id, &self.content_types)
    }

    pub fn content_children(&self, id: NodeId) -> Vec<&Node> {
        self.store.content_children(id, &self.content_types)
    }

    /// Index of every attached file, resolved against `base_dir`, for
    /// [`crate::attachment_monitor::AttachmentMonitor`].
    pub fn attachment_index(&self, base_dir: &Path) -> AttachmentIndex {
        AttachmentIndex::from_store(&self.store, base_dir)
    }

    /// Record a filesystem change to an attachment. Vanished files are listed
    /// in the `missing` system attribute until they reappear. Events for
    /// nodes that no longer exist are ignored.
    pub fn apply_attachment_event(&mut self, event: &AttachmentEvent) -> Result<(), RepositoryError> {
        let Some(node) = self.store.get(&event.node_id) else {
            warn!(node = %event.node_id, path = %event.path.display(), "event for unknown node");
            return Ok(());
        };
        let Some(file_path) = node
            .files
            .iter()
            .find(|f| event.path.ends_with(&f.path))
            .map(|f| f.path.clone())
        else {
            warn!(node = %event.node_id, path = %event.path.display(), "event for detached file");
            return Ok(());
        };

        let vanished = matches!(
            event.kind,
            AttachmentChangeKind::Removed | AttachmentChangeKind::Renamed { .. }
        );
        let mut missing: BTreeSet<String> = node
            .system_attr(MISSING_ATTR)
            .map(|m| m.split(';').map(str::to_string).collect())
            .unwrap_or_default();
        let changed = if vanished {
            missing.insert(file_path.clone())
        } else {
            missing.remove(&file_path)
        };
        if !changed && event.kind != AttachmentChangeKind::Modified {
            return Ok(());
        }

        info!(node = %event.node_id, path = %file_path, kind = ?event.kind, "attachment changed on disk");
        self.store.update(event.node_id, |node| {
            if missing.is_empty() {
                node.system_attrs.remove(MISSING_ATTR);
            } else {
                let joined: Vec<&str> = missing.iter().map(String::as_str).collect();
                node.set_system_attr(MISSING_ATTR, joined.join(";"));
            }
        })?;
        self.fire_files_changed(event.node_id)
    }
}
