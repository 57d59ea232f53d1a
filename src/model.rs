use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Stable, sortable identifiers.
pub type NodeId = Ulid;
pub type VersionId = Ulid;
pub type TransactionId = Ulid;
pub type RuleId = Ulid;
pub type UserId = Ulid;
pub type GroupId = Ulid;

/// File attached to exactly one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub path: String,
    pub filetype: String, // e.g. "original", "thumbnail", "document"
    pub mimetype: String,
    pub size: Option<u64>,
}

impl FileAttachment {
    pub fn new(
        path: impl Into<String>,
        filetype: impl Into<String>,
        mimetype: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            filetype: filetype.into(),
            mimetype: mimetype.into(),
            size: None,
        }
    }
}

/// Container nodes hold other nodes; content nodes carry the actual media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Container,
    Content,
}

/// Decides whether a node type is a container. Implemented by the content
/// type registry.
pub trait NodeClassifier {
    fn kind_of(&self, node_type: &str) -> NodeKind;
}

/// A typed node in the repository graph. Edges are held by the node store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub node_type: String,
    pub schema: Option<String>,
    pub name: String,
    pub orderpos: i64,
    pub attrs: BTreeMap<String, String>,
    pub system_attrs: BTreeMap<String, String>,
    pub files: Vec<FileAttachment>,
}

impl Node {
    pub fn new(node_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            node_type: node_type.into(),
            schema: None,
            name: name.into(),
            orderpos: 1,
            attrs: BTreeMap::new(),
            system_attrs: BTreeMap::new(),
            files: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn kind(&self, types: &dyn NodeClassifier) -> NodeKind {
        types.kind_of(&self.node_type)
    }

    pub fn is_container(&self, types: &dyn NodeClassifier) -> bool {
        self.kind(types) == NodeKind::Container
    }

    /// Schema name for content nodes, node type for containers.
    pub fn content_type(&self, types: &dyn NodeClassifier) -> &str {
        match (self.kind(types), &self.schema) {
            (NodeKind::Content, Some(schema)) => schema,
            _ => &self.node_type,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(key.into(), value.into());
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        self.attrs.remove(key)
    }

    /// Returns the existing value, inserting `default` first if the key is absent.
    pub fn setdefault(&mut self, key: &str, default: &str) -> &str {
        self.attrs
            .entry(key.to_string())
            .or_insert_with(|| default.to_string())
    }

    pub fn system_attr(&self, key: &str) -> Option<&str> {
        self.system_attrs.get(key).map(String::as_str)
    }

    pub fn set_system_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.system_attrs.insert(key.into(), value.into());
    }

    pub fn file_by_type(&self, filetype: &str) -> Option<&FileAttachment> {
        self.files.iter().find(|f| f.filetype == filetype)
    }
}

/// Errors when validating node invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("node {0} has an empty attribute key")]
    EmptyAttributeKey(NodeId),
    #[error("node {node} lists file {path} more than once")]
    DuplicateFile { node: NodeId, path: String },
    #[error("node {0} has an empty type")]
    EmptyType(NodeId),
}

/// Validate invariants for a single node.
///
/// - Node type must be non-empty.
/// - Attribute keys (plain and system) must be non-empty.
/// - A file path appears at most once per node.
pub fn assert_node_invariants(node: &Node) -> Result<(), ModelError> {
    if node.node_type.is_empty() {
        return Err(ModelError::EmptyType(node.id));
    }
    if node
        .attrs
        .keys()
        .chain(node.system_attrs.keys())
        .any(|k| k.is_empty())
    {
        return Err(ModelError::EmptyAttributeKey(node.id));
    }

    let mut seen_paths = HashSet::new();
    for file in &node.files {
        if !seen_paths.insert(file.path.as_str()) {
            return Err(ModelError::DuplicateFile {
                node: node.id,
                path: file.path.clone(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> Node {
        let mut node = Node::new("image", "sunset").with_schema("photo");
        node.set("testattr", "testvalue");
        node.files
            .push(FileAttachment::new("img/sunset.jpg", "original", "image/jpeg"));
        node
    }

    #[test]
    fn validates_ok_node() {
        assert_node_invariants(&sample_node()).unwrap();
    }

    #[test]
    fn detects_duplicate_files() {
        let mut node = sample_node();
        let dup = node.files[0].clone();
        node.files.push(dup);
        let err = assert_node_invariants(&node).unwrap_err();
        assert!(matches!(err, ModelError::DuplicateFile { .. }));
    }

    #[test]
    fn detects_empty_attribute_key() {
        let mut node = sample_node();
        node.set_system_attr("", "x");
        let err = assert_node_invariants(&node).unwrap_err();
        assert!(matches!(err, ModelError::EmptyAttributeKey(_)));
    }

    #[test]
    fn get_with_default() {
        let node = sample_node();
        assert_eq!(node.get_or("testattr", "default_value"), "testvalue");
        assert_eq!(node.get_or("missing", "default_value"), "default_value");
    }

    #[test]
    fn setdefault_keeps_existing_value() {
        let mut node = sample_node();
        assert_eq!(node.setdefault("testattr", "default_value"), "testvalue");
        assert_eq!(node.setdefault("newattr", "default_value"), "default_value");
        assert_eq!(node.get("newattr"), Some("default_value"));
    }

    struct Dirs;

    impl NodeClassifier for Dirs {
        fn kind_of(&self, node_type: &str) -> NodeKind {
            if node_type == "directory" {
                NodeKind::Container
            } else {
                NodeKind::Content
            }
        }
    }

    #[test]
    fn content_type_depends_on_kind() {
        assert_eq!(sample_node().content_type(&Dirs), "photo");
        let dir = Node::new("directory", "d").with_schema("ignored");
        assert_eq!(dir.content_type(&Dirs), "directory");
        assert!(dir.is_container(&Dirs));
        assert!(!sample_node().is_container(&Dirs));
    }
}
