//! Per-type node behavior hooked into lifecycle events.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::{Node, NodeClassifier, NodeKind};

/// Behavior attached to a node type.
pub trait ContentType: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn is_container(&self) -> bool {
        false
    }

    /// Filetypes managed by the system rather than uploaded by users.
    fn sys_filetypes(&self) -> &'static [&'static str] {
        &[]
    }

    /// Called after the node's file attachments changed.
    fn on_files_changed(&self, _node: &mut Node) {}

    /// Called after the node's metadata attributes changed.
    fn on_metadata_changed(&self, _node: &mut Node) {}
}

macro_rules! container_type {
    ($ty:ident, $name:literal) => {
        pub struct $ty;

        impl ContentType for $ty {
            fn type_name(&self) -> &'static str {
                $name
            }

            fn is_container(&self) -> bool {
                true
            }
        }
    };
}

container_type!(Root, "root");
container_type!(Directory, "directory");
container_type!(Collection, "collection");
container_type!(Collections, "collections");
container_type!(Home, "home");
container_type!(Workflows, "workflows");
container_type!(Workflow, "workflow");

pub struct Image;

impl ContentType for Image {
    fn type_name(&self) -> &'static str {
        "image"
    }

    fn sys_filetypes(&self) -> &'static [&'static str] {
        &["original", "image", "thumbnail", "presentation"]
    }

    fn on_files_changed(&self, node: &mut Node) {
        let mimetype = node
            .file_by_type("original")
            .or_else(|| node.file_by_type("image"))
            .map(|f| f.mimetype.clone());
        match mimetype {
            Some(m) => node.set("mimetype", m),
            None => {
                node.remove_attr("mimetype");
            }
        }
        let has_thumbnail = node.file_by_type("thumbnail").is_some();
        node.set("Thumbnail", if has_thumbnail { "True" } else { "False" });
    }
}

pub struct Document;

impl ContentType for Document {
    fn type_name(&self) -> &'static str {
        "document"
    }

    fn sys_filetypes(&self) -> &'static [&'static str] {
        &["document", "thumbnail", "fulltext"]
    }

    fn on_files_changed(&self, node: &mut Node) {
        match node.file_by_type("document").map(|f| f.mimetype.clone()) {
            Some(m) => node.set("mimetype", m),
            None => {
                node.remove_attr("mimetype");
            }
        }
    }
}

/// Fallback for node types without a registered plugin.
pub struct Other;

impl ContentType for Other {
    fn type_name(&self) -> &'static str {
        "other"
    }
}

/// Maps node types to plugins. Unknown types use [`Other`].
#[derive(Clone)]
pub struct ContentTypeRegistry {
    types: HashMap<String, Arc<dyn ContentType>>,
    fallback: Arc<dyn ContentType>,
}

impl Default for ContentTypeRegistry {
    fn default() -> Self {
        let mut registry = Self {
            types: HashMap::new(),
            fallback: Arc::new(Other),
        };
        registry.register(Arc::new(Root));
        registry.register(Arc::new(Directory));
        registry.register(Arc::new(Collection));
        registry.register(Arc::new(Collections));
        registry.register(Arc::new(Home));
        registry.register(Arc::new(Workflows));
        registry.register(Arc::new(Workflow));
        registry.register(Arc::new(Image));
        registry.register(Arc::new(Document));
        registry
    }
}

impl std::fmt::Debug for ContentTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ContentTypeRegistry")
            .field("types", &names)
            .finish()
    }
}

impl ContentTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the plugin for its type name.
    pub fn register(&mut self, content_type: Arc<dyn ContentType>) {
        debug!(node_type = content_type.type_name(), "registered content type");
        self.types
            .insert(content_type.type_name().to_string(), content_type);
    }

    pub fn get(&self, node_type: &str) -> &dyn ContentType {
        self.types
            .get(node_type)
            .map(|t| t.as_ref())
            .unwrap_or_else(|| self.fallback.as_ref())
    }

    pub fn is_registered(&self, node_type: &str) -> bool {
        self.types.contains_key(node_type)
    }

    /// Whether `filetype` is managed by the system for nodes of `node_type`.
    pub fn is_system_file(&self, node_type: &str, filetype: &str) -> bool {
        self.get(node_type).sys_filetypes().contains(&filetype)
    }
}

impl NodeClassifier for ContentTypeRegistry {
    /// Registered types decide for themselves. Workflow steps hold the nodes
    /// passing through them and count as containers.
    fn kind_of(&self, node_type: &str) -> NodeKind {
        let container = match self.types.get(node_type) {
            Some(t) => t.is_container(),
            None => node_type.starts_with("workflowstep"),
        };
        if container {
            NodeKind::Container
        } else {
            NodeKind::Content
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileAttachment;

    #[test]
    fn image_derives_mimetype_and_thumbnail_flag() {
        let registry = ContentTypeRegistry::new();
        let mut node = Node::new("image", "pic");
        node.files
            .push(FileAttachment::new("pic.png", "original", "image/png"));
        registry.get("image").on_files_changed(&mut node);
        assert_eq!(node.get("mimetype"), Some("image/png"));
        assert_eq!(node.get("Thumbnail"), Some("False"));

        node.files
            .push(FileAttachment::new("pic.thumb", "thumbnail", "image/jpeg"));
        registry.get("image").on_files_changed(&mut node);
        assert_eq!(node.get("Thumbnail"), Some("True"));

        node.files.clear();
        registry.get("image").on_files_changed(&mut node);
        assert_eq!(node.get("mimetype"), None);
    }

    #[test]
    fn document_uses_document_file() {
        let registry = ContentTypeRegistry::new();
        let mut node = Node::new("document", "paper");
        node.files
            .push(FileAttachment::new("paper.pdf", "document", "application/pdf"));
        registry.get("document").on_files_changed(&mut node);
        assert_eq!(node.get("mimetype"), Some("application/pdf"));
    }

    struct Project;

    impl ContentType for Project {
        fn type_name(&self) -> &'static str {
            "project"
        }

        fn is_container(&self) -> bool {
            true
        }
    }

    #[test]
    fn classification_follows_registered_types() {
        let mut registry = ContentTypeRegistry::new();
        let project = Node::new("project", "p");
        assert!(!project.is_container(&registry));
        registry.register(Arc::new(Project));
        assert!(project.is_container(&registry));
        assert_eq!(registry.kind_of("image"), NodeKind::Content);
        assert_eq!(registry.kind_of("workflowstep_end"), NodeKind::Container);
        assert_eq!(registry.kind_of("video"), NodeKind::Content);
    }

    #[test]
    fn system_filetypes_per_type() {
        let registry = ContentTypeRegistry::new();
        assert!(registry.is_system_file("image", "thumbnail"));
        assert!(!registry.is_system_file("image", "attachment"));
        assert!(registry.is_system_file("document", "fulltext"));
        assert!(!registry.is_system_file("video", "thumbnail"));
    }

    #[test]
    fn unknown_types_fall_back() {
        let registry = ContentTypeRegistry::new();
        assert_eq!(registry.get("video").type_name(), "other");
        assert!(registry.get("directory").is_container());
        assert!(!registry.is_registered("video"));
    }
}
