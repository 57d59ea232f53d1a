//! Mediavault core.
//!
//! Node graph, access-rule evaluation and versioning for a multimedia content
//! repository. Persistence and transport are left to callers: every record is
//! serde-serializable and the stores are plain in-memory structures.

pub mod access;
pub mod attachment_monitor;
pub mod config;
pub mod contenttypes;
pub mod error;
pub mod identity;
pub mod model;
pub mod node_store;
pub mod repository;
pub mod versioning;
pub mod workflow;

pub use error::RepositoryError;
pub use model::*;
pub use node_store::NodeStore;
pub use repository::Repository;
