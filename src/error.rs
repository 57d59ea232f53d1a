use thiserror::Error;

use crate::access::AccessError;
use crate::attachment_monitor::AttachmentMonitorError;
use crate::config::ConfigError;
use crate::identity::IdentityError;
use crate::model::ModelError;
use crate::node_store::NodeStoreError;
use crate::versioning::VersioningError;

/// Errors surfaced by [`crate::Repository`].
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Store(#[from] NodeStoreError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Versioning(#[from] VersioningError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Monitor(#[from] AttachmentMonitorError),
}
