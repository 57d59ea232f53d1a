//! Filesystem watching for attached files.
//!
//! Raw `notify` events are normalized and mapped back to the node owning the
//! path before they reach a sink. Paths nobody owns are dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, RwLock};
use std::thread;
use std::time::SystemTime;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tracing::{debug, warn};

use crate::node_store::NodeStore;
use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentChangeKind {
    Created,
    Modified,
    Removed,
    Renamed { to: PathBuf },
}

/// Change to a file attached to `node_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentEvent {
    pub node_id: NodeId,
    pub path: PathBuf,
    pub kind: AttachmentChangeKind,
    pub occurred_at: SystemTime,
}

pub trait AttachmentEventSink: Send + Sync + 'static {
    fn handle(&self, event: AttachmentEvent);
}

#[derive(Debug, Error)]
pub enum AttachmentMonitorError {
    #[error("no attached files to monitor")]
    NoPaths,
    #[error("path index lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Notify(#[from] notify::Error),
}

/// Path to owning node lookup shared with the watcher thread.
#[derive(Debug, Default, Clone)]
pub struct AttachmentIndex {
    paths: Arc<RwLock<HashMap<PathBuf, NodeId>>>,
}

impl AttachmentIndex {
    /// Build the index from every file attached in `store`. Relative
    /// attachment paths are resolved against `base_dir`.
    pub fn from_store(store: &NodeStore, base_dir: &Path) -> Self {
        let paths = store
            .nodes()
            .flat_map(|node| {
                node.files
                    .iter()
                    .map(move |f| (base_dir.join(&f.path), node.id))
            })
            .collect();
        Self {
            paths: Arc::new(RwLock::new(paths)),
        }
    }

    pub fn insert(&self, path: PathBuf, node: NodeId) -> Result<(), AttachmentMonitorError> {
        self.paths
            .write()
            .map_err(|_| AttachmentMonitorError::Poisoned)?
            .insert(path, node);
        Ok(())
    }

    pub fn remove(&self, path: &Path) -> Result<Option<NodeId>, AttachmentMonitorError> {
        Ok(self
            .paths
            .write()
            .map_err(|_| AttachmentMonitorError::Poisoned)?
            .remove(path))
    }

    pub fn owner(&self, path: &Path) -> Option<NodeId> {
        self.paths.read().ok()?.get(path).copied()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths
            .read()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Keeps the platform watchers and the forwarding thread alive.
pub struct AttachmentMonitor {
    _watchers: Vec<RecommendedWatcher>,
    _worker: thread::JoinHandle<()>,
}

impl AttachmentMonitor {
    /// Watch the parent directory of every indexed path and forward events
    /// for indexed files to `sink`.
    pub fn watch<S: AttachmentEventSink>(
        index: AttachmentIndex,
        sink: Arc<S>,
    ) -> Result<Self, AttachmentMonitorError> {
        let mut dirs: Vec<PathBuf> = index
            .paths()
            .iter()
            .filter_map(|p| p.parent().map(Path::to_path_buf))
            .collect();
        dirs.sort();
        dirs.dedup();
        if dirs.is_empty() {
            return Err(AttachmentMonitorError::NoPaths);
        }

        let (tx, rx) = mpsc::channel();
        let mut watchers = Vec::new();
        let mut last_error = None;
        for dir in dirs {
            let mut watcher = RecommendedWatcher::new(tx.clone(), Config::default())?;
            // Directories rather than files so that removal and re-creation are seen.
            match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    debug!(dir = %dir.display(), "watching attachment directory");
                    watchers.push(watcher);
                }
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "cannot watch attachment directory, skipped");
                    last_error = Some(err);
                }
            }
        }
        if watchers.is_empty() {
            return Err(last_error.map_or(AttachmentMonitorError::NoPaths, Into::into));
        }

        let worker = thread::spawn(move || {
            for res in rx {
                match res {
                    Ok(event) => {
                        for normalized in map_event(&index, event) {
                            sink.handle(normalized);
                        }
                    }
                    Err(err) => warn!(error = %err, "attachment watcher error"),
                }
            }
        });

        Ok(Self {
            _watchers: watchers,
            _worker: worker,
        })
    }
}

fn classify(event: &Event) -> Option<AttachmentChangeKind> {
    let kind = match &event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any | CreateKind::Other) => {
            AttachmentChangeKind::Created
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let to = event.paths.get(1)?.clone();
            AttachmentChangeKind::Renamed { to }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => AttachmentChangeKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => AttachmentChangeKind::Created,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => {
            AttachmentChangeKind::Modified
        }
        EventKind::Remove(RemoveKind::File | RemoveKind::Any | RemoveKind::Other) => {
            AttachmentChangeKind::Removed
        }
        _ => return None,
    };
    Some(kind)
}

/// Normalize a raw event and attach owning nodes. A rename whose target is
/// itself attached is reported as a creation on the target's node too.
pub fn map_event(index: &AttachmentIndex, event: Event) -> Vec<AttachmentEvent> {
    let Some(kind) = classify(&event) else {
        return Vec::new();
    };
    let occurred_at = SystemTime::now();
    let mut out = Vec::new();

    let Some(path) = event.paths.first() else {
        return out;
    };
    if let Some(node_id) = index.owner(path) {
        out.push(AttachmentEvent {
            node_id,
            path: path.clone(),
            kind: kind.clone(),
            occurred_at,
        });
    }
    if let AttachmentChangeKind::Renamed { to } = &kind {
        if let Some(node_id) = index.owner(to) {
            out.push(AttachmentEvent {
                node_id,
                path: to.clone(),
                kind: AttachmentChangeKind::Created,
                occurred_at,
            });
        }
    }
    out
}

/// Sink forwarding into a channel, handy for tests and for handing events to
/// the thread that owns the repository.
pub struct ChannelSink {
    pub sender: mpsc::Sender<AttachmentEvent>,
}

impl AttachmentEventSink for ChannelSink {
    fn handle(&self, event: AttachmentEvent) {
        let _ = self.sender.send(event);
    }
}
