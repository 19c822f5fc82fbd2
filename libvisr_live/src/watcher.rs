//! Change notification sources.
//!
//! A watcher turns an external notification (a filesystem event from `notify`, or a message
//! from a STOMP topic) into a [`TickTrigger`] for the tick worker. Watchers never touch
//! frame data themselves.

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use super::coordinator::DatasetRequest;
use super::error::WatcherError;

/// What the tick worker should do in response to a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickTrigger {
    /// The active dataset may have grown
    Tick,
    /// A different dataset became available; open it, then tick
    Reopen(DatasetRequest),
}

/// A raw notification from one of the external sources
#[derive(Debug, Clone)]
pub enum Notice {
    FileEvent(Event),
    QueueMessage(String),
}

pub trait ChangeWatcher: Send {
    fn on_change(&mut self, notice: &Notice) -> Option<TickTrigger>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveDataset {
    path: PathBuf,
    dataset_name: Option<String>,
}

/// The file (and dataset) of the currently open session, shared between the coordinator
/// (which sets it) and the watchers (which filter on it)
#[derive(Debug, Clone, Default)]
pub struct WatchTarget {
    active: Arc<Mutex<Option<ActiveDataset>>>,
}

impl WatchTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, active: Option<ActiveDataset>) {
        match self.active.lock() {
            Ok(mut current) => *current = active,
            Err(poisoned) => *poisoned.into_inner() = active,
        }
    }

    fn load(&self) -> Option<ActiveDataset> {
        match self.active.lock() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Watch a file without naming a dataset in it
    pub fn set(&self, path: Option<PathBuf>) {
        self.store(path.map(|p| ActiveDataset {
            path: normalize(&p),
            dataset_name: None,
        }));
    }

    pub fn set_with_dataset(&self, path: &Path, dataset_name: &str) {
        self.store(Some(ActiveDataset {
            path: normalize(path),
            dataset_name: Some(dataset_name.trim_matches('/').to_string()),
        }));
    }

    pub fn get(&self) -> Option<PathBuf> {
        self.load().map(|active| active.path)
    }

    pub fn dataset_name(&self) -> Option<String> {
        self.load().and_then(|active| active.dataset_name)
    }

    fn matches(&self, path: &Path) -> bool {
        self.get().is_some_and(|target| target == normalize(path))
    }

    fn matches_dataset(&self, path: &Path, dataset_name: &str) -> bool {
        self.load().is_some_and(|active| {
            active.path == normalize(path)
                && active.dataset_name.as_deref() == Some(dataset_name.trim_matches('/'))
        })
    }
}

/// Canonical path when the file exists, the path as given otherwise
fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Triggers a tick when the active file is created or its contents are modified.
///
/// The underlying watch covers a whole directory, so events for other files in it are
/// dropped here.
#[derive(Debug, Clone)]
pub struct FilesystemWatcher {
    target: WatchTarget,
}

impl FilesystemWatcher {
    pub fn new(target: WatchTarget) -> Self {
        Self { target }
    }

    fn is_relevant_kind(kind: &EventKind) -> bool {
        match kind {
            EventKind::Create(_) => true,
            EventKind::Modify(ModifyKind::Metadata(_)) => false,
            EventKind::Modify(_) => true,
            _ => false,
        }
    }
}

impl ChangeWatcher for FilesystemWatcher {
    fn on_change(&mut self, notice: &Notice) -> Option<TickTrigger> {
        let Notice::FileEvent(event) = notice else {
            return None;
        };
        if !Self::is_relevant_kind(&event.kind) {
            return None;
        }
        if event.paths.iter().any(|path| self.target.matches(path)) {
            log::debug!("Active file changed: {:?}", event.paths);
            Some(TickTrigger::Tick)
        } else {
            None
        }
    }
}

/// Triggers ticks (or dataset switches) from stream documents published on a queue.
///
/// Understands bare documents and `{"name": ..., "doc": {...}}` envelopes. A stream
/// resource carries the URI of the file being written; a stream datum announces new
/// frames in the current resource.
#[derive(Debug, Clone)]
pub struct QueueWatcher {
    target: WatchTarget,
}

impl QueueWatcher {
    pub fn new(target: WatchTarget) -> Self {
        Self { target }
    }

    fn document(value: &Value) -> &Value {
        match (value.get("name"), value.get("doc")) {
            (Some(Value::String(_)), Some(doc @ Value::Object(_))) => doc,
            _ => value,
        }
    }

    fn resource_request(&self, doc: &Value, uri: &str) -> TickTrigger {
        let path = path_from_uri(uri);
        let dataset_name = doc
            .get("parameters")
            .and_then(|p| p.get("dataset").or_else(|| p.get("path")))
            .and_then(Value::as_str)
            .map(String::from);

        let already_open = match dataset_name.as_deref() {
            Some(name) => self.target.matches_dataset(&path, name),
            None => self.target.matches(&path),
        };
        if already_open {
            return TickTrigger::Tick;
        }
        TickTrigger::Reopen(DatasetRequest {
            filepath: path.parent().map(Path::to_path_buf),
            filename: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            dataset_name,
        })
    }
}

impl ChangeWatcher for QueueWatcher {
    fn on_change(&mut self, notice: &Notice) -> Option<TickTrigger> {
        let Notice::QueueMessage(body) = notice else {
            return None;
        };
        let value: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Ignoring queue message that is not JSON: {e}");
                return None;
            }
        };

        let doc = Self::document(&value);
        if let Some(uri) = doc.get("uri").and_then(Value::as_str) {
            return Some(self.resource_request(doc, uri));
        }
        if doc.get("stream_resource").is_some() || doc.get("indices").is_some() {
            return Some(TickTrigger::Tick);
        }
        log::debug!("Ignoring queue message without a resource or datum");
        None
    }
}

/// Strip a `file://[host]` prefix from a resource URI
pub fn path_from_uri(uri: &str) -> PathBuf {
    match uri.strip_prefix("file://") {
        Some(rest) => match rest.find('/') {
            Some(index) => PathBuf::from(&rest[index..]),
            None => PathBuf::from(rest),
        },
        None => PathBuf::from(uri),
    }
}

/// Keeps a `notify` directory watch alive and forwards relevant events as triggers
pub struct FilesystemService {
    _watcher: RecommendedWatcher,
    directory: PathBuf,
}

impl std::fmt::Debug for FilesystemService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemService")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl FilesystemService {
    /// Watch `directory` (non-recursively), running every event through `watcher`
    pub fn start(
        directory: &Path,
        mut watcher: FilesystemWatcher,
        tx: Sender<TickTrigger>,
    ) -> Result<Self, WatcherError> {
        if !directory.exists() {
            return Err(WatcherError::BadWatchPath(directory.to_path_buf()));
        }

        let mut inner = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if let Some(trigger) = watcher.on_change(&Notice::FileEvent(event)) {
                    if tx.send(trigger).is_err() {
                        log::debug!("Tick worker is gone; dropping file event");
                    }
                }
            }
            Err(e) => log::warn!("File watcher error: {e}"),
        })?;
        inner.watch(directory, RecursiveMode::NonRecursive)?;
        log::info!("Watching {} for file changes", directory.display());

        Ok(Self {
            _watcher: inner,
            directory: directory.to_path_buf(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}
