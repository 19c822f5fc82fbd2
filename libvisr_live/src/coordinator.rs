use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::cursor::{DatasetCursor, PendingRead};
use super::error::{SessionError, SourceError, TickError};
use super::hub::{Payload, SubscriberHub};
use super::normalizer::{NormalizedFraction, RunningNormalizer};
use super::reducer::{reduce, validate_frame_shape, FrameStat};
use super::source::SourceOpener;
use super::watcher::WatchTarget;

/// Sent after the fractions of one tick, marking the end of the available batch
pub const END_OF_BATCH: &str = "[]";

/// A request to open a dataset. Missing fields fall back to the current session's values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRequest {
    pub filepath: Option<PathBuf>,
    pub filename: Option<String>,
    pub dataset_name: Option<String>,
}

/// Fallback dataset location used while no session is open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDefaults {
    pub filepath: PathBuf,
    pub filename: String,
    pub dataset_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Armed,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionOpened {
    pub message: String,
    pub shape: Vec<usize>,
    pub session_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No session is open
    Idle,
    /// Another tick was in flight; this one was folded into it
    Busy,
    /// The session changed while frames were being reduced; nothing was committed
    Discarded { session_id: u64 },
    /// New frames (possibly none) were committed and broadcast
    Processed {
        session_id: u64,
        fractions: Vec<NormalizedFraction>,
    },
}

/// Serializable snapshot of the run state; file handles are left out
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStateView {
    pub state: PipelineState,
    pub session_id: Option<u64>,
    pub filepath: PathBuf,
    pub filename: String,
    pub dataset_name: String,
    pub cursor_position: usize,
    pub accumulated_stats: Vec<FrameStat>,
    pub subscribers: usize,
    pub opened_at: Option<String>,
}

/// One open dataset and everything accumulated from it
#[derive(Debug)]
struct Session {
    id: u64,
    filepath: PathBuf,
    filename: String,
    dataset_name: String,
    cursor: DatasetCursor,
    normalizer: RunningNormalizer,
    opened_at: String,
}

impl Session {
    fn path(&self) -> PathBuf {
        self.filepath.join(&self.filename)
    }
}

/// Clears the processing flag when a tick ends, however it ends
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the dataset session and runs ticks: read new frames, reduce them, normalize them
/// and broadcast the fractions.
///
/// The session lock is held while frames are read and while results are committed, but
/// not while frames are reduced or broadcast. A session opened, reset or closed between
/// those two points makes the tick discard its results.
pub struct PipelineCoordinator {
    opener: Arc<dyn SourceOpener>,
    defaults: DatasetDefaults,
    session: Mutex<Option<Session>>,
    processing: AtomicBool,
    next_session_id: AtomicU64,
    hub: Arc<SubscriberHub>,
    target: WatchTarget,
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("defaults", &self.defaults)
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

impl PipelineCoordinator {
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        defaults: DatasetDefaults,
        hub: Arc<SubscriberHub>,
        target: WatchTarget,
    ) -> Self {
        Self {
            opener,
            defaults,
            session: Mutex::new(None),
            processing: AtomicBool::new(false),
            next_session_id: AtomicU64::new(1),
            hub,
            target,
        }
    }

    pub fn hub(&self) -> &Arc<SubscriberHub> {
        &self.hub
    }

    pub fn watch_target(&self) -> &WatchTarget {
        &self.target
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            log::error!("Session lock was poisoned by a panicking tick; recovering");
            poisoned.into_inner()
        })
    }

    /// Fill the missing fields of a request from the open session, or the defaults
    fn resolve(&self, request: DatasetRequest) -> DatasetDefaults {
        let session = self.lock_session();
        let (filepath, filename, dataset_name) = match session.as_ref() {
            Some(s) => (&s.filepath, &s.filename, &s.dataset_name),
            None => (
                &self.defaults.filepath,
                &self.defaults.filename,
                &self.defaults.dataset_name,
            ),
        };
        DatasetDefaults {
            filepath: request.filepath.unwrap_or_else(|| filepath.clone()),
            filename: request.filename.unwrap_or_else(|| filename.clone()),
            dataset_name: request.dataset_name.unwrap_or_else(|| dataset_name.clone()),
        }
    }

    /// Open (or reopen) a dataset session.
    ///
    /// On success the previous session, its cursor and its statistics are discarded. On
    /// failure the previous session is left as it was.
    pub fn open_session(&self, request: DatasetRequest) -> Result<SessionOpened, SessionError> {
        let resolved = self.resolve(request);
        let path = resolved.filepath.join(&resolved.filename);
        log::info!(
            "Opening dataset {} in {}",
            resolved.dataset_name,
            path.display()
        );

        let source = self
            .opener
            .open(&path, &resolved.dataset_name)
            .map_err(|e| match e {
                SourceError::DatasetNotFound(name) => SessionError::DatasetNotFound(name),
                other => SessionError::SessionOpenFailure(other.to_string()),
            })?;
        let mut cursor = DatasetCursor::new(source);
        let shape = cursor
            .shape()
            .map_err(|e| SessionError::SessionOpenFailure(e.to_string()))?;
        validate_frame_shape(shape.get(1..).unwrap_or_default())?;

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.target.set_with_dataset(&path, &resolved.dataset_name);
        let session = Session {
            id,
            filepath: resolved.filepath,
            filename: resolved.filename,
            dataset_name: resolved.dataset_name,
            cursor,
            normalizer: RunningNormalizer::new(),
            opened_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        };
        let previous = self.lock_session().replace(session);
        if let Some(previous) = previous {
            log::info!(
                "Session {} closed after {} frames",
                previous.id,
                previous.cursor.position()
            );
        }
        log::info!("Session {id} opened with dataset shape {shape:?}");

        Ok(SessionOpened {
            message: String::from("Dataset set successfully"),
            shape,
            session_id: id,
        })
    }

    /// Start the current dataset over: new session, cursor at zero, no statistics
    pub fn reset_session(&self) -> Result<SessionOpened, SessionError> {
        if self.lock_session().is_none() {
            return Err(SessionError::DatasetUninitialized);
        }
        self.open_session(DatasetRequest::default())
    }

    /// Close the session and go idle. Returns false if none was open.
    pub fn close_session(&self) -> bool {
        let previous = self.lock_session().take();
        self.target.set(None);
        match previous {
            Some(session) => {
                log::info!("Session {} closed", session.id);
                true
            }
            None => false,
        }
    }

    /// Run one tick to completion, including the broadcast of its results
    pub fn tick(&self) -> Result<TickOutcome, TickError> {
        if self.processing.swap(true, Ordering::AcqRel) {
            return Ok(TickOutcome::Busy);
        }
        let _guard = ProcessingGuard(&self.processing);

        let Some((session_id, pending)) = self.read_phase()? else {
            return Ok(TickOutcome::Idle);
        };
        if pending.is_empty() {
            return Ok(TickOutcome::Processed {
                session_id,
                fractions: vec![],
            });
        }

        let stats = Self::reduce_phase(&pending)?;
        let outcome = self.commit_phase(session_id, &pending, &stats);
        if let TickOutcome::Processed { fractions, .. } = &outcome {
            self.broadcast_phase(fractions);
        }
        Ok(outcome)
    }

    fn read_phase(&self) -> Result<Option<(u64, PendingRead)>, TickError> {
        let mut session = self.lock_session();
        match session.as_mut() {
            Some(s) => Ok(Some((s.id, s.cursor.read_pending()?))),
            None => Ok(None),
        }
    }

    fn reduce_phase(pending: &PendingRead) -> Result<Vec<FrameStat>, TickError> {
        pending
            .frames
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(offset, frame)| {
                reduce(frame).map_err(|source| TickError::Frame {
                    index: pending.start + offset,
                    source,
                })
            })
            .collect()
    }

    fn commit_phase(
        &self,
        session_id: u64,
        pending: &PendingRead,
        stats: &[FrameStat],
    ) -> TickOutcome {
        let mut session = self.lock_session();
        let committed = match session.as_mut() {
            Some(s) if s.id == session_id => s
                .cursor
                .commit(pending)
                .then(|| s.normalizer.observe_all(stats)),
            _ => None,
        };
        match committed {
            Some(fractions) => {
                log::debug!(
                    "Session {session_id}: committed frames {}..{}",
                    pending.start,
                    pending.end
                );
                TickOutcome::Processed {
                    session_id,
                    fractions,
                }
            }
            None => {
                log::info!(
                    "Session {session_id} changed during the tick; discarding {} frames",
                    pending.len()
                );
                TickOutcome::Discarded { session_id }
            }
        }
    }

    fn broadcast_phase(&self, fractions: &[NormalizedFraction]) {
        for fraction in fractions {
            if let Err(e) = self.hub.broadcast_json(fraction) {
                log::error!("Failed to serialize fraction {fraction:?}: {e}");
            }
        }
        self.hub.broadcast(&Payload::from(END_OF_BATCH));
    }

    /// Shape of the open dataset after a refresh
    pub fn shape(&self) -> Result<Vec<usize>, SessionError> {
        let mut session = self.lock_session();
        let session = session.as_mut().ok_or(SessionError::DatasetUninitialized)?;
        Ok(session.cursor.shape()?)
    }

    /// The last `n` fractions as they were emitted, oldest first
    pub fn latest_fractions(&self, n: usize) -> Result<Vec<NormalizedFraction>, SessionError> {
        let session = self.lock_session();
        let session = session.as_ref().ok_or(SessionError::DatasetUninitialized)?;
        Ok(session.normalizer.latest(n).to_vec())
    }

    /// Top level groups of the current (or default) file
    pub fn groups(&self) -> Result<Vec<String>, SessionError> {
        let path = match self.lock_session().as_ref() {
            Some(session) => session.path(),
            None => self.defaults.filepath.join(&self.defaults.filename),
        };
        self.list_groups(&path)
    }

    fn list_groups(&self, path: &Path) -> Result<Vec<String>, SessionError> {
        self.opener
            .list_groups(path)
            .map_err(|e| SessionError::SessionOpenFailure(e.to_string()))
    }

    pub fn state(&self) -> RunStateView {
        let session = self.lock_session();
        let subscribers = self.hub.len();
        match session.as_ref() {
            Some(s) => RunStateView {
                state: if self.processing.load(Ordering::Acquire) {
                    PipelineState::Processing
                } else {
                    PipelineState::Armed
                },
                session_id: Some(s.id),
                filepath: s.filepath.clone(),
                filename: s.filename.clone(),
                dataset_name: s.dataset_name.clone(),
                cursor_position: s.cursor.position(),
                accumulated_stats: s.normalizer.history().to_vec(),
                subscribers,
                opened_at: Some(s.opened_at.clone()),
            },
            None => RunStateView {
                state: PipelineState::Idle,
                session_id: None,
                filepath: self.defaults.filepath.clone(),
                filename: self.defaults.filename.clone(),
                dataset_name: self.defaults.dataset_name.clone(),
                cursor_position: 0,
                accumulated_stats: vec![],
                subscribers,
                opened_at: None,
            },
        }
    }
}
