use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Invalid frame shape {0:?}; expected HxW or HxWxC with H >= 3")]
    InvalidFrameShape(Vec<usize>),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Frame source could not find file {0:?}")]
    FileNotFound(PathBuf),
    #[error("Frame source could not find dataset {0} in the file")]
    DatasetNotFound(String),
    #[error("Frame source was asked for frames {0}..{1} but only {2} are available")]
    OutOfRange(usize, usize, usize),
    #[error("Frame source dataset has rank {0}; expected 3 (NxHxW) or 4 (NxHxWxC)")]
    BadRank(usize),
    #[error("Frame source is closed")]
    Closed,
    #[error("Frame source storage error: {0}")]
    Storage(String),
    #[error("Frame source was built without support for {0}")]
    Unsupported(&'static str),
}

#[cfg(feature = "hdf5")]
impl From<hdf5::Error> for SourceError {
    fn from(value: hdf5::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("DatasetCursor failed because the dataset is unavailable: {0}")]
    DatasetUnavailable(SourceError),
    #[error("DatasetCursor failed to read frames: {0}")]
    DatasetReadFailure(SourceError),
    #[error("DatasetCursor saw the dataset shrink from {0} to {1} frames")]
    DatasetShrank(usize, usize),
}

impl CursorError {
    /// Sort a storage level error into the cursor taxonomy
    pub fn from_source(err: SourceError) -> Self {
        match err {
            SourceError::FileNotFound(_) | SourceError::DatasetNotFound(_) | SourceError::Closed => {
                Self::DatasetUnavailable(err)
            }
            _ => Self::DatasetReadFailure(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session failed to open: dataset {0} not found")]
    DatasetNotFound(String),
    #[error("Session is not initialized; set a dataset first")]
    DatasetUninitialized,
    #[error("Session failed to open: {0}")]
    SessionOpenFailure(String),
    #[error("Session failed to open because of the frame shape: {0}")]
    InvalidFrameShape(#[from] FrameError),
    #[error("Session failed due to cursor error: {0}")]
    CursorError(#[from] CursorError),
}

#[derive(Debug, Error)]
pub enum TickError {
    #[error("Tick aborted due to cursor error: {0}")]
    Cursor(#[from] CursorError),
    #[error("Tick aborted due to frame error at frame {index}: {source}")]
    Frame { index: usize, source: FrameError },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriberSendFailure {
    #[error("Subscriber queue is full")]
    QueueFull,
    #[error("Subscriber is disconnected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum StompError {
    #[error("STOMP client failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("STOMP frame was malformed: {0}")]
    MalformedFrame(String),
    #[error("STOMP broker rejected the connection: {0}")]
    ConnectRejected(String),
    #[error("STOMP broker closed the connection")]
    ConnectionClosed,
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watcher failed due to notify error: {0}")]
    NotifyError(#[from] notify::Error),
    #[error("Watcher could not watch {0:?} as it does not exist")]
    BadWatchPath(PathBuf),
    #[error("Watcher failed due to STOMP error: {0}")]
    StompError(#[from] StompError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid bind address {0}")]
    BadBindAddress(String),
    #[error("Config subscriber_queue_depth must be at least 1")]
    BadQueueDepth,
    #[error("Config has an invalid log level {0}")]
    BadLogLevel(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Server failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Server failed due to watcher error: {0}")]
    WatcherError(#[from] WatcherError),
    #[error("Server failed due to config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Server failed due to session error: {0}")]
    SessionError(#[from] SessionError),
}
