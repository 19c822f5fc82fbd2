use ndarray::Axis;

use super::error::CursorError;
use super::source::{Frame, FrameSource};

/// Frames read from the dataset but not yet committed to the cursor
#[derive(Debug, Clone)]
pub struct PendingRead {
    pub start: usize,
    pub end: usize,
    /// Frames `start..end`, stacked along axis 0
    pub frames: Frame,
}

impl PendingRead {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Split the stack into single frames, oldest first
    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
            .axis_iter(Axis(0))
            .map(|frame| frame.to_owned())
            .collect()
    }
}

/// Tracks how far into an append-only dataset we have read.
///
/// Every read window starts at the cursor position and ends at the extent observed after an
/// explicit refresh, so each frame is read exactly once. The cursor only moves when a read
/// is committed; a failed read leaves it where it was.
pub struct DatasetCursor {
    source: Box<dyn FrameSource>,
    position: usize,
}

impl std::fmt::Debug for DatasetCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetCursor")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl DatasetCursor {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self {
            source,
            position: 0,
        }
    }

    /// Number of frames already consumed
    pub fn position(&self) -> usize {
        self.position
    }

    /// Refresh and return the full dataset shape
    pub fn shape(&mut self) -> Result<Vec<usize>, CursorError> {
        self.source.refresh().map_err(CursorError::from_source)?;
        self.source.shape().map_err(CursorError::from_source)
    }

    /// Refresh the dataset and read every frame appended since the cursor position.
    ///
    /// The cursor is not advanced; pass the result to `commit` once it has been consumed.
    pub fn read_pending(&mut self) -> Result<PendingRead, CursorError> {
        self.source.refresh().map_err(CursorError::from_source)?;
        let extent = self.source.n_frames().map_err(CursorError::from_source)?;
        if extent < self.position {
            return Err(CursorError::DatasetShrank(self.position, extent));
        }

        let frames = self
            .source
            .read_frames(self.position, extent)
            .map_err(CursorError::from_source)?;
        Ok(PendingRead {
            start: self.position,
            end: extent,
            frames,
        })
    }

    /// Advance past a pending read. Returns false (and stays put) if the read did not start
    /// at the current position.
    pub fn commit(&mut self, pending: &PendingRead) -> bool {
        if pending.start != self.position {
            return false;
        }
        self.position = pending.end;
        true
    }

    /// Read the frames appended since the last call, oldest first, and advance past them
    pub fn refresh_and_read_new(&mut self) -> Result<Vec<Frame>, CursorError> {
        let pending = self.read_pending()?;
        self.commit(&pending);
        Ok(pending.into_frames())
    }
}
