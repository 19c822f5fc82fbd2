use ndarray::{ArrayD, Axis, IxDyn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::SourceError;

/// A single detector frame (HxW or HxWxC), or a stack of them along axis 0
pub type Frame = ArrayD<u64>;

/// Read side of an append-only frame dataset.
///
/// The shape reported by a source is the extent observed at its last `refresh`; a writer
/// may have appended more frames since then.
pub trait FrameSource: Send {
    /// Re-read the extent committed by the writer
    fn refresh(&mut self) -> Result<(), SourceError>;

    /// Full dataset shape as of the last refresh, leading axis is the frame axis
    fn shape(&self) -> Result<Vec<usize>, SourceError>;

    /// Read frames `start..end` as a stack along axis 0
    fn read_frames(&self, start: usize, end: usize) -> Result<Frame, SourceError>;

    fn n_frames(&self) -> Result<usize, SourceError> {
        Ok(self.shape()?.first().copied().unwrap_or(0))
    }
}

/// Opens FrameSources by file path and dataset name
pub trait SourceOpener: Send + Sync {
    fn open(&self, path: &Path, dataset_name: &str) -> Result<Box<dyn FrameSource>, SourceError>;

    /// Names of the top level groups (or datasets) in a file
    fn list_groups(&self, path: &Path) -> Result<Vec<String>, SourceError>;
}

/// An opener that refuses everything, used when no storage backend is compiled in
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedOpener;

impl SourceOpener for UnsupportedOpener {
    fn open(&self, _path: &Path, _dataset_name: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        Err(SourceError::Unsupported("HDF5 files"))
    }

    fn list_groups(&self, _path: &Path) -> Result<Vec<String>, SourceError> {
        Err(SourceError::Unsupported("HDF5 files"))
    }
}

#[derive(Debug)]
struct MemoryInner {
    frame_shape: Vec<usize>,
    frames: Vec<Frame>,
    failing_reads: usize,
}

/// An in-memory append-only frame dataset.
///
/// Clones share the same frames, so a test (or a simulated writer) can keep appending
/// while a MemorySource reads from it.
#[derive(Debug, Clone)]
pub struct MemoryDataset {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryDataset {
    pub fn new(frame_shape: &[usize]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                frame_shape: frame_shape.to_vec(),
                frames: Vec::new(),
                failing_reads: 0,
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, SourceError> {
        self.inner
            .lock()
            .map_err(|e| SourceError::Storage(format!("memory dataset lock poisoned: {e}")))
    }

    /// Append a frame; its shape must match the dataset frame shape
    pub fn append(&self, frame: Frame) -> Result<(), SourceError> {
        let mut inner = self.lock()?;
        if frame.shape() != inner.frame_shape.as_slice() {
            return Err(SourceError::Storage(format!(
                "frame shape {:?} does not match dataset frame shape {:?}",
                frame.shape(),
                inner.frame_shape
            )));
        }
        inner.frames.push(frame);
        Ok(())
    }

    /// Append a frame with every pixel set to `value`
    pub fn append_filled(&self, value: u64) -> Result<(), SourceError> {
        let shape = self.lock()?.frame_shape.clone();
        self.append(ArrayD::from_elem(IxDyn(&shape), value))
    }

    /// Make the next `n` reads fail with a storage error
    pub fn fail_next_reads(&self, n: usize) -> Result<(), SourceError> {
        self.lock()?.failing_reads = n;
        Ok(())
    }

    /// Drop frames past `len`, as a writer that restarted its file would
    pub fn truncate(&self, len: usize) -> Result<(), SourceError> {
        self.lock()?.frames.truncate(len);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.frames.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A reader over this dataset; it starts with no frames visible until refreshed
    pub fn source(&self) -> MemorySource {
        MemorySource {
            dataset: self.clone(),
            visible: 0,
        }
    }
}

/// Reader over a MemoryDataset with refresh semantics matching an SWMR reader
#[derive(Debug)]
pub struct MemorySource {
    dataset: MemoryDataset,
    visible: usize,
}

impl FrameSource for MemorySource {
    fn refresh(&mut self) -> Result<(), SourceError> {
        self.visible = self.dataset.lock()?.frames.len();
        Ok(())
    }

    fn shape(&self) -> Result<Vec<usize>, SourceError> {
        let inner = self.dataset.lock()?;
        let mut shape = vec![self.visible];
        shape.extend_from_slice(&inner.frame_shape);
        Ok(shape)
    }

    fn read_frames(&self, start: usize, end: usize) -> Result<Frame, SourceError> {
        let mut inner = self.dataset.lock()?;
        if inner.failing_reads > 0 {
            inner.failing_reads -= 1;
            return Err(SourceError::Storage(String::from("injected read failure")));
        }
        if start > end || end > self.visible || end > inner.frames.len() {
            return Err(SourceError::OutOfRange(start, end, self.visible));
        }
        if start == end {
            let mut shape = vec![0];
            shape.extend_from_slice(&inner.frame_shape);
            return Ok(ArrayD::zeros(IxDyn(&shape)));
        }
        let views: Vec<_> = inner.frames[start..end].iter().map(|f| f.view()).collect();
        ndarray::stack(Axis(0), &views).map_err(|e| SourceError::Storage(e.to_string()))
    }
}

/// Opener over a set of named MemoryDatasets, keyed by file path
#[derive(Debug, Default, Clone)]
pub struct MemoryOpener {
    files: Arc<Mutex<HashMap<PathBuf, HashMap<String, MemoryDataset>>>>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset under a file path; replaces any dataset of the same name
    pub fn insert(
        &self,
        path: &Path,
        dataset_name: &str,
        dataset: MemoryDataset,
    ) -> Result<(), SourceError> {
        let mut files = self.lock()?;
        files
            .entry(path.to_path_buf())
            .or_default()
            .insert(dataset_name.trim_matches('/').to_string(), dataset);
        Ok(())
    }

    fn lock(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<PathBuf, HashMap<String, MemoryDataset>>>, SourceError>
    {
        self.files
            .lock()
            .map_err(|e| SourceError::Storage(format!("memory opener lock poisoned: {e}")))
    }
}

impl SourceOpener for MemoryOpener {
    fn open(&self, path: &Path, dataset_name: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        let files = self.lock()?;
        let datasets = files
            .get(path)
            .ok_or_else(|| SourceError::FileNotFound(path.to_path_buf()))?;
        let dataset = datasets
            .get(dataset_name.trim_matches('/'))
            .ok_or_else(|| SourceError::DatasetNotFound(dataset_name.to_string()))?;
        let mut source = dataset.source();
        source.refresh()?;
        Ok(Box::new(source))
    }

    fn list_groups(&self, path: &Path) -> Result<Vec<String>, SourceError> {
        let files = self.lock()?;
        let datasets = files
            .get(path)
            .ok_or_else(|| SourceError::FileNotFound(path.to_path_buf()))?;
        let mut groups: Vec<String> = datasets
            .keys()
            .filter_map(|name| name.split('/').next())
            .map(String::from)
            .collect();
        groups.sort();
        groups.dedup();
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appended_frames_are_invisible_until_refresh() {
        let dataset = MemoryDataset::new(&[3, 2]);
        let mut source = dataset.source();
        dataset.append_filled(1).unwrap();
        assert_eq!(source.shape().unwrap(), vec![0, 3, 2]);
        source.refresh().unwrap();
        assert_eq!(source.shape().unwrap(), vec![1, 3, 2]);
        assert!(source.read_frames(0, 2).is_err());
    }

    #[test]
    fn read_frames_stacks_in_order() {
        let dataset = MemoryDataset::new(&[3, 1]);
        for value in 0..4 {
            dataset.append_filled(value).unwrap();
        }
        let mut source = dataset.source();
        source.refresh().unwrap();
        let stack = source.read_frames(1, 3).unwrap();
        assert_eq!(stack.shape(), &[2, 3, 1]);
        assert_eq!(stack[[0, 0, 0]], 1);
        assert_eq!(stack[[1, 2, 0]], 2);
        assert_eq!(source.read_frames(2, 2).unwrap().shape(), &[0, 3, 1]);
    }

    #[test]
    fn wrong_frame_shape_is_refused() {
        let dataset = MemoryDataset::new(&[3, 3]);
        assert!(dataset.append(ArrayD::zeros(IxDyn(&[3, 4]))).is_err());
        assert!(dataset.is_empty());
    }

    #[test]
    fn opener_reports_missing_file_and_dataset() {
        let opener = MemoryOpener::new();
        let path = Path::new("/data/run.h5");
        opener
            .insert(path, "entry/instrument/detector/data", MemoryDataset::new(&[3, 3]))
            .unwrap();

        assert!(matches!(
            opener.open(Path::new("/data/other.h5"), "entry"),
            Err(SourceError::FileNotFound(_))
        ));
        assert!(matches!(
            opener.open(path, "entry/missing"),
            Err(SourceError::DatasetNotFound(_))
        ));
        assert!(opener.open(path, "/entry/instrument/detector/data").is_ok());
        assert_eq!(opener.list_groups(path).unwrap(), vec![String::from("entry")]);
    }
}
