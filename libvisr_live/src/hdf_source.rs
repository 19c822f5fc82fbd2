use hdf5::plist::FileAccess;
use hdf5::types::{FloatSize, IntSize, TypeDescriptor};
use hdf5::{Dataset, File, H5Type};
use hdf5_sys::h5d::H5Drefresh;
use hdf5_sys::h5f::{H5Fopen, H5F_ACC_RDONLY, H5F_ACC_SWMR_READ};
use ndarray::{s, ArrayD, IxDyn};
use std::ffi::CString;
use std::path::{Path, PathBuf};

use super::error::SourceError;
use super::source::{Frame, FrameSource, SourceOpener};

/// Open a file read-only in SWMR mode with the latest file format.
///
/// A reader opened this way may follow a file that a writer is appending to in SWMR
/// mode; metadata read mid-flush is retried by the library instead of failing.
fn open_swmr(path: &Path) -> Result<File, SourceError> {
    if !path.exists() {
        return Err(SourceError::FileNotFound(path.to_path_buf()));
    }
    let c_path = path
        .to_str()
        .and_then(|p| CString::new(p).ok())
        .ok_or_else(|| SourceError::Storage(format!("path {path:?} cannot be passed to HDF5")))?;
    let fapl = FileAccess::build().libver_latest().finish()?;
    let id = hdf5::sync::sync(|| unsafe {
        H5Fopen(c_path.as_ptr(), H5F_ACC_RDONLY | H5F_ACC_SWMR_READ, fapl.id())
    });
    if id < 0 {
        return Err(SourceError::Storage(format!(
            "could not open {path:?} for SWMR reading"
        )));
    }
    Ok(hdf5::from_id::<File>(id)?)
}

/// A read-only SWMR view of an append-only detector dataset in an HDF5 file.
///
/// The dataset layout is NxHxW or NxHxWxC where N grows as the detector writes. The file
/// stays open for the life of the source; `refresh` asks the library to reload the
/// dataset metadata so the extent last flushed by the writer becomes visible.
#[derive(Debug)]
pub struct Hdf5Source {
    path: PathBuf,
    dataset_name: String,
    _file: File,
    dataset: Dataset,
    shape: Vec<usize>,
}

impl Hdf5Source {
    /// Open the dataset `dataset_name` in the file at `path`
    pub fn open(path: &Path, dataset_name: &str) -> Result<Self, SourceError> {
        let file = open_swmr(path)?;
        let dataset = file
            .dataset(dataset_name)
            .map_err(|_| SourceError::DatasetNotFound(dataset_name.to_string()))?;
        let shape = Self::checked_shape(&dataset)?;
        Ok(Self {
            path: path.to_path_buf(),
            dataset_name: dataset_name.to_string(),
            _file: file,
            dataset,
            shape,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn checked_shape(dataset: &Dataset) -> Result<Vec<usize>, SourceError> {
        let shape = dataset.shape();
        if shape.len() != 3 && shape.len() != 4 {
            return Err(SourceError::BadRank(shape.len()));
        }
        Ok(shape)
    }

    /// Read a block of frames of element type T, converting each element to u64
    fn read_as<T>(
        dataset: &Dataset,
        start: usize,
        end: usize,
        rank: usize,
        convert: fn(T) -> u64,
    ) -> Result<Frame, SourceError>
    where
        T: H5Type + Copy,
    {
        let block = match rank {
            3 => dataset.read_slice::<T, _, IxDyn>(s![start..end, .., ..])?,
            4 => dataset.read_slice::<T, _, IxDyn>(s![start..end, .., .., ..])?,
            other => return Err(SourceError::BadRank(other)),
        };
        Ok(block.mapv(convert))
    }
}

impl FrameSource for Hdf5Source {
    fn refresh(&mut self) -> Result<(), SourceError> {
        let id = self.dataset.id();
        let status = hdf5::sync::sync(|| unsafe { H5Drefresh(id) });
        if status < 0 {
            return Err(SourceError::Storage(format!(
                "refresh of dataset {} failed",
                self.dataset_name
            )));
        }
        self.shape = Self::checked_shape(&self.dataset)?;
        Ok(())
    }

    fn shape(&self) -> Result<Vec<usize>, SourceError> {
        Ok(self.shape.clone())
    }

    fn read_frames(&self, start: usize, end: usize) -> Result<Frame, SourceError> {
        let available = self.shape.first().copied().unwrap_or(0);
        if start > end || end > available {
            return Err(SourceError::OutOfRange(start, end, available));
        }
        if start == end {
            let mut shape = self.shape.clone();
            shape[0] = 0;
            return Ok(ArrayD::zeros(IxDyn(&shape)));
        }

        let dataset = &self.dataset;
        let rank = self.shape.len();
        match dataset.dtype()?.to_descriptor()? {
            TypeDescriptor::Unsigned(IntSize::U1) => {
                Self::read_as::<u8>(dataset, start, end, rank, u64::from)
            }
            TypeDescriptor::Unsigned(IntSize::U2) => {
                Self::read_as::<u16>(dataset, start, end, rank, u64::from)
            }
            TypeDescriptor::Unsigned(IntSize::U4) => {
                Self::read_as::<u32>(dataset, start, end, rank, u64::from)
            }
            TypeDescriptor::Unsigned(IntSize::U8) => {
                Self::read_as::<u64>(dataset, start, end, rank, |v| v)
            }
            // Negative counts carry no intensity
            TypeDescriptor::Integer(IntSize::U1) => {
                Self::read_as::<i8>(dataset, start, end, rank, |v| v.max(0) as u64)
            }
            TypeDescriptor::Integer(IntSize::U2) => {
                Self::read_as::<i16>(dataset, start, end, rank, |v| v.max(0) as u64)
            }
            TypeDescriptor::Integer(IntSize::U4) => {
                Self::read_as::<i32>(dataset, start, end, rank, |v| v.max(0) as u64)
            }
            TypeDescriptor::Integer(IntSize::U8) => {
                Self::read_as::<i64>(dataset, start, end, rank, |v| v.max(0) as u64)
            }
            TypeDescriptor::Float(FloatSize::U4) => {
                Self::read_as::<f32>(dataset, start, end, rank, |v| v.max(0.0).round() as u64)
            }
            TypeDescriptor::Float(FloatSize::U8) => {
                Self::read_as::<f64>(dataset, start, end, rank, |v| v.max(0.0).round() as u64)
            }
            other => Err(SourceError::Storage(format!(
                "unsupported element type {other:?} in dataset {}",
                self.dataset_name
            ))),
        }
    }
}

/// Opens Hdf5Sources read-only in SWMR mode
#[derive(Debug, Default, Clone, Copy)]
pub struct Hdf5Opener;

impl SourceOpener for Hdf5Opener {
    fn open(&self, path: &Path, dataset_name: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        Ok(Box::new(Hdf5Source::open(path, dataset_name)?))
    }

    fn list_groups(&self, path: &Path) -> Result<Vec<String>, SourceError> {
        let file = open_swmr(path)?;
        Ok(file.member_names()?)
    }
}

#[cfg(all(test, feature = "hdf5"))]
mod tests {
    use super::*;
    use hdf5_sys::h5f::H5Fstart_swmr_write;
    use ndarray::Array3;

    const FRAME: (usize, usize) = (3, 2);

    fn latest_format_file(path: &Path) -> File {
        File::with_options()
            .with_fapl(|p| p.libver_latest())
            .create(path)
            .unwrap()
    }

    fn create_frames<T: H5Type>(file: &File) -> Dataset {
        let entry = file.create_group("entry").unwrap();
        entry
            .new_dataset::<T>()
            .shape((0.., FRAME.0, FRAME.1))
            .chunk((1, FRAME.0, FRAME.1))
            .create("data")
            .unwrap()
    }

    /// Grow the dataset to `end` frames; frame k is filled with `value(k)`
    fn append<T: H5Type + Copy>(dataset: &Dataset, start: usize, end: usize, value: fn(usize) -> T) {
        dataset.resize((end, FRAME.0, FRAME.1)).unwrap();
        let frames = Array3::from_shape_fn((end - start, FRAME.0, FRAME.1), |(i, _, _)| {
            value(start + i)
        });
        dataset
            .write_slice(frames.view(), s![start..end, .., ..])
            .unwrap();
    }

    #[test]
    fn refresh_sees_frames_flushed_by_swmr_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.h5");
        let writer = latest_format_file(&path);
        let dataset = create_frames::<u16>(&writer);
        append(&dataset, 0, 5, |k| k as u16);
        drop(dataset);
        let status = hdf5::sync::sync(|| unsafe { H5Fstart_swmr_write(writer.id()) });
        assert!(status >= 0);
        let dataset = writer.dataset("entry/data").unwrap();

        let mut source = Hdf5Source::open(&path, "entry/data").unwrap();
        assert_eq!(source.shape().unwrap(), vec![5, 3, 2]);

        append(&dataset, 5, 8, |k| k as u16);
        writer.flush().unwrap();
        // nothing new is visible until the next refresh
        assert_eq!(source.n_frames().unwrap(), 5);
        source.refresh().unwrap();
        assert_eq!(source.shape().unwrap(), vec![8, 3, 2]);

        let frames = source.read_frames(5, 8).unwrap();
        assert_eq!(frames.shape(), &[3, 3, 2]);
        let firsts: Vec<u64> = (0..3).map(|i| frames[[i, 0, 0]]).collect();
        assert_eq!(firsts, vec![5, 6, 7]);
        assert!(source.read_frames(6, 9).is_err());
    }

    #[test]
    fn signed_and_float_values_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let signed_path = dir.path().join("signed.h5");
        {
            let file = latest_format_file(&signed_path);
            let dataset = create_frames::<i16>(&file);
            append(&dataset, 0, 2, |k| if k == 0 { -7 } else { 300 });
        }
        let source = Hdf5Source::open(&signed_path, "entry/data").unwrap();
        let frames = source.read_frames(0, 2).unwrap();
        assert_eq!(frames[[0, 1, 1]], 0);
        assert_eq!(frames[[1, 2, 0]], 300);

        let float_path = dir.path().join("float.h5");
        {
            let file = latest_format_file(&float_path);
            let dataset = create_frames::<f32>(&file);
            append(&dataset, 0, 2, |k| if k == 0 { -1.5 } else { 2.6 });
        }
        let source = Hdf5Source::open(&float_path, "/entry/data").unwrap();
        let frames = source.read_frames(0, 2).unwrap();
        assert_eq!(frames[[0, 0, 0]], 0);
        assert_eq!(frames[[1, 0, 1]], 3);
        assert_eq!(source.read_frames(2, 2).unwrap().shape(), &[0, 3, 2]);
    }

    #[test]
    fn bad_rank_and_missing_names_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.h5");
        {
            let file = latest_format_file(&path);
            file.new_dataset::<u8>()
                .shape((4, 4))
                .create("flat")
                .unwrap();
            create_frames::<u8>(&file);
        }
        assert!(matches!(Hdf5Source::open(&path, "flat"), Err(SourceError::BadRank(2))));
        assert!(matches!(
            Hdf5Source::open(&path, "entry/missing"),
            Err(SourceError::DatasetNotFound(_))
        ));
        assert!(matches!(
            Hdf5Opener.open(&dir.path().join("absent.h5"), "entry/data"),
            Err(SourceError::FileNotFound(_))
        ));

        let mut groups = Hdf5Opener.list_groups(&path).unwrap();
        groups.sort();
        assert_eq!(groups, vec![String::from("entry"), String::from("flat")]);
    }
}
