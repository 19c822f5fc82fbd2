use ndarray::{ArrayViewD, Axis};
use serde::{Deserialize, Serialize};

use super::error::FrameError;

/// Number of horizontal bands a frame is split into
pub const N_BANDS: usize = 3;
/// Number of channels in a FrameStat (the bands plus the total)
pub const N_CHANNELS: usize = N_BANDS + 1;

/// The reduced statistic of one frame.
///
/// `r`, `g` and `b` are the summed intensities of the top, middle and bottom bands of the
/// frame, `total` is the sum of the whole frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStat {
    pub r: u64,
    pub g: u64,
    pub b: u64,
    pub total: u64,
}

impl FrameStat {
    pub fn new(r: u64, g: u64, b: u64) -> Self {
        Self {
            r,
            g,
            b,
            total: r.saturating_add(g).saturating_add(b),
        }
    }

    /// The channel view, in r, g, b, total order
    pub fn channels(&self) -> [u64; N_CHANNELS] {
        [self.r, self.g, self.b, self.total]
    }
}

/// Band heights for a frame of height `height`: the last band takes the remainder
pub fn band_heights(height: usize) -> [usize; N_BANDS] {
    let segment = height / N_BANDS;
    [segment, segment, height - 2 * segment]
}

/// Check that a single frame shape (no leading frame axis) can be reduced
pub fn validate_frame_shape(shape: &[usize]) -> Result<(), FrameError> {
    match shape {
        [h, _] | [h, _, _] if *h >= N_BANDS => Ok(()),
        _ => Err(FrameError::InvalidFrameShape(shape.to_vec())),
    }
}

/// Reduce a frame (HxW or HxWxC) to its FrameStat.
///
/// Frames of any other rank, or shorter than three rows, are rejected.
pub fn reduce<T>(frame: ArrayViewD<'_, T>) -> Result<FrameStat, FrameError>
where
    T: Copy + Into<u64>,
{
    validate_frame_shape(frame.shape())?;
    let heights = band_heights(frame.shape()[0]);

    let mut sums = [0u64; N_BANDS];
    let mut start = 0;
    for (sum, height) in sums.iter_mut().zip(heights) {
        let band = frame.slice_axis(Axis(0), (start..start + height).into());
        *sum = band
            .iter()
            .fold(0u64, |acc, value| acc.saturating_add((*value).into()));
        start += height;
    }

    Ok(FrameStat::new(sums[0], sums[1], sums[2]))
}
