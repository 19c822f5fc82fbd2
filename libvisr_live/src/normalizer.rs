use serde::{Deserialize, Serialize};

use super::reducer::{FrameStat, N_CHANNELS};

/// A FrameStat normalized against the running min/max of its session.
///
/// Each component lies in [0, 1]. A channel whose min equals its max is reported as 0.0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedFraction {
    pub r: f64,
    pub g: f64,
    pub b: f64,
    pub total: f64,
}

impl NormalizedFraction {
    fn from_channels(values: [f64; N_CHANNELS]) -> Self {
        Self {
            r: values[0],
            g: values[1],
            b: values[2],
            total: values[3],
        }
    }

    pub fn channels(&self) -> [f64; N_CHANNELS] {
        [self.r, self.g, self.b, self.total]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    min: u64,
    max: u64,
}

impl Extent {
    fn include(&mut self, value: u64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn fraction(&self, value: u64) -> f64 {
        if self.max == self.min {
            return 0.0;
        }
        // Differences are taken in integer space so large counts keep their precision
        ((value - self.min) as f64 / (self.max - self.min) as f64).clamp(0.0, 1.0)
    }
}

/// Running per-channel min/max normalization over a session of FrameStats.
///
/// The history is append-only, so the running extrema are exact over everything seen so
/// far. Emitted fractions describe the history as of their own frame and are never
/// recomputed afterwards.
#[derive(Debug, Clone, Default)]
pub struct RunningNormalizer {
    extents: Option<[Extent; N_CHANNELS]>,
    history: Vec<FrameStat>,
    fractions: Vec<NormalizedFraction>,
}

impl RunningNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stat to the history and return its fraction
    pub fn observe(&mut self, stat: FrameStat) -> NormalizedFraction {
        let values = stat.channels();
        let extents = self.extents.get_or_insert_with(|| {
            values.map(|value| Extent {
                min: value,
                max: value,
            })
        });

        let mut fractions = [0.0; N_CHANNELS];
        for ((extent, value), fraction) in extents.iter_mut().zip(values).zip(fractions.iter_mut())
        {
            extent.include(value);
            *fraction = extent.fraction(value);
        }

        let fraction = NormalizedFraction::from_channels(fractions);
        self.history.push(stat);
        self.fractions.push(fraction);
        fraction
    }

    /// Observe a batch in order, returning one fraction per stat
    pub fn observe_all(&mut self, stats: &[FrameStat]) -> Vec<NormalizedFraction> {
        stats.iter().map(|stat| self.observe(*stat)).collect()
    }

    pub fn history(&self) -> &[FrameStat] {
        &self.history
    }

    pub fn fractions(&self) -> &[NormalizedFraction] {
        &self.fractions
    }

    /// The last `n` emitted fractions, oldest first
    pub fn latest(&self, n: usize) -> &[NormalizedFraction] {
        let start = self.fractions.len().saturating_sub(n);
        &self.fractions[start..]
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn reset(&mut self) {
        self.extents = None;
        self.history.clear();
        self.fractions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn stat(r: u64, g: u64, b: u64) -> FrameStat {
        FrameStat::new(r, g, b)
    }

    #[test]
    fn fractions_stay_in_unit_interval() {
        let mut rng = rand::thread_rng();
        let mut normalizer = RunningNormalizer::new();
        for _ in 0..500 {
            let fraction = normalizer.observe(stat(
                rng.gen_range(0..1_000_000),
                rng.gen_range(0..10),
                rng.gen(),
            ));
            for value in fraction.channels() {
                assert!((0.0..=1.0).contains(&value), "{value} out of range");
            }
        }
        assert_eq!(normalizer.len(), 500);
    }

    #[test]
    fn constant_channel_is_always_zero() {
        let mut rng = rand::thread_rng();
        let mut normalizer = RunningNormalizer::new();
        for _ in 0..100 {
            let fraction = normalizer.observe(stat(42, rng.gen_range(0..100), 7));
            assert_eq!(fraction.r, 0.0);
            assert_eq!(fraction.b, 0.0);
        }
    }

    #[test]
    fn new_extremes_are_exact() {
        let mut normalizer = RunningNormalizer::new();
        normalizer.observe(stat(10, 10, 10));
        let up = normalizer.observe(stat(20, 20, 20));
        assert_eq!(up, NormalizedFraction { r: 1.0, g: 1.0, b: 1.0, total: 1.0 });
        let down = normalizer.observe(stat(5, 5, 5));
        assert_eq!(down, NormalizedFraction::default());
        let middle = normalizer.observe(stat(15, 15, 15));
        assert_eq!(middle.r, 10.0 / 15.0);
    }

    #[test]
    fn zero_frames_then_bright_frame() {
        let mut normalizer = RunningNormalizer::new();
        assert_eq!(normalizer.observe(stat(0, 0, 0)), NormalizedFraction::default());
        assert_eq!(normalizer.observe(stat(0, 0, 0)), NormalizedFraction::default());
        let bright = normalizer.observe(stat(100, 200, 300));
        assert_eq!(bright, NormalizedFraction { r: 1.0, g: 1.0, b: 1.0, total: 1.0 });
        // earlier fractions are kept as emitted
        assert_eq!(normalizer.fractions()[0], NormalizedFraction::default());
    }

    #[test]
    fn latest_returns_tail_in_order() {
        let mut normalizer = RunningNormalizer::new();
        let emitted = normalizer.observe_all(&[stat(0, 0, 0), stat(1, 1, 1), stat(2, 2, 2)]);
        assert_eq!(normalizer.latest(2), &emitted[1..]);
        assert_eq!(normalizer.latest(10).len(), 3);
        assert!(normalizer.latest(0).is_empty());

        normalizer.reset();
        assert!(normalizer.is_empty());
        assert!(normalizer.latest(5).is_empty());
    }
}
