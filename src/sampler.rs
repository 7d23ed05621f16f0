//! Frame sampling plans.
//!
//! A plan visits `start, start + step, start + 2*step, ...` within an
//! inclusive range and never yields more than a ceiling derived from the
//! source length. The ceiling bounds decode and inference cost on long
//! sources regardless of the requested rate.

/// Requested sampling density.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SamplingRate {
    /// Visit every frame (subject to the ceiling).
    Every,
    /// Keep roughly `target` frames per second of a `source`-fps stream.
    Fps { target: f64, source: f64 },
    /// Keep roughly `n` items out of every 100.
    PerHundred(i32),
}

/// Default per-100 density used when a requested density is out of range.
pub const DEFAULT_PER_HUNDRED: i32 = 20;

impl SamplingRate {
    /// Step size before the ceiling is applied. Always at least 1.
    pub fn raw_step(&self, total: u64) -> u64 {
        match *self {
            SamplingRate::Every => 1,
            SamplingRate::Fps { target, source } => {
                if !(target > 0.0) || !(source > 0.0) {
                    return 1;
                }
                ((source / target).round() as u64).max(1)
            }
            SamplingRate::PerHundred(n) if n <= 0 => count_based_step(total),
            SamplingRate::PerHundred(n) => {
                let n = if n > 100 { DEFAULT_PER_HUNDRED } else { n };
                (100 / n as u64) + 1
            }
        }
    }
}

fn count_based_step(total: u64) -> u64 {
    match total {
        0..=500 => 5,
        501..=1000 => 10,
        _ => 50,
    }
}

/// Maximum number of samples taken from a source of `total` items.
pub fn sample_cap(total: u64) -> u64 {
    match total {
        0..=200 => total,
        201..=1000 => total / 20 + 1,
        1001..=4000 => total / 50 + 1,
        4001..=6000 => total / 20 + 1,
        _ => 600,
    }
}

/// Resolved sampling plan over `[start, end]` of a source with `total` items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplePlan {
    pub start: u64,
    /// Inclusive. Meaningless when the plan is empty.
    pub end: u64,
    pub step: u64,
    pub cap: u64,
    empty: bool,
}

impl SamplePlan {
    /// `end = None` means the last item.
    pub fn new(total: u64, start: u64, end: Option<u64>, rate: SamplingRate) -> Self {
        let cap = sample_cap(total);
        let raw = rate.raw_step(total);
        let step = if cap == 0 { raw } else { raw.max(total / cap) }.max(1);
        let last = total.saturating_sub(1);
        let end = end.map_or(last, |e| e.min(last));
        Self {
            start,
            end,
            step,
            cap,
            empty: total == 0 || start > end,
        }
    }

    /// Visit every item with no ceiling. For listings that were already
    /// sampled when they were produced.
    pub fn exhaustive(total: u64) -> Self {
        Self {
            start: 0,
            end: total.saturating_sub(1),
            step: 1,
            cap: total,
            empty: total == 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.empty || self.cap == 0
    }

    /// Number of indices the plan yields.
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        ((self.end - self.start) / self.step + 1).min(self.cap)
    }

    /// Source index of the `k`-th sample.
    pub fn original_index(&self, k: u64) -> Option<u64> {
        (k < self.len()).then(|| self.start + k * self.step)
    }

    /// Effective sampling rate for a source running at `source_fps`.
    pub fn sample_fps(&self, source_fps: f64) -> f64 {
        source_fps / self.step as f64
    }

    pub fn indices(&self) -> SampleIndices {
        SampleIndices {
            next: self.start,
            remaining: self.len(),
            step: self.step,
        }
    }
}

/// Lazy iterator over a plan's source indices.
#[derive(Clone, Debug)]
pub struct SampleIndices {
    next: u64,
    remaining: u64,
    step: u64,
}

impl Iterator for SampleIndices {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next;
        self.remaining -= 1;
        self.next = self.next.saturating_add(self.step);
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

/// Map the `sample_index`-th sample taken at `sample_fps` back to the frame
/// number of a source running at `original_fps`.
///
/// Identity when either rate is unknown or non-positive (unsampled mode).
pub fn map_sample_to_original(sample_index: i64, original_fps: f64, sample_fps: f64) -> u64 {
    if sample_index < 0 {
        return 0;
    }
    if !(sample_fps > 0.0) || !(original_fps > 0.0) {
        return sample_index as u64;
    }
    let seconds = sample_index as f64 / sample_fps;
    (seconds * original_fps).round().max(0.0) as u64
}

pub fn map_samples_to_original(sample_indices: &[i64], original_fps: f64, sample_fps: f64) -> Vec<u64> {
    sample_indices
        .iter()
        .map(|&si| map_sample_to_original(si, original_fps, sample_fps))
        .collect()
}
