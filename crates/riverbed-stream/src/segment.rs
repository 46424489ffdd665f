//! Segments and key ranges.
//!
//! A stream's key space is `[0, 1)`. Every epoch partitions it into disjoint
//! half-open ranges, one per segment. Segments reference each other only by
//! id: the predecessor/successor graph lives in the stream's segment arena.

use riverbed_common::{Error, Result, SegmentId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tolerance used when comparing range boundaries
pub const RANGE_EPSILON: f64 = 1e-9;

/// Half-open key range `[low, high)` within `[0, 1]`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawKeyRange")]
pub struct KeyRange {
    low: f64,
    high: f64,
}

/// Decoded form of a [`KeyRange`] before its bounds are checked
#[derive(Deserialize)]
struct RawKeyRange {
    low: f64,
    high: f64,
}

impl TryFrom<RawKeyRange> for KeyRange {
    type Error = Error;

    fn try_from(raw: RawKeyRange) -> Result<Self> {
        Self::new(raw.low, raw.high)
    }
}

impl KeyRange {
    /// Create a range; requires `0 <= low < high <= 1`
    pub fn new(low: f64, high: f64) -> Result<Self> {
        if !(low.is_finite() && high.is_finite()) || low < 0.0 || high > 1.0 || low >= high {
            return Err(Error::InvalidKeyRanges(format!(
                "[{low}, {high}) is not a valid key range"
            )));
        }
        Ok(Self { low, high })
    }

    /// The whole key space
    #[must_use]
    pub const fn full() -> Self {
        Self {
            low: 0.0,
            high: 1.0,
        }
    }

    #[must_use]
    pub const fn low(&self) -> f64 {
        self.low
    }

    #[must_use]
    pub const fn high(&self) -> f64 {
        self.high
    }

    /// Whether the two ranges share any key
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.low < other.high - RANGE_EPSILON && other.low < self.high - RANGE_EPSILON
    }

    /// Split the full key space into `count` equal-width ranges
    #[must_use]
    pub fn split_evenly(count: u32) -> Vec<Self> {
        let width = 1.0 / f64::from(count);
        (0..count)
            .map(|i| Self {
                low: f64::from(i) * width,
                high: if i + 1 == count {
                    1.0
                } else {
                    f64::from(i + 1) * width
                },
            })
            .collect()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= RANGE_EPSILON
}

/// Coalesce ranges into a sorted list of maximal contiguous intervals
fn merge(ranges: &[KeyRange]) -> Vec<(f64, f64)> {
    let mut sorted: Vec<KeyRange> = ranges.to_vec();
    sorted.sort_by(|a, b| a.low.total_cmp(&b.low));

    let mut merged: Vec<(f64, f64)> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.low <= last.1 + RANGE_EPSILON => {
                last.1 = last.1.max(range.high);
            }
            _ => merged.push((range.low, range.high)),
        }
    }
    merged
}

/// Ranges are pairwise disjoint
#[must_use]
pub fn are_disjoint(ranges: &[KeyRange]) -> bool {
    let mut sorted: Vec<KeyRange> = ranges.to_vec();
    sorted.sort_by(|a, b| a.low.total_cmp(&b.low));
    sorted
        .windows(2)
        .all(|pair| pair[0].high <= pair[1].low + RANGE_EPSILON)
}

/// Ranges are disjoint and their union is exactly `[0, 1)`
#[must_use]
pub fn covers_key_space(ranges: &[KeyRange]) -> bool {
    let merged = merge(ranges);
    are_disjoint(ranges) && merged.len() == 1 && close(merged[0].0, 0.0) && close(merged[0].1, 1.0)
}

/// Check that `new_ranges` can replace `sealed_ranges`.
///
/// The new ranges must be pairwise disjoint and cover exactly the union of
/// the sealed ranges, no more and no less.
pub fn validate_replacement(sealed_ranges: &[KeyRange], new_ranges: &[KeyRange]) -> Result<()> {
    if new_ranges.is_empty() {
        return Err(Error::InvalidKeyRanges("no new key ranges".into()));
    }
    if !are_disjoint(new_ranges) {
        return Err(Error::InvalidKeyRanges(
            "new key ranges overlap each other".into(),
        ));
    }

    let sealed = merge(sealed_ranges);
    let proposed = merge(new_ranges);
    let matches = sealed.len() == proposed.len()
        && sealed
            .iter()
            .zip(&proposed)
            .all(|(a, b)| close(a.0, b.0) && close(a.1, b.1));
    if !matches {
        return Err(Error::InvalidKeyRanges(format!(
            "new ranges {proposed:?} do not cover sealed ranges {sealed:?}"
        )));
    }
    Ok(())
}

/// One segment of a stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub key_range: KeyRange,
    /// Creation time (milliseconds since the Unix epoch)
    pub created_at: u64,
    /// Seal time, once sealed
    pub sealed_at: Option<u64>,
    /// Segments this one replaced
    pub predecessors: Vec<SegmentId>,
    /// Segments that replaced this one
    pub successors: Vec<SegmentId>,
}

impl Segment {
    #[must_use]
    pub const fn new(id: SegmentId, key_range: KeyRange, created_at: u64) -> Self {
        Self {
            id,
            key_range,
            created_at,
            sealed_at: None,
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed_at.is_some()
    }
}
