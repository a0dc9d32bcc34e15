use divrem::DivCeil;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Slicing of a single dimension into `chunk`-sized slices.
///
/// When `chunk` doesn't divide `size`, the last slice is the smaller leftover;
/// sizes are never redistributed. A chunk at least as large as the dimension
/// yields one (trivial) slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DimSlicing {
    size: u32,
    chunk: u32,
}

/// A walk over a grid of slice coordinates, outermost dimension first.
///
/// With a snake dimension, that dimension reverses direction every time a
/// dimension outside it steps, so consecutive slices share the operands which
/// don't depend on it. Dimensions inside the snake dimension always run forward.
#[derive(Debug, Clone)]
pub struct SliceWalk {
    counts: Vec<u32>,
    snake_dim: Option<usize>,
    next: Option<Vec<u32>>,
}

impl DimSlicing {
    pub fn new(size: u32, chunk: u32) -> Self {
        debug_assert!(size > 0);
        DimSlicing {
            size,
            chunk: chunk.clamp(1, size.max(1)),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    /// Returns the number of slices, including the leftover.
    pub fn count(&self) -> u32 {
        DivCeil::div_ceil(self.size, self.chunk)
    }

    /// Counts the elements in the leftover slice.
    ///
    /// Returns `0` if every slice is full.
    pub fn leftover(&self) -> u32 {
        self.size % self.chunk
    }

    pub fn is_trivial(&self) -> bool {
        self.count() == 1
    }

    pub fn range(&self, idx: u32) -> Range<u32> {
        debug_assert!(idx < self.count());
        let start = idx * self.chunk;
        start..(start + self.chunk).min(self.size)
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range<u32>> + '_ {
        (0..self.count()).map(|i| self.range(i))
    }

    /// The same chunk applied to a dimension's actual (run-time) size.
    pub fn rebind(&self, actual: u32) -> Self {
        DimSlicing::new(actual, self.chunk)
    }
}

/// Chunk sizes to try for a dimension of `size`, largest first.
///
/// Repeatedly halves (rounding up) and, once the chunk is at least `multiple_of`,
/// snaps it down to a multiple of `multiple_of`. The dimension's full size comes
/// first; 1 comes last unless `multiple_of` forbids it.
pub fn chunk_candidates(size: u32, multiple_of: u32) -> Vec<u32> {
    let multiple_of = multiple_of.max(1);
    let mut result = vec![size];
    let mut c = size;
    while c > 1 {
        c = DivCeil::div_ceil(c, 2);
        let snapped = if c >= multiple_of {
            c - c % multiple_of
        } else {
            break;
        };
        if snapped < *result.last().unwrap_or(&u32::MAX) {
            result.push(snapped);
        }
    }
    result
}

/// Chunks made of whole `granule`s for a dimension of `size`, largest first.
///
/// The number of granules per chunk is halved as in [chunk_candidates]. The
/// full size is never included. Empty unless `1 < granule < size`.
pub fn granule_candidates(size: u32, granule: u32) -> Vec<u32> {
    if granule <= 1 || granule >= size {
        return vec![];
    }
    chunk_candidates(DivCeil::div_ceil(size, granule), 1)
        .into_iter()
        .map(|n| n.saturating_mul(granule))
        .filter(|&c| c < size)
        .collect()
}

impl SliceWalk {
    pub fn new(counts: Vec<u32>, snake_dim: Option<usize>) -> Self {
        debug_assert!(snake_dim.map_or(true, |s| s < counts.len()));
        let next = if counts.contains(&0) {
            None
        } else {
            Some(vec![0; counts.len()])
        };
        SliceWalk {
            counts,
            snake_dim,
            next,
        }
    }

    pub fn len(&self) -> u64 {
        self.counts.iter().map(|&c| u64::from(c)).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply_snake(&self, logical: &[u32]) -> Vec<u32> {
        let mut coords = logical.to_vec();
        if let Some(s) = self.snake_dim {
            let row = logical[..s]
                .iter()
                .zip(&self.counts[..s])
                .fold(0u64, |acc, (&c, &n)| acc * u64::from(n) + u64::from(c));
            if row % 2 == 1 {
                coords[s] = self.counts[s] - 1 - logical[s];
            }
        }
        coords
    }
}

impl Iterator for SliceWalk {
    type Item = Vec<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        let logical = self.next.take()?;
        let result = self.apply_snake(&logical);

        let mut advanced = logical;
        let mut d = advanced.len();
        loop {
            if d == 0 {
                break;
            }
            d -= 1;
            advanced[d] += 1;
            if advanced[d] < self.counts[d] {
                self.next = Some(advanced);
                break;
            }
            advanced[d] = 0;
        }
        Some(result)
    }
}
