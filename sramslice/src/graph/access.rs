//! Operator iteration spaces and how operands are addressed from them.
//!
//! Slicing a bundle means slicing its anchor's iteration space. Every operand's
//! slice follows from the index box through that operand's [AccessMap].

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::common::Region;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum DimRole {
    Batch,
    Spatial,
    /// A parallel dimension of a matrix-engine output other than batch or spatial.
    NonCommon,
    /// The contraction dimension(s) of a matrix-engine op.
    Common,
    /// Kernel window positions.
    Filter,
    /// A dimension of an elementwise-style op's output.
    Elementwise,
    /// The reduced axis of a reduction.
    Reduced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct IndexDim {
    pub size: u32,
    pub role: DimRole,
    pub reduction: bool,
}

/// How one operand dimension's coordinate derives from index coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum DimAccess {
    Direct(u8),
    /// A size-1 operand dimension, always at coordinate 0.
    Broadcast,
    /// `coord = index[out] * stride + index[kernel] * dilation - pad_before`.
    /// Coordinates outside the operand are padding.
    Window {
        out: u8,
        kernel: u8,
        stride: u32,
        dilation: u32,
        pad_before: u32,
    },
    /// The inverse of [DimAccess::Window]: the operand coordinate `o` satisfying
    /// `index[pos] + pad_before - index[kernel] * dilation == o * stride`. Index
    /// points with no integral solution contribute nothing.
    TransposedWindow {
        pos: u8,
        kernel: u8,
        stride: u32,
        dilation: u32,
        pad_before: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum AccessMap {
    Dims(Vec<DimAccess>),
    /// Row-major element order is shared with the index space (reshape).
    Flat,
}

impl IndexDim {
    pub fn parallel(size: u32, role: DimRole) -> Self {
        IndexDim {
            size,
            role,
            reduction: false,
        }
    }

    pub fn reduction(size: u32, role: DimRole) -> Self {
        IndexDim {
            size,
            role,
            reduction: true,
        }
    }
}

impl DimAccess {
    pub fn depends_on(&self, index_dim: u8) -> bool {
        match *self {
            DimAccess::Direct(i) => i == index_dim,
            DimAccess::Broadcast => false,
            DimAccess::Window { out, kernel, .. } => out == index_dim || kernel == index_dim,
            DimAccess::TransposedWindow { pos, kernel, .. } => {
                pos == index_dim || kernel == index_dim
            }
        }
    }

    /// The operand coordinate touched by a single index point, or `None` for
    /// padding and non-integral transposed positions.
    pub fn coord(&self, index_point: &[u32], operand_size: u32) -> Option<u32> {
        let c = match *self {
            DimAccess::Direct(i) => i64::from(index_point[usize::from(i)]),
            DimAccess::Broadcast => 0,
            DimAccess::Window {
                out,
                kernel,
                stride,
                dilation,
                pad_before,
            } => {
                i64::from(index_point[usize::from(out)]) * i64::from(stride)
                    + i64::from(index_point[usize::from(kernel)]) * i64::from(dilation)
                    - i64::from(pad_before)
            }
            DimAccess::TransposedWindow {
                pos,
                kernel,
                stride,
                dilation,
                pad_before,
            } => {
                let num = i64::from(index_point[usize::from(pos)]) + i64::from(pad_before)
                    - i64::from(index_point[usize::from(kernel)]) * i64::from(dilation);
                if num < 0 || num % i64::from(stride) != 0 {
                    return None;
                }
                num / i64::from(stride)
            }
        };
        if c < 0 || c >= i64::from(operand_size) {
            None
        } else {
            u32::try_from(c).ok()
        }
    }

    /// The range of operand coordinates touched by an index box, clamped to
    /// the operand. May be empty if the box only touches padding.
    pub fn range(&self, index_box: &Region, operand_size: u32) -> Range<u32> {
        let size = i64::from(operand_size);
        let (lo, hi) = match *self {
            DimAccess::Direct(i) => {
                let r = &index_box.0[usize::from(i)];
                (i64::from(r.start), i64::from(r.end) - 1)
            }
            DimAccess::Broadcast => (0, size - 1),
            DimAccess::Window {
                out,
                kernel,
                stride,
                dilation,
                pad_before,
            } => {
                let o = &index_box.0[usize::from(out)];
                let k = &index_box.0[usize::from(kernel)];
                let (s, d, p) = (
                    i64::from(stride),
                    i64::from(dilation),
                    i64::from(pad_before),
                );
                (
                    i64::from(o.start) * s + i64::from(k.start) * d - p,
                    (i64::from(o.end) - 1) * s + (i64::from(k.end) - 1) * d - p,
                )
            }
            DimAccess::TransposedWindow {
                pos,
                kernel,
                stride,
                dilation,
                pad_before,
            } => {
                let h = &index_box.0[usize::from(pos)];
                let k = &index_box.0[usize::from(kernel)];
                let (s, d, p) = (
                    i64::from(stride),
                    i64::from(dilation),
                    i64::from(pad_before),
                );
                let lo_num = i64::from(h.start) + p - (i64::from(k.end) - 1) * d;
                let hi_num = i64::from(h.end) - 1 + p - i64::from(k.start) * d;
                (lo_num.div_euclid(s) + i64::from(lo_num.rem_euclid(s) != 0), hi_num.div_euclid(s))
            }
        };
        let lo = lo.clamp(0, size);
        let hi = (hi + 1).clamp(lo, size);
        // Both bounds are within 0..=operand_size.
        (lo as u32)..(hi as u32)
    }

    /// An upper bound on the operand extent touched by any index box with the
    /// given per-dimension sizes.
    pub fn max_extent(&self, box_sizes: &[u32], operand_size: u32) -> u32 {
        let e = match *self {
            DimAccess::Direct(i) => u64::from(box_sizes[usize::from(i)]),
            DimAccess::Broadcast => u64::from(operand_size),
            DimAccess::Window {
                out,
                kernel,
                stride,
                dilation,
                ..
            } => {
                let o = u64::from(box_sizes[usize::from(out)]);
                let k = u64::from(box_sizes[usize::from(kernel)]);
                (o - 1) * u64::from(stride) + (k - 1) * u64::from(dilation) + 1
            }
            DimAccess::TransposedWindow {
                pos,
                kernel,
                stride,
                dilation,
                ..
            } => {
                let h = u64::from(box_sizes[usize::from(pos)]);
                let k = u64::from(box_sizes[usize::from(kernel)]);
                (h - 1 + (k - 1) * u64::from(dilation)) / u64::from(stride) + 1
            }
        };
        e.min(u64::from(operand_size)) as u32
    }
}

impl AccessMap {
    pub fn identity(rank: usize) -> Self {
        AccessMap::Dims((0..rank).map(|i| DimAccess::Direct(i as u8)).collect())
    }

    pub fn depends_on(&self, index_dim: u8) -> bool {
        match self {
            AccessMap::Dims(dims) => dims.iter().any(|d| d.depends_on(index_dim)),
            AccessMap::Flat => true,
        }
    }

    /// Map an index box to the operand region it touches.
    ///
    /// Returns `None` for a [AccessMap::Flat] operand when the box doesn't
    /// correspond to a box of the operand.
    pub fn region(
        &self,
        index_box: &Region,
        index_sizes: &[u32],
        operand_shape: &[u32],
    ) -> Option<Region> {
        match self {
            AccessMap::Dims(dims) => Some(Region(
                dims.iter()
                    .zip(operand_shape)
                    .map(|(d, &s)| d.range(index_box, s))
                    .collect(),
            )),
            AccessMap::Flat => {
                let flat = flat_range(index_sizes, index_box)?;
                box_for_flat_range(operand_shape, flat)
            }
        }
    }

    /// Map an operand region back to the index box which produces exactly it.
    ///
    /// Only defined for output-style maps ([DimAccess::Direct] and
    /// [DimAccess::Broadcast] dimensions) and [AccessMap::Flat]. Index dimensions not
    /// addressed by the operand cover their whole range.
    pub fn index_box_for(
        &self,
        region: &Region,
        index_sizes: &[u32],
        operand_shape: &[u32],
    ) -> Option<Region> {
        match self {
            AccessMap::Dims(dims) => {
                let mut b = Region::from_sizes(index_sizes);
                for (d, r) in dims.iter().zip(&region.0) {
                    match d {
                        DimAccess::Direct(i) => b.0[usize::from(*i)] = r.clone(),
                        DimAccess::Broadcast => {}
                        _ => return None,
                    }
                }
                Some(b)
            }
            AccessMap::Flat => {
                let flat = flat_range(operand_shape, region)?;
                box_for_flat_range(index_sizes, flat)
            }
        }
    }
}

/// The row-major flat element range occupied by `region`, if it is contiguous.
pub fn flat_range(shape: &[u32], region: &Region) -> Option<Range<u64>> {
    debug_assert_eq!(shape.len(), region.rank());
    if region.is_empty() {
        return None;
    }
    // Find the outermost dimension which isn't a single coordinate; everything
    // inside it must be full.
    let k = region
        .0
        .iter()
        .position(|r| r.end - r.start != 1)
        .unwrap_or(shape.len().saturating_sub(1));
    for d in (k + 1)..shape.len() {
        let r = &region.0[d];
        if r.start != 0 || r.end != shape[d] {
            return None;
        }
    }
    let mut start = 0u64;
    for (d, r) in region.0.iter().enumerate() {
        start = start * u64::from(shape[d]) + u64::from(r.start);
    }
    Some(start..start + region.volume())
}

/// The box of a row-major tensor of `shape` whose elements are exactly the flat
/// range `range`, if one exists.
pub fn box_for_flat_range(shape: &[u32], range: Range<u64>) -> Option<Region> {
    let len = range.end.checked_sub(range.start)?;
    if len == 0 {
        return None;
    }
    let rank = shape.len();
    let mut inner = 1u64;
    for k in (0..rank).rev() {
        let size = u64::from(shape[k]);
        if range.start % inner == 0 && len % inner == 0 {
            let rows = len / inner;
            let first = (range.start / inner) % size;
            if first + rows <= size {
                let mut outer_coord = range.start / (inner * size);
                let mut b = vec![0..0; rank];
                b[k] = (first as u32)..((first + rows) as u32);
                for d in (k + 1)..rank {
                    b[d] = 0..shape[d];
                }
                for d in (0..k).rev() {
                    let c = (outer_coord % u64::from(shape[d])) as u32;
                    outer_coord /= u64::from(shape[d]);
                    b[d] = c..c + 1;
                }
                return Some(Region(b));
            }
        } else {
            return None;
        }
        inner *= size;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::volume;
    use crate::shape;
    use proptest::prelude::*;

    #[test]
    fn test_window_range_clamps_padding() {
        // 3x3 kernel, stride 1, pad 1 over H=8.
        let access = DimAccess::Window {
            out: 0,
            kernel: 1,
            stride: 1,
            dilation: 1,
            pad_before: 1,
        };
        let first = Region(vec![0..4, 0..3]);
        let last = Region(vec![4..8, 0..3]);
        assert_eq!(access.range(&first, 8), 0..5);
        assert_eq!(access.range(&last, 8), 3..8);
    }

    #[test]
    fn test_transposed_window_range_strided() {
        // dx rows 0..4 of a stride-2, 3-tap, pad-1 conv reading dy of 4 rows.
        let access = DimAccess::TransposedWindow {
            pos: 0,
            kernel: 1,
            stride: 2,
            dilation: 1,
            pad_before: 1,
        };
        let b = Region(vec![0..4, 0..3]);
        // h + 1 - r = 2 * o: h in 0..4, r in 0..3 gives o in 0..=2.
        assert_eq!(access.range(&b, 4), 0..3);
        assert_eq!(access.coord(&[1, 0], 4), Some(1));
        assert_eq!(access.coord(&[1, 1], 4), None);
    }

    #[test]
    fn test_flat_range_of_rows() {
        let shape = [4, 6];
        assert_eq!(flat_range(&shape, &Region(vec![1..3, 0..6])), Some(6..18));
        assert_eq!(flat_range(&shape, &Region(vec![2..3, 1..4])), Some(13..16));
        assert_eq!(flat_range(&shape, &Region(vec![1..3, 1..4])), None);
    }

    #[test]
    fn test_box_for_flat_range_requires_box() {
        let shape = [4, 6];
        assert_eq!(
            box_for_flat_range(&shape, 6..18),
            Some(Region(vec![1..3, 0..6]))
        );
        assert_eq!(box_for_flat_range(&shape, 4..8), None);
        assert_eq!(
            box_for_flat_range(&shape, 13..16),
            Some(Region(vec![2..3, 1..4]))
        );
    }

    #[test]
    fn test_reshape_rows_map_through_flat_access() {
        // [8, 4] viewed as [2, 16]: two rows of the source form one row of the view.
        let src = [8, 4];
        let view = [2, 16];
        let r = AccessMap::Flat.region(&Region(vec![1..2, 0..16]), &view, &src);
        assert_eq!(r, Some(Region(vec![4..8, 0..4])));
        let half_row = AccessMap::Flat.region(&Region(vec![0..2, 0..8]), &view, &src);
        assert_eq!(half_row, None);
    }

    proptest! {
        #[test]
        fn test_flat_round_trip_of_contiguous_boxes(
            dims in prop::collection::vec(1u32..5, 1..4),
            seed in any::<u64>(),
        ) {
            let shape = dims.clone();
            let total = volume(&shape.iter().map(|&d| d.try_into().unwrap()).collect::<Vec<_>>());
            let start = seed % total;
            let len = 1 + (seed / 7) % (total - start);
            if let Some(b) = box_for_flat_range(&shape, start..start + len) {
                prop_assert_eq!(b.volume(), len);
                prop_assert_eq!(flat_range(&shape, &b), Some(start..start + len));
            }
        }
    }

    #[test]
    fn test_shape_macro_volume() {
        assert_eq!(volume(&shape![2, 3, 4]), 24);
    }
}
