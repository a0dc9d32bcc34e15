use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::num::NonZeroU32;
use std::ops::Range;

use crate::utils::join_into_string;

pub type DimSize = NonZeroU32;
pub type Shape = Vec<DimSize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum Dtype {
    Uint8,
    Sint8,
    Uint16,
    Sint16,
    Uint32,
    Sint32,
    Float32,
    Bfloat16,
}

/// An axis-aligned, half-open box of coordinates.
///
/// Regions describe both slices of tensors and boxes of an operator's
/// iteration space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Region(pub Vec<Range<u32>>);

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Uint8 | Dtype::Sint8 => 1,
            Dtype::Uint16 | Dtype::Sint16 | Dtype::Bfloat16 => 2,
            Dtype::Uint32 | Dtype::Sint32 | Dtype::Float32 => 4,
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Sint8 => write!(f, "i8"),
            Dtype::Uint16 => write!(f, "u16"),
            Dtype::Sint16 => write!(f, "i16"),
            Dtype::Uint32 => write!(f, "u32"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Bfloat16 => write!(f, "bf16"),
        }
    }
}

pub fn volume(shape: &[DimSize]) -> u64 {
    shape.iter().map(|d| u64::from(d.get())).product()
}

pub fn shape_to_u32s(shape: &[DimSize]) -> Vec<u32> {
    shape.iter().map(|d| d.get()).collect()
}

impl Region {
    pub fn full(shape: &[DimSize]) -> Self {
        Region(shape.iter().map(|d| 0..d.get()).collect())
    }

    pub fn from_sizes(sizes: &[u32]) -> Self {
        Region(sizes.iter().map(|&s| 0..s).collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn sizes(&self) -> Vec<u32> {
        self.0.iter().map(|r| r.end - r.start).collect()
    }

    pub fn origin(&self) -> Vec<u32> {
        self.0.iter().map(|r| r.start).collect()
    }

    pub fn volume(&self) -> u64 {
        self.0
            .iter()
            .map(|r| u64::from(r.end.saturating_sub(r.start)))
            .product()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().any(|r| r.end <= r.start)
    }

    /// Returns `true` if `other` lies entirely within `self`.
    pub fn contains(&self, other: &Region) -> bool {
        self.rank() == other.rank()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.start <= b.start && b.end <= a.end)
    }

    /// Returns `true` if the region covers every coordinate of `shape`.
    pub fn covers(&self, shape: &[DimSize]) -> bool {
        self.rank() == shape.len()
            && self
                .0
                .iter()
                .zip(shape)
                .all(|(r, d)| r.start == 0 && r.end >= d.get())
    }

    pub fn intersects(&self, other: &Region) -> bool {
        self.rank() == other.rank()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.start < b.end && b.start < a.end)
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]",
            join_into_string(self.0.iter().map(|r| format!("{}..{}", r.start, r.end)), ", ")
        )
    }
}

pub mod macros {
    pub mod internal {
        use crate::common::DimSize;
        pub trait IntoDimSize {
            fn into_dim_size(self) -> DimSize;
        }
        impl IntoDimSize for DimSize {
            fn into_dim_size(self) -> DimSize {
                self
            }
        }
        // Raw sizes are a test convenience.
        #[cfg(test)]
        impl IntoDimSize for u32 {
            fn into_dim_size(self) -> DimSize {
                DimSize::new(self).unwrap()
            }
        }
    }

    #[macro_export]
    macro_rules! shape {
        ($dim:expr; $n:expr) => {{
            use $crate::common::macros::internal::IntoDimSize;
            let sv: $crate::common::Shape = vec![ ($dim).into_dim_size(); $n ];
            sv
        }};
        ($($dim:expr),*$(,)*) => {{
            use $crate::common::macros::internal::IntoDimSize;
            // Bind to a variable with an explicit type to help out type inference.
            let sv: $crate::common::Shape = vec![ $( ($dim).into_dim_size() ),* ];
            sv
        }};
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;

    #[test]
    fn test_region_containment() {
        let outer = Region(vec![0..8, 2..6]);
        assert!(outer.contains(&Region(vec![1..8, 2..3])));
        assert!(!outer.contains(&Region(vec![1..9, 2..3])));
        assert!(!outer.contains(&Region(vec![0..8])));
    }

    #[test]
    fn test_region_covers_shape() {
        let s = shape![4, 3];
        assert!(Region::full(&s).covers(&s));
        assert!(!Region(vec![0..4, 1..3]).covers(&s));
        assert_eq!(Region::full(&s).volume(), 12);
    }

    #[test]
    fn test_region_display() {
        assert_eq!(Region(vec![0..2, 5..7]).to_string(), "[0..2, 5..7]");
    }
}
