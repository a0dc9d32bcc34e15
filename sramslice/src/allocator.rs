//! Sizing of a bundle's SRAM buffers.

use log::trace;
use serde::{Deserialize, Serialize};

use crate::graph::TensorId;
use crate::slicing::{OperandKey, SlicingStrategy};
use crate::target::Target;
use crate::utils::round_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Placement {
    /// `buffers` slots of `slot_bytes` each, used round-robin across slices.
    Sram { buffers: u8, slot_bytes: u64 },
    /// Read from or written to HBM directly by every slice.
    Hbm,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OperandAllocation {
    pub key: OperandKey,
    pub tensor: TensorId,
    pub placement: Placement,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Allocation {
    pub operands: Vec<OperandAllocation>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("single buffers need {required} bytes, only {available} available")]
    Overcommit { required: u64, available: u64 },
}

impl Placement {
    pub fn bytes(&self) -> u64 {
        match self {
            Placement::Sram {
                buffers,
                slot_bytes,
            } => u64::from(*buffers) * slot_bytes,
            Placement::Hbm => 0,
        }
    }
}

impl Allocation {
    pub fn placement(&self, key: OperandKey) -> Option<Placement> {
        self.operands
            .iter()
            .find(|o| o.key == key)
            .map(|o| o.placement)
    }

    /// Total SRAM bytes of every slot.
    pub fn total_bytes(&self) -> u64 {
        self.operands.iter().map(|o| o.placement.bytes()).sum()
    }

    pub fn is_multi_buffered(&self) -> bool {
        self.operands
            .iter()
            .any(|o| matches!(o.placement, Placement::Sram { buffers, .. } if buffers > 1))
    }
}

/// Size buffers for `strategy` within `available` bytes.
///
/// Every SRAM-resident operand first gets one line-aligned slot. Then, with
/// `double_buffering`, operands whose region changes between slices get a
/// second slot, in operand order, while the total still fits.
pub fn allocate<Tgt: Target>(
    strategy: &SlicingStrategy,
    available: u64,
    double_buffering: bool,
) -> Result<Allocation, AllocError> {
    let line = u64::from(Tgt::line_size());
    let mut operands = strategy
        .operands
        .iter()
        .map(|o| OperandAllocation {
            key: o.key,
            tensor: o.tensor,
            placement: if o.in_sram {
                Placement::Sram {
                    buffers: 1,
                    slot_bytes: round_up(o.max_bytes, line),
                }
            } else {
                Placement::Hbm
            },
        })
        .collect::<Vec<_>>();
    let mut total: u64 = operands.iter().map(|o| o.placement.bytes()).sum();
    if total > available {
        return Err(AllocError::Overcommit {
            required: total,
            available,
        });
    }

    if double_buffering && !strategy.dynamic && strategy.slice_count() > 1 {
        for (alloc, info) in operands.iter_mut().zip(&strategy.operands) {
            let Placement::Sram {
                buffers,
                slot_bytes,
            } = &mut alloc.placement
            else {
                continue;
            };
            if !info.varies || total + *slot_bytes > available {
                continue;
            }
            total += *slot_bytes;
            *buffers = 2;
            trace!("Double-buffering {:?}", info.key);
        }
    }
    Ok(Allocation { operands })
}
