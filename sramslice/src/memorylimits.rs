//! Graph-wide SRAM accounting.
//!
//! Units run one after another, so every SRAM reservation covers a contiguous
//! range of steps of the unit order. A reservation only competes with the ones
//! whose step ranges overlap it.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::ops::Range;

use crate::bundlizer::BundleId;
use crate::graph::{NodeId, TensorId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Owner {
    /// A tensor kept in SRAM for its whole live range.
    Pinned(TensorId),
    /// A large input of an unbundled vector-core node.
    ScalarPipe { node: NodeId, slot: u8 },
    Bundle(BundleId),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{owner} needs {requested} bytes over steps {steps:?}, only {available} available")]
pub struct Overcommit {
    pub owner: Owner,
    pub requested: u64,
    pub available: u64,
    pub steps: Range<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SramLedger {
    capacity: u64,
    usage: Vec<u64>,
    reservations: Vec<(Owner, Range<usize>, u64)>,
}

impl SramLedger {
    pub fn new(capacity: u64, steps: usize) -> Self {
        SramLedger {
            capacity,
            usage: vec![0; steps],
            reservations: vec![],
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn steps(&self) -> usize {
        self.usage.len()
    }

    /// Bytes free at every step of `steps`.
    pub fn available_at(&self, steps: Range<usize>) -> u64 {
        let used = self.usage[clamp(&steps, self.usage.len())]
            .iter()
            .copied()
            .max()
            .unwrap_or(0);
        self.capacity.saturating_sub(used)
    }

    pub fn reserve(&mut self, owner: Owner, steps: Range<usize>, bytes: u64) -> Result<(), Overcommit> {
        let available = self.available_at(steps.clone());
        if bytes > available {
            return Err(Overcommit {
                owner,
                requested: bytes,
                available,
                steps,
            });
        }
        if bytes == 0 {
            return Ok(());
        }
        let r = clamp(&steps, self.usage.len());
        for u in &mut self.usage[r] {
            *u += bytes;
        }
        self.reservations.push((owner, steps, bytes));
        Ok(())
    }

    /// Drop every reservation of `owner`. Returns the bytes freed per reservation.
    pub fn release(&mut self, owner: Owner) -> Vec<u64> {
        let mut freed = vec![];
        let usage = &mut self.usage;
        self.reservations.retain(|(o, steps, bytes)| {
            if *o != owner {
                return true;
            }
            let r = clamp(steps, usage.len());
            for u in &mut usage[r] {
                *u -= bytes;
            }
            freed.push(*bytes);
            false
        });
        freed
    }

    pub fn reserved_by(&self, owner: Owner) -> u64 {
        self.reservations
            .iter()
            .filter(|(o, _, _)| *o == owner)
            .map(|(_, _, b)| b)
            .sum()
    }

    /// The largest number of bytes reserved at any one step.
    pub fn peak(&self) -> u64 {
        self.usage.iter().copied().max().unwrap_or(0)
    }
}

fn clamp(steps: &Range<usize>, len: usize) -> Range<usize> {
    let end = steps.end.min(len);
    steps.start.min(end)..end
}

impl Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Pinned(t) => write!(f, "pinned {}", t),
            Owner::ScalarPipe { node, slot } => write!(f, "{} input {}", node, slot),
            Owner::Bundle(b) => write!(f, "bundle {}", b.0),
        }
    }
}
