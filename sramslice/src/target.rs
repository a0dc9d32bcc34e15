use crate::cost::MainCost;

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Properties of a device the scheduler plans for.
///
/// Throughputs are per cycle and only need to be consistent with each other;
/// the [crate::cost] model compares latencies, never absolute times.
pub trait Target: Clone + Copy + std::hash::Hash + Eq + Default + Debug + Send + Sync + 'static {
    fn target_id() -> TargetId;

    /// SRAM cache line size in bytes. Every SRAM buffer is padded to a multiple.
    fn line_size() -> u32;

    /// Bytes of SRAM on the device.
    fn sram_bytes() -> u64;

    fn mme_macs_per_cycle() -> u64;
    fn tpc_elements_per_cycle() -> u64;
    fn dma_bytes_per_cycle() -> u64;

    /// Fixed cost paid by every slice (descriptor setup, engine synchronization).
    fn slice_overhead() -> MainCost;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum TargetId {
    #[default]
    Gaudi2,
    Gaudi3,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Gaudi2Target;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Gaudi3Target;

impl Target for Gaudi2Target {
    fn target_id() -> TargetId {
        TargetId::Gaudi2
    }

    fn line_size() -> u32 {
        128
    }

    fn sram_bytes() -> u64 {
        48 * 1024 * 1024
    }

    fn mme_macs_per_cycle() -> u64 {
        2 * 256 * 256
    }

    fn tpc_elements_per_cycle() -> u64 {
        24 * 64
    }

    fn dma_bytes_per_cycle() -> u64 {
        1024
    }

    fn slice_overhead() -> MainCost {
        400
    }
}

impl Target for Gaudi3Target {
    fn target_id() -> TargetId {
        TargetId::Gaudi3
    }

    fn line_size() -> u32 {
        256
    }

    fn sram_bytes() -> u64 {
        96 * 1024 * 1024
    }

    fn mme_macs_per_cycle() -> u64 {
        8 * 256 * 256
    }

    fn tpc_elements_per_cycle() -> u64 {
        64 * 64
    }

    fn dma_bytes_per_cycle() -> u64 {
        2048
    }

    fn slice_overhead() -> MainCost {
        300
    }
}
