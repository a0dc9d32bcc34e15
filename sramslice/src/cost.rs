use std::cmp::Ordering;

use divrem::DivCeil;
use log::debug;
use num_rational::Ratio;
use serde::{Deserialize, Serialize};

use crate::graph::ops::{OpKind, OpSemantics};
use crate::graph::{Graph, NodeId};
use crate::slicing::{SliceLoad, SlicingStrategy};
use crate::target::Target;
use crate::utils::round_up;

pub type MainCost = u64;

/// Unsliced execution exposes every transfer; this factor accounts for the
/// engines stalling on them.
pub const UNSLICED_PENALTY: Ratio<u64> = Ratio::new_raw(11, 10);

/// Estimated cost of running a bundle.
///
/// Compared by latency, then HBM traffic, slice count and SRAM footprint. Callers
/// break remaining ties by preferring the earlier candidate.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default, Deserialize, Serialize)]
pub struct PipelineCost {
    pub latency: MainCost,
    pub hbm_traffic: u64,
    pub slices: u64,
    pub sram_bytes: u64,
}

impl PartialOrd for PipelineCost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PipelineCost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.latency
            .cmp(&other.latency)
            .then(self.hbm_traffic.cmp(&other.hbm_traffic))
            .then(self.slices.cmp(&other.slices))
            .then(self.sram_bytes.cmp(&other.sram_bytes))
    }
}

/// Cycles one slice spends fetching, computing and evicting.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct SlicePhases {
    pub fetch: MainCost,
    pub compute: MainCost,
    pub evict: MainCost,
}

impl SlicePhases {
    pub fn of<Tgt: Target>(load: &SliceLoad) -> Self {
        SlicePhases {
            fetch: dma_cycles::<Tgt>(load.fetch_bytes),
            compute: compute_cycles::<Tgt>(load.macs, load.tpc_elements),
            evict: dma_cycles::<Tgt>(load.evict_bytes),
        }
    }
}

fn dma_cycles<Tgt: Target>(bytes: u64) -> MainCost {
    DivCeil::div_ceil(bytes, Tgt::dma_bytes_per_cycle())
}

/// The matrix engine and the vector cores of one slice run back to back.
fn compute_cycles<Tgt: Target>(macs: u64, tpc_elements: u64) -> MainCost {
    DivCeil::div_ceil(macs, Tgt::mme_macs_per_cycle())
        + DivCeil::div_ceil(tpc_elements, Tgt::tpc_elements_per_cycle())
}

/// Latency of a slice pipeline.
///
/// Double-buffered, slice `i` computes while slice `i + 1` is fetched and slice
/// `i - 1` is evicted, so only the first fetch and the last eviction are exposed.
pub fn pipeline_latency(phases: &[SlicePhases], double_buffered: bool, overhead: MainCost) -> MainCost {
    let fixed = overhead * phases.len() as MainCost;
    if !double_buffered {
        return fixed
            + phases
                .iter()
                .map(|p| p.fetch + p.compute + p.evict)
                .sum::<MainCost>();
    }
    let Some(first) = phases.first() else {
        return 0;
    };
    let mut latency = first.fetch;
    for (i, p) in phases.iter().enumerate() {
        let next_fetch = phases.get(i + 1).map_or(0, |n| n.fetch);
        let prev_evict = if i == 0 { 0 } else { phases[i - 1].evict };
        latency += p.compute.max(next_fetch + prev_evict);
    }
    latency + phases.last().map_or(0, |p| p.evict) + fixed
}

impl PipelineCost {
    /// Cost of `strategy` when its varying operands are double-buffered or not.
    pub fn of_strategy<Tgt: Target>(strategy: &SlicingStrategy, double_buffered: bool) -> Self {
        let phases = strategy
            .loads
            .iter()
            .map(SlicePhases::of::<Tgt>)
            .collect::<Vec<_>>();
        let footprint = strategy.min_footprint(Tgt::line_size());
        let extra = if double_buffered {
            strategy
                .operands
                .iter()
                .filter(|o| o.in_sram && o.varies)
                .map(|o| round_up(o.max_bytes, u64::from(Tgt::line_size())))
                .sum()
        } else {
            0
        };
        PipelineCost {
            latency: pipeline_latency(&phases, double_buffered, Tgt::slice_overhead()),
            hbm_traffic: strategy
                .loads
                .iter()
                .map(|l| l.fetch_bytes + l.evict_bytes)
                .sum(),
            slices: strategy.slice_count(),
            sram_bytes: footprint + extra,
        }
    }

    /// Cost of running `nodes` one after another with every operand in HBM.
    ///
    /// Tensors passed between the nodes are written out and read back, so they
    /// count twice.
    pub fn unsliced<Tgt: Target>(graph: &Graph, nodes: &[NodeId]) -> Self {
        let mut macs = 0;
        let mut tpc = 0;
        let mut traffic = 0;
        for &n in nodes {
            let node = graph.node(n);
            let volume: u64 = graph.index_space(n).iter().map(|d| u64::from(d.size)).product();
            match node.op.kind() {
                OpKind::MatrixEngine => macs += volume,
                OpKind::ShapeOnly => {}
                _ => tpc += volume,
            }
            traffic += node
                .inputs
                .iter()
                .map(|&t| graph.tensor(t).bytes())
                .sum::<u64>();
            traffic += graph.tensor(node.output).bytes();
        }
        let exposed = compute_cycles::<Tgt>(macs, tpc) + dma_cycles::<Tgt>(traffic);
        let latency = (UNSLICED_PENALTY * exposed).to_integer() + Tgt::slice_overhead();
        PipelineCost {
            latency,
            hbm_traffic: traffic,
            slices: 1,
            sram_bytes: 0,
        }
    }
}

/// Pick among `candidates`, in preference order.
///
/// With the cost model disabled the first candidate wins. Otherwise the cheapest
/// wins, counting the members it trims as running unsliced. `None` is returned
/// when no candidate beats running the whole bundle unsliced.
pub fn select<Tgt: Target>(
    graph: &Graph,
    candidates: &[SlicingStrategy],
    cost_model: bool,
    double_buffered: bool,
) -> Option<(usize, PipelineCost)> {
    let first = candidates.first()?;
    if !cost_model {
        return Some((0, PipelineCost::of_strategy::<Tgt>(first, double_buffered)));
    }
    let (idx, best) = candidates
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let db = double_buffered && !s.dynamic;
            let mut cost = PipelineCost::of_strategy::<Tgt>(s, db);
            if !s.trimmed.is_empty() {
                let rest = PipelineCost::unsliced::<Tgt>(graph, &s.trimmed);
                cost.latency += rest.latency;
                cost.hbm_traffic += rest.hbm_traffic;
            }
            (i, cost)
        })
        .min_by(|(ia, a), (ib, b)| a.cmp(b).then(ia.cmp(ib)))?;
    let mut all = first.members.nodes();
    all.extend(&first.trimmed);
    let unsliced = PipelineCost::unsliced::<Tgt>(graph, &all);
    debug!(
        "Bundle {}: best {} at {} cycles, unsliced {} cycles",
        first.bundle.0, candidates[idx], best.latency, unsliced.latency
    );
    if best.latency >= unsliced.latency {
        return None;
    }
    Some((idx, best))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Gaudi2Target;
    use proptest::prelude::*;

    fn phases(v: &[(u64, u64, u64)]) -> Vec<SlicePhases> {
        v.iter()
            .map(|&(fetch, compute, evict)| SlicePhases {
                fetch,
                compute,
                evict,
            })
            .collect()
    }

    #[test]
    fn test_double_buffering_hides_transfers() {
        let p = phases(&[(10, 100, 0), (10, 100, 0), (10, 100, 20)]);
        assert_eq!(pipeline_latency(&p, true, 0), 10 + 300 + 20);
        assert_eq!(pipeline_latency(&p, false, 0), 350);
    }

    #[test]
    fn test_dma_bound_pipeline() {
        // Fetching the next slice takes longer than computing this one.
        let p = phases(&[(50, 10, 5), (50, 10, 5)]);
        assert_eq!(pipeline_latency(&p, true, 1), 50 + 50 + 10 + 5 + 2);
    }

    #[test]
    fn test_empty_pipeline_is_free() {
        assert_eq!(pipeline_latency(&[], true, 7), 0);
        assert_eq!(pipeline_latency(&[], false, 7), 0);
    }

    #[test]
    fn test_cost_order_is_lexicographic() {
        let a = PipelineCost {
            latency: 5,
            hbm_traffic: 100,
            slices: 1,
            sram_bytes: 0,
        };
        let b = PipelineCost {
            hbm_traffic: 50,
            ..a
        };
        assert!(b < a);
        let c = PipelineCost { latency: 4, ..a };
        assert!(c < b);
    }

    #[test]
    fn test_unsliced_counts_penalty() {
        let mut g = Graph::new();
        let a = g
            .create_tensor("a", crate::shape![64, 64], crate::common::Dtype::Float32, false)
            .unwrap();
        let b = g
            .create_tensor("b", crate::shape![64, 64], crate::common::Dtype::Float32, false)
            .unwrap();
        g.apply("mm", crate::graph::ops::Op::gemm(), &[a, b]).unwrap();
        g.freeze().unwrap();
        let c = PipelineCost::unsliced::<Gaudi2Target>(&g, &[NodeId(0)]);
        assert_eq!(c.hbm_traffic, 3 * 64 * 64 * 4);
        let exposed = 2 + (3 * 64 * 64 * 4) / 1024;
        assert_eq!(c.latency, exposed * 11 / 10 + 400);
    }

    proptest! {
        #[test]
        fn test_double_buffering_never_slower(
            v in proptest::collection::vec((0u64..1000, 0u64..1000, 0u64..1000), 1..12)
        ) {
            let p = phases(&v);
            prop_assert!(pipeline_latency(&p, true, 3) <= pipeline_latency(&p, false, 3));
        }
    }
}
