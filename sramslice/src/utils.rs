use petgraph::algo::{toposort, Cycle};
use petgraph::graphmap::{DiGraphMap, NodeTrait};
use petgraph::Direction;
use std::collections::HashMap;

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Round `n` up to the next multiple of `multiple`.
///
/// # Examples
/// ```
/// # use sramslice::utils::round_up;
/// assert_eq!(round_up(0, 128), 0);
/// assert_eq!(round_up(1, 128), 128);
/// assert_eq!(round_up(256, 128), 256);
/// ```
pub const fn round_up(n: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        return n;
    }
    n.div_ceil(multiple) * multiple
}

pub const fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// A topological order of `dag` grouped by depth, the longest path from any
/// source. Within a depth, vertices are ordered by `key`.
pub fn layered_toposort<N, K>(dag: &DiGraphMap<N, ()>, key: impl Fn(N) -> K) -> Result<Vec<N>, Cycle<N>>
where
    N: NodeTrait,
    K: Ord,
{
    let mut order = toposort(dag, None)?;
    let mut depth: HashMap<N, usize> = HashMap::with_capacity(order.len());
    for &n in &order {
        let d = dag
            .neighbors_directed(n, Direction::Incoming)
            .filter_map(|p| depth.get(&p))
            .map(|d| d + 1)
            .max()
            .unwrap_or(0);
        depth.insert(n, d);
    }
    order.sort_by_cached_key(|&n| (depth.get(&n).copied().unwrap_or(0), key(n)));
    Ok(order)
}
