//! Deterministic Louvain modularity maximization.
//!
//! Nodes are visited in ascending index order and candidate communities
//! in ascending id order; a node only moves for a strictly better gain.
//! Same graph in, same partition out, no RNG.

use std::collections::BTreeMap;

use crate::{Error, Result};

const MIN_GAIN: f64 = 1e-12;

/// Symmetric weighted adjacency. A self-loop `(i, w)` appears once in `adj[i]`;
/// every other edge appears in both endpoint lists.
pub(crate) struct WeightedGraph {
    pub(crate) adj: Vec<Vec<(usize, f64)>>,
}

impl WeightedGraph {
    fn degree(&self, i: usize) -> f64 {
        self.adj[i].iter().map(|&(j, w)| if j == i { 2.0 * w } else { w }).sum()
    }

    /// Sum of edge weights, each edge counted once.
    fn total_weight(&self) -> f64 {
        (0..self.adj.len()).map(|i| self.degree(i)).sum::<f64>() / 2.0
    }
}

/// Partition node indices `0..n` into communities, returned as a community
/// label per node, labels numbered by first appearance.
pub(crate) fn partition(graph: &WeightedGraph) -> Result<Vec<usize>> {
    let n = graph.adj.len();
    let m = graph.total_weight();
    if !m.is_finite() {
        return Err(Error::InvalidArgument(format!("total edge weight is not finite ({m})")));
    }
    if m == 0.0 {
        return Ok((0..n).collect());
    }

    let mut membership: Vec<usize> = (0..n).collect();
    let mut level = WeightedGraph { adj: graph.adj.clone() };

    loop {
        let (labels, moved) = local_moves(&level, m);
        for c in membership.iter_mut() {
            *c = labels[*c];
        }
        let communities = labels.iter().copied().max().map_or(0, |c| c + 1);
        if !moved || communities == level.adj.len() {
            break;
        }
        level = aggregate(&level, &labels, communities);
    }

    Ok(renumber(&membership))
}

/// Phase one: greedy single-node moves until a full pass changes nothing.
fn local_moves(g: &WeightedGraph, m: f64) -> (Vec<usize>, bool) {
    let n = g.adj.len();
    let two_m = 2.0 * m;
    let degree: Vec<f64> = (0..n).map(|i| g.degree(i)).collect();
    let mut comm: Vec<usize> = (0..n).collect();
    let mut tot = degree.clone();
    let mut moved_any = false;

    loop {
        let mut moved = false;
        for i in 0..n {
            let home = comm[i];
            let k_i = degree[i];
            tot[home] -= k_i;

            let mut links: BTreeMap<usize, f64> = BTreeMap::new();
            for &(j, w) in &g.adj[i] {
                if j != i {
                    *links.entry(comm[j]).or_default() += w;
                }
            }

            let gain = |c: usize, w_ic: f64| w_ic - tot[c] * k_i / two_m;
            let mut best = home;
            let mut best_gain = gain(home, links.get(&home).copied().unwrap_or(0.0));
            for (&c, &w_ic) in &links {
                let g_c = gain(c, w_ic);
                if g_c > best_gain + MIN_GAIN {
                    best = c;
                    best_gain = g_c;
                }
            }

            tot[best] += k_i;
            if best != home {
                comm[i] = best;
                moved = true;
                moved_any = true;
            }
        }
        if !moved {
            break;
        }
    }

    (renumber(&comm), moved_any)
}

/// Phase two: collapse each community into one node. Internal weight
/// becomes a self-loop.
fn aggregate(g: &WeightedGraph, labels: &[usize], communities: usize) -> WeightedGraph {
    let mut inner = vec![0.0; communities];
    let mut between: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); communities];

    for (i, edges) in g.adj.iter().enumerate() {
        let ci = labels[i];
        for &(j, w) in edges {
            let cj = labels[j];
            if i == j {
                inner[ci] += w;
            } else if ci == cj {
                // Seen once from each endpoint.
                inner[ci] += w / 2.0;
            } else {
                *between[ci].entry(cj).or_default() += w;
            }
        }
    }

    let adj = between
        .into_iter()
        .enumerate()
        .map(|(c, links)| {
            let mut row: Vec<(usize, f64)> = links.into_iter().collect();
            if inner[c] > 0.0 {
                row.push((c, inner[c]));
            }
            row
        })
        .collect();
    WeightedGraph { adj }
}

/// Relabel so labels are 0.. in order of first appearance.
fn renumber(labels: &[usize]) -> Vec<usize> {
    let mut map: BTreeMap<usize, usize> = BTreeMap::new();
    let mut out = Vec::with_capacity(labels.len());
    for &l in labels {
        let next = map.len();
        out.push(*map.entry(l).or_insert(next));
    }
    out
}

/// Newman modularity of a labelling.
pub(crate) fn modularity(g: &WeightedGraph, labels: &[usize]) -> f64 {
    let m = g.total_weight();
    if m == 0.0 {
        return 0.0;
    }
    let communities = labels.iter().copied().max().map_or(0, |c| c + 1);
    let mut internal = vec![0.0; communities];
    let mut degree = vec![0.0; communities];
    for (i, edges) in g.adj.iter().enumerate() {
        let ci = labels[i];
        for &(j, w) in edges {
            if i == j {
                internal[ci] += w;
                degree[ci] += 2.0 * w;
            } else {
                if labels[j] == ci {
                    internal[ci] += w / 2.0;
                }
                degree[ci] += w;
            }
        }
    }
    internal
        .iter()
        .zip(&degree)
        .map(|(l, d)| l / m - (d / (2.0 * m)).powi(2))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_edges(n: usize, edges: &[(usize, usize, f64)]) -> WeightedGraph {
        let mut adj = vec![Vec::new(); n];
        for &(a, b, w) in edges {
            adj[a].push((b, w));
            if a != b {
                adj[b].push((a, w));
            }
        }
        WeightedGraph { adj }
    }

    fn two_cliques() -> WeightedGraph {
        let mut edges = Vec::new();
        for base in [0, 5] {
            for i in 0..5 {
                for j in (i + 1)..5 {
                    edges.push((base + i, base + j, 1.0));
                }
            }
        }
        edges.push((4, 5, 1.0));
        from_edges(10, &edges)
    }

    #[test]
    fn test_two_cliques_split() {
        let labels = partition(&two_cliques()).unwrap();
        assert_eq!(labels, vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_partition_is_deterministic() {
        let g = two_cliques();
        assert_eq!(partition(&g).unwrap(), partition(&g).unwrap());
    }

    #[test]
    fn test_edgeless_graph_is_singletons() {
        let labels = partition(&from_edges(4, &[])).unwrap();
        assert_eq!(labels, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_partition_improves_on_singletons() {
        let g = two_cliques();
        let found = partition(&g).unwrap();
        let singletons: Vec<usize> = (0..10).collect();
        assert!(modularity(&g, &found) > modularity(&g, &singletons));
    }

    #[test]
    fn test_non_finite_weight_fails() {
        let g = from_edges(2, &[(0, 1, f64::INFINITY)]);
        assert!(partition(&g).is_err());
    }

    #[test]
    fn test_self_loop_degree_counts_twice() {
        let g = from_edges(1, &[(0, 0, 3.0)]);
        assert_eq!(g.degree(0), 6.0);
        assert_eq!(g.total_weight(), 3.0);
    }
}
