//! Reachability pre-checks for channel-mode analyses.
//!
//! The normalized-channel Laplacian is only solvable when every source can
//! feed at least one sink through edges the damping mask keeps alive. The
//! pre-check walks the masked graph with incoming edges of sources and
//! outgoing edges of sinks cut, so a path found here is a genuine
//! source-to-sink transit path. All live edges count one hop, which makes the
//! shortest-path search a plain breadth-first traversal.

use std::collections::VecDeque;

use crate::adjacency::CsrAdjacency;
use crate::{Error, Result};

#[derive(Debug)]
pub(crate) struct ChannelPrecheck {
    /// Average over sources of the shortest hop count to the nearest sink.
    /// Lower bound for the average path length in calibration.
    pub avg_shortest_path: f64,
    /// Nodes outside the (source-reachable ∩ sink-coreachable) region; their
    /// mask entries must be zeroed before an undamped solve.
    pub disconnected: Vec<usize>,
}

/// Verify every source reaches some sink through the masked graph, and
/// locate the region that actually participates in source-to-sink transit.
pub(crate) fn channel_precheck(
    adj: &CsrAdjacency,
    df_mask: &[f64],
    sources: &[usize],
    sinks: &[usize],
) -> Result<ChannelPrecheck> {
    let n = adj.node_count();
    let mut is_source = vec![false; n];
    for &s in sources {
        is_source[s] = true;
    }
    let mut is_sink = vec![false; n];
    for &k in sinks {
        is_sink[k] = true;
    }

    let mut forward: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        if is_sink[i] {
            continue;
        }
        for k in adj.row_range(i) {
            let j = adj.col_indices()[k];
            if df_mask[k] == 0.0 || is_source[j] || j == i {
                continue;
            }
            forward[i].push(j);
            reverse[j].push(i);
        }
    }

    let mut src_valid = vec![false; n];
    let mut total_shortest = 0usize;
    for &s in sources {
        let dist = hop_distances(&forward, s);
        let nearest = sinks
            .iter()
            .filter_map(|&k| dist[k])
            .min()
            .ok_or(Error::UnreachableBoundary)?;
        total_shortest += nearest;
        for (flag, d) in src_valid.iter_mut().zip(dist.iter()) {
            *flag |= d.is_some();
        }
    }

    let mut snk_valid = vec![false; n];
    for &k in sinks {
        let dist = hop_distances(&reverse, k);
        for (flag, d) in snk_valid.iter_mut().zip(dist.iter()) {
            *flag |= d.is_some();
        }
    }

    let disconnected = (0..n)
        .filter(|&i| !(src_valid[i] && snk_valid[i]))
        .collect();

    Ok(ChannelPrecheck {
        avg_shortest_path: total_shortest as f64 / sources.len() as f64,
        disconnected,
    })
}

/// Zero the mask entries of every edge touching one of `nodes`, removing
/// them from the chain entirely.
pub(crate) fn mask_out_nodes(adj: &CsrAdjacency, df_mask: &mut [f64], nodes: &[usize]) {
    let n = adj.node_count();
    let mut excluded = vec![false; n];
    for &i in nodes {
        excluded[i] = true;
    }
    for i in 0..n {
        for k in adj.row_range(i) {
            if excluded[i] || excluded[adj.col_indices()[k]] {
                df_mask[k] = 0.0;
            }
        }
    }
}

/// BFS hop distances over an adjacency list; `None` marks unreachable nodes.
fn hop_distances(adj: &[Vec<usize>], start: usize) -> Vec<Option<usize>> {
    let mut dist = vec![None; adj.len()];
    dist[start] = Some(0);
    let mut queue = VecDeque::new();
    queue.push_back(start);
    while let Some(u) = queue.pop_front() {
        let du = match dist[u] {
            Some(d) => d,
            None => continue,
        };
        for &v in &adj[u] {
            if dist[v].is_none() {
                dist[v] = Some(du + 1);
                queue.push_back(v);
            }
        }
    }
    dist
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn mask_ones(adj: &CsrAdjacency) -> Vec<f64> {
        adj.damping_mask(1.0, &BTreeMap::new(), 1.0, &BTreeMap::new())
    }

    #[test]
    fn shortest_path_average_over_sources() {
        // 0 -> 1 -> 2 -> 4 and 3 -> 4: sources {0, 3}, sink {4}
        let adj = CsrAdjacency::from_edges(
            5,
            &[(0, 1, 1.0), (1, 2, 1.0), (2, 4, 1.0), (3, 4, 1.0)],
        )
        .unwrap();
        let mask = mask_ones(&adj);
        let pre = channel_precheck(&adj, &mask, &[0, 3], &[4]).unwrap();
        assert_eq!(pre.avg_shortest_path, 2.0); // (3 + 1) / 2
    }

    #[test]
    fn disconnected_source_is_an_error() {
        // two components: 0 -> 1 and 2 -> 3; source 0, sink 3
        let adj =
            CsrAdjacency::from_edges(4, &[(0, 1, 1.0), (2, 3, 1.0)]).unwrap();
        let mask = mask_ones(&adj);
        let err = channel_precheck(&adj, &mask, &[0], &[3]).unwrap_err();
        assert!(matches!(err, Error::UnreachableBoundary));
    }

    #[test]
    fn masked_edges_do_not_carry_flow() {
        let adj = CsrAdjacency::from_edges(3, &[(0, 1, 1.0), (1, 2, 1.0)]).unwrap();
        let mut out = BTreeMap::new();
        out.insert(1usize, 0.0); // node 1 fully dissipates
        let mask = adj.damping_mask(1.0, &out, 1.0, &BTreeMap::new());
        let err = channel_precheck(&adj, &mask, &[0], &[2]).unwrap_err();
        assert!(matches!(err, Error::UnreachableBoundary));
    }

    #[test]
    fn off_transit_nodes_are_reported_disconnected() {
        // transit path 0 -> 1 -> 2; node 3 dangles off node 1
        let adj = CsrAdjacency::from_edges(
            4,
            &[(0, 1, 1.0), (1, 2, 1.0), (1, 3, 1.0)],
        )
        .unwrap();
        let mask = mask_ones(&adj);
        let pre = channel_precheck(&adj, &mask, &[0], &[2]).unwrap();
        assert_eq!(pre.disconnected, vec![3]);
        assert_eq!(pre.avg_shortest_path, 2.0);
    }

    #[test]
    fn mask_out_nodes_zeroes_rows_and_columns() {
        let adj = CsrAdjacency::from_edges(
            3,
            &[(0, 1, 1.0), (1, 2, 1.0), (2, 0, 1.0)],
        )
        .unwrap();
        let mut mask = mask_ones(&adj);
        mask_out_nodes(&adj, &mut mask, &[1]);
        for i in 0..3 {
            for k in adj.row_range(i) {
                let j = adj.col_indices()[k];
                if i == 1 || j == 1 {
                    assert_eq!(mask[k], 0.0);
                } else {
                    assert_eq!(mask[k], 1.0);
                }
            }
        }
    }
}
