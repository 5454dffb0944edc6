//! Clock graph — timestamp translation across receiver pairs.
//!
//! Undirected weighted graph over receivers with mature pair filters.
//! Edge weight is the pair's jitter variance plus a small per-hop
//! constant, so shortest paths prefer quiet pairs and few hops. When two
//! receivers share no direct pair, translations compose through
//! intermediate hops.
//!
//! The graph is a snapshot: `rebuild` copies the per-edge clock model out
//! of the live filters, so queries never observe a half-updated edge and
//! solver workers can hold a graph without borrowing the tracker.

use std::collections::{BinaryHeap, HashMap};

use crate::clock::{PairClock, PairKey};
use crate::config::GraphParams;
use crate::types::{MlatError, ReceiverId, Result};

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// Immutable copy of one pair's clock model, oriented i -> j.
#[derive(Debug, Clone, Copy)]
struct EdgeSnapshot {
    delta: f64,
    rate: f64,
    /// Filter time of the pair's last observation (i's clock).
    last_obs_t: f64,
    /// Variance contributed by crossing this edge [s^2].
    variance: f64,
    /// Dijkstra weight: variance + hop penalty.
    weight: f64,
}

impl EdgeSnapshot {
    /// Translate across the edge; `forward` means i -> j.
    fn translate(&self, t: f64, forward: bool) -> f64 {
        if forward {
            t + self.delta + self.rate * (t - self.last_obs_t)
        } else {
            // Solve t_i = t_j - delta(t_i); the offset can be tens of
            // seconds, so the rate term must be evaluated at t_i.
            (t - self.delta + self.rate * self.last_obs_t) / (1.0 + self.rate)
        }
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Snapshot graph over synced receivers.
#[derive(Debug)]
pub struct ClockGraph {
    adj: HashMap<ReceiverId, Vec<ReceiverId>>,
    edges: HashMap<PairKey, EdgeSnapshot>,
    params: GraphParams,
}

impl ClockGraph {
    /// Build from the current pair filters. Pairs still in bootstrap,
    /// below the observation minimum, or above the variance cutoff are
    /// left out.
    pub fn rebuild<'a>(
        pairs: impl Iterator<Item = (&'a PairKey, &'a PairClock)>,
        params: &GraphParams,
    ) -> ClockGraph {
        let mut adj: HashMap<ReceiverId, Vec<ReceiverId>> = HashMap::new();
        let mut edges = HashMap::new();

        for (&key, pc) in pairs {
            if !pc.eligible() {
                continue;
            }
            let jitter_var = pc.jitter_s().powi(2);
            let variance = jitter_var + pc.sigma().powi(2);
            if variance > params.edge_variance_cutoff_s2 {
                continue;
            }
            let Some(last_obs_t) = pc.last_obs_t() else {
                continue;
            };
            edges.insert(
                key,
                EdgeSnapshot {
                    delta: pc.delta(),
                    rate: pc.rate(),
                    last_obs_t,
                    variance,
                    weight: jitter_var + params.hop_penalty_s2,
                },
            );
            adj.entry(key.i).or_default().push(key.j);
            adj.entry(key.j).or_default().push(key.i);
        }

        ClockGraph {
            adj,
            edges,
            params: params.clone(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.adj.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, id: ReceiverId) -> bool {
        self.adj.contains_key(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = ReceiverId> + '_ {
        self.adj.keys().copied()
    }

    /// Shortest-path tree from `from`: node -> (total weight, predecessor).
    fn dijkstra(&self, from: ReceiverId) -> HashMap<ReceiverId, (f64, ReceiverId)> {
        #[derive(PartialEq)]
        struct Entry {
            cost: f64,
            node: ReceiverId,
        }
        impl Eq for Entry {}
        impl Ord for Entry {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                // Min-heap on cost; ties by id for determinism
                other
                    .cost
                    .total_cmp(&self.cost)
                    .then_with(|| other.node.cmp(&self.node))
            }
        }
        impl PartialOrd for Entry {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut best: HashMap<ReceiverId, (f64, ReceiverId)> = HashMap::new();
        let mut heap = BinaryHeap::new();
        best.insert(from, (0.0, from));
        heap.push(Entry {
            cost: 0.0,
            node: from,
        });

        while let Some(Entry { cost, node }) = heap.pop() {
            if cost > best.get(&node).map_or(f64::INFINITY, |b| b.0) {
                continue;
            }
            let Some(neighbours) = self.adj.get(&node) else {
                continue;
            };
            for &next in neighbours {
                let key = PairKey::new(node, next);
                let weight = self.edges[&key].weight;
                let c = cost + weight;
                if c < best.get(&next).map_or(f64::INFINITY, |b| b.0) {
                    best.insert(next, (c, node));
                    heap.push(Entry { cost: c, node: next });
                }
            }
        }
        best
    }

    /// Reconstruct the node sequence `from -> ... -> to`.
    fn shortest_path(&self, from: ReceiverId, to: ReceiverId) -> Option<Vec<ReceiverId>> {
        let tree = self.dijkstra(from);
        if !tree.contains_key(&to) {
            return None;
        }
        let mut path = vec![to];
        let mut cur = to;
        while cur != from {
            cur = tree[&cur].1;
            path.push(cur);
        }
        path.reverse();
        Some(path)
    }

    /// Translate `t` (seconds, `from`'s clock) into `to`'s clock.
    /// Returns the translated time and the accumulated variance.
    pub fn translate(&self, t: f64, from: ReceiverId, to: ReceiverId) -> Result<(f64, f64)> {
        if from == to {
            return Ok((t, 0.0));
        }
        let path = self
            .shortest_path(from, to)
            .ok_or(MlatError::NoSyncPath { from, to })?;

        let mut t_cur = t;
        let mut variance = 0.0;
        for hop in path.windows(2) {
            let key = PairKey::new(hop[0], hop[1]);
            let edge = &self.edges[&key];
            t_cur = edge.translate(t_cur, hop[0] == key.i);
            variance += edge.variance;
        }

        if variance > self.params.path_variance_ceiling_s2 {
            return Err(MlatError::NoSyncPath { from, to });
        }
        Ok((t_cur, variance))
    }

    /// Variance a translation between two receivers would carry.
    pub fn expected_variance(&self, from: ReceiverId, to: ReceiverId) -> Result<f64> {
        if from == to {
            return Ok(0.0);
        }
        let path = self
            .shortest_path(from, to)
            .ok_or(MlatError::NoSyncPath { from, to })?;
        let variance: f64 = path
            .windows(2)
            .map(|hop| self.edges[&PairKey::new(hop[0], hop[1])].variance)
            .sum();
        if variance > self.params.path_variance_ceiling_s2 {
            return Err(MlatError::NoSyncPath { from, to });
        }
        Ok(variance)
    }

    /// The best-connected receiver: reaches the most nodes with the
    /// lowest summed path variance; ties broken by lowest id.
    pub fn select_anchor(&self) -> Option<ReceiverId> {
        let mut best: Option<(usize, f64, ReceiverId)> = None;
        let mut nodes: Vec<ReceiverId> = self.adj.keys().copied().collect();
        nodes.sort();

        for &node in &nodes {
            let tree = self.dijkstra(node);
            let reach = tree.len() - 1;
            let total: f64 = nodes
                .iter()
                .filter(|&&n| n != node)
                .filter_map(|n| {
                    let path = self.shortest_path(node, *n)?;
                    Some(
                        path.windows(2)
                            .map(|hop| self.edges[&PairKey::new(hop[0], hop[1])].variance)
                            .sum::<f64>(),
                    )
                })
                .sum();
            let candidate = (reach, total, node);
            best = Some(match best {
                None => candidate,
                Some(b) => {
                    if candidate.0 > b.0 || (candidate.0 == b.0 && candidate.1 < b.1) {
                        candidate
                    } else {
                        b
                    }
                }
            });
        }
        best.map(|(_, _, id)| id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncParams;

    /// A pair filter fed to maturity with a fixed offset and rate.
    fn mature_pair(delta: f64, rate: f64, r_var: f64) -> PairClock {
        let mut pc = PairClock::new(SyncParams::default());
        for k in 0..10 {
            let t = k as f64;
            pc.update(t, delta + rate * t, r_var, 100.0 + t);
        }
        assert!(pc.eligible());
        pc
    }

    fn graph_of(pairs: &[(u32, u32, f64, f64)]) -> (Vec<(PairKey, PairClock)>, ClockGraph) {
        let built: Vec<(PairKey, PairClock)> = pairs
            .iter()
            .map(|&(a, b, delta, rate)| {
                (
                    PairKey::new(ReceiverId(a), ReceiverId(b)),
                    mature_pair(delta, rate, 1e-15),
                )
            })
            .collect();
        let graph = ClockGraph::rebuild(
            built.iter().map(|(k, p)| (k, p)),
            &GraphParams::default(),
        );
        (built, graph)
    }

    #[test]
    fn test_direct_translation() {
        let (_p, g) = graph_of(&[(0, 1, 2e-3, 0.0)]);
        assert_eq!(g.node_count(), 2);
        let (t, var) = g.translate(50.0, ReceiverId(0), ReceiverId(1)).unwrap();
        assert!((t - 50.002).abs() < 1e-7, "t = {t}");
        assert!(var > 0.0);
    }

    #[test]
    fn test_reverse_translation() {
        let (_p, g) = graph_of(&[(0, 1, 2e-3, 0.0)]);
        let (t, _) = g.translate(50.002, ReceiverId(1), ReceiverId(0)).unwrap();
        assert!((t - 50.0).abs() < 1e-7);
    }

    #[test]
    fn test_identity_translation() {
        let (_p, g) = graph_of(&[(0, 1, 2e-3, 0.0)]);
        assert_eq!(g.translate(5.0, ReceiverId(0), ReceiverId(0)).unwrap(), (5.0, 0.0));
    }

    #[test]
    fn test_composition_through_hop() {
        // Edges 0-1 and 1-2 only; 0 -> 2 must compose and match the
        // two-step translation to within the summed variance.
        let (_p, g) = graph_of(&[(0, 1, 1e-3, 0.0), (1, 2, -4e-3, 0.0)]);
        let (direct, var) = g.translate(10.0, ReceiverId(0), ReceiverId(2)).unwrap();

        let (step1, v1) = g.translate(10.0, ReceiverId(0), ReceiverId(1)).unwrap();
        let (step2, v2) = g.translate(step1, ReceiverId(1), ReceiverId(2)).unwrap();
        assert!((direct - step2).abs() <= (var + v1 + v2).sqrt() + 1e-12);
        assert!((direct - (10.0 + 1e-3 - 4e-3)).abs() < 1e-7);
        assert!((var - (v1 + v2)).abs() < 1e-18);
    }

    #[test]
    fn test_no_path() {
        let (_p, g) = graph_of(&[(0, 1, 1e-3, 0.0), (2, 3, 1e-3, 0.0)]);
        let err = g.translate(1.0, ReceiverId(0), ReceiverId(3)).unwrap_err();
        assert!(matches!(err, MlatError::NoSyncPath { .. }));
    }

    #[test]
    fn test_unknown_receiver_no_path() {
        let (_p, g) = graph_of(&[(0, 1, 1e-3, 0.0)]);
        assert!(g.translate(1.0, ReceiverId(0), ReceiverId(9)).is_err());
    }

    #[test]
    fn test_immature_pair_not_published() {
        let key = PairKey::new(ReceiverId(0), ReceiverId(1));
        let mut pc = PairClock::new(SyncParams::default());
        pc.update(0.0, 1e-3, 1e-15, 100.0); // single observation
        let pairs = vec![(key, pc)];
        let g = ClockGraph::rebuild(
            pairs.iter().map(|(k, p)| (k, p)),
            &GraphParams::default(),
        );
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn test_anchor_prefers_center() {
        // Star: 1 is connected to 0 and 2; 0 and 2 reach each other
        // through 1 only, so 1 has the lowest summed variance.
        let (_p, g) = graph_of(&[(0, 1, 1e-3, 0.0), (1, 2, 1e-3, 0.0)]);
        assert_eq!(g.select_anchor(), Some(ReceiverId(1)));
    }

    #[test]
    fn test_anchor_tie_breaks_by_id() {
        // Fully symmetric triangle: everyone reaches everyone at equal
        // cost, lowest id wins.
        let (_p, g) = graph_of(&[
            (0, 1, 1e-3, 0.0),
            (1, 2, 1e-3, 0.0),
            (0, 2, 1e-3, 0.0),
        ]);
        assert_eq!(g.select_anchor(), Some(ReceiverId(0)));
    }

    #[test]
    fn test_rate_corrected_translation() {
        let (_p, g) = graph_of(&[(0, 1, 1e-3, 10e-6)]);
        // Last observation at t=9; translating t=19 must apply 10 more
        // seconds of 10 ppm drift on top of the converged offset.
        let (t, _) = g.translate(19.0, ReceiverId(0), ReceiverId(1)).unwrap();
        let expect = 19.0 + 1e-3 + 10e-6 * 19.0;
        assert!((t - expect).abs() < 1e-6, "t = {t}, expect {expect}");
    }
}
