/// Two-level bounded indirection search over a triangular cost matrix
use super::route_manager::{RouteEntry, RouteManager, MAX_ROUTE_RELAYS, UNCOSTABLE_THRESHOLD};
use crate::config::OptimizerConfig;
use crate::matrix::{tri_index, tri_len, CostMatrix, UNROUTABLE};
use rayon::prelude::*;
use std::time::Instant;
use tracing::debug;

/// Optimizer knobs
#[derive(Debug, Clone, Copy)]
pub struct OptimizeOptions<'a> {
    /// An indirect path must beat the direct link by more than this
    pub cost_threshold: i32,
    /// Waypoints kept per ordered pair
    pub max_indirects: usize,
    /// Routes kept per pair
    pub max_routes_per_entry: usize,
    /// Longest relay sequence kept
    pub max_route_relays: usize,
    /// Relay index -> datacenter id, for redundancy filtering
    pub datacenters: Option<&'a [u64]>,
    /// Relay index -> whether sessions may end there; pairs with no dest relay get no routes
    pub dest_relays: Option<&'a [bool]>,
}

impl Default for OptimizeOptions<'_> {
    fn default() -> Self {
        Self {
            cost_threshold: 5,
            max_indirects: 5,
            max_routes_per_entry: 8,
            max_route_relays: MAX_ROUTE_RELAYS,
            datacenters: None,
            dest_relays: None,
        }
    }
}

impl<'a> OptimizeOptions<'a> {
    pub fn from_config(
        config: &OptimizerConfig,
        datacenters: &'a [u64],
        dest_relays: &'a [bool],
    ) -> Self {
        Self {
            cost_threshold: config.cost_threshold,
            max_indirects: config.max_indirects,
            max_routes_per_entry: config.max_routes_per_entry,
            max_route_relays: config.max_route_relays,
            datacenters: config.datacenter_filter.then_some(datacenters),
            dest_relays: Some(dest_relays),
        }
    }

    fn is_dest(&self, relay: usize) -> bool {
        self.dest_relays
            .and_then(|dests| dests.get(relay).copied())
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Indirect {
    relay: usize,
    cost: i32,
}

/// Contiguous `[start, end)` relay ranges, one per worker
fn segment_ranges(num_relays: usize, segments: usize) -> Vec<(usize, usize)> {
    let segments = segments.clamp(1, num_relays.max(1));
    (0..segments)
        .map(|s| (s * num_relays / segments, (s + 1) * num_relays / segments))
        .collect()
}

struct Costs<'c> {
    costs: &'c [i32],
}

impl Costs<'_> {
    fn get(&self, i: usize, j: usize) -> i32 {
        self.costs
            .get(tri_index(i, j))
            .copied()
            .unwrap_or(UNROUTABLE)
    }
}

/// Compute up to `max_routes_per_entry` routes for every relay pair.
///
/// Returns one [`RouteEntry`] per triangular index. The result does not depend
/// on `segments`.
pub fn optimize(
    costs: &[i32],
    num_relays: usize,
    segments: usize,
    options: &OptimizeOptions,
) -> Vec<RouteEntry> {
    if num_relays < 2 {
        return Vec::new();
    }

    debug_assert_eq!(costs.len(), tri_len(num_relays));

    let start = Instant::now();
    let costs = Costs { costs };
    let ranges = segment_ranges(num_relays, segments);

    // Pass 1: waypoint candidates for every ordered pair
    let indirect: Vec<Vec<Vec<Indirect>>> = ranges
        .par_iter()
        .map(|&(begin, end)| {
            (begin..end)
                .map(|i| indirects_from(&costs, num_relays, i, options))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect();

    // Pass 2: assemble routes of up to five relays for i > j
    let entries: Vec<RouteEntry> = ranges
        .par_iter()
        .map(|&(begin, end)| {
            let mut out = Vec::new();
            for i in begin..end {
                for j in 0..i {
                    out.push(assemble_entry(&costs, &indirect, i, j, options));
                }
            }
            out
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect();

    debug!(
        "Optimized {} relays into {} entries in {:?}",
        num_relays,
        entries.len(),
        start.elapsed()
    );

    entries
}

/// Convenience wrapper over a [`CostMatrix`]
pub fn optimize_matrix(
    matrix: &CostMatrix,
    segments: usize,
    options: &OptimizeOptions,
) -> Vec<RouteEntry> {
    optimize(&matrix.costs, matrix.num_relays(), segments, options)
}

fn indirects_from(
    costs: &Costs,
    num_relays: usize,
    i: usize,
    options: &OptimizeOptions,
) -> Vec<Vec<Indirect>> {
    let mut row = Vec::with_capacity(num_relays);
    for j in 0..num_relays {
        if i == j {
            row.push(Vec::new());
            continue;
        }

        let direct = costs.get(i, j);
        let mut candidates = Vec::new();
        for x in 0..num_relays {
            if x == i || x == j {
                continue;
            }
            let ix = costs.get(i, x);
            let xj = costs.get(x, j);
            if ix < 0 || xj < 0 {
                continue;
            }
            let cost = ix.saturating_add(xj);
            // No direct link: every two-leg path is a candidate
            if direct < 0 || cost.saturating_add(options.cost_threshold) < direct {
                candidates.push(Indirect { relay: x, cost });
            }
        }

        candidates.sort_by(|a, b| a.cost.cmp(&b.cost).then(a.relay.cmp(&b.relay)));
        candidates.truncate(options.max_indirects);
        row.push(candidates);
    }
    row
}

fn assemble_entry(
    costs: &Costs,
    indirect: &[Vec<Vec<Indirect>>],
    i: usize,
    j: usize,
    options: &OptimizeOptions,
) -> RouteEntry {
    let direct = costs.get(i, j);

    if !options.is_dest(i) && !options.is_dest(j) {
        return RouteEntry {
            direct_cost: direct,
            routes: Vec::new(),
        };
    }

    let mut manager =
        RouteManager::new(options.max_routes_per_entry).with_max_relays(options.max_route_relays);
    if let Some(datacenters) = options.datacenters {
        manager = manager.with_datacenters(datacenters);
    }

    let mut offer = |cost: i32, relays: &[usize]| {
        if cost >= UNCOSTABLE_THRESHOLD {
            return;
        }
        let relays: Vec<u32> = relays.iter().map(|r| *r as u32).collect();
        manager.add_route(cost, &relays);
    };

    if direct >= 0 {
        offer(direct, &[i, j]);
    }

    for k in &indirect[i][j] {
        offer(k.cost, &[i, k.relay, j]);

        let kj = costs.get(k.relay, j);
        for x in &indirect[i][k.relay] {
            offer(x.cost.saturating_add(kj), &[i, x.relay, k.relay, j]);
        }

        let ik = costs.get(i, k.relay);
        for y in &indirect[k.relay][j] {
            offer(ik.saturating_add(y.cost), &[i, k.relay, y.relay, j]);
        }

        for x in &indirect[i][k.relay] {
            for y in &indirect[k.relay][j] {
                offer(x.cost.saturating_add(y.cost), &[i, x.relay, k.relay, y.relay, j]);
            }
        }
    }

    RouteEntry {
        direct_cost: direct,
        routes: manager.into_routes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(n: usize, links: &[(usize, usize, i32)]) -> Vec<i32> {
        let mut costs = vec![UNROUTABLE; tri_len(n)];
        for &(a, b, cost) in links {
            costs[tri_index(a, b)] = cost;
        }
        costs
    }

    #[test]
    fn test_segment_ranges_cover_everything() {
        for n in 1..20 {
            for s in 0..25 {
                let ranges = segment_ranges(n, s);
                assert_eq!(ranges.first().map(|r| r.0), Some(0));
                assert_eq!(ranges.last().map(|r| r.1), Some(n));
                assert!(ranges.windows(2).all(|w| w[0].1 == w[1].0));
            }
        }
    }

    #[test]
    fn test_empty_inputs() {
        let options = OptimizeOptions::default();
        assert!(optimize(&[], 0, 4, &options).is_empty());
        assert!(optimize(&[], 1, 4, &options).is_empty());
    }

    #[test]
    fn test_missing_direct_link_allows_indirect_routes() {
        // 0 - 2 - 1 with no direct 0-1 link
        let costs = matrix(3, &[(0, 2, 15), (2, 1, 25)]);
        let entries = optimize(&costs, 3, 1, &OptimizeOptions::default());

        let entry = &entries[tri_index(1, 0)];
        assert_eq!(entry.direct_cost, UNROUTABLE);
        assert_eq!(entry.routes.len(), 1);
        assert_eq!(entry.routes[0].cost, 40);
        assert_eq!(entry.routes[0].relays, vec![1, 2, 0]);
    }

    #[test]
    fn test_uncostable_candidates_are_discarded() {
        let costs = matrix(3, &[(0, 2, 150), (2, 1, 150)]);
        let entries = optimize(&costs, 3, 1, &OptimizeOptions::default());
        assert!(entries[tri_index(1, 0)].routes.is_empty());
    }

    #[test]
    fn test_margin_is_strict() {
        // 0 -> 2 -> 1 costs 15, direct 20: 15 + 5 is not below 20
        let costs = matrix(3, &[(0, 1, 20), (0, 2, 5), (2, 1, 10)]);
        let entries = optimize(&costs, 3, 1, &OptimizeOptions::default());
        let entry = &entries[tri_index(1, 0)];
        assert_eq!(entry.routes.len(), 1);
        assert_eq!(entry.routes[0].relays, vec![1, 0]);
    }

    #[test]
    fn test_huge_costs_saturate() {
        let costs = matrix(3, &[(0, 1, i32::MAX), (0, 2, i32::MAX), (2, 1, i32::MAX)]);
        let entries = optimize(&costs, 3, 1, &OptimizeOptions::default());
        assert!(entries.iter().all(|entry| entry.routes.is_empty()));
        assert_eq!(entries[tri_index(1, 0)].direct_cost, i32::MAX);
    }

    #[test]
    fn test_pairs_without_dest_relay_are_skipped() {
        // 3 is the only dest relay
        let costs = matrix(4, &[(0, 1, 10), (0, 3, 10), (1, 3, 10), (2, 3, 40), (0, 2, 10)]);
        let dest_relays = [false, false, false, true];
        let options = OptimizeOptions {
            dest_relays: Some(&dest_relays),
            ..OptimizeOptions::default()
        };
        let entries = optimize(&costs, 4, 2, &options);

        let skipped = &entries[tri_index(1, 0)];
        assert_eq!(skipped.direct_cost, 10);
        assert!(skipped.routes.is_empty());
        assert!(entries[tri_index(2, 0)].routes.is_empty());

        // Non-dest relays still serve as waypoints
        let best = entries[tri_index(3, 2)].best().unwrap();
        assert_eq!(best.cost, 20);
        assert_eq!(best.relays, vec![3, 0, 2]);
    }

    #[test]
    fn test_hop_cap_limits_route_length() {
        let costs = matrix(
            4,
            &[(0, 1, 100), (0, 2, 50), (2, 1, 10), (0, 3, 10), (3, 2, 10)],
        );
        let options = OptimizeOptions {
            max_route_relays: 3,
            ..OptimizeOptions::default()
        };
        let entries = optimize(&costs, 4, 1, &options);
        let entry = &entries[tri_index(1, 0)];
        assert!(entry.routes.iter().all(|r| r.relays.len() <= 3));
        assert_eq!(entry.best().unwrap().cost, 60);
    }

    #[test]
    fn test_datacenter_filter_applies() {
        let costs = matrix(3, &[(0, 1, 100), (0, 2, 10), (2, 1, 10)]);
        let datacenters = [1, 2, 2];
        let options = OptimizeOptions {
            datacenters: Some(&datacenters),
            ..OptimizeOptions::default()
        };
        let entries = optimize(&costs, 3, 1, &options);
        let entry = &entries[tri_index(1, 0)];
        assert_eq!(entry.routes.len(), 1);
        assert_eq!(entry.routes[0].cost, 100);
    }
}
