/// Route matrix queries used by the session selector
use crate::matrix::tri_index;
use crate::optimizer::{route_hash, RouteEntry};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Best-route cost when nothing was found
pub const NO_ROUTE_COST: i32 = i32::MAX;

/// Source relay cost that marks the source relay unroutable
pub const UNROUTABLE_SOURCE_COST: i32 = 255;

/// Source cost used when a route's first relay is not a known source relay
const UNKNOWN_SOURCE_COST: i32 = 1000;

/// Cap on candidates gathered for random selection
pub const MAX_BEST_ROUTES: usize = 1024;

/// Session endpoints in relay-index space.
///
/// `source_costs[k]` is the session's RTT to `source_relays[k]`. `cost_bias`
/// is added to every route cost handed back.
#[derive(Debug, Clone, Copy)]
pub struct Endpoints<'a> {
    pub source_relays: &'a [u32],
    pub source_costs: &'a [i32],
    pub dest_relays: &'a [u32],
    pub cost_bias: i32,
}

impl<'a> Endpoints<'a> {
    fn sources(&self) -> impl Iterator<Item = (u32, i32)> + 'a {
        let relays: &'a [u32] = self.source_relays;
        let costs: &'a [i32] = self.source_costs;
        relays.iter().copied().zip(costs.iter().copied())
    }
}

/// Route in caller space: relays run source to dest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedRoute {
    /// Includes the cost bias
    pub cost: i32,
    pub relays: Vec<u32>,
}

#[derive(Debug, Clone)]
struct Candidate<'r> {
    cost: i32,
    relays: &'r [u32],
    reverse: bool,
}

fn entry_for(routes: &[RouteEntry], source: u32, dest: u32) -> Option<&RouteEntry> {
    if source == dest {
        return None;
    }
    routes.get(tri_index(source as usize, dest as usize))
}

/// Cheapest source cost + route cost over all endpoint pairs, plus the cost bias.
/// Returns [`NO_ROUTE_COST`] when no pair has a route.
pub fn best_route_cost(routes: &[RouteEntry], endpoints: &Endpoints) -> i32 {
    let mut best = NO_ROUTE_COST;
    for (source, source_cost) in endpoints.sources() {
        if source_cost >= UNROUTABLE_SOURCE_COST {
            continue;
        }
        for dest in endpoints.dest_relays {
            if let Some(route) = entry_for(routes, source, *dest).and_then(RouteEntry::best) {
                best = best.min(source_cost.saturating_add(route.cost));
            }
        }
    }
    if best == NO_ROUTE_COST {
        best
    } else {
        best.saturating_add(endpoints.cost_bias)
    }
}

/// Routes with source cost + route cost at or below `max_cost`, and the
/// number of source relays that contributed at least one
fn best_routes<'r>(
    routes: &'r [RouteEntry],
    endpoints: &Endpoints,
    max_cost: i32,
) -> (Vec<Candidate<'r>>, i32) {
    let mut candidates = Vec::new();
    let mut diversity = 0;

    for (source, source_cost) in endpoints.sources() {
        if source_cost >= UNROUTABLE_SOURCE_COST {
            continue;
        }
        let mut first_from_source = true;
        for dest in endpoints.dest_relays {
            let entry = match entry_for(routes, source, *dest) {
                Some(entry) => entry,
                None => continue,
            };
            for route in &entry.routes {
                let cost = source_cost.saturating_add(route.cost);
                // Routes are sorted, nothing further along can fit
                if cost > max_cost {
                    break;
                }
                candidates.push(Candidate {
                    cost,
                    relays: &route.relays,
                    reverse: source < *dest,
                });
                if first_from_source {
                    diversity += 1;
                    first_from_source = false;
                }
                if candidates.len() == MAX_BEST_ROUTES {
                    return (candidates, diversity);
                }
            }
        }
    }

    (candidates, diversity)
}

/// Pick uniformly among routes within `threshold` of the best, if the best fits `max_cost`.
///
/// A `max_cost` of -1 means no route is wanted. Returns the route (cost
/// including the cost bias) and the route diversity.
pub fn random_best_route(
    routes: &[RouteEntry],
    endpoints: &Endpoints,
    max_cost: i32,
    threshold: i32,
    rng: &mut impl Rng,
) -> (Option<SelectedRoute>, i32) {
    if max_cost == -1 {
        return (None, 0);
    }

    let best = best_route_cost(routes, endpoints);
    if best > max_cost {
        return (None, 0);
    }

    let (candidates, diversity) = best_routes(routes, endpoints, best.saturating_add(threshold));
    if candidates.is_empty() {
        return (None, diversity);
    }

    let chosen = &candidates[rng.gen_range(0..candidates.len())];
    let mut relays = chosen.relays.to_vec();
    if chosen.reverse {
        relays.reverse();
    }

    (
        Some(SelectedRoute {
            cost: chosen.cost.saturating_add(endpoints.cost_bias),
            relays,
        }),
        diversity,
    )
}

/// Cost of `route` (caller space) in the current matrix, or -1 if it is gone
pub fn current_route_cost(routes: &[RouteEntry], route: &[u32], endpoints: &Endpoints) -> i32 {
    if routes.is_empty() {
        return -1;
    }
    let (first, last) = match (route.first(), route.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return -1,
    };

    let source_cost = endpoints
        .sources()
        .find(|(source, _)| *source == first)
        .map(|(_, cost)| cost)
        .unwrap_or(UNKNOWN_SOURCE_COST);
    if source_cost >= UNROUTABLE_SOURCE_COST {
        return -1;
    }

    if first == last {
        return -1;
    }

    // Stored routes run from the higher index to the lower one
    let mut stored = route.to_vec();
    if first < last {
        stored.reverse();
    }

    let hash = route_hash(&stored);
    let entry = match entry_for(routes, first, last) {
        Some(entry) => entry,
        None => return -1,
    };

    entry
        .routes
        .iter()
        .find(|r| r.hash == hash && r.relays.len() == stored.len())
        .map(|r| source_cost.saturating_add(r.cost).saturating_add(endpoints.cost_bias))
        .unwrap_or(-1)
}

/// Whether `route` (either orientation) is still present in the matrix
pub fn route_exists(routes: &[RouteEntry], route: &[u32]) -> bool {
    let (first, last) = match (route.first(), route.last()) {
        (Some(first), Some(last)) if first != last => (*first, *last),
        _ => return false,
    };
    let mut stored = route.to_vec();
    if first < last {
        stored.reverse();
    }
    entry_for(routes, first, last)
        .map(|entry| entry.routes.iter().any(|r| r.relays == stored))
        .unwrap_or(false)
}

/// Result of refreshing a session's current route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUpdate {
    pub route: Option<SelectedRoute>,
    pub changed: bool,
    pub lost: bool,
}

/// Keep the current route unless it vanished or fell outside `switch_threshold` of the best
pub fn update_best_route(
    routes: &[RouteEntry],
    endpoints: &Endpoints,
    max_cost: i32,
    select_threshold: i32,
    switch_threshold: i32,
    current: &[u32],
    rng: &mut impl Rng,
) -> RouteUpdate {
    let current_cost = current_route_cost(routes, current, endpoints);

    if current_cost < 0 {
        let (route, _) = random_best_route(routes, endpoints, max_cost, select_threshold, rng);
        return RouteUpdate {
            route,
            changed: true,
            lost: true,
        };
    }

    let best = best_route_cost(routes, endpoints);
    if current_cost > best.saturating_add(switch_threshold) {
        let (route, _) = random_best_route(routes, endpoints, best, select_threshold, rng);
        return RouteUpdate {
            route,
            changed: true,
            lost: false,
        };
    }

    RouteUpdate {
        route: Some(SelectedRoute {
            cost: current_cost,
            relays: current.to_vec(),
        }),
        changed: false,
        lost: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{tri_len, UNROUTABLE};
    use crate::optimizer::{optimize, OptimizeOptions};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    // 0 = LA, 1 = Chicago, 2 = A
    fn la_chicago() -> Vec<RouteEntry> {
        let mut costs = vec![UNROUTABLE; tri_len(3)];
        costs[tri_index(0, 1)] = 100;
        costs[tri_index(0, 2)] = 10;
        costs[tri_index(2, 1)] = 10;
        optimize(&costs, 3, 1, &OptimizeOptions::default())
    }

    #[test]
    fn test_best_route_cost_includes_bias() {
        let routes = la_chicago();
        let endpoints = Endpoints {
            source_relays: &[0],
            source_costs: &[10],
            dest_relays: &[1],
            cost_bias: 3,
        };
        assert_eq!(best_route_cost(&routes, &endpoints), 10 + 20 + 3);

        let unbiased = Endpoints {
            cost_bias: 0,
            ..endpoints
        };
        assert_eq!(best_route_cost(&routes, &unbiased), 30);
        assert_eq!(current_route_cost(&routes, &[0, 2, 1], &unbiased), 30);

        let unroutable = Endpoints {
            source_costs: &[255],
            ..endpoints
        };
        assert_eq!(best_route_cost(&routes, &unroutable), NO_ROUTE_COST);
        assert_eq!(best_route_cost(&[], &endpoints), NO_ROUTE_COST);
    }

    #[test]
    fn test_random_best_route_reads_source_to_dest() {
        let routes = la_chicago();
        let mut rng = StdRng::seed_from_u64(1);

        let forward = Endpoints {
            source_relays: &[0],
            source_costs: &[10],
            dest_relays: &[1],
            cost_bias: 3,
        };
        let (route, diversity) = random_best_route(&routes, &forward, 1000, 2, &mut rng);
        let route = route.unwrap();
        assert_eq!(route.relays, vec![0, 2, 1]);
        assert_eq!(route.cost, 33);
        assert_eq!(diversity, 1);

        let backward = Endpoints {
            source_relays: &[1],
            source_costs: &[10],
            dest_relays: &[0],
            cost_bias: 3,
        };
        let (route, _) = random_best_route(&routes, &backward, 1000, 2, &mut rng);
        assert_eq!(route.unwrap().relays, vec![1, 2, 0]);

        let (route, diversity) = random_best_route(&routes, &forward, -1, 2, &mut rng);
        assert!(route.is_none());
        assert_eq!(diversity, 0);

        let (route, _) = random_best_route(&routes, &forward, 32, 2, &mut rng);
        assert!(route.is_none());
    }

    #[test]
    fn test_current_route_cost() {
        let routes = la_chicago();
        let endpoints = Endpoints {
            source_relays: &[0],
            source_costs: &[10],
            dest_relays: &[1],
            cost_bias: 3,
        };
        assert_eq!(current_route_cost(&routes, &[0, 2, 1], &endpoints), 33);
        assert_eq!(current_route_cost(&routes, &[0, 1], &endpoints), 113);
        assert_eq!(current_route_cost(&routes, &[0, 3, 1], &endpoints), -1);
        assert_eq!(current_route_cost(&routes, &[], &endpoints), -1);
        assert_eq!(current_route_cost(&routes, &[0], &endpoints), -1);
        assert_eq!(current_route_cost(&[], &[0, 1], &endpoints), -1);
        // First relay is not a source relay
        assert_eq!(current_route_cost(&routes, &[2, 1], &endpoints), -1);
        assert_eq!(current_route_cost(&routes, &[0, 7], &endpoints), -1);

        assert!(route_exists(&routes, &[0, 2, 1]));
        assert!(route_exists(&routes, &[1, 2, 0]));
        assert!(!route_exists(&routes, &[0, 7]));
    }

    #[test]
    fn test_update_holds_switches_and_recovers() {
        let routes = la_chicago();
        let endpoints = Endpoints {
            source_relays: &[0],
            source_costs: &[10],
            dest_relays: &[1],
            cost_bias: 3,
        };
        let mut rng = StdRng::seed_from_u64(3);

        let held = update_best_route(&routes, &endpoints, 1000, 2, 5, &[0, 2, 1], &mut rng);
        assert!(!held.changed && !held.lost);
        assert_eq!(held.route.unwrap().cost, 33);

        let switched = update_best_route(&routes, &endpoints, 1000, 2, 5, &[0, 1], &mut rng);
        assert!(switched.changed && !switched.lost);
        assert_eq!(switched.route.unwrap().relays, vec![0, 2, 1]);

        let lost = update_best_route(&routes, &endpoints, 1000, 2, 5, &[0, 9, 1], &mut rng);
        assert!(lost.changed && lost.lost);
        assert_eq!(lost.route.unwrap().relays, vec![0, 2, 1]);
    }
}
