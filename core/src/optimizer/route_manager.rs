/// Bounded, sorted route table for one relay pair
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Routes at or above this cost are never stored
pub const UNCOSTABLE_THRESHOLD: i32 = 255;

/// Longest relay sequence the optimizer builds, and the default hop cap
pub const MAX_ROUTE_RELAYS: usize = 5;

/// One candidate path through the overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub cost: i32,
    pub hash: u32,
    pub relays: Vec<u32>,
}

/// Routes for one relay pair `(i, j)`, `i > j`.
///
/// Relay sequences run from `i` to `j`; callers with `src < dst` reverse them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Cost of the zero-hop link, or `-1` if there is none
    pub direct_cost: i32,
    pub routes: Vec<Route>,
}

impl Default for RouteEntry {
    fn default() -> Self {
        Self {
            direct_cost: crate::matrix::UNROUTABLE,
            routes: Vec::new(),
        }
    }
}

impl RouteEntry {
    pub fn best(&self) -> Option<&Route> {
        self.routes.first()
    }
}

/// FNV-style hash over each relay index's big-endian bytes
pub fn route_hash(relays: &[u32]) -> u32 {
    const PRIME: u32 = 16_777_619;
    let mut hash: u32 = 0;
    for relay in relays {
        for byte in relay.to_be_bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}

/// Accumulates routes for a single relay pair.
///
/// After any sequence of [`RouteManager::add_route`] calls the table is sorted
/// ascending by cost, unique by hash, loop-free and at most `max_routes` long.
#[derive(Debug, Clone)]
pub struct RouteManager<'a> {
    max_routes: usize,
    max_relays: usize,
    datacenters: Option<&'a [u64]>,
    routes: Vec<Route>,
}

impl<'a> RouteManager<'a> {
    pub fn new(max_routes: usize) -> Self {
        Self {
            max_routes: max_routes.max(1),
            max_relays: MAX_ROUTE_RELAYS,
            datacenters: None,
            routes: Vec::with_capacity(max_routes),
        }
    }

    /// Reject routes longer than `max_relays` (clamped to `2..=MAX_ROUTE_RELAYS`)
    pub fn with_max_relays(mut self, max_relays: usize) -> Self {
        self.max_relays = max_relays.clamp(2, MAX_ROUTE_RELAYS);
        self
    }

    /// Reject routes that pass through two relays of the same datacenter.
    /// `datacenters[relay_index]` is the relay's datacenter id, 0 when unknown.
    pub fn with_datacenters(mut self, datacenters: &'a [u64]) -> Self {
        self.datacenters = Some(datacenters);
        self
    }

    /// Offer a route; returns whether it was stored
    pub fn add_route(&mut self, cost: i32, relays: &[u32]) -> bool {
        if cost >= UNCOSTABLE_THRESHOLD {
            return false;
        }

        if relays.is_empty() || relays.len() > self.max_relays {
            return false;
        }

        let mut visited = HashSet::with_capacity(relays.len());
        if !relays.iter().all(|r| visited.insert(*r)) {
            return false;
        }

        if let Some(datacenters) = self.datacenters {
            let mut seen = HashSet::with_capacity(relays.len());
            for relay in relays {
                match datacenters.get(*relay as usize) {
                    Some(0) | None => {}
                    Some(dc) => {
                        if !seen.insert(*dc) {
                            return false;
                        }
                    }
                }
            }
        }

        let hash = route_hash(relays);
        if self.routes.iter().any(|r| r.hash == hash) {
            return false;
        }

        if self.routes.len() >= self.max_routes {
            match self.routes.last() {
                Some(worst) if cost < worst.cost => {}
                _ => return false,
            }
        }

        // Equal costs keep insertion order
        let position = self
            .routes
            .iter()
            .position(|r| r.cost > cost)
            .unwrap_or(self.routes.len());

        self.routes.insert(
            position,
            Route {
                cost,
                hash,
                relays: relays.to_vec(),
            },
        );
        self.routes.truncate(self.max_routes);
        true
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn into_routes(self) -> Vec<Route> {
        self.routes
    }
}
