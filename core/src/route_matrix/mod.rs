/// Route matrix container: relay metadata aligned with optimizer output
pub mod codec;

pub use codec::{ROUTE_MATRIX_VERSION, ROUTE_MATRIX_VERSION_MIN};

use crate::error::{CoreError, Result};
use crate::matrix::{tri_index, tri_len};
use crate::optimizer::RouteEntry;
use crate::stats::RelayInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Relay arrays and route entries for one optimizer pass.
///
/// All `relay_*` vectors and `dest_relays` are indexed by relay index;
/// `route_entries` is indexed by [`tri_index`].
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatrix {
    pub version: u32,
    /// Unix seconds
    pub created_at: u64,
    pub relay_ids: Vec<u64>,
    pub relay_addresses: Vec<SocketAddr>,
    pub relay_names: Vec<String>,
    pub relay_latitudes: Vec<f32>,
    pub relay_longitudes: Vec<f32>,
    pub relay_datacenter_ids: Vec<u64>,
    /// Relays that sessions may terminate at
    pub dest_relays: Vec<bool>,
    pub route_entries: Vec<RouteEntry>,
    relay_id_to_index: HashMap<u64, usize>,
}

impl RouteMatrix {
    pub fn new(relays: &[RelayInfo], route_entries: Vec<RouteEntry>, created_at: u64) -> Self {
        let mut matrix = Self {
            version: ROUTE_MATRIX_VERSION,
            created_at,
            relay_ids: relays.iter().map(|r| r.id).collect(),
            relay_addresses: relays.iter().map(|r| r.address).collect(),
            relay_names: relays.iter().map(|r| r.name.clone()).collect(),
            relay_latitudes: relays.iter().map(|r| r.latitude).collect(),
            relay_longitudes: relays.iter().map(|r| r.longitude).collect(),
            relay_datacenter_ids: relays.iter().map(|r| r.datacenter_id).collect(),
            dest_relays: relays.iter().map(|r| r.dest).collect(),
            route_entries,
            relay_id_to_index: HashMap::new(),
        };
        matrix.rebuild_index();
        matrix
    }

    pub(crate) fn rebuild_index(&mut self) {
        self.relay_id_to_index = self
            .relay_ids
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, index))
            .collect();
    }

    pub fn num_relays(&self) -> usize {
        self.relay_ids.len()
    }

    /// Check that every relay array and the entry table line up
    pub fn validate(&self) -> Result<()> {
        let n = self.relay_ids.len();
        let aligned = self.relay_addresses.len() == n
            && self.relay_names.len() == n
            && self.relay_latitudes.len() == n
            && self.relay_longitudes.len() == n
            && self.relay_datacenter_ids.len() == n
            && self.dest_relays.len() == n;
        if !aligned {
            return Err(CoreError::Codec(format!(
                "relay arrays are not aligned to {} relays",
                n
            )));
        }
        if self.route_entries.len() != tri_len(n) {
            return Err(CoreError::Codec(format!(
                "expected {} route entries for {} relays, found {}",
                tri_len(n),
                n,
                self.route_entries.len()
            )));
        }
        Ok(())
    }

    pub fn relay_index(&self, relay_id: u64) -> Option<usize> {
        self.relay_id_to_index.get(&relay_id).copied()
    }

    pub fn entry(&self, i: usize, j: usize) -> Option<&RouteEntry> {
        if i == j {
            return None;
        }
        self.route_entries.get(tri_index(i, j))
    }

    /// Relay ids located in `datacenter_id`
    pub fn datacenter_relays(&self, datacenter_id: u64) -> Vec<u64> {
        self.relay_datacenter_ids
            .iter()
            .zip(&self.relay_ids)
            .filter(|(dc, _)| **dc == datacenter_id)
            .map(|(_, id)| *id)
            .collect()
    }

    fn is_dest(&self, index: usize) -> bool {
        self.dest_relays.get(index).copied().unwrap_or(true)
    }

    /// Summary statistics over pairs that touch at least one dest relay
    pub fn analyze(&self) -> RouteMatrixAnalysis {
        let mut analysis = RouteMatrixAnalysis::default();

        let mut pairs = 0usize;
        let mut no_route = 0usize;
        let mut one_route = 0usize;
        let mut no_direct = 0usize;
        let mut no_improvement = 0usize;
        let mut buckets = [0usize; IMPROVEMENT_BUCKETS];
        let mut total_route_length = 0usize;

        for i in 0..self.num_relays() {
            for j in 0..i {
                if !self.is_dest(i) && !self.is_dest(j) {
                    continue;
                }
                let entry = match self.route_entries.get(tri_index(i, j)) {
                    Some(entry) => entry,
                    None => continue,
                };
                pairs += 1;

                let n = entry.routes.len();
                analysis.total_routes += n;
                analysis.max_routes_per_pair = analysis.max_routes_per_pair.max(n);
                for route in &entry.routes {
                    total_route_length += route.relays.len();
                    analysis.max_route_length = analysis.max_route_length.max(route.relays.len());
                }

                match entry.best() {
                    None => no_route += 1,
                    Some(best) => {
                        if n == 1 {
                            one_route += 1;
                        }
                        if entry.direct_cost < 0 {
                            no_direct += 1;
                        } else {
                            let improvement = entry.direct_cost - best.cost;
                            if improvement > 0 {
                                let bucket = ((improvement - 1) / 5) as usize;
                                buckets[bucket.min(IMPROVEMENT_BUCKETS - 1)] += 1;
                            } else {
                                no_improvement += 1;
                            }
                        }
                    }
                }
            }
        }

        analysis.relay_pairs = pairs;
        if pairs > 0 {
            let percent = |count: usize| count as f32 / pairs as f32 * 100.0;
            analysis.average_num_routes = analysis.total_routes as f32 / pairs as f32;
            analysis.no_route_percent = percent(no_route);
            analysis.one_route_percent = percent(one_route);
            analysis.no_direct_route_percent = percent(no_direct);
            analysis.no_improvement_percent = percent(no_improvement);
            for (slot, count) in analysis.improvement_buckets.iter_mut().zip(buckets) {
                *slot = percent(count);
            }
        }
        if analysis.total_routes > 0 {
            analysis.average_route_length =
                total_route_length as f32 / analysis.total_routes as f32;
        }
        analysis.dest_relays = (0..self.num_relays()).filter(|i| self.is_dest(*i)).count();

        analysis
    }
}

/// Buckets of 5ms best-route improvement over direct; the last is everything above 50ms
pub const IMPROVEMENT_BUCKETS: usize = 11;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteMatrixAnalysis {
    pub relay_pairs: usize,
    pub dest_relays: usize,
    pub total_routes: usize,
    pub max_routes_per_pair: usize,
    pub max_route_length: usize,
    pub average_num_routes: f32,
    pub average_route_length: f32,
    pub no_route_percent: f32,
    pub one_route_percent: f32,
    /// Pairs that are only reachable through other relays
    pub no_direct_route_percent: f32,
    pub no_improvement_percent: f32,
    pub improvement_buckets: [f32; IMPROVEMENT_BUCKETS],
}
