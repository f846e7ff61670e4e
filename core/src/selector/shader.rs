/// Route shader: per-buyer routing policy
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default safety margin added to route costs handed back to callers
pub const DEFAULT_COST_BIAS: i32 = 3;

/// Thresholds and toggles that govern take/stay decisions.
///
/// Latencies and costs are in ms, packet loss is in percent (1.0 = 1%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteShader {
    /// Never accelerate
    pub disable_network_next: bool,

    /// Evaluate sessions but always stay direct
    pub analysis_only: bool,

    /// Percentage of user ids eligible for acceleration
    pub selection_percent: u32,

    /// Split users into A (may accelerate) and B (always direct) by id parity
    pub ab_test: bool,

    /// Direct latency at or below this is already good enough
    pub acceptable_latency: i32,

    /// Required latency improvement before taking a route
    pub latency_reduction_threshold: i32,

    /// Direct packet loss above this triggers loss reduction immediately
    pub acceptable_packet_loss_instant: f32,

    /// Direct packet loss at or above this for three slices triggers loss reduction
    pub acceptable_packet_loss_sustained: f32,

    /// Extra latency accepted while reducing packet loss
    pub max_latency_trade_off: i32,

    /// Window above the best route cost from which a route is picked at random
    pub route_select_threshold: i32,

    /// How much worse than the best route the current route may get before switching
    pub route_switch_threshold: i32,

    /// How much worse than direct the accelerated route may get before leaving
    pub rtt_veto: i32,

    /// Never take or keep a route costing more than this
    pub max_next_rtt: i32,

    /// Safety margin added to every real route cost
    pub cost_bias: i32,

    /// Accelerate whenever any route exists
    pub force_next: bool,

    /// Minimum number of distinct first-hop relays among candidate routes
    pub route_diversity: i32,

    /// Send on direct and accelerated paths at the same time
    pub multipath: bool,

    pub banned_users: HashSet<u64>,
}

impl Default for RouteShader {
    fn default() -> Self {
        Self {
            disable_network_next: false,
            analysis_only: false,
            selection_percent: 100,
            ab_test: false,
            acceptable_latency: 0,
            latency_reduction_threshold: 10,
            acceptable_packet_loss_instant: 1.0,
            acceptable_packet_loss_sustained: 0.5,
            max_latency_trade_off: 20,
            route_select_threshold: 2,
            route_switch_threshold: 5,
            rtt_veto: 10,
            max_next_rtt: 250,
            cost_bias: DEFAULT_COST_BIAS,
            force_next: false,
            route_diversity: 0,
            multipath: true,
            banned_users: HashSet::new(),
        }
    }
}
