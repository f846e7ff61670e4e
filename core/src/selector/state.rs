/// Per-session route state carried from slice to slice
use serde::{Deserialize, Serialize};

/// Why the session is where it is.
///
/// Created all-false at session start. `veto` is sticky: once set the session
/// never accelerates again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteState {
    pub user_id: u64,

    pub next: bool,
    pub veto: bool,
    pub location_veto: bool,
    pub banned: bool,
    pub disabled: bool,
    pub not_selected: bool,
    pub ab_test: bool,
    pub a: bool,
    pub b: bool,
    pub forced_next: bool,
    pub reduce_latency: bool,
    pub reduce_packet_loss: bool,
    pub multipath: bool,
    pub latency_worse: bool,
    pub no_route: bool,
    pub next_latency_too_high: bool,
    pub route_lost: bool,
    pub mispredict: bool,
    pub lack_of_diversity: bool,

    pub mispredict_counter: u32,
    pub latency_worse_counter: u32,
    pub packet_loss_sustained_counter: u32,
}

impl RouteState {
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }

    /// Any flag that pins the session to direct for good
    pub fn is_vetoed(&self) -> bool {
        self.veto || self.location_veto || self.banned || self.disabled || self.not_selected || self.b
    }
}
