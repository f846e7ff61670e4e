/// Per-slice take/stay decisions for a session
use super::best_route::{
    random_best_route, update_best_route, Endpoints, SelectedRoute, UNROUTABLE_SOURCE_COST,
};
use super::shader::RouteShader;
use super::state::RouteState;
use crate::optimizer::RouteEntry;
use rand::Rng;
use tracing::debug;

/// Next latency this far above the prediction counts as a mispredict
const MISPREDICT_MARGIN: i32 = 10;

/// Consecutive bad slices before a counter trips
const COUNTER_LIMIT: u32 = 3;

/// What the session observed during the last slice
#[derive(Debug, Clone, Copy)]
pub struct SliceInput<'a> {
    pub direct_latency: i32,
    pub direct_packet_loss: f32,
    pub next_latency: i32,
    pub predicted_latency: i32,
    pub source_relays: &'a [u32],
    pub source_relay_costs: &'a [i32],
    pub dest_relays: &'a [u32],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TakeDecision {
    pub take: bool,
    pub route: Option<SelectedRoute>,
    pub route_diversity: i32,
    pub trace: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StayDecision {
    pub stay: bool,
    pub route_changed: bool,
    pub route: Option<SelectedRoute>,
    pub trace: Vec<String>,
}

/// Shared gate for both decisions: returns true when the session must stay direct.
///
/// A vetoed state is left untouched.
pub fn early_out_direct(state: &mut RouteState, shader: &RouteShader) -> bool {
    if state.is_vetoed() {
        return true;
    }

    if shader.disable_network_next {
        state.disabled = true;
        return true;
    }

    if shader.analysis_only {
        return true;
    }

    if shader.selection_percent == 0 || state.user_id % 100 > u64::from(shader.selection_percent) {
        state.not_selected = true;
        return true;
    }

    if shader.ab_test {
        state.ab_test = true;
        if state.user_id % 2 == 1 {
            state.b = true;
            return true;
        }
        state.a = true;
    }

    if shader.banned_users.contains(&state.user_id) {
        state.banned = true;
        return true;
    }

    false
}

/// Source costs with non-positive entries replaced by the unroutable cost
fn safe_source_costs(costs: &[i32]) -> Vec<i32> {
    costs
        .iter()
        .map(|c| if *c <= 0 { UNROUTABLE_SOURCE_COST } else { *c })
        .collect()
}

struct Trace {
    enabled: bool,
    user_id: u64,
    lines: Vec<String>,
}

impl Trace {
    fn new(enabled: bool, user_id: u64) -> Self {
        Self {
            enabled,
            user_id,
            lines: Vec::new(),
        }
    }

    fn push(&mut self, line: String) {
        if self.enabled {
            debug!("Session {:016x}: {}", self.user_id, line);
            self.lines.push(line);
        }
    }
}

/// Applies one route shader against one route matrix snapshot
#[derive(Debug, Clone, Copy)]
pub struct RouteSelector<'a> {
    routes: &'a [RouteEntry],
    shader: &'a RouteShader,
    trace: bool,
}

impl<'a> RouteSelector<'a> {
    pub fn new(routes: &'a [RouteEntry], shader: &'a RouteShader) -> Self {
        Self {
            routes,
            shader,
            trace: false,
        }
    }

    /// Collect trace lines in decisions and log them at debug level
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Decide whether a direct session should move onto an accelerated route
    pub fn take_network_next(
        &self,
        state: &mut RouteState,
        input: &SliceInput,
        rng: &mut impl Rng,
    ) -> TakeDecision {
        let shader = self.shader;
        let mut trace = Trace::new(self.trace, state.user_id);

        if early_out_direct(state, shader) {
            trace.push("early out, staying direct".to_string());
            return TakeDecision {
                trace: trace.lines,
                ..TakeDecision::default()
            };
        }

        let source_costs = safe_source_costs(input.source_relay_costs);
        let endpoints = Endpoints {
            source_relays: input.source_relays,
            source_costs: &source_costs,
            dest_relays: input.dest_relays,
            cost_bias: shader.cost_bias,
        };

        if input.direct_packet_loss >= shader.acceptable_packet_loss_sustained {
            state.packet_loss_sustained_counter =
                (state.packet_loss_sustained_counter + 1).min(COUNTER_LIMIT);
        } else {
            state.packet_loss_sustained_counter = 0;
        }

        let mut reduce_latency = false;
        let mut reduce_packet_loss = false;
        let mut max_cost = -1;

        if input.direct_latency > shader.acceptable_latency {
            reduce_latency = true;
            max_cost = input.direct_latency.saturating_sub(
                shader
                    .latency_reduction_threshold
                    .saturating_add(shader.route_select_threshold),
            );
            trace.push(format!(
                "direct latency {} above acceptable {}, max cost {}",
                input.direct_latency, shader.acceptable_latency, max_cost
            ));
        }

        if input.direct_packet_loss > shader.acceptable_packet_loss_instant
            || state.packet_loss_sustained_counter == COUNTER_LIMIT
        {
            reduce_packet_loss = true;
            max_cost = input
                .direct_latency
                .saturating_add(shader.max_latency_trade_off)
                .saturating_sub(shader.route_select_threshold);
            trace.push(format!(
                "direct packet loss {:.3} (sustained {}), max cost {}",
                input.direct_packet_loss, state.packet_loss_sustained_counter, max_cost
            ));
        }

        if shader.force_next {
            state.forced_next = true;
            max_cost = i32::MAX;
            reduce_latency = false;
            reduce_packet_loss = false;
            trace.push("forcing network next".to_string());
        }

        let (route, diversity) = random_best_route(
            self.routes,
            &endpoints,
            max_cost,
            shader.route_select_threshold,
            rng,
        );

        let decline = |trace: Trace, diversity: i32| TakeDecision {
            take: false,
            route: None,
            route_diversity: diversity,
            trace: trace.lines,
        };

        if diversity < shader.route_diversity {
            state.lack_of_diversity = true;
            trace.push(format!(
                "route diversity {} below required {}",
                diversity, shader.route_diversity
            ));
            return decline(trace, diversity);
        }

        let route = match route {
            Some(route) => route,
            None => {
                trace.push(format!("no route within max cost {}", max_cost));
                return decline(trace, diversity);
            }
        };

        if route.cost > shader.max_next_rtt {
            trace.push(format!(
                "route cost {} above max next rtt {}",
                route.cost, shader.max_next_rtt
            ));
            return decline(trace, diversity);
        }

        state.next = true;
        state.reduce_latency = reduce_latency;
        state.reduce_packet_loss = reduce_packet_loss;
        state.multipath = shader.multipath;
        trace.push(format!(
            "taking route {:?} with cost {}",
            route.relays, route.cost
        ));

        TakeDecision {
            take: true,
            route: Some(route),
            route_diversity: diversity,
            trace: trace.lines,
        }
    }

    /// Decide whether an accelerated session keeps its route, switches, or falls back to direct.
    ///
    /// `current_route` is in caller space, source to dest. Leaving clears
    /// `next` and sets `veto`.
    pub fn stay_on_network_next(
        &self,
        state: &mut RouteState,
        input: &SliceInput,
        current_route: &[u32],
        rng: &mut impl Rng,
    ) -> StayDecision {
        let mut trace = Trace::new(self.trace, state.user_id);
        let was_next = state.next;

        let (stay, route_changed, route) =
            self.evaluate_stay(state, input, current_route, rng, &mut trace);

        if was_next && !stay {
            state.next = false;
            state.veto = true;
            trace.push("leaving network next".to_string());
        }

        StayDecision {
            stay,
            route_changed,
            route: if stay { route } else { None },
            trace: trace.lines,
        }
    }

    fn evaluate_stay(
        &self,
        state: &mut RouteState,
        input: &SliceInput,
        current_route: &[u32],
        rng: &mut impl Rng,
        trace: &mut Trace,
    ) -> (bool, bool, Option<SelectedRoute>) {
        let shader = self.shader;

        if early_out_direct(state, shader) {
            trace.push("early out".to_string());
            return (false, false, None);
        }

        let source_costs = safe_source_costs(input.source_relay_costs);
        let endpoints = Endpoints {
            source_relays: input.source_relays,
            source_costs: &source_costs,
            dest_relays: input.dest_relays,
            cost_bias: shader.cost_bias,
        };

        if input.predicted_latency > 0
            && input.next_latency >= input.predicted_latency.saturating_add(MISPREDICT_MARGIN)
        {
            state.mispredict_counter += 1;
            if state.mispredict_counter >= COUNTER_LIMIT {
                state.mispredict = true;
                trace.push(format!(
                    "next latency {} keeps missing prediction {}",
                    input.next_latency, input.predicted_latency
                ));
                return (false, false, None);
            }
        } else {
            state.mispredict_counter = 0;
        }

        let max_cost = if shader.force_next {
            i32::MAX
        } else {
            let mut veto = shader.rtt_veto;
            if state.reduce_packet_loss {
                veto = veto.saturating_add(shader.max_latency_trade_off);
            }

            let worse = input.next_latency > input.direct_latency.saturating_add(veto);
            if state.multipath {
                if worse {
                    state.latency_worse_counter += 1;
                    if state.latency_worse_counter >= COUNTER_LIMIT {
                        state.latency_worse = true;
                        trace.push(format!(
                            "multipath next latency {} worse than direct {} for {} slices",
                            input.next_latency, input.direct_latency, COUNTER_LIMIT
                        ));
                        return (false, false, None);
                    }
                } else {
                    state.latency_worse_counter = 0;
                }
            } else if worse {
                state.latency_worse = true;
                trace.push(format!(
                    "next latency {} worse than direct {} by more than {}",
                    input.next_latency, input.direct_latency, veto
                ));
                return (false, false, None);
            }

            input.direct_latency.saturating_add(veto)
        };

        let update = update_best_route(
            self.routes,
            &endpoints,
            max_cost,
            shader.route_select_threshold,
            shader.route_switch_threshold,
            current_route,
            rng,
        );
        state.route_lost = update.lost;
        if update.lost {
            trace.push("current route is gone".to_string());
        }

        let route = match update.route {
            Some(route) => route,
            None => {
                state.no_route = true;
                trace.push(format!("no route within max cost {}", max_cost));
                return (false, false, None);
            }
        };

        if route.cost > shader.max_next_rtt {
            state.next_latency_too_high = true;
            trace.push(format!(
                "route cost {} above max next rtt {}",
                route.cost, shader.max_next_rtt
            ));
            return (false, false, None);
        }

        if update.changed {
            trace.push(format!(
                "switched to route {:?} with cost {}",
                route.relays, route.cost
            ));
        }

        (true, update.changed, Some(route))
    }
}
